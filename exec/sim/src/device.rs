// Copyright (C) Microsoft Corporation. All rights reserved.

//! Simulated device region.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use accl_exec_interface::RegIo;
use accl_exec_types::*;
use parking_lot::Mutex;

use crate::cu::{CuState, SimCu};

type IrqHook = Box<dyn Fn(u32) + Send + Sync>;

/// One mapped device region backed by a sparse register file.
///
/// Every region starts as plain storage; CU models and read-to-clear status
/// words are attached per test. The write log records every register write
/// in order so tests can assert programming sequences, not just final
/// values.
#[derive(Default)]
pub struct SimDevice {
    inner: Mutex<SimInner>,
    irq_hook: Mutex<Option<IrqHook>>,
    irq_armed: AtomicBool,
}

#[derive(Default)]
struct SimInner {
    regs: HashMap<u32, u32>,
    cus: Vec<SimCu>,
    read_clear: Vec<(u32, u32)>,
    write_log: Vec<(u32, u32)>,
}

impl SimInner {
    fn cu_at(&mut self, offset: u32) -> Option<&mut SimCu> {
        self.cus.iter_mut().find(|cu| cu.addr == offset)
    }

    fn is_read_clear(&self, offset: u32) -> bool {
        self.read_clear
            .iter()
            .any(|(base, words)| offset >= *base && offset < *base + words * 4)
    }
}

impl SimDevice {
    /// Create an empty region
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a host-visible device region: completion status words behind
    /// [`STATUS_REG`] are read-to-clear, as the embedded scheduler hardware
    /// implements them
    pub fn new_host_device() -> Self {
        let dev = Self::new();
        dev.mark_read_clear(STATUS_REG, 4);
        dev
    }

    /// Attach a CU whose completion the test raises by hand
    pub fn add_cu(&self, addr: u32) {
        self.inner.lock().cus.push(SimCu::new(addr, false));
    }

    /// Attach a CU that completes on the first status poll after start
    pub fn add_auto_cu(&self, addr: u32) {
        self.inner.lock().cus.push(SimCu::new(addr, true));
    }

    /// Mark `words` consecutive status words at `base` as read-to-clear
    pub fn mark_read_clear(&self, base: u32, words: u32) {
        self.inner.lock().read_clear.push((base, words));
    }

    /// Install the interrupt callback, invoked with the status bank index
    pub fn set_irq_hook(&self, hook: impl Fn(u32) + Send + Sync + 'static) {
        *self.irq_hook.lock() = Some(Box::new(hook));
        self.irq_armed.store(true, Ordering::Release);
    }

    /// Raise AP_DONE on the CU at `addr`
    ///
    /// # Panics
    /// Panics when no CU was attached there.
    pub fn complete_cu(&self, addr: u32) {
        let mut inner = self.inner.lock();
        match inner.cu_at(addr) {
            Some(cu) => cu.complete(),
            None => panic!("no simulated cu at 0x{addr:x}"),
        }
    }

    /// Execution state of the CU at `addr`, if one is attached
    pub fn cu_state(&self, addr: u32) -> Option<CuState> {
        self.inner.lock().cus.iter().find(|cu| cu.addr == addr).map(|cu| cu.state)
    }

    /// Number of AP_START writes the CU at `addr` accepted
    pub fn cu_starts(&self, addr: u32) -> u32 {
        self.inner
            .lock()
            .cus
            .iter()
            .find(|cu| cu.addr == addr)
            .map(|cu| cu.starts)
            .unwrap_or(0)
    }

    /// Report the command queue slots in `slots` as complete
    ///
    /// Sets the matching completion status bits and fires the interrupt
    /// callback once per touched status word, the way the embedded scheduler
    /// raises one interrupt per status register bank.
    pub fn ert_complete(&self, slots: &[u32]) {
        let mut touched = [false; 4];
        {
            let mut inner = self.inner.lock();
            for slot in slots {
                let mask_idx = slot >> 5;
                let reg = STATUS_REG + (mask_idx << 2);
                *inner.regs.entry(reg).or_insert(0) |= 1 << (slot & 0x1f);
                touched[mask_idx as usize] = true;
            }
        }
        if self.irq_armed.load(Ordering::Acquire) {
            let hook = self.irq_hook.lock();
            if let Some(hook) = hook.as_ref() {
                for (mask_idx, fired) in touched.iter().enumerate() {
                    if *fired {
                        hook(mask_idx as u32);
                    }
                }
            }
        }
    }

    /// Every write issued to this region, in order
    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.inner.lock().write_log.clone()
    }

    /// Every value written to `offset`, in order
    pub fn writes_to(&self, offset: u32) -> Vec<u32> {
        self.inner
            .lock()
            .write_log
            .iter()
            .filter(|(addr, _)| *addr == offset)
            .map(|(_, value)| *value)
            .collect()
    }

    /// Read a register without triggering read-to-clear behavior
    pub fn peek(&self, offset: u32) -> u32 {
        self.inner.lock().regs.get(&offset).copied().unwrap_or(0)
    }
}

impl RegIo for SimDevice {
    fn read32(&self, offset: u32) -> u32 {
        let mut inner = self.inner.lock();
        if let Some(cu) = inner.cu_at(offset) {
            return cu.read_ctrl();
        }
        let value = inner.regs.get(&offset).copied().unwrap_or(0);
        if value != 0 && inner.is_read_clear(offset) {
            inner.regs.insert(offset, 0);
        }
        value
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut inner = self.inner.lock();
        inner.write_log.push((offset, value));
        if let Some(cu) = inner.cu_at(offset) {
            cu.write_ctrl(value);
            return;
        }
        inner.regs.insert(offset, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_plain_register_storage() {
        let dev = SimDevice::new();
        assert_eq!(dev.read32(0x100), 0);
        dev.write32(0x100, 0xDEAD);
        assert_eq!(dev.read32(0x100), 0xDEAD);
        assert_eq!(dev.writes_to(0x100), vec![0xDEAD]);
    }

    #[test]
    fn test_status_reads_clear() {
        let dev = SimDevice::new_host_device();
        dev.ert_complete(&[0, 5]);
        assert_eq!(dev.read32(STATUS_REG), 0b10_0001);
        assert_eq!(dev.read32(STATUS_REG), 0);
    }

    #[test]
    fn test_ert_complete_sets_per_bank_bits() {
        let dev = SimDevice::new_host_device();
        dev.ert_complete(&[1, 33, 127]);
        assert_eq!(dev.peek(STATUS_REG), 0b10);
        assert_eq!(dev.peek(STATUS_REG + 4), 0b10);
        assert_eq!(dev.peek(STATUS_REG + 12), 1 << 31);
    }

    #[test]
    fn test_irq_hook_fires_per_touched_bank() {
        use std::sync::atomic::AtomicU32;
        use std::sync::Arc;

        let dev = SimDevice::new_host_device();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_hook = fired.clone();
        dev.set_irq_hook(move |mask_idx| {
            fired_hook.fetch_or(1 << mask_idx, Ordering::AcqRel);
        });

        dev.ert_complete(&[3, 70]);
        // banks 0 and 2
        assert_eq!(fired.load(Ordering::Acquire), 0b101);
    }

    #[test]
    fn test_cu_model_behind_regio() {
        let dev = SimDevice::new();
        dev.add_cu(0x1_0000);

        dev.write32(0x1_0004, 0xAA);
        dev.write32(0x1_0000, AP_START);
        assert_eq!(dev.cu_state(0x1_0000), Some(CuState::Running));
        assert_eq!(dev.read32(0x1_0000) & AP_DONE, 0);

        dev.complete_cu(0x1_0000);
        assert_eq!(dev.read32(0x1_0000), AP_DONE);
        // the argument register kept its value
        assert_eq!(dev.read32(0x1_0004), 0xAA);
    }
}
