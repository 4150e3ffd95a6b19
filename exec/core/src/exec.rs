// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-device execution core.
//!
//! An [`ExecCore`] splits into a shared section the ISR and clients may touch
//! (atomics, condvar, client list) and a worker section behind one mutex that
//! only the scheduler thread locks while it is running: command queue
//! geometry, the CU address map, slot and CU status bitmaps, and the
//! submitted-slot table.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use accl_exec_interface::{DevCaps, ErtRegion, ExecError, ExecResult, RegIo};
use accl_exec_types::*;
use parking_lot::{Condvar, Mutex};
use tracing::instrument;

use crate::client::ClientCtx;
use crate::cmd::ExecCmd;
use crate::ops::SchedOps;
use crate::scheduler::{self, Scheduler};

/// Core data structure for command execution on one device
pub struct ExecCore {
    pub(crate) regio: Arc<dyn RegIo>,
    pub(crate) caps: DevCaps,

    /// Present on device-side deployments, where this scheduler is the
    /// embedded runtime and the host talks to it through CQ BRAM
    pub(crate) ert_region: Option<ErtRegion>,

    pub(crate) state: Mutex<ExecState>,
    pub(crate) clients: Mutex<Vec<Arc<ClientCtx>>>,

    /// Clients block here until some command completes
    pub(crate) completion_mutex: Mutex<()>,
    pub(crate) completion_cond: Condvar,

    /// Status register banks flagged by the ISR, consumed by the worker
    pub(crate) sr: [AtomicBool; 4],

    /// Mode mirrors so the ISR and the CQ poller never take the state lock
    pub(crate) ert_mode: AtomicBool,
    pub(crate) polling_mirror: AtomicBool,
    pub(crate) cq_interrupt_mirror: AtomicBool,

    /// Set when teardown gave up on outstanding commands
    pub(crate) needs_reset: AtomicBool,

    pub(crate) outstanding_execs: AtomicUsize,
    pub(crate) total_execs: AtomicU64,
}

/// Worker-owned scheduler state of a device
pub(crate) struct ExecState {
    pub(crate) num_slots: u32,
    pub(crate) num_cus: u32,
    pub(crate) cu_shift_offset: u32,
    pub(crate) cu_base_addr: u32,
    pub(crate) polling_mode: bool,
    pub(crate) cq_interrupt: bool,
    pub(crate) cu_dma: bool,
    pub(crate) cu_isr: bool,
    pub(crate) configured: bool,

    pub(crate) cu_addr_map: [u32; MAX_CUS],

    /// Busy(1)/free(0) bits for command queue slots
    pub(crate) slot_status: [u32; MAX_SLOT_MASKS],
    pub(crate) num_slot_masks: u32,

    /// Busy(1)/free(0) bits for CUs, software mode only
    pub(crate) cu_status: [u32; MAX_CU_MASKS],
    pub(crate) num_cu_masks: u32,

    /// Command occupying each slot while Running
    pub(crate) submitted_cmds: [Option<CmdId>; MAX_SLOTS],

    pub(crate) ops: SchedOps,
}

impl Default for ExecState {
    fn default() -> Self {
        Self {
            num_slots: 16,
            num_cus: 0,
            cu_shift_offset: 0,
            cu_base_addr: 0,
            polling_mode: true,
            cq_interrupt: false,
            cu_dma: false,
            cu_isr: false,
            configured: false,
            cu_addr_map: [0; MAX_CUS],
            slot_status: [0; MAX_SLOT_MASKS],
            num_slot_masks: 1,
            cu_status: [0; MAX_CU_MASKS],
            num_cu_masks: 0,
            submitted_cmds: [None; MAX_SLOTS],
            ops: SchedOps::Penguin,
        }
    }
}

impl ExecState {
    /// Command queue slot size per current configuration
    pub(crate) fn slot_size(&self) -> u32 {
        CQ_SIZE / self.num_slots
    }

    /// Relative address of CU `cu_idx`
    pub(crate) fn cu_addr(&self, cu_idx: u32) -> u32 {
        self.cu_addr_map[cu_idx as usize]
    }

    /// Acquire a free command queue slot, marking it busy
    pub(crate) fn acquire_slot(&mut self) -> Option<u32> {
        crate::masks::acquire_idx(&mut self.slot_status, self.num_slot_masks, self.num_slots)
    }

    /// Release command queue slot `slot`
    pub(crate) fn release_slot(&mut self, slot: u32) {
        crate::masks::release_idx(&mut self.slot_status, slot);
    }
}

/// Point-in-time view of an exec core, for diagnostics and tests
#[derive(Clone, Debug)]
pub struct ExecSnapshot {
    /// Number of command queue slots
    pub num_slots: u32,
    /// Number of CUs in the loaded program
    pub num_cus: u32,
    /// Slot status mask words in use
    pub num_slot_masks: u32,
    /// CU status mask words in use
    pub num_cu_masks: u32,
    /// CU address map, `num_cus` entries
    pub cu_addr_map: Vec<u32>,
    /// Configure command has been accepted
    pub configured: bool,
    /// Completion is polled rather than interrupt driven
    pub polling_mode: bool,
    /// New commands interrupt the embedded scheduler
    pub cq_interrupt: bool,
    /// CU DMA module requested
    pub cu_dma: bool,
    /// CU interrupts requested
    pub cu_isr: bool,
    /// Embedded scheduler dispatch is active
    pub ert: bool,
    /// Number of busy command queue slots
    pub busy_slots: u32,
    /// Number of busy CUs
    pub busy_cus: u32,
    /// Number of occupied entries in the submitted-slot table
    pub submitted: u32,
}

impl ExecCore {
    /// Create an execution core for one device
    ///
    /// # Arguments
    /// * `regio`      - Register access into the device base region
    /// * `caps`       - Capabilities from the device feature ROM
    /// * `ert_region` - ERT control block and CQ BRAM regions when this
    ///   scheduler itself runs on the device
    pub fn new(
        regio: Arc<dyn RegIo>,
        caps: DevCaps,
        ert_region: Option<ErtRegion>,
    ) -> Arc<Self> {
        Arc::new(Self {
            regio,
            caps,
            ert_region,
            state: Mutex::new(ExecState::default()),
            clients: Mutex::new(Vec::new()),
            completion_mutex: Mutex::new(()),
            completion_cond: Condvar::new(),
            sr: Default::default(),
            ert_mode: AtomicBool::new(false),
            polling_mirror: AtomicBool::new(true),
            cq_interrupt_mirror: AtomicBool::new(false),
            needs_reset: AtomicBool::new(false),
            outstanding_execs: AtomicUsize::new(0),
            total_execs: AtomicU64::new(0),
        })
    }

    /// Whether this core is a device-side (embedded) deployment
    pub(crate) fn device_side(&self) -> bool {
        self.ert_region.is_some()
    }

    /// Reset this core to its post-probe state
    ///
    /// Stale commands belonging to the core are force recycled. Safe to call
    /// between client sessions; the first client of a device always resets.
    pub fn reset(self: &Arc<Self>) {
        reset_exec(self);
    }

    /// Whether teardown flagged this device for reset
    pub fn needs_reset(&self) -> bool {
        self.needs_reset.load(Ordering::Acquire)
    }

    /// Number of commands submitted and not yet retired
    pub fn outstanding_execs(&self) -> usize {
        self.outstanding_execs.load(Ordering::Acquire)
    }

    /// Total number of commands ever submitted to this core
    pub fn total_execs(&self) -> u64 {
        self.total_execs.load(Ordering::Relaxed)
    }

    /// Snapshot the worker-side state
    pub fn snapshot(&self) -> ExecSnapshot {
        let st = self.state.lock();
        ExecSnapshot {
            num_slots: st.num_slots,
            num_cus: st.num_cus,
            num_slot_masks: st.num_slot_masks,
            num_cu_masks: st.num_cu_masks,
            cu_addr_map: st.cu_addr_map[..st.num_cus as usize].to_vec(),
            configured: st.configured,
            polling_mode: st.polling_mode,
            cq_interrupt: st.cq_interrupt,
            cu_dma: st.cu_dma,
            cu_isr: st.cu_isr,
            ert: st.ops.is_ert(),
            busy_slots: crate::masks::busy_count(&st.slot_status, st.num_slot_masks),
            busy_cus: crate::masks::busy_count(&st.cu_status, MAX_CU_MASKS as u32),
            submitted: st.submitted_cmds.iter().filter(|s| s.is_some()).count() as u32,
        }
    }
}

/// Reset an execution core and drop its stale commands
pub(crate) fn reset_exec(core: &Arc<ExecCore>) {
    scheduler::purge_exec_cmds(core);

    let mut st = core.state.lock();
    *st = ExecState::default();

    core.ert_mode.store(false, Ordering::Release);
    core.polling_mirror.store(true, Ordering::Release);
    core.cq_interrupt_mirror.store(false, Ordering::Release);
    for sr in &core.sr {
        sr.store(false, Ordering::Release);
    }
}

struct CfgValues {
    slot_size: u32,
    num_cus: u32,
    cu_shift: u32,
    cu_base_addr: u32,
    features: ConfigFeatures,
    count: u32,
}

/// Process a configure command
///
/// Only the first configure command of a device is accepted. On success the
/// dispatch ops, CQ geometry, and CU address map are all in place and
/// `configured` latches true for the lifetime of the core.
#[instrument(skip_all, fields(id = cmd.id))]
pub(crate) fn configure(
    sched: &Scheduler,
    core: &Arc<ExecCore>,
    st: &mut ExecState,
    cmd: &mut ExecCmd,
) -> ExecResult<()> {
    let ert_avail = core.caps.ert;
    let cdma = core.caps.cdma;
    tracing::info!(ert = ert_avail, dsa = core.caps.dsa, "feature rom capabilities");

    if scheduler::sched_error_on(
        sched,
        cmd.opcode() != Some(Opcode::Configure),
        "expected configure command",
    ) {
        return Err(ExecError::BadPacket("expected configure command"));
    }

    if st.configured {
        tracing::info!("command scheduler is already configured for this device");
        return Err(ExecError::AlreadyConfigured);
    }

    let cfg = cmd
        .buffer
        .with_packet(|p| {
            ConfigurePacket::new(p).map(|c| CfgValues {
                slot_size: c.slot_size(),
                num_cus: c.num_cus(),
                cu_shift: c.cu_shift(),
                cu_base_addr: c.cu_base_addr(),
                features: c.features(),
                count: c.count(),
            })
        })
        .ok_or(ExecError::BadPacket("malformed configure packet"))?;

    if cfg.count != CONFIGURE_FIXED_WORDS + cfg.num_cus {
        tracing::info!(
            count = cfg.count,
            num_cus = cfg.num_cus,
            "invalid configure command, expected count of 5+num_cus"
        );
        return Err(ExecError::BadPacket("configure count mismatch"));
    }

    let max_cus = if cdma { MAX_CUS as u32 - 1 } else { MAX_CUS as u32 };
    if cfg.num_cus > max_cus {
        return Err(ExecError::BadPacket("too many compute units"));
    }

    if cfg.slot_size == 0
        || CQ_SIZE / cfg.slot_size == 0
        || CQ_SIZE / cfg.slot_size > MAX_SLOTS as u32
    {
        return Err(ExecError::BadPacket("invalid slot size"));
    }

    tracing::debug!("configuring scheduler");
    st.num_slots = CQ_SIZE / cfg.slot_size;
    st.num_cus = cfg.num_cus;
    st.cu_shift_offset = cfg.cu_shift;
    st.cu_base_addr = cfg.cu_base_addr;
    st.num_slot_masks = st.num_slots.div_ceil(32);

    // count was validated against num_cus, the address table is in bounds
    let cu_addrs: Vec<u32> = cmd.buffer.with_packet(|p| {
        ConfigurePacket::new(p)
            .map(|c| (0..cfg.num_cus).map(|i| c.cu_addr(i)).collect())
            .unwrap_or_default()
    });
    for (i, addr) in cu_addrs.iter().enumerate() {
        st.cu_addr_map[i] = *addr;
        tracing::debug!("configure cu({i}) at 0x{addr:x}");
    }

    if cdma {
        st.cu_addr_map[st.num_cus as usize] = CDMA_CU_ADDR;
        tracing::debug!("configure cdma cu({}) at 0x{CDMA_CU_ADDR:x}", st.num_cus);
        st.num_cus += 1;
        cmd.buffer.with_words_mut(|words| {
            words[CONFIGURE_NUM_CUS_WORD] = st.num_cus;
        });
    }
    st.num_cu_masks = st.num_cus.div_ceil(32);

    if core.device_side() {
        // this scheduler is the embedded runtime; CUs are driven directly
        // and the accepted configuration is programmed into the control block
        tracing::debug!("configuring embedded-side scheduler mode");
        st.ops = SchedOps::Penguin;
        st.polling_mode = cfg.features.polling();
        st.cq_interrupt = cfg.features.cq_int();
        st.cu_dma = cfg.features.cu_dma();
        st.cu_isr = cfg.features.cu_isr();
        setup_ert_hw(core, st);
    } else if ert_avail && cfg.features.ert() {
        tracing::debug!("configuring embedded scheduler mode");
        st.ops = SchedOps::Ert;
        st.polling_mode = cfg.features.polling();
        st.cq_interrupt = cfg.features.cq_int();
        // stamp capabilities back for the firmware
        let dsa52 = core.caps.dsa >= 52;
        cmd.buffer.with_words_mut(|words| {
            let features = ConfigFeatures::from(words[CONFIGURE_FEATURES_WORD])
                .with_dsa52(dsa52)
                .with_cdma(cdma);
            words[CONFIGURE_FEATURES_WORD] = features.into();
        });
    } else {
        tracing::debug!("configuring penguin scheduler mode");
        st.ops = SchedOps::Penguin;
        st.polling_mode = true;
    }

    core.ert_mode.store(st.ops.is_ert(), Ordering::Release);
    core.polling_mirror.store(st.polling_mode, Ordering::Release);
    core.cq_interrupt_mirror.store(st.cq_interrupt, Ordering::Release);

    st.configured = true;

    tracing::info!(
        ert = st.ops.is_ert(),
        slots = st.num_slots,
        cus = st.num_cus,
        cu_shift = st.cu_shift_offset,
        cu_masks = st.num_cu_masks,
        polling = st.polling_mode,
        cq_interrupt = st.cq_interrupt,
        "scheduler configured, cu_base 0x{:x}",
        st.cu_base_addr
    );

    Ok(())
}

/// Program the accepted configuration into the device-side ERT control block
fn setup_ert_hw(core: &ExecCore, st: &ExecState) {
    let Some(region) = &core.ert_region else {
        return;
    };
    let hw = &region.hw;

    hw.write32(ert_hw::CQ_SLOT_SIZE, st.slot_size() / 4);
    hw.write32(ert_hw::CU_OFFSET, st.cu_shift_offset);
    hw.write32(ert_hw::CQ_NUM_SLOTS, st.num_slots);
    hw.write32(ert_hw::CU_BASE_ADDR, ert_hw::CU_PHYS_BASE);
    hw.write32(ert_hw::CQ_BASE_ADDR, ert_hw::CQ_PHYS_BASE);
    hw.write32(ert_hw::NUM_CU, st.num_cus);
    hw.write32(ert_hw::CU_DMA_ENABLE, st.cu_dma as u32);
    hw.write32(ert_hw::HOST_INT_ENABLE, (!st.polling_mode) as u32);
}

/// Execute a register-write command
///
/// Cannot currently fail; the caller still routes a failure to the Error
/// state should register access ever grow a fault path.
pub(crate) fn exec_write(core: &ExecCore, cmd: &mut ExecCmd) -> ExecResult<()> {
    tracing::debug!(id = cmd.id, "exec_write");
    cmd.buffer.with_packet(|p| {
        let count = p.count();
        let payload = p.payload();
        let mut idx = 0usize;
        while (idx as u32) + 1 < count {
            let addr = payload[idx];
            let val = payload[idx + 1];
            tracing::debug!("exec_write base[0x{addr:x}] = 0x{val:x}");
            core.regio.write32(addr, val);
            idx += 2;
        }
    });
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Register target that accepts everything and reads zero
    pub(crate) struct NullRegIo;

    impl RegIo for NullRegIo {
        fn read32(&self, _offset: u32) -> u32 {
            0
        }
        fn write32(&self, _offset: u32, _value: u32) {}
    }

    #[test]
    fn test_reset_state_defaults() {
        let st = ExecState::default();
        assert_eq!(st.num_slots, 16);
        assert_eq!(st.num_slot_masks, 1);
        assert_eq!(st.num_cus, 0);
        assert!(st.polling_mode);
        assert!(!st.configured);
        assert_eq!(st.ops, SchedOps::Penguin);
        assert_eq!(st.slot_size(), CQ_SIZE / 16);
    }

    #[test]
    fn test_slot_acquire_release_tracks_status() {
        let mut st = ExecState::default();
        let slot = st.acquire_slot().unwrap();
        assert_eq!(slot, 0);
        assert!(crate::masks::is_busy(&st.slot_status, 0));
        st.release_slot(slot);
        assert!(!crate::masks::is_busy(&st.slot_status, 0));
    }
}
