// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device-side command queue poller.
//!
//! On deployments without a host-to-device interrupt, a second thread sweeps
//! CQ BRAM for packets the host deposited. A slot in New state is claimed by
//! writing Queued back into BRAM, copied into device memory, and fed to the
//! scheduler as a regular command carrying its CQ slot index, which the
//! completion path uses to raise the matching host status bit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use accl_exec_interface::{ExecError, ExecResult};
use accl_exec_types::*;

use crate::cmd::CmdBuffer;
use crate::exec::ExecCore;
use crate::scheduler::GLOBAL_SCHEDULER;
use crate::pool;

/// Handle on a running CQ poller thread
pub struct CqPoller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CqPoller {
    /// Whether the poller thread has exited
    pub fn finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    /// Signal the poller and wait for it to exit
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CqPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the CQ poller for a device-side core
///
/// # Error
/// * `ExecError::BadPacket` - The core has no ERT region to poll
pub fn start_cq_poller(core: &Arc<ExecCore>) -> ExecResult<CqPoller> {
    if core.ert_region.is_none() {
        return Err(ExecError::BadPacket("core has no command queue region"));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();
    let thread_core = core.clone();

    #[allow(
        clippy::expect_used,
        reason = "thread creation failing at startup is not recoverable"
    )]
    let handle = std::thread::Builder::new()
        .name("accl-ert-thread".into())
        .spawn(move || cq_check(&thread_core, &thread_stop))
        .expect("failed to spawn cq poller thread");

    Ok(CqPoller {
        stop,
        handle: Some(handle),
    })
}

/// Sweep CQ BRAM for new packets until stopped
///
/// Exits when CQ interrupts get enabled; the interrupt path supersedes
/// polling.
fn cq_check(core: &Arc<ExecCore>, stop: &AtomicBool) {
    tracing::debug!("cq poller started");
    let Some(region) = core.ert_region.clone() else {
        return;
    };

    while !stop.load(Ordering::Acquire) && !core.cq_interrupt_mirror.load(Ordering::Acquire) {
        let (num_slots, slot_size) = {
            let st = core.state.lock();
            (st.num_slots, st.slot_size())
        };

        for slot_idx in 0..num_slots {
            let slot_addr = slot_idx * slot_size;
            let header = PacketHeader::from(region.cq.read32(slot_addr));
            if CmdState::from_raw(header.state()) != Some(CmdState::New) {
                continue;
            }

            // claim the slot before copying it out
            region
                .cq
                .write32(slot_addr, header.with_state(CmdState::Queued as u8).into());

            let size = get_packet_size(header);
            tracing::debug!(slot_idx, size, "inbound packet 0x{:x}", u32::from(header));

            let mut words = vec![0u32; size as usize];
            region.cq.read_block(slot_addr, &mut words);

            if !Packet::new(&words).well_formed() {
                tracing::error!(slot_idx, "malformed inbound packet");
                region
                    .cq
                    .write32(slot_addr, header.with_state(CmdState::Error as u8).into());
                continue;
            }

            let mut cmd = pool::get_free_cmd(core.clone(), None, CmdBuffer::Raw(words), Vec::new());
            cmd.cq_slot_idx = Some(slot_idx);
            pool::add_cmd(cmd);
            GLOBAL_SCHEDULER.wake();
        }

        std::thread::yield_now();
    }
    tracing::debug!("cq poller exits");
}
