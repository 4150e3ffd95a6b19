// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Embedded scheduler (ERT) dispatch back-end.
//!
//! Commands are copied into command queue slots in device memory; the
//! firmware pulls them, drives the CUs, and reports completion through the
//! status registers, one bit per slot. The header word is written last so
//! the firmware never observes a partial packet.

use std::sync::atomic::Ordering;

use accl_exec_types::*;

use crate::cmd::ExecCmd;
use crate::exec::{ExecCore, ExecState};
use crate::masks;
use crate::ops::{DispatchOps, QueryResult};
use crate::scheduler::Scheduler;

/// Embedded scheduler dispatch operations instance
pub(crate) static ERT_OPS: ErtOps = ErtOps;

/// Embedded scheduler dispatch back-end
pub(crate) struct ErtOps;

impl DispatchOps for ErtOps {
    fn submit(
        &self,
        _sched: &Scheduler,
        core: &ExecCore,
        st: &mut ExecState,
        cmd: &mut ExecCmd,
    ) -> bool {
        let Some(slot) = st.acquire_slot() else {
            return false;
        };
        cmd.slot_idx = Some(slot);

        if cmd.kind() == CmdKind::KdsLocal {
            tracing::debug!(id = cmd.id, slot, "ert_submit local");
            return true;
        }

        let slot_addr = CQ_BASE + slot * st.slot_size();
        tracing::debug!(id = cmd.id, slot, "ert_submit at 0x{slot_addr:x}");

        cmd.buffer.with_packet(|p| {
            // payload first, the header write is the commit
            core.regio.write_block(slot_addr + 4, p.payload());
            core.regio.write32(slot_addr, p.header().into());
        });

        if st.cq_interrupt {
            let cq_int_addr = CQ_STATUS_REG + (masks::mask_idx(slot) << 2);
            let mask = 1 << masks::idx_in_mask(slot);
            tracing::debug!("ert_submit doorbell 0x{mask:x} at 0x{cq_int_addr:x}");
            core.regio.write32(cq_int_addr, mask);
        }

        true
    }

    /// Query completion through the status registers
    ///
    /// In polling mode the register is read every iteration; in interrupt
    /// mode only when the ISR flagged the bank, consuming the flag with an
    /// atomic swap so each interrupt is honored exactly once. All commands
    /// sharing the status word complete together.
    fn query(
        &self,
        _sched: &Scheduler,
        core: &ExecCore,
        st: &mut ExecState,
        cmd: &mut ExecCmd,
    ) -> QueryResult {
        if cmd.kind() == CmdKind::KdsLocal {
            return QueryResult::Done;
        }

        let Some(slot) = cmd.slot_idx else {
            return QueryResult::Pending;
        };
        let mask_idx = masks::mask_idx(slot);

        if st.polling_mode || core.sr[mask_idx as usize].swap(false, Ordering::AcqRel) {
            let csr_addr = STATUS_REG + (mask_idx << 2);
            let mask = core.regio.read32(csr_addr);
            if mask != 0 {
                tracing::debug!("ert_query csr 0x{csr_addr:x} mask 0x{mask:x}");
                return QueryResult::MaskDone { mask, mask_idx };
            }
        }

        QueryResult::Pending
    }
}
