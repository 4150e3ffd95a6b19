// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Software ("penguin") dispatch back-end.
//!
//! The scheduler drives CUs directly: pick a free CU allowed by the command's
//! CU masks, transfer the register map, write AP_START, and poll AP_DONE.
//! Used on hosts without an embedded scheduler and on device-side
//! deployments where this code is the embedded runtime.

use accl_exec_types::*;

use crate::cmd::ExecCmd;
use crate::exec::{ExecCore, ExecState};
use crate::masks;
use crate::ops::{DispatchOps, QueryResult};
use crate::scheduler::{sched_error_on, Scheduler};

/// Software dispatch operations instance
pub(crate) static PENGUIN_OPS: PenguinOps = PenguinOps;

/// Software dispatch back-end
pub(crate) struct PenguinOps;

/// Pick the first CU that is allowed by the command's CU masks and not busy
///
/// The busy bit of the returned CU is set before returning.
fn get_free_cu(st: &mut ExecState, cmd: &ExecCmd) -> Option<u32> {
    let num_masks = cmd
        .buffer
        .with_packet(|p| p.cu_masks())
        .min(MAX_CU_MASKS as u32);
    for mask_idx in 0..num_masks {
        let cmd_mask = cmd.buffer.with_packet(|p| p.cu_mask_word(mask_idx));
        let busy_mask = st.cu_status[mask_idx as usize];
        if let Some(bit) = masks::first_free_candidate(cmd_mask, busy_mask) {
            st.cu_status[mask_idx as usize] ^= 1 << bit;
            let cu_idx = masks::idx_from_mask(bit, mask_idx);
            tracing::debug!(cu_idx, "get_free_cu");
            return Some(cu_idx);
        }
    }
    None
}

/// Transfer the command register map to CU `cu_idx` and start it
///
/// The first regmap word is skipped; AP_START is written last so the
/// argument writes are visible before the kernel starts.
fn configure_cu(core: &ExecCore, st: &ExecState, cmd: &ExecCmd, cu_idx: u32) {
    let cu_addr = st.cu_addr(cu_idx);
    cmd.buffer.with_packet(|p| {
        let size = p.regmap_size();
        tracing::debug!(cu_idx, regmap_size = size, "configure_cu at 0x{cu_addr:x}");
        for i in 1..size {
            core.regio.write32(cu_addr + (i << 2), p.regmap_word(i));
        }
        core.regio.write32(cu_addr, AP_START);
    });
}

/// Check whether CU `cu_idx` raised AP_DONE, freeing its busy bit if so
fn cu_done(core: &ExecCore, st: &mut ExecState, cu_idx: u32) -> bool {
    let cu_addr = st.cu_addr(cu_idx);
    // AP_DONE may appear alone or together with AP_IDLE; bit 1 is decisive
    if core.regio.read32(cu_addr) & AP_DONE != 0 {
        let mask_idx = masks::mask_idx(cu_idx) as usize;
        st.cu_status[mask_idx] ^= 1 << masks::idx_in_mask(cu_idx);
        tracing::debug!(cu_idx, "cu_done");
        return true;
    }
    false
}

impl DispatchOps for PenguinOps {
    /// Submit in software mode
    ///
    /// Configure and scheduler-local commands executed already in the
    /// transition that called submit; they only need a slot so retirement
    /// follows the normal flow.
    fn submit(
        &self,
        _sched: &Scheduler,
        core: &ExecCore,
        st: &mut ExecState,
        cmd: &mut ExecCmd,
    ) -> bool {
        let opcode = cmd.opcode();

        if opcode == Some(Opcode::Configure) || cmd.kind() == CmdKind::KdsLocal {
            match st.acquire_slot() {
                Some(slot) => {
                    cmd.slot_idx = Some(slot);
                    tracing::debug!(id = cmd.id, slot, "penguin_submit local");
                    return true;
                }
                None => return false,
            }
        }

        if opcode != Some(Opcode::StartCu) {
            return false;
        }

        let Some(cu_idx) = get_free_cu(st, cmd) else {
            return false;
        };

        let Some(slot) = st.acquire_slot() else {
            // hand the CU back, the command retries when a slot frees up
            let mask_idx = masks::mask_idx(cu_idx) as usize;
            st.cu_status[mask_idx] ^= 1 << masks::idx_in_mask(cu_idx);
            return false;
        };

        cmd.cu_idx = Some(cu_idx);
        cmd.slot_idx = Some(slot);

        configure_cu(core, st, cmd, cu_idx);

        tracing::debug!(id = cmd.id, cu_idx, slot, "penguin_submit");
        true
    }

    fn query(
        &self,
        sched: &Scheduler,
        core: &ExecCore,
        st: &mut ExecState,
        cmd: &mut ExecCmd,
    ) -> QueryResult {
        let opcode = cmd.opcode();

        if cmd.kind() == CmdKind::KdsLocal || opcode == Some(Opcode::Configure) {
            return QueryResult::Done;
        }

        if opcode == Some(Opcode::StartCu) {
            let Some(cu_idx) = cmd.cu_idx else {
                sched_error_on(sched, true, "no cu for submitted command");
                return QueryResult::Pending;
            };
            if cu_done(core, st, cu_idx) {
                return QueryResult::Done;
            }
        }

        QueryResult::Pending
    }
}
