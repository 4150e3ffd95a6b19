// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interrupt service adaptor.
//!
//! The platform wires device IRQs 0..3 to [`exec_isr`]. The handler records
//! which completion status bank fired and wakes the worker; it reads only
//! lock-free mode mirrors and never touches scheduler state directly.

use std::sync::atomic::Ordering;

use crate::exec::ExecCore;
use crate::scheduler::GLOBAL_SCHEDULER;

/// Handle a completion interrupt from the device
///
/// # Arguments
/// * `exec` - Core the interrupt belongs to
/// * `irq`  - Status register bank that fired, 0..3
pub fn exec_isr(exec: &ExecCore, irq: u32) {
    tracing::debug!(irq, "exec_isr");

    let ert = exec.ert_mode.load(Ordering::Acquire);
    let polling = exec.polling_mirror.load(Ordering::Acquire);

    if ert && !polling && (irq as usize) < exec.sr.len() {
        exec.sr[irq as usize].store(true, Ordering::Release);

        GLOBAL_SCHEDULER.intc.store(true, Ordering::Release);
        GLOBAL_SCHEDULER.wake();
    } else {
        tracing::error!(irq, ert, polling, "unhandled isr");
    }
}
