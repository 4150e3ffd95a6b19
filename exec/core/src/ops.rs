// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Dispatch operations vtable.
//!
//! A device runs with exactly one of two back-ends: the embedded scheduler
//! (commands are written into CQ slots and the firmware drives the CUs) or
//! software dispatch (the worker picks a CU, writes its register map, and
//! polls AP_DONE). The selector is per device and changes only at configure.

use crate::cmd::ExecCmd;
use crate::exec::{ExecCore, ExecState};
use crate::scheduler::Scheduler;

/// Completion information produced by a back-end query
pub(crate) enum QueryResult {
    /// Command still in flight
    Pending,

    /// The queried command is complete
    Done,

    /// A completion status register fired; every set bit is a finished slot
    MaskDone {
        /// Status register contents
        mask: u32,
        /// Which of the four status words was read
        mask_idx: u32,
    },
}

/// Back-end specific scheduler operations
pub(crate) trait DispatchOps: Sync {
    /// Submit a command to the device
    ///
    /// # Returns
    /// * `bool` - Whether the command was accepted; a refused command stays
    ///   queued and is retried on a later iteration
    fn submit(
        &self,
        sched: &Scheduler,
        core: &ExecCore,
        st: &mut ExecState,
        cmd: &mut ExecCmd,
    ) -> bool;

    /// Check completion of a running command
    fn query(
        &self,
        sched: &Scheduler,
        core: &ExecCore,
        st: &mut ExecState,
        cmd: &mut ExecCmd,
    ) -> QueryResult;
}

/// Back-end selector held in the exec state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SchedOps {
    /// Software dispatch, host or device side
    Penguin,

    /// Embedded scheduler dispatch
    Ert,
}

impl SchedOps {
    pub(crate) fn dispatch(self) -> &'static dyn DispatchOps {
        match self {
            SchedOps::Penguin => &crate::penguin::PENGUIN_OPS,
            SchedOps::Ert => &crate::ert::ERT_OPS,
        }
    }

    pub(crate) fn is_ert(self) -> bool {
        self == SchedOps::Ert
    }
}
