// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Execution core interface library - Error module

use thiserror::Error;

/// Exec Error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Malformed or unexpected command packet
    #[error("bad command packet: {0}")]
    BadPacket(&'static str),

    /// Scheduler was already configured for this device
    #[error("command scheduler is already configured for this device")]
    AlreadyConfigured,

    /// A predecessor command has no room left for another waiter
    #[error("dependency chain capacity exceeded")]
    ChainOverflow,

    /// No free command queue slot or compute unit
    #[error("no free slot or compute unit")]
    BackendBusy,

    /// Register programming failed
    #[error("register write failed")]
    MmioFailed,

    /// Command was aborted by client teardown
    #[error("command aborted")]
    Aborted,

    /// Device kept commands outstanding past the teardown deadline
    #[error("device stuck with {0} outstanding commands, needs reset")]
    DeviceStuck(usize),

    /// Scheduler is not running
    #[error("scheduler is stopped")]
    SchedulerStopped,
}
