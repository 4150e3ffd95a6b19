// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! Command scheduler engine for the Osprey accelerator.
//!
//! User processes submit command packets referencing buffer objects; a
//! single worker thread admits them into the device command queue and
//! dispatches through one of two back-ends: the embedded runtime (ERT)
//! firmware, or software ("penguin") dispatch where the worker drives CUs
//! directly. Completion arrives by MMIO polling or through the interrupt
//! adaptor; clients learn about it through their poll trigger counters.
//!
//! The same engine serves device-side deployments, where it is itself the
//! embedded runtime: a poller thread lifts inbound packets out of CQ BRAM
//! and completions are raised as host-facing status register bits.

mod client;
mod cmd;
mod cq_thread;
mod ert;
mod exec;
mod isr;
mod masks;
mod ops;
mod penguin;
mod pool;
mod scheduler;

pub use accl_exec_interface::*;

pub use client::{
    create_client, destroy_client, poll_client, ClientCtx, TEARDOWN_POLL_INTERVAL,
    TEARDOWN_TIMEOUT_LOOPS,
};
pub use cmd::ExecBuf;
pub use cq_thread::{start_cq_poller, CqPoller};
pub use exec::{ExecCore, ExecSnapshot};
pub use isr::exec_isr;
pub use scheduler::{add_exec_buffer, scheduler_error, start_scheduler, stop_scheduler};
