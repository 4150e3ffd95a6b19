// Copyright (C) Microsoft Corporation. All rights reserved.

#![warn(missing_docs)]

//! Register-accurate simulated device for the scheduler engine.
//!
//! A [`SimDevice`] is a sparse register file with optional behavioral
//! models attached: compute units with AP_START/AP_DONE control registers,
//! read-to-clear completion status words, and an interrupt callback. Tests
//! drive the engine against it through the same [`RegIo`] seam the real
//! platform glue uses, and steer completion explicitly so every scenario is
//! deterministic.

mod cu;
mod device;

pub use cu::CuState;
pub use device::SimDevice;

pub use accl_exec_interface::RegIo;
