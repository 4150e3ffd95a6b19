// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared scaffolding for scheduler tests: packet builders and rigs pairing
//! the engine with a simulated device.

#![allow(clippy::unwrap_used)]

mod packets;
mod rig;

pub use packets::*;
pub use rig::*;

pub use accl_exec_core::*;
pub use accl_exec_sim::SimDevice;
pub use accl_exec_types::*;

use std::time::{Duration, Instant};

/// Default deadline for waits in tests
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `cond` until it holds or [`WAIT_TIMEOUT`] expires
pub fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
