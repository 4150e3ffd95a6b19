// Copyright (C) Microsoft Corporation. All rights reserved.

//! Compute unit model.
//!
//! A CU is a control register at a fixed address plus an argument register
//! file behind it. Writing AP_START latches the kernel as running; the done
//! bit appears either when the test completes the CU by hand or, for
//! auto-completing CUs, on the first status read after start.

use accl_exec_types::{AP_DONE, AP_START};

/// AP_IDLE bit reported by an idle control register
const AP_IDLE: u32 = 0x4;

/// Execution state of a simulated CU
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CuState {
    /// Waiting for AP_START
    Idle,

    /// Kernel accepted, not yet done
    Running,

    /// Kernel finished, AP_DONE visible
    Done,
}

pub(crate) struct SimCu {
    pub(crate) addr: u32,
    pub(crate) state: CuState,
    pub(crate) auto_complete: bool,

    /// Number of AP_START writes this CU ever accepted
    pub(crate) starts: u32,
}

impl SimCu {
    pub(crate) fn new(addr: u32, auto_complete: bool) -> Self {
        Self {
            addr,
            state: CuState::Idle,
            auto_complete,
            starts: 0,
        }
    }

    /// Control register write
    pub(crate) fn write_ctrl(&mut self, value: u32) {
        if value & AP_START != 0 {
            tracing::debug!("cu start at 0x{:x}", self.addr);
            self.state = CuState::Running;
            self.starts += 1;
        }
    }

    /// Control register read
    pub(crate) fn read_ctrl(&mut self) -> u32 {
        match self.state {
            CuState::Idle => AP_IDLE,
            CuState::Running => {
                if self.auto_complete {
                    self.state = CuState::Done;
                    AP_DONE
                } else {
                    AP_START
                }
            }
            CuState::Done => AP_DONE,
        }
    }

    /// Raise AP_DONE by hand
    pub(crate) fn complete(&mut self) {
        self.state = CuState::Done;
    }
}
