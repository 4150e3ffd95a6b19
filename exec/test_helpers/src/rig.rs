// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scheduler-plus-simulator rigs.

use std::sync::Arc;

use accl_exec_core::*;
use accl_exec_sim::SimDevice;
use accl_exec_types::*;

use crate::wait_for;

/// Host-side rig: one device, one client, scheduler running
pub struct TestRig {
    /// Simulated device base region
    pub sim: Arc<SimDevice>,
    /// Execution core under test
    pub exec: Arc<ExecCore>,
    /// Client used for submissions
    pub client: Arc<ClientCtx>,
}

impl TestRig {
    /// Rig for a device without an embedded scheduler
    pub fn penguin() -> Self {
        Self::with_caps(DevCaps::default())
    }

    /// Rig for a device whose feature ROM advertises the embedded scheduler
    pub fn ert() -> Self {
        Self::with_caps(DevCaps {
            ert: true,
            cdma: false,
            dsa: 52,
        })
    }

    /// Rig with explicit capabilities
    pub fn with_caps(caps: DevCaps) -> Self {
        start_scheduler();
        let sim = Arc::new(SimDevice::new_host_device());
        let exec = ExecCore::new(sim.clone(), caps, None);
        let client = create_client(&exec);
        Self { sim, exec, client }
    }

    /// Submit a command buffer without dependencies
    pub fn submit(&self, bo: &ExecBuf) -> ExecResult<()> {
        add_exec_buffer(&self.exec, &self.client, bo, &[])
    }

    /// Submit a command buffer depending on earlier buffers
    pub fn submit_with_deps(&self, bo: &ExecBuf, deps: &[ExecBuf]) -> ExecResult<()> {
        add_exec_buffer(&self.exec, &self.client, bo, deps)
    }

    /// Wait until the packet of `bo` reports `state`
    pub fn wait_state(&self, bo: &ExecBuf, state: CmdState) -> bool {
        wait_for(|| bo.state() == Some(state))
    }

    /// Wait until the CU at `addr` accepted a start
    pub fn wait_cu_running(&self, addr: u32) -> bool {
        wait_for(|| self.sim.cu_state(addr) == Some(accl_exec_sim::CuState::Running))
    }

    /// Wait until the core has accepted a configure command
    pub fn wait_configured(&self) -> bool {
        wait_for(|| self.exec.snapshot().configured)
    }
}

impl Drop for TestRig {
    fn drop(&mut self) {
        let _ = destroy_client(&self.exec, &self.client);
        stop_scheduler();
    }
}

/// Device-side rig: the engine is the embedded runtime, commands arrive
/// through CQ BRAM and completions surface in the host status registers
pub struct DeviceRig {
    /// CU register region driven by the engine
    pub cu_region: Arc<SimDevice>,
    /// ERT control block and host status registers
    pub hw: Arc<SimDevice>,
    /// Command queue BRAM the host writes packets into
    pub cq: Arc<SimDevice>,
    /// Execution core under test
    pub exec: Arc<ExecCore>,
    poller: Option<CqPoller>,
}

impl DeviceRig {
    /// Start the scheduler and the CQ poller against fresh regions
    pub fn new() -> Self {
        start_scheduler();
        let cu_region = Arc::new(SimDevice::new());
        let hw = Arc::new(SimDevice::new());
        let cq = Arc::new(SimDevice::new());
        let exec = ExecCore::new(
            cu_region.clone(),
            DevCaps::default(),
            Some(ErtRegion {
                hw: hw.clone(),
                cq: cq.clone(),
            }),
        );
        let poller = start_cq_poller(&exec).unwrap();
        Self {
            cu_region,
            hw,
            cq,
            exec,
            poller: Some(poller),
        }
    }

    /// Current slot size per the core's configuration
    pub fn slot_size(&self) -> u32 {
        CQ_SIZE / self.exec.snapshot().num_slots
    }

    /// Deposit a packet into CQ BRAM slot `slot`
    ///
    /// Payload first, header last, so the poller never observes a torn
    /// packet.
    pub fn host_submit(&self, slot: u32, words: &[u32]) {
        let slot_addr = slot * self.slot_size();
        self.cq.write_block(slot_addr + 4, &words[1..]);
        self.cq.write32(slot_addr, words[0]);
    }

    /// Host-facing completion bit for CQ slot `slot`
    pub fn host_status_bit(&self, slot: u32) -> bool {
        let reg = ert_hw::HOST_STATUS_REG + ((slot >> 5) << 2);
        self.hw.peek(reg) & (1 << (slot & 0x1f)) != 0
    }

    /// Wait for the host-facing completion bit of `slot`
    pub fn wait_host_status(&self, slot: u32) -> bool {
        wait_for(|| self.host_status_bit(slot))
    }

    /// Wait until the core has accepted a configure command
    pub fn wait_configured(&self) -> bool {
        wait_for(|| self.exec.snapshot().configured)
    }

    /// Whether the poller thread has exited
    pub fn poller_finished(&self) -> bool {
        self.poller.as_ref().map(|p| p.finished()).unwrap_or(true)
    }
}

impl Default for DeviceRig {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeviceRig {
    fn drop(&mut self) {
        self.poller.take();
        stop_scheduler();
    }
}
