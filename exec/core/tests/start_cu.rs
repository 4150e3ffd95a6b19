// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(clippy::unwrap_used)]

use accl_exec_test_helpers::*;
use test_log::test;

const CU0: u32 = 0x1_0000;

fn configured_rig(cu_addrs: &[u32]) -> TestRig {
    let rig = TestRig::penguin();
    for addr in cu_addrs {
        rig.sim.add_cu(*addr);
    }
    let cfg = configure_cmd(4096, 16, 0, ConfigFeatures::new(), cu_addrs);
    rig.submit(&cfg).unwrap();
    assert!(rig.wait_state(&cfg, CmdState::Completed));
    rig
}

#[test]
fn test_start_cu_writes_regmap_then_start_bit() {
    let rig = configured_rig(&[CU0]);

    let cmd = start_cu_cmd(0x1, &[0, 0xAA, 0xBB]);
    rig.submit(&cmd).unwrap();
    assert!(rig.wait_cu_running(CU0));

    // argument words first, AP_START last
    let cu_writes: Vec<(u32, u32)> = rig
        .sim
        .writes()
        .into_iter()
        .filter(|(addr, _)| (CU0..CU0 + 0x10).contains(addr))
        .collect();
    assert_eq!(
        cu_writes,
        vec![(CU0 + 4, 0xAA), (CU0 + 8, 0xBB), (CU0, AP_START)]
    );

    // still running until the CU raises the done bit
    assert_eq!(cmd.state(), Some(CmdState::New));
    let snap = rig.exec.snapshot();
    assert_eq!(snap.busy_cus, 1);
    assert_eq!(snap.busy_slots, 1);
    // every busy slot has exactly one tracked command
    assert_eq!(snap.submitted, snap.busy_slots);

    rig.sim.complete_cu(CU0);
    assert!(rig.wait_state(&cmd, CmdState::Completed));

    let snap = rig.exec.snapshot();
    assert_eq!(snap.busy_cus, 0);
    assert_eq!(snap.busy_slots, 0);
    assert_eq!(snap.submitted, 0);
}

#[test]
fn test_start_cu_serializes_on_busy_cu() {
    let rig = configured_rig(&[CU0]);

    let first = start_cu_cmd(0x1, &[0, 0x11]);
    let second = start_cu_cmd(0x1, &[0, 0x22]);
    rig.submit(&first).unwrap();
    rig.submit(&second).unwrap();

    assert!(rig.wait_cu_running(CU0));
    std::thread::sleep(std::time::Duration::from_millis(20));
    // only one start has been accepted, the second command is parked
    assert_eq!(rig.sim.cu_starts(CU0), 1);
    assert_eq!(second.state(), Some(CmdState::New));

    rig.sim.complete_cu(CU0);
    assert!(rig.wait_state(&first, CmdState::Completed));

    assert!(wait_for(|| rig.sim.cu_starts(CU0) == 2));
    rig.sim.complete_cu(CU0);
    assert!(rig.wait_state(&second, CmdState::Completed));
}

#[test]
fn test_start_cu_second_mask_word() {
    let cu_addrs: Vec<u32> = (0..40).map(|i| 0x1_0000 + i * 0x1000).collect();
    let rig = configured_rig(&cu_addrs);

    // only CU 35 is allowed, it lives in the second mask word
    let cmd = start_cu_cmd_masks(&[0, 1 << 3], &[0, 0x77]);
    rig.submit(&cmd).unwrap();

    let cu35 = cu_addrs[35];
    assert!(rig.wait_cu_running(cu35));
    rig.sim.complete_cu(cu35);
    assert!(rig.wait_state(&cmd, CmdState::Completed));
}

#[test]
fn test_write_command_programs_registers() {
    let rig = configured_rig(&[CU0]);

    let cmd = write_cmd(&[(0x4000, 0x11), (0x4004, 0x22), (0x4008, 0x33)]);
    rig.submit(&cmd).unwrap();
    assert!(rig.wait_state(&cmd, CmdState::Completed));

    assert_eq!(rig.sim.read32(0x4000), 0x11);
    assert_eq!(rig.sim.read32(0x4004), 0x22);
    assert_eq!(rig.sim.read32(0x4008), 0x33);
}

#[test]
fn test_local_command_never_touches_device() {
    let rig = configured_rig(&[CU0]);
    let writes_before = rig.sim.writes().len();

    let cmd = local_cmd();
    rig.submit(&cmd).unwrap();
    assert!(rig.wait_state(&cmd, CmdState::Completed));

    assert_eq!(rig.sim.writes().len(), writes_before);
    assert_eq!(rig.sim.cu_starts(CU0), 0);
}
