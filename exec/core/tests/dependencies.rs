// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(clippy::unwrap_used)]

use accl_exec_test_helpers::*;
use test_log::test;

const CU0: u32 = 0x1_0000;
const CU1: u32 = 0x2_0000;

fn configured_rig() -> TestRig {
    let rig = TestRig::penguin();
    rig.sim.add_cu(CU0);
    let cfg = configure_cmd(4096, 16, 0, ConfigFeatures::new(), &[CU0, CU1]);
    rig.submit(&cfg).unwrap();
    assert!(rig.wait_state(&cfg, CmdState::Completed));
    rig
}

#[test]
fn test_dependent_waits_for_predecessor() {
    let rig = configured_rig();
    rig.sim.add_cu(CU1);

    let a = start_cu_cmd(0x1, &[0, 0x11]);
    rig.submit(&a).unwrap();
    assert!(rig.wait_cu_running(CU0));

    let b = start_cu_cmd(0x2, &[0, 0x22]);
    rig.submit_with_deps(&b, &[a.clone()]).unwrap();

    // CU 1 is free, only the dependency holds B back
    std::thread::sleep(std::time::Duration::from_millis(20));
    assert_eq!(rig.sim.cu_starts(CU1), 0);

    rig.sim.complete_cu(CU0);
    assert!(rig.wait_state(&a, CmdState::Completed));

    assert!(rig.wait_cu_running(CU1));
    rig.sim.complete_cu(CU1);
    assert!(rig.wait_state(&b, CmdState::Completed));
}

#[test]
fn test_dependency_on_completed_buffer_is_free() {
    let rig = configured_rig();
    rig.sim.add_cu(CU1);

    let a = start_cu_cmd(0x1, &[0, 0x11]);
    rig.submit(&a).unwrap();
    assert!(rig.wait_cu_running(CU0));
    rig.sim.complete_cu(CU0);
    assert!(rig.wait_state(&a, CmdState::Completed));

    // the buffer no longer names an active command
    let b = start_cu_cmd(0x2, &[0, 0x22]);
    rig.submit_with_deps(&b, &[a.clone()]).unwrap();
    assert!(rig.wait_cu_running(CU1));
    rig.sim.complete_cu(CU1);
    assert!(rig.wait_state(&b, CmdState::Completed));
}

#[test]
fn test_wait_count_covers_all_dependencies() {
    let rig = TestRig::penguin();
    let cu_addrs: Vec<u32> = (0..9).map(|i| 0x1_0000 + i * 0x1_0000).collect();
    for addr in &cu_addrs[..8] {
        rig.sim.add_cu(*addr);
    }
    rig.sim.add_auto_cu(cu_addrs[8]);

    let cfg = configure_cmd(4096, 16, 0, ConfigFeatures::new(), &cu_addrs);
    rig.submit(&cfg).unwrap();
    assert!(rig.wait_state(&cfg, CmdState::Completed));

    // eight predecessors, each holding its own CU
    let preds: Vec<ExecBuf> = (0..8)
        .map(|i| {
            let cmd = start_cu_cmd(1 << i, &[0, i as u32]);
            rig.submit(&cmd).unwrap();
            assert!(rig.wait_cu_running(cu_addrs[i]));
            cmd
        })
        .collect();

    let tail = start_cu_cmd(1 << 8, &[0, 0xFF]);
    rig.submit_with_deps(&tail, &preds).unwrap();

    // half the dependencies done is not enough
    for addr in &cu_addrs[..4] {
        rig.sim.complete_cu(*addr);
    }
    for pred in &preds[..4] {
        assert!(rig.wait_state(pred, CmdState::Completed));
    }
    std::thread::sleep(std::time::Duration::from_millis(20));
    assert_eq!(rig.sim.cu_starts(cu_addrs[8]), 0);

    for addr in &cu_addrs[4..8] {
        rig.sim.complete_cu(*addr);
    }
    assert!(rig.wait_state(&tail, CmdState::Completed));
}

#[test]
fn test_chain_overflow_errors_ninth_waiter() {
    let rig = configured_rig();
    rig.sim.add_auto_cu(CU1);

    let a = start_cu_cmd(0x1, &[0, 0x11]);
    rig.submit(&a).unwrap();
    assert!(rig.wait_cu_running(CU0));

    let waiters: Vec<ExecBuf> = (0..9)
        .map(|i| {
            let cmd = start_cu_cmd(0x2, &[0, i]);
            rig.submit_with_deps(&cmd, &[a.clone()]).unwrap();
            cmd
        })
        .collect();

    // the ninth waiter exceeds the chain capacity of A
    assert!(rig.wait_state(&waiters[8], CmdState::Error));

    rig.sim.complete_cu(CU0);
    assert!(rig.wait_state(&a, CmdState::Completed));
    for waiter in &waiters[..8] {
        assert!(rig.wait_state(waiter, CmdState::Completed));
    }

    // the errored waiter never reached the device
    assert_eq!(rig.sim.cu_starts(CU1), 8);
    assert_eq!(rig.exec.snapshot().busy_cus, 0);
}
