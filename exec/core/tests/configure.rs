// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(clippy::unwrap_used)]

use accl_exec_test_helpers::*;
use test_log::test;

#[test]
fn test_configure_one_cu() {
    let rig = TestRig::penguin();
    rig.sim.add_cu(0x1_0000);

    let cfg = configure_cmd(4096, 16, 0, ConfigFeatures::new(), &[0x1_0000]);
    rig.submit(&cfg).unwrap();
    assert!(rig.wait_state(&cfg, CmdState::Completed));

    let snap = rig.exec.snapshot();
    assert!(snap.configured);
    assert_eq!(snap.num_slots, CQ_SIZE / 4096);
    assert_eq!(snap.num_slots, 32);
    assert_eq!(snap.num_slot_masks, 1);
    assert_eq!(snap.num_cus, 1);
    assert_eq!(snap.num_cu_masks, 1);
    assert_eq!(snap.cu_addr_map, vec![0x1_0000]);
    assert!(snap.polling_mode);
    assert!(!snap.ert);
    assert_eq!(snap.busy_slots, 0);
    assert_eq!(snap.submitted, 0);

    // the completion was signalled to the client
    assert!(poll_client(
        &rig.exec,
        &rig.client,
        std::time::Duration::from_secs(1)
    ));
}

#[test]
fn test_second_configure_rejected() {
    let rig = TestRig::penguin();

    let first = configure_cmd(4096, 16, 0, ConfigFeatures::new(), &[0x1_0000]);
    rig.submit(&first).unwrap();
    assert!(rig.wait_state(&first, CmdState::Completed));

    let second = configure_cmd(2048, 16, 0, ConfigFeatures::new(), &[0x2_0000]);
    rig.submit(&second).unwrap();
    assert!(rig.wait_state(&second, CmdState::Error));

    // the original configuration stands
    let snap = rig.exec.snapshot();
    assert!(snap.configured);
    assert_eq!(snap.num_slots, 32);
    assert_eq!(snap.cu_addr_map, vec![0x1_0000]);
}

#[test]
fn test_configure_count_mismatch_is_error() {
    let rig = TestRig::penguin();

    let broken = broken_configure_cmd(&[0x1_0000]);
    rig.submit(&broken).unwrap();
    assert!(rig.wait_state(&broken, CmdState::Error));
    assert!(!rig.exec.snapshot().configured);
}

#[test]
fn test_configure_unaligned_slot_size() {
    let rig = TestRig::penguin();

    // not a power of two; slot count is the integer quotient
    let cfg = configure_cmd(3000, 16, 0, ConfigFeatures::new(), &[0x1_0000]);
    rig.submit(&cfg).unwrap();
    assert!(rig.wait_state(&cfg, CmdState::Completed));

    let snap = rig.exec.snapshot();
    assert_eq!(snap.num_slots, CQ_SIZE / 3000);
    assert_eq!(snap.num_slots, 43);
    assert_eq!(snap.num_slot_masks, 2);
}

#[test]
fn test_configure_zero_cus() {
    let rig = TestRig::penguin();

    let cfg = configure_cmd(4096, 16, 0, ConfigFeatures::new(), &[]);
    rig.submit(&cfg).unwrap();
    assert!(rig.wait_state(&cfg, CmdState::Completed));

    let snap = rig.exec.snapshot();
    assert!(snap.configured);
    assert_eq!(snap.num_cus, 0);
    assert_eq!(snap.num_cu_masks, 0);
    assert!(snap.cu_addr_map.is_empty());
}

#[test]
fn test_configure_full_cu_table() {
    let rig = TestRig::penguin();

    let cu_addrs: Vec<u32> = (0..MAX_CUS as u32).map(|i| 0x1_0000 + i * 0x1000).collect();
    let cfg = configure_cmd(1024, 16, 0, ConfigFeatures::new(), &cu_addrs);
    rig.submit(&cfg).unwrap();
    assert!(rig.wait_state(&cfg, CmdState::Completed));

    let snap = rig.exec.snapshot();
    assert_eq!(snap.num_cus, 128);
    assert_eq!(snap.num_cu_masks, 4);
    assert_eq!(snap.num_slots, 128);
    assert_eq!(snap.num_slot_masks, 4);
    assert_eq!(snap.cu_addr_map, cu_addrs);
}

#[test]
fn test_submit_rejects_truncated_packet() {
    let rig = TestRig::penguin();

    // header claims six payload words, buffer carries one
    let bo = ExecBuf::new(vec![
        header_word(Opcode::Configure, CmdKind::Default, 6, 0),
        4096,
    ]);
    assert_eq!(
        rig.submit(&bo),
        Err(ExecError::BadPacket("truncated command packet"))
    );
}

#[test]
fn test_submit_rejects_too_many_dependencies() {
    let rig = TestRig::penguin();

    let deps: Vec<ExecBuf> = (0..9).map(|_| local_cmd()).collect();
    let bo = local_cmd();
    assert_eq!(
        rig.submit_with_deps(&bo, &deps),
        Err(ExecError::BadPacket("too many dependencies"))
    );
}

#[test]
fn test_configure_cdma_appends_extra_cu() {
    let rig = TestRig::with_caps(DevCaps {
        cdma: true,
        ..Default::default()
    });

    let cfg = configure_cmd(4096, 16, 0, ConfigFeatures::new(), &[0x1_0000]);
    rig.submit(&cfg).unwrap();
    assert!(rig.wait_state(&cfg, CmdState::Completed));

    let snap = rig.exec.snapshot();
    assert_eq!(snap.num_cus, 2);
    assert_eq!(snap.cu_addr_map, vec![0x1_0000, CDMA_CU_ADDR]);

    // the packet was updated for the firmware to see
    cfg.with_packet(|p| {
        assert_eq!(p.payload()[CONFIGURE_NUM_CUS_WORD - 1], 2);
    });
}
