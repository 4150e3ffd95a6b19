// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command packet builders.

use accl_exec_core::ExecBuf;
use accl_exec_types::*;

/// Build a header word
pub fn header_word(opcode: Opcode, kind: CmdKind, count: u16, extra_cu_masks: u8) -> u32 {
    PacketHeader::new()
        .with_state(CmdState::New as u8)
        .with_custom(extra_cu_masks)
        .with_count(count)
        .with_opcode(opcode as u8)
        .with_kind(kind as u8)
        .into()
}

/// Raw words of a configure command
pub fn configure_words(
    slot_size: u32,
    cu_shift: u32,
    cu_base_addr: u32,
    features: ConfigFeatures,
    cu_addrs: &[u32],
) -> Vec<u32> {
    let count = (CONFIGURE_FIXED_WORDS as usize + cu_addrs.len()) as u16;
    let mut words = vec![
        header_word(Opcode::Configure, CmdKind::Default, count, 0),
        slot_size,
        cu_addrs.len() as u32,
        cu_shift,
        cu_base_addr,
        features.into(),
    ];
    words.extend_from_slice(cu_addrs);
    words
}

/// Configure command in a buffer object
pub fn configure_cmd(
    slot_size: u32,
    cu_shift: u32,
    cu_base_addr: u32,
    features: ConfigFeatures,
    cu_addrs: &[u32],
) -> ExecBuf {
    ExecBuf::new(configure_words(
        slot_size,
        cu_shift,
        cu_base_addr,
        features,
        cu_addrs,
    ))
}

/// Configure command with a deliberately wrong payload count
pub fn broken_configure_cmd(cu_addrs: &[u32]) -> ExecBuf {
    let mut words = configure_words(4096, 16, 0, ConfigFeatures::new(), cu_addrs);
    let bad_count = (CONFIGURE_FIXED_WORDS as usize + cu_addrs.len() + 1) as u16;
    words[0] = header_word(Opcode::Configure, CmdKind::Default, bad_count, 0);
    words.push(0);
    ExecBuf::new(words)
}

/// Raw words of a CU start command with one CU mask word
///
/// `regmap[0]` is the AP_START word and stays zero; the scheduler writes the
/// start bit itself, last.
pub fn start_cu_words(cu_mask: u32, regmap: &[u32]) -> Vec<u32> {
    let count = (1 + regmap.len()) as u16;
    let mut words = vec![header_word(Opcode::StartCu, CmdKind::Default, count, 0), cu_mask];
    words.extend_from_slice(regmap);
    words
}

/// CU start command in a buffer object
pub fn start_cu_cmd(cu_mask: u32, regmap: &[u32]) -> ExecBuf {
    ExecBuf::new(start_cu_words(cu_mask, regmap))
}

/// CU start command with extra CU mask words
pub fn start_cu_cmd_masks(cu_masks: &[u32], regmap: &[u32]) -> ExecBuf {
    assert!(!cu_masks.is_empty() && cu_masks.len() <= 4);
    let extra = (cu_masks.len() - 1) as u8;
    let count = (cu_masks.len() + regmap.len()) as u16;
    let mut words = vec![header_word(Opcode::StartCu, CmdKind::Default, count, extra)];
    words.extend_from_slice(cu_masks);
    words.extend_from_slice(regmap);
    ExecBuf::new(words)
}

/// Register-write command, scheduler local
pub fn write_cmd(pairs: &[(u32, u32)]) -> ExecBuf {
    let count = (pairs.len() * 2) as u16;
    let mut words = vec![header_word(Opcode::Write, CmdKind::KdsLocal, count, 0)];
    for (addr, value) in pairs {
        words.push(*addr);
        words.push(*value);
    }
    ExecBuf::new(words)
}

/// Scheduler-local no-op command
pub fn local_cmd() -> ExecBuf {
    ExecBuf::new(vec![
        header_word(Opcode::StartCu, CmdKind::KdsLocal, 1, 0),
        0,
    ])
}
