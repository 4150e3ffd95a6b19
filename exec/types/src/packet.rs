// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Execution core wire types - Command packet module
//!
//! A command packet is a word-addressed blob: one header word followed by
//! `count` payload words. The header bit layout is fixed by the firmware ABI;
//! the rest of the system depends only on the named accessors defined here.

use bitfield_struct::bitfield;

/// Command packet header word
///
/// `state` is written back by the scheduler so the submitting process can
/// observe terminal states directly in its buffer.
#[bitfield(u32)]
pub struct PacketHeader {
    /// Command state, see [`CmdState`]
    #[bits(4)]
    pub state: u8,

    /// Opcode specific bits; low two bits carry `extra_cu_masks` for
    /// kernel start commands
    #[bits(8)]
    pub custom: u8,

    /// Number of payload words following the header
    #[bits(11)]
    pub count: u16,

    /// Command opcode, see [`Opcode`]
    #[bits(5)]
    pub opcode: u8,

    /// Command type, see [`CmdKind`]
    #[bits(4)]
    pub kind: u8,
}

/// Command opcodes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Start a kernel identified by CU masks and a register map
    StartKernel = 0x0,

    /// Start a compute unit; same payload shape as `StartKernel`
    StartCu = 0x1,

    /// Configure the scheduler, first command on a device
    Configure = 0x2,

    /// Stop the embedded scheduler
    Stop = 0x3,

    /// Abort a previously submitted command
    Abort = 0x4,

    /// Execute raw `(address, value)` register writes
    Write = 0x5,
}

impl Opcode {
    /// Decode an opcode field value
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x0 => Some(Self::StartKernel),
            0x1 => Some(Self::StartCu),
            0x2 => Some(Self::Configure),
            0x3 => Some(Self::Stop),
            0x4 => Some(Self::Abort),
            0x5 => Some(Self::Write),
            _ => None,
        }
    }
}

/// Command types
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CmdKind {
    /// Regular device command
    #[default]
    Default = 0x0,

    /// Scheduler-local command, never touches the device
    KdsLocal = 0x1,

    /// Control command
    Ctrl = 0x2,
}

impl CmdKind {
    /// Decode a type field value; unknown values fold to `Default`
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0x1 => Self::KdsLocal,
            0x2 => Self::Ctrl,
            _ => Self::Default,
        }
    }
}

/// Command states
///
/// Zero is reserved so that freshly cleared command queue memory does not
/// parse as a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CmdState {
    /// Set by the submitter, command not yet admitted
    New = 1,

    /// Admitted into the scheduler command queue
    Queued = 2,

    /// Submitted to the device or a CU
    Running = 3,

    /// Finished successfully
    Completed = 4,

    /// Finished with an error
    Error = 5,

    /// Retired without execution after client teardown
    Abort = 6,
}

impl CmdState {
    /// Decode a state field value
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::New),
            2 => Some(Self::Queued),
            3 => Some(Self::Running),
            4 => Some(Self::Completed),
            5 => Some(Self::Error),
            6 => Some(Self::Abort),
            _ => None,
        }
    }

    /// Whether a command in this state is finished and can be recycled
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Abort)
    }
}

/// Feature word of a configure command payload
#[bitfield(u32)]
pub struct ConfigFeatures {
    /// Request the embedded scheduler
    pub ert: bool,

    /// Poll for completion instead of interrupts
    pub polling: bool,

    /// Enable the CU DMA module
    pub cu_dma: bool,

    /// Enable CU interrupts
    pub cu_isr: bool,

    /// Interrupt the embedded scheduler on new commands
    pub cq_int: bool,

    /// Device exposes a CDMA engine, stamped back by the scheduler
    pub cdma: bool,

    /// Shell is version 5.2 or newer, stamped back by the scheduler
    pub dsa52: bool,

    #[bits(25)]
    __: u32,
}

/// Number of fixed payload words in a configure command before the CU
/// address table
pub const CONFIGURE_FIXED_WORDS: u32 = 5;

/// Word index of the `num_cus` field within a configure packet
pub const CONFIGURE_NUM_CUS_WORD: usize = 2;

/// Word index of the feature word within a configure packet
pub const CONFIGURE_FEATURES_WORD: usize = 5;

/// Read-only view of a command packet
#[derive(Clone, Copy)]
pub struct Packet<'a> {
    words: &'a [u32],
}

impl<'a> Packet<'a> {
    /// Wrap a word buffer holding at least the header
    pub fn new(words: &'a [u32]) -> Self {
        debug_assert!(!words.is_empty());
        Self { words }
    }

    /// Packet header word
    pub fn header(&self) -> PacketHeader {
        PacketHeader::from(self.words[0])
    }

    /// Command state recorded in the header
    pub fn state(&self) -> Option<CmdState> {
        CmdState::from_raw(self.header().state())
    }

    /// Command opcode
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_raw(self.header().opcode())
    }

    /// Command type
    pub fn kind(&self) -> CmdKind {
        CmdKind::from_raw(self.header().kind())
    }

    /// Payload size in words
    pub fn count(&self) -> u32 {
        self.header().count() as u32
    }

    /// Packet size in words, including the header
    pub fn packet_size(&self) -> u32 {
        self.count() + 1
    }

    /// Number of CU mask words in the payload
    ///
    /// Kernel and CU start commands carry one mandatory mask word plus
    /// `extra_cu_masks` additional ones; every other opcode carries none.
    pub fn cu_masks(&self) -> u32 {
        match self.opcode() {
            Some(Opcode::StartKernel) | Some(Opcode::StartCu) => 1 + self.extra_cu_masks(),
            _ => 0,
        }
    }

    /// Number of CU mask words beyond the mandatory first one
    pub fn extra_cu_masks(&self) -> u32 {
        (self.header().custom() & 0x3) as u32
    }

    /// Size of the register map in words
    pub fn regmap_size(&self) -> u32 {
        self.count() - self.cu_masks()
    }

    /// Whether the backing buffer and the header agree
    ///
    /// A packet is well formed when the buffer holds at least `count + 1`
    /// words and, for kernel start commands, the payload is long enough to
    /// carry its own CU mask words.
    pub fn well_formed(&self) -> bool {
        self.words.len() >= self.packet_size() as usize && self.count() >= self.cu_masks()
    }

    /// Payload words, header excluded
    pub fn payload(&self) -> &'a [u32] {
        let end = (self.packet_size() as usize).min(self.words.len());
        &self.words[1..end]
    }

    /// CU mask word `idx`, the first mask addresses CUs 0 through 31
    pub fn cu_mask_word(&self, idx: u32) -> u32 {
        self.words[1 + idx as usize]
    }

    /// Register map word `idx`; word 0 is reserved for AP_START
    pub fn regmap_word(&self, idx: u32) -> u32 {
        self.words[(1 + self.cu_masks() + idx) as usize]
    }
}

/// Size in words of a packet found in CQ BRAM, derived from its opcode
///
/// Used by the device-side poller, which sees the header before any payload
/// has been sized. The result includes the header word.
pub fn get_packet_size(header: PacketHeader) -> u32 {
    let payload = match Opcode::from_raw(header.opcode()) {
        Some(Opcode::Configure) => CONFIGURE_FIXED_WORDS + header.count() as u32,
        Some(Opcode::StartCu) | Some(Opcode::StartKernel) => header.count() as u32,
        _ => 0,
    };
    1 + payload
}

/// View of a configure command payload
pub struct ConfigurePacket<'a> {
    packet: Packet<'a>,
}

impl<'a> ConfigurePacket<'a> {
    /// Reinterpret a packet as a configure command
    ///
    /// # Returns
    /// * `None` - Packet opcode is not `Configure` or the payload is shorter
    ///   than the fixed configure words
    pub fn new(packet: Packet<'a>) -> Option<Self> {
        if packet.opcode() != Some(Opcode::Configure)
            || packet.count() < CONFIGURE_FIXED_WORDS
            || packet.words.len() < packet.packet_size() as usize
        {
            return None;
        }
        Some(Self { packet })
    }

    /// Requested command queue slot size in bytes
    pub fn slot_size(&self) -> u32 {
        self.packet.words[1]
    }

    /// Number of CUs in the loaded program
    pub fn num_cus(&self) -> u32 {
        self.packet.words[2]
    }

    /// CU index to address shift value
    pub fn cu_shift(&self) -> u32 {
        self.packet.words[3]
    }

    /// Base address of the CU address space
    pub fn cu_base_addr(&self) -> u32 {
        self.packet.words[4]
    }

    /// Requested feature set
    pub fn features(&self) -> ConfigFeatures {
        ConfigFeatures::from(self.packet.words[5])
    }

    /// CU address table entry `idx`
    pub fn cu_addr(&self, idx: u32) -> u32 {
        self.packet.words[(1 + CONFIGURE_FIXED_WORDS + idx) as usize]
    }

    /// Payload word count carried by the header
    pub fn count(&self) -> u32 {
        self.packet.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(state: u8, custom: u8, count: u16, opcode: u8, kind: u8) -> u32 {
        PacketHeader::new()
            .with_state(state)
            .with_custom(custom)
            .with_count(count)
            .with_opcode(opcode)
            .with_kind(kind)
            .into()
    }

    #[test]
    fn test_header_round_trip() {
        let word = header(1, 0x2, 7, 0x1, 0x0);
        let hdr = PacketHeader::from(word);
        assert_eq!(hdr.state(), 1);
        assert_eq!(hdr.custom(), 0x2);
        assert_eq!(hdr.count(), 7);
        assert_eq!(hdr.opcode(), 0x1);
        assert_eq!(hdr.kind(), 0x0);
    }

    #[test]
    fn test_start_cu_accessors() {
        // one mandatory mask, one extra mask, three regmap words
        let words = vec![header(1, 0x1, 5, 0x1, 0x0), 0x1, 0x0, 0x0, 0xAA, 0xBB];
        let pkt = Packet::new(&words);
        assert_eq!(pkt.opcode(), Some(Opcode::StartCu));
        assert_eq!(pkt.packet_size(), 6);
        assert_eq!(pkt.cu_masks(), 2);
        assert_eq!(pkt.regmap_size(), 3);
        assert_eq!(pkt.cu_mask_word(0), 0x1);
        assert_eq!(pkt.regmap_word(1), 0xAA);
        assert_eq!(pkt.regmap_word(2), 0xBB);
    }

    #[test]
    fn test_non_start_has_no_masks() {
        let words = vec![header(1, 0, 4, 0x5, 0x0), 0x10, 0x1, 0x14, 0x2];
        let pkt = Packet::new(&words);
        assert_eq!(pkt.opcode(), Some(Opcode::Write));
        assert_eq!(pkt.cu_masks(), 0);
        assert_eq!(pkt.regmap_size(), 4);
    }

    #[test]
    fn test_configure_view() {
        let words = vec![
            header(1, 0, 6, 0x2, 0x0),
            4096,
            1,
            16,
            0,
            ConfigFeatures::new().with_ert(true).into(),
            0x1_0000,
        ];
        let pkt = Packet::new(&words);
        let cfg = ConfigurePacket::new(pkt).unwrap();
        assert_eq!(cfg.slot_size(), 4096);
        assert_eq!(cfg.num_cus(), 1);
        assert_eq!(cfg.cu_shift(), 16);
        assert_eq!(cfg.cu_base_addr(), 0);
        assert!(cfg.features().ert());
        assert_eq!(cfg.cu_addr(0), 0x1_0000);
    }

    #[test]
    fn test_configure_view_rejects_other_opcodes() {
        let words = vec![header(1, 0, 5, 0x1, 0x0), 0, 0, 0, 0, 0];
        assert!(ConfigurePacket::new(Packet::new(&words)).is_none());
    }

    #[test]
    fn test_get_packet_size_by_opcode() {
        let cfg = PacketHeader::new().with_opcode(0x2).with_count(6);
        assert_eq!(get_packet_size(cfg), 1 + 5 + 6);

        let start = PacketHeader::new().with_opcode(0x1).with_count(4);
        assert_eq!(get_packet_size(start), 5);

        let stop = PacketHeader::new().with_opcode(0x3).with_count(9);
        assert_eq!(get_packet_size(stop), 1);
    }

    #[test]
    fn test_state_terminal() {
        assert!(!CmdState::New.is_terminal());
        assert!(!CmdState::Queued.is_terminal());
        assert!(!CmdState::Running.is_terminal());
        assert!(CmdState::Completed.is_terminal());
        assert!(CmdState::Error.is_terminal());
        assert!(CmdState::Abort.is_terminal());
    }
}
