// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Execution core wire types - Device register layout
//!
//! Byte offsets relative to the device base region unless noted otherwise.
//! The command queue is a fixed window partitioned into equal-size slots;
//! status and doorbell blocks are four words each, one bit per slot.

/// Command queue base address
pub const CQ_BASE: u32 = 0x19_0000;

/// Command queue size in bytes
pub const CQ_SIZE: u32 = 0x2_0000;

/// Completion status registers, four consecutive words
pub const STATUS_REG: u32 = 0x12_0000;

/// Command queue doorbell registers, four consecutive words
pub const CQ_STATUS_REG: u32 = 0x12_0010;

/// AP_START bit of a CU control register
pub const AP_START: u32 = 0x1;

/// AP_DONE bit of a CU control register
pub const AP_DONE: u32 = 0x2;

/// CU address reserved for the CDMA engine when the feature ROM enables it
pub const CDMA_CU_ADDR: u32 = 0x25_0000;

/// ERT control block register offsets, relative to the ERT hw region of a
/// device-side deployment.
pub mod ert_hw {
    /// Slot size in words
    pub const CQ_SLOT_SIZE: u32 = 0x0;

    /// CU index to address shift value
    pub const CU_OFFSET: u32 = 0x4;

    /// Number of command queue slots
    pub const CQ_NUM_SLOTS: u32 = 0x8;

    /// CU physical base address, in words
    pub const CU_BASE_ADDR: u32 = 0xC;

    /// Command queue physical base address, in words
    pub const CQ_BASE_ADDR: u32 = 0x10;

    /// Number of CUs
    pub const NUM_CU: u32 = 0x14;

    /// CU DMA module enable
    pub const CU_DMA_ENABLE: u32 = 0x18;

    /// Device to host interrupt enable
    pub const HOST_INT_ENABLE: u32 = 0x100;

    /// Host-facing completion status registers, four consecutive words
    pub const HOST_STATUS_REG: u32 = 0x1000;

    /// Physical CU base programmed into the control block, in words
    pub const CU_PHYS_BASE: u32 = 0x8180_0000 / 4;

    /// Physical CQ base programmed into the control block, in words
    pub const CQ_PHYS_BASE: u32 = 0x8019_0000 / 4;
}
