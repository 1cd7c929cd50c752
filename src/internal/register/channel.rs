//! Per-channel control/status register block
//!
//! One block per DMA engine channel, holding the Run control, the engine
//! status and error bits, the completed-descriptor-count register, the
//! alignment capability register, and the poll-mode writeback address.

use bitflags::bitflags;

use super::{C2H_CHANNEL_BASE, CHANNEL_STRIDE, H2C_CHANNEL_BASE, reg_ro, reg_rw, reg_wo};
use crate::driver::config::ChannelDirection;
use crate::mapping::BarMapping;

// =============================================================================
// Register Offsets
// =============================================================================

/// Identifier register offset
pub const IDENTIFIER_OFFSET: usize = 0x00;
/// Control register offset
pub const CONTROL_OFFSET: usize = 0x04;
/// Control write-1-to-set alias offset
pub const CONTROL_W1S_OFFSET: usize = 0x08;
/// Control write-1-to-clear alias offset
pub const CONTROL_W1C_OFFSET: usize = 0x0C;
/// Status register offset
pub const STATUS_OFFSET: usize = 0x40;
/// Status read-to-clear alias offset
pub const STATUS_RC_OFFSET: usize = 0x44;
/// Completed descriptor count register offset
pub const COMPLETED_COUNT_OFFSET: usize = 0x48;
/// Alignment capability register offset
pub const ALIGNMENTS_OFFSET: usize = 0x4C;
/// Poll-mode writeback address (low half) offset
pub const POLL_WRITEBACK_LO_OFFSET: usize = 0x88;
/// Poll-mode writeback address (high half) offset
pub const POLL_WRITEBACK_HI_OFFSET: usize = 0x8C;
/// Interrupt enable mask register offset
pub const INTERRUPT_ENABLE_OFFSET: usize = 0x90;

// =============================================================================
// Control / Status Bits
// =============================================================================

bitflags! {
    /// Channel Control register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelControl: u32 {
        /// Run the engine
        const RUN = 1 << 0;
        /// Interrupt enable: descriptor stopped
        const IE_DESCRIPTOR_STOPPED = 1 << 1;
        /// Interrupt enable: descriptor completed
        const IE_DESCRIPTOR_COMPLETED = 1 << 2;
        /// Interrupt enable: address/length alignment mismatch
        const IE_ALIGN_MISMATCH = 1 << 3;
        /// Interrupt enable: bad descriptor magic
        const IE_MAGIC_STOPPED = 1 << 4;
        /// Interrupt enable: invalid descriptor length
        const IE_INVALID_LENGTH = 1 << 5;
        /// Interrupt enable: engine went idle
        const IE_IDLE_STOPPED = 1 << 6;
        /// Interrupt enable: read error class
        const IE_READ_ERROR = 1 << 9;
        /// Interrupt enable: write error class
        const IE_WRITE_ERROR = 1 << 14;
        /// Interrupt enable: descriptor fetch error class
        const IE_DESCRIPTOR_ERROR = 1 << 19;
        /// Engine writes the completed count to the poll-mode writeback
        /// address after each Completed descriptor
        const POLLMODE_WRITEBACK_ENABLE = 1 << 26;
    }
}

bitflags! {
    /// Channel Status register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelStatus: u32 {
        /// Engine is processing descriptors
        const BUSY = 1 << 0;
        /// Engine halted on a Stop descriptor
        const DESCRIPTOR_STOPPED = 1 << 1;
        /// A Completed descriptor retired since last clear
        const DESCRIPTOR_COMPLETED = 1 << 2;
        /// Address or length violated the channel alignment rules
        const ALIGN_MISMATCH = 1 << 3;
        /// Descriptor fetched without the expected magic
        const MAGIC_STOPPED = 1 << 4;
        /// Descriptor byte count out of range
        const INVALID_LENGTH = 1 << 5;
        /// Engine went idle without a Stop descriptor
        const IDLE_STOPPED = 1 << 6;
        /// Read error class (5-bit sub-code)
        const READ_ERROR = 0x1F << 9;
        /// Write error class (5-bit sub-code)
        const WRITE_ERROR = 0x1F << 14;
        /// Descriptor fetch error class (5-bit sub-code)
        const DESCRIPTOR_ERROR = 0x1F << 19;

        /// Everything that fails the channel when observed
        const ERRORS = Self::ALIGN_MISMATCH.bits()
            | Self::MAGIC_STOPPED.bits()
            | Self::INVALID_LENGTH.bits()
            | Self::READ_ERROR.bits()
            | Self::WRITE_ERROR.bits()
            | Self::DESCRIPTOR_ERROR.bits();
    }
}

impl ChannelStatus {
    /// The error bits present in this status value, if any.
    #[inline]
    #[must_use]
    pub fn errors(self) -> Option<ChannelStatus> {
        let errors = self.intersection(ChannelStatus::ERRORS);
        (!errors.is_empty()).then_some(errors)
    }
}

// =============================================================================
// Alignment Capability Fields
// =============================================================================

/// Address alignment field shift in the Alignments register
pub const ALIGNMENTS_ADDR_SHIFT: u32 = 16;
/// Length granularity field shift in the Alignments register
pub const ALIGNMENTS_GRANULARITY_SHIFT: u32 = 8;
/// Each Alignments field is one byte wide
pub const ALIGNMENTS_FIELD_MASK: u32 = 0xFF;

// =============================================================================
// Register Block
// =============================================================================

/// Typed accessors over one channel's control/status block.
#[derive(Debug, Clone, Copy)]
pub struct ChannelRegs<'b> {
    bar: &'b BarMapping,
    base: usize,
}

impl<'b> ChannelRegs<'b> {
    /// Accessors for the given direction and channel index.
    #[must_use]
    pub fn new(bar: &'b BarMapping, direction: ChannelDirection, channel: u32) -> Self {
        let block = match direction {
            ChannelDirection::HostToCard => H2C_CHANNEL_BASE,
            ChannelDirection::CardToHost => C2H_CHANNEL_BASE,
        };
        Self {
            bar,
            base: block + channel as usize * CHANNEL_STRIDE,
        }
    }

    reg_ro!(identifier, IDENTIFIER_OFFSET, "the Identifier register");
    reg_rw!(control, set_control, CONTROL_OFFSET, "the Control register");
    reg_wo!(control_w1s, CONTROL_W1S_OFFSET, "the Control write-1-to-set alias");
    reg_wo!(control_w1c, CONTROL_W1C_OFFSET, "the Control write-1-to-clear alias");
    reg_ro!(status_raw, STATUS_OFFSET, "the Status register");
    reg_ro!(status_rc_raw, STATUS_RC_OFFSET, "the Status read-to-clear alias");
    reg_ro!(
        completed_descriptor_count,
        COMPLETED_COUNT_OFFSET,
        "the Completed Descriptor Count register"
    );
    reg_ro!(alignments, ALIGNMENTS_OFFSET, "the Alignments register");
    reg_rw!(
        interrupt_enable,
        set_interrupt_enable,
        INTERRUPT_ENABLE_OFFSET,
        "the Interrupt Enable Mask register"
    );

    /// Read the Status register as typed flags.
    #[inline]
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        ChannelStatus::from_bits_retain(self.status_raw())
    }

    /// Read the Status read-to-clear alias as typed flags.
    ///
    /// Latched event bits are consumed by this read; each engine error is
    /// therefore observed exactly once.
    #[inline]
    #[must_use]
    pub fn status_rc(&self) -> ChannelStatus {
        ChannelStatus::from_bits_retain(self.status_rc_raw())
    }

    /// Program the poll-mode writeback address (the completed-count word's
    /// IOVA).
    #[inline]
    pub fn set_poll_writeback_addr(&self, iova: u64) {
        self.bar
            .write32(self.base + POLL_WRITEBACK_LO_OFFSET, iova as u32);
        self.bar
            .write32(self.base + POLL_WRITEBACK_HI_OFFSET, (iova >> 32) as u32);
    }
}

// =============================================================================
// Tests
// =============================================================================
