//! Device-visible descriptor and writeback layouts
//!
//! All layouts are little-endian and referenced in place inside the
//! caller's DMA-coherent descriptor region.

use bitflags::bitflags;

use super::VolatileCell;
use crate::internal::constants::{COMPLETED_COUNT_WRITEBACK_MASK, DMA_DESCRIPTOR_MAX_ADJACENT};

// =============================================================================
// Descriptor Control Word
// =============================================================================

/// Magic value the engine requires in the control word's upper half
pub const DESCRIPTOR_MAGIC: u32 = 0xAD4B;
/// Magic field shift in the control word
pub const DESCRIPTOR_MAGIC_SHIFT: u32 = 16;
/// Adjacent count field shift in the control word
pub const DESCRIPTOR_ADJACENT_SHIFT: u32 = 8;
/// Adjacent count field mask (before shift)
pub const DESCRIPTOR_ADJACENT_MASK: u32 = 0x3F;

bitflags! {
    /// Descriptor control flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DescriptorFlags: u32 {
        /// Engine halts after this descriptor
        const STOP = 0x01;
        /// Engine raises a completion pulse and bumps the completed count
        /// when this descriptor retires
        const COMPLETED = 0x02;
        /// Packet boundary (stream channels)
        const END_OF_PACKET = 0x10;
    }
}

/// Assemble a descriptor control word from flags and an adjacent count.
#[inline]
#[must_use]
pub fn control_word(flags: DescriptorFlags, adjacent: u32) -> u32 {
    debug_assert!(adjacent <= DMA_DESCRIPTOR_MAX_ADJACENT);
    (DESCRIPTOR_MAGIC << DESCRIPTOR_MAGIC_SHIFT)
        | ((adjacent & DESCRIPTOR_ADJACENT_MASK) << DESCRIPTOR_ADJACENT_SHIFT)
        | flags.bits()
}

// =============================================================================
// Descriptor
// =============================================================================

/// One 32-byte scatter-gather descriptor.
///
/// `magic|flags|byte_count|src_addr|dst_addr|next_addr`, fetched by the
/// engine from the descriptor region. The host owns every field; the
/// engine only reads.
#[repr(C)]
pub struct DmaDescriptor {
    /// Magic, adjacent count, and control flags
    control: VolatileCell<u32>,
    /// Bytes to move (up to `DMA_DESCRIPTOR_MAX_LEN`)
    byte_count: VolatileCell<u32>,
    /// Source address (host IOVA for H2C, card address for MM C2H)
    src_addr: VolatileCell<u64>,
    /// Destination address (card address for MM H2C, host IOVA for C2H)
    dst_addr: VolatileCell<u64>,
    /// IOVA of the next descriptor in the chain
    next_addr: VolatileCell<u64>,
}

impl DmaDescriptor {
    /// Size of the descriptor in bytes
    pub const SIZE: usize = 32;

    /// Write the control word.
    #[inline(always)]
    pub fn set_control(&self, flags: DescriptorFlags, adjacent: u32) {
        self.control.set(control_word(flags, adjacent));
    }

    /// Control flags currently programmed.
    #[inline(always)]
    #[must_use]
    pub fn flags(&self) -> DescriptorFlags {
        DescriptorFlags::from_bits_truncate(self.control.get())
    }

    /// Adjacent count currently programmed.
    #[inline(always)]
    #[must_use]
    pub fn adjacent(&self) -> u32 {
        (self.control.get() >> DESCRIPTOR_ADJACENT_SHIFT) & DESCRIPTOR_ADJACENT_MASK
    }

    /// Write the byte count.
    #[inline(always)]
    pub fn set_byte_count(&self, byte_count: u32) {
        self.byte_count.set(byte_count);
    }

    /// Byte count currently programmed.
    #[inline(always)]
    #[must_use]
    pub fn byte_count(&self) -> u32 {
        self.byte_count.get()
    }

    /// Write the source address.
    #[inline(always)]
    pub fn set_src_addr(&self, addr: u64) {
        self.src_addr.set(addr);
    }

    /// Source address currently programmed.
    #[inline(always)]
    #[must_use]
    pub fn src_addr(&self) -> u64 {
        self.src_addr.get()
    }

    /// Write the destination address.
    #[inline(always)]
    pub fn set_dst_addr(&self, addr: u64) {
        self.dst_addr.set(addr);
    }

    /// Destination address currently programmed.
    #[inline(always)]
    #[must_use]
    pub fn dst_addr(&self) -> u64 {
        self.dst_addr.get()
    }

    /// Write the next-descriptor link.
    #[inline(always)]
    pub fn set_next_addr(&self, iova: u64) {
        self.next_addr.set(iova);
    }

    /// Next-descriptor link currently programmed.
    #[inline(always)]
    #[must_use]
    pub fn next_addr(&self) -> u64 {
        self.next_addr.get()
    }
}

// =============================================================================
// Completed-Count Writeback
// =============================================================================

/// The 4-byte completed-descriptor-count word the engine writes back.
///
/// The low 31 bits count retired descriptors modulo 2^31; the high bit is
/// a status latch on some hardware revisions and is masked out.
#[repr(C)]
pub struct CompletedCountWriteback {
    count: VolatileCell<u32>,
}

impl CompletedCountWriteback {
    /// Size of the writeback word in bytes
    pub const SIZE: usize = 4;

    /// Read the retired-descriptor counter (high bit masked out).
    #[inline(always)]
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count.get() & COMPLETED_COUNT_WRITEBACK_MASK
    }

    /// Zero the word before handing it to the engine.
    #[inline(always)]
    pub fn clear(&self) {
        self.count.set(0);
    }
}

// =============================================================================
// Stream Writeback Record
// =============================================================================

/// Status bit: the record's descriptor ended a packet
pub const STREAM_WRITEBACK_EOP: u32 = 0x1;
/// Status bit: the engine has written this record
pub const STREAM_WRITEBACK_VALID: u32 = 0x8000_0000;

/// Per-descriptor C2H stream writeback record (16 bytes).
///
/// Carries the byte count actually transferred into the descriptor's
/// buffer plus the end-of-packet flag. The engine raises the validity bit
/// after the rest of the record is visible; the host zeroes the record
/// before each reuse.
#[repr(C)]
pub struct StreamWriteback {
    status: VolatileCell<u32>,
    length: VolatileCell<u32>,
    _reserved: [u32; 2],
}

impl StreamWriteback {
    /// Size of the record in bytes
    pub const SIZE: usize = 16;

    /// Whether the engine has written this record.
    #[inline(always)]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.status.get() & STREAM_WRITEBACK_VALID != 0
    }

    /// Whether the descriptor ended a packet.
    #[inline(always)]
    #[must_use]
    pub fn end_of_packet(&self) -> bool {
        self.status.get() & STREAM_WRITEBACK_EOP != 0
    }

    /// Bytes the engine actually transferred.
    #[inline(always)]
    #[must_use]
    pub fn length(&self) -> u32 {
        self.length.get()
    }

    /// Zero the record before re-arming its descriptor.
    #[inline(always)]
    pub fn clear(&self) {
        self.status.set(0);
        self.length.set(0);
    }
}

// =============================================================================
// Tests
// =============================================================================
