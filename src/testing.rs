//! Testing utilities and mock implementations
//!
//! This module provides a mock bridge for testing the driver on the host
//! without hardware access: a heap-backed fake BAR, descriptor and data
//! regions with fake IOVA ranges, card-side memory, and a software model
//! of the DMA engine that walks descriptor chains, honors Stop/Completed
//! flags and descriptor credits, retires the completed-count writeback,
//! and fills C2H stream writeback records.
//!
//! Only available when running `cargo test`.

#![allow(missing_docs)]

use std::alloc::Layout;
use std::collections::VecDeque;
use std::ptr::NonNull;

use crate::driver::config::ChannelDirection;
use crate::internal::constants::{
    COMPLETED_COUNT_WRITEBACK_MASK, DESCRIPTOR_REGION_ALIGNMENT,
};
use crate::internal::register::MIN_BAR_LEN;
use crate::mapping::{BarMapping, ContiguousMapping};

const DESC_REGION_LEN: usize = 0x8000;
const DESC_REGION_IOVA: u64 = 0x10_0000;
const DATA_REGION_LEN: usize = 0x10_0000;
const DATA_REGION_IOVA: u64 = 0x80_0000;
const CARD_MEMORY_LEN: usize = 0x10_0000;

const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

fn alloc_region(len: usize) -> NonNull<u8> {
    let layout = Layout::from_size_align(len, DESCRIPTOR_REGION_ALIGNMENT).unwrap();
    NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).unwrap()
}

// =============================================================================
// Engine Model
// =============================================================================

/// Software model of one DMA engine channel.
#[derive(Debug, Clone, Copy)]
struct EngineModel {
    direction: ChannelDirection,
    stream: bool,
    run: bool,
    halted: bool,
    current_desc: u64,
    retired: u32,
    credits: u32,
    /// Carve offset of the serviced ring inside the descriptor region
    ring_offset: usize,
    ring_len: u32,
    /// Injected status bits that persist across services (errors, wedge)
    status_extra: u32,
    completed_event: bool,
}

impl EngineModel {
    fn new(direction: ChannelDirection, stream: bool) -> Self {
        Self {
            direction,
            stream,
            run: false,
            halted: false,
            current_desc: 0,
            retired: 0,
            credits: 0,
            ring_offset: 0,
            ring_len: 0,
            status_extra: 0,
            completed_event: false,
        }
    }
}

// =============================================================================
// Mock Bridge
// =============================================================================

/// A fake bridge: BAR, DMA regions, card memory, and two engine models
/// (H2C channel 0 and C2H channel 0).
pub struct MockBridge {
    bar_mem: NonNull<u8>,
    desc_mem: NonNull<u8>,
    data_mem: NonNull<u8>,
    card: Vec<u8>,
    engines: [EngineModel; 2],
    /// Pending C2H stream packets: payload plus end-of-packet flag
    packets: VecDeque<(Vec<u8>, bool)>,
}

impl MockBridge {
    /// Build a bridge with one channel per direction, each optionally
    /// configured for AXI Stream.
    pub fn new(h2c_stream: bool, c2h_stream: bool) -> Self {
        let mock = Self {
            bar_mem: alloc_region(MIN_BAR_LEN),
            desc_mem: alloc_region(DESC_REGION_LEN),
            data_mem: alloc_region(DATA_REGION_LEN),
            card: vec![0u8; CARD_MEMORY_LEN],
            engines: [
                EngineModel::new(ChannelDirection::HostToCard, h2c_stream),
                EngineModel::new(ChannelDirection::CardToHost, c2h_stream),
            ],
            packets: VecDeque::new(),
        };
        mock.seed_identifiers();
        mock
    }

    fn seed_identifiers(&self) {
        use crate::internal::register::{
            C2H_CHANNEL_BASE, C2H_SGDMA_BASE, CONFIG_BLOCK_BASE, H2C_CHANNEL_BASE,
            H2C_SGDMA_BASE, IDENTIFIER_STREAM, IDENTIFIER_SUBSYSTEM_SHIFT,
            IDENTIFIER_TARGET_SHIFT, SGDMA_COMMON_BASE, SUBSYSTEM_SIGNATURE, target,
        };

        let identifier = |block_target: u32, stream: bool| {
            (SUBSYSTEM_SIGNATURE << IDENTIFIER_SUBSYSTEM_SHIFT)
                | (block_target << IDENTIFIER_TARGET_SHIFT)
                | if stream { IDENTIFIER_STREAM } else { 0 }
                | 0x01
        };
        let bar = self.bar();
        bar.write32(CONFIG_BLOCK_BASE, identifier(target::CONFIG, false));
        bar.write32(SGDMA_COMMON_BASE, identifier(target::SGDMA_COMMON, false));
        bar.write32(
            H2C_CHANNEL_BASE,
            identifier(target::H2C_CHANNEL, self.engines[0].stream),
        );
        bar.write32(
            C2H_CHANNEL_BASE,
            identifier(target::C2H_CHANNEL, self.engines[1].stream),
        );
        bar.write32(H2C_SGDMA_BASE, identifier(target::H2C_SGDMA, false));
        bar.write32(C2H_SGDMA_BASE, identifier(target::C2H_SGDMA, false));
    }

    // =========================================================================
    // Mappings
    // =========================================================================

    pub fn bar(&self) -> BarMapping {
        unsafe { BarMapping::new(self.bar_mem, MIN_BAR_LEN) }
    }

    pub fn descriptor_region(&self) -> ContiguousMapping {
        unsafe { ContiguousMapping::new(self.desc_mem, DESC_REGION_LEN, DESC_REGION_IOVA) }
    }

    pub fn data_region(&self) -> ContiguousMapping {
        unsafe { ContiguousMapping::new(self.data_mem, DATA_REGION_LEN, DATA_REGION_IOVA) }
    }

    // =========================================================================
    // Test Setup Helpers
    // =========================================================================

    /// Program the channel's alignment capability register.
    pub fn set_alignments(
        &self,
        direction: ChannelDirection,
        addr_alignment: u32,
        len_granularity: u32,
        address_bits: u32,
    ) {
        use crate::internal::register::channel::ALIGNMENTS_OFFSET;
        self.bar().write32(
            self.channel_base(direction) + ALIGNMENTS_OFFSET,
            (addr_alignment << 16) | (len_granularity << 8) | address_bits,
        );
    }

    /// Tell the engine model where a channel's ring was carved, so it can
    /// find the completed-count word and stream writeback records.
    pub fn register_ring(
        &mut self,
        direction: ChannelDirection,
        descriptor_offset: usize,
        num_descriptors: u32,
    ) {
        let engine = &mut self.engines[Self::engine_index(direction)];
        engine.ring_offset = descriptor_offset;
        engine.ring_len = num_descriptors;
    }

    /// Queue a packet for the C2H stream engine; each packet fills one
    /// descriptor.
    pub fn push_c2h_packet(&mut self, payload: &[u8], end_of_packet: bool) {
        self.packets.push_back((payload.to_vec(), end_of_packet));
    }

    /// Latch error bits into the channel's status registers.
    pub fn inject_status_error(&mut self, direction: ChannelDirection, bits: u32) {
        self.engines[Self::engine_index(direction)].status_extra |= bits;
        self.sync_status(Self::engine_index(direction));
    }

    /// Make the channel report Busy forever (a wedged engine).
    pub fn wedge(&mut self, direction: ChannelDirection) {
        use crate::internal::register::channel::ChannelStatus;
        self.engines[Self::engine_index(direction)].status_extra |=
            ChannelStatus::BUSY.bits();
        self.sync_status(Self::engine_index(direction));
    }

    /// Seed an engine's retired counter (for wraparound tests).
    pub fn seed_retired_count(&mut self, direction: ChannelDirection, count: u32) {
        self.engines[Self::engine_index(direction)].retired =
            count & COMPLETED_COUNT_WRITEBACK_MASK;
    }

    // =========================================================================
    // Memory Helpers
    // =========================================================================

    pub fn write_card(&mut self, offset: usize, bytes: &[u8]) {
        self.card[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_card(&self, offset: usize, len: usize) -> Vec<u8> {
        self.card[offset..offset + len].to_vec()
    }

    pub fn write_data(&mut self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= DATA_REGION_LEN);
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.data_mem.as_ptr().add(offset),
                bytes.len(),
            );
        }
    }

    pub fn read_data(&self, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= DATA_REGION_LEN);
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.data_mem.as_ptr().add(offset),
                out.as_mut_ptr(),
                len,
            );
        }
        out
    }

    // =========================================================================
    // Engine Service
    // =========================================================================

    /// Step both engine models: apply pending control writes, then walk
    /// descriptor chains as far as credits, Stop flags, and queued
    /// packets allow.
    pub fn service(&mut self) {
        self.apply_common_block();
        for index in 0..self.engines.len() {
            self.service_engine(index);
        }
    }

    fn engine_index(direction: ChannelDirection) -> usize {
        match direction {
            ChannelDirection::HostToCard => 0,
            ChannelDirection::CardToHost => 1,
        }
    }

    fn channel_base(&self, direction: ChannelDirection) -> usize {
        use crate::internal::register::{C2H_CHANNEL_BASE, H2C_CHANNEL_BASE};
        match direction {
            ChannelDirection::HostToCard => H2C_CHANNEL_BASE,
            ChannelDirection::CardToHost => C2H_CHANNEL_BASE,
        }
    }

    fn sgdma_base(&self, direction: ChannelDirection) -> usize {
        use crate::internal::register::{C2H_SGDMA_BASE, H2C_SGDMA_BASE};
        match direction {
            ChannelDirection::HostToCard => H2C_SGDMA_BASE,
            ChannelDirection::CardToHost => C2H_SGDMA_BASE,
        }
    }

    /// Read a register cell and zero it (write-1 aliases, credit adds).
    fn take32(&self, offset: usize) -> u32 {
        let bar = self.bar();
        let value = bar.read32(offset);
        bar.write32(offset, 0);
        value
    }

    fn apply_common_block(&self) {
        use crate::internal::register::SGDMA_COMMON_BASE;
        use crate::internal::register::sgdma::{
            CREDIT_ENABLE_OFFSET, CREDIT_ENABLE_W1C_OFFSET, CREDIT_ENABLE_W1S_OFFSET,
            DESCRIPTOR_CONTROL_OFFSET, DESCRIPTOR_CONTROL_W1C_OFFSET,
            DESCRIPTOR_CONTROL_W1S_OFFSET,
        };
        let bar = self.bar();
        for (reg, w1s, w1c) in [
            (
                CREDIT_ENABLE_OFFSET,
                CREDIT_ENABLE_W1S_OFFSET,
                CREDIT_ENABLE_W1C_OFFSET,
            ),
            (
                DESCRIPTOR_CONTROL_OFFSET,
                DESCRIPTOR_CONTROL_W1S_OFFSET,
                DESCRIPTOR_CONTROL_W1C_OFFSET,
            ),
        ] {
            let set = self.take32(SGDMA_COMMON_BASE + w1s);
            let clear = self.take32(SGDMA_COMMON_BASE + w1c);
            let value = bar.read32(SGDMA_COMMON_BASE + reg);
            bar.write32(SGDMA_COMMON_BASE + reg, (value | set) & !clear);
        }
    }

    fn service_engine(&mut self, index: usize) {
        use crate::internal::register::channel::{
            ChannelControl, ChannelStatus, CONTROL_W1C_OFFSET, CONTROL_W1S_OFFSET,
            INTERRUPT_ENABLE_OFFSET, POLL_WRITEBACK_HI_OFFSET, POLL_WRITEBACK_LO_OFFSET,
        };
        use crate::internal::register::sgdma::{
            DESCRIPTOR_CREDITS_OFFSET, DESCRIPTOR_LO_OFFSET, DESCRIPTOR_HI_OFFSET,
        };
        use crate::internal::register::SGDMA_COMMON_BASE;
        use crate::internal::register::sgdma::{CREDIT_ENABLE_OFFSET, common_channel_bit};
        use crate::internal::dma::descriptor::{
            DESCRIPTOR_MAGIC, DESCRIPTOR_MAGIC_SHIFT, DescriptorFlags,
        };

        let mut engine = self.engines[index];
        let bar = self.bar();
        let channel_base = self.channel_base(engine.direction);
        let sgdma_base = self.sgdma_base(engine.direction);

        // Apply pending Run writes; a set gives Run a rising edge and
        // re-fetches from the programmed descriptor address.
        let w1s = self.take32(channel_base + CONTROL_W1S_OFFSET);
        let w1c = self.take32(channel_base + CONTROL_W1C_OFFSET);
        if w1c & ChannelControl::RUN.bits() != 0 {
            engine.run = false;
        }
        if w1s & ChannelControl::RUN.bits() != 0 {
            engine.run = true;
            engine.halted = false;
            let lo = bar.read32(sgdma_base + DESCRIPTOR_LO_OFFSET);
            let hi = bar.read32(sgdma_base + DESCRIPTOR_HI_OFFSET);
            engine.current_desc = u64::from(hi) << 32 | u64::from(lo);
            // The driver must have armed the writeback and masked
            // interrupts before starting the engine.
            assert_eq!(
                bar.read32(channel_base + INTERRUPT_ENABLE_OFFSET),
                0,
                "interrupts must be masked before Run"
            );
            let wb_lo = bar.read32(channel_base + POLL_WRITEBACK_LO_OFFSET);
            let wb_hi = bar.read32(channel_base + POLL_WRITEBACK_HI_OFFSET);
            let wb = u64::from(wb_hi) << 32 | u64::from(wb_lo);
            if engine.ring_len > 0 {
                assert_eq!(
                    wb,
                    DESC_REGION_IOVA
                        + (engine.ring_offset
                            + align_up(
                                engine.ring_len as usize * 32,
                                DESCRIPTOR_REGION_ALIGNMENT
                            )) as u64,
                    "poll writeback address must point at the completed-count word"
                );
            }
        }

        // Hardware adds on every credits write; this cell only keeps the
        // last value written between services, so back-to-back grants
        // coalesce and the engine catches up over later services.
        engine.credits = engine
            .credits
            .wrapping_add(self.take32(sgdma_base + DESCRIPTOR_CREDITS_OFFSET));
        let credit_mode = bar.read32(SGDMA_COMMON_BASE + CREDIT_ENABLE_OFFSET)
            & common_channel_bit(engine.direction, 0)
            != 0;

        while engine.run && !engine.halted {
            if credit_mode && engine.credits == 0 {
                break;
            }
            let Some(desc_offset) = self.descriptor_offset_of(engine.current_desc) else {
                engine.status_extra |= ChannelStatus::DESCRIPTOR_ERROR.bits() & (1 << 19);
                engine.halted = true;
                break;
            };
            let control = self.desc_read32(desc_offset);
            let byte_count = self.desc_read32(desc_offset + 4) as usize;
            let src = self.desc_read64(desc_offset + 8);
            let dst = self.desc_read64(desc_offset + 16);
            let next = self.desc_read64(desc_offset + 24);

            if control >> DESCRIPTOR_MAGIC_SHIFT != DESCRIPTOR_MAGIC {
                engine.status_extra |= ChannelStatus::MAGIC_STOPPED.bits();
                engine.halted = true;
                break;
            }

            if !self.move_bytes(&mut engine, desc_offset, byte_count, src, dst) {
                break;
            }

            engine.retired = (engine.retired + 1) & COMPLETED_COUNT_WRITEBACK_MASK;
            if credit_mode {
                engine.credits -= 1;
            }
            let flags = DescriptorFlags::from_bits_truncate(control);
            if flags.contains(DescriptorFlags::COMPLETED) {
                // Status-valid latch set on purpose: the driver must mask
                // it out of the count.
                self.write_completed_count(&engine, engine.retired | !COMPLETED_COUNT_WRITEBACK_MASK);
                engine.completed_event = true;
            }
            if flags.contains(DescriptorFlags::STOP) {
                engine.halted = true;
            } else {
                engine.current_desc = next;
            }
        }

        self.engines[index] = engine;
        self.sync_status(index);
    }

    /// Move one descriptor's payload; returns whether the walk continues.
    fn move_bytes(
        &mut self,
        engine: &mut EngineModel,
        desc_offset: usize,
        byte_count: usize,
        src: u64,
        dst: u64,
    ) -> bool {
        use crate::internal::register::channel::ChannelStatus;
        use crate::internal::dma::descriptor::{
            STREAM_WRITEBACK_EOP, STREAM_WRITEBACK_VALID,
        };

        match (engine.direction, engine.stream) {
            (ChannelDirection::HostToCard, false) => {
                let Some(host) = self.data_offset_of(src) else {
                    engine.status_extra |= ChannelStatus::READ_ERROR.bits() & (1 << 9);
                    engine.halted = true;
                    return false;
                };
                let bytes = self.read_data(host, byte_count);
                self.card[dst as usize..dst as usize + byte_count].copy_from_slice(&bytes);
            }
            (ChannelDirection::HostToCard, true) => {
                // Stream sink: the card consumes the bytes, nothing to do.
            }
            (ChannelDirection::CardToHost, false) => {
                let Some(host) = self.data_offset_of(dst) else {
                    engine.status_extra |= ChannelStatus::WRITE_ERROR.bits() & (1 << 14);
                    engine.halted = true;
                    return false;
                };
                let bytes = self.read_card(src as usize, byte_count);
                self.write_data(host, &bytes);
            }
            (ChannelDirection::CardToHost, true) => {
                // Stream source: one queued packet per descriptor; no
                // packet means the engine waits for card data.
                let Some((payload, end_of_packet)) = self.packets.pop_front() else {
                    return false;
                };
                let len = payload.len().min(byte_count);
                let Some(host) = self.data_offset_of(dst) else {
                    engine.status_extra |= ChannelStatus::WRITE_ERROR.bits() & (1 << 14);
                    engine.halted = true;
                    return false;
                };
                self.write_data(host, &payload[..len]);
                // Record first, count second: the driver trusts the count
                // only after the record is visible.
                let slot = (desc_offset - engine.ring_offset) / 32;
                let record = self.stream_record_offset(engine, slot);
                self.desc_write32(record + 4, len as u32);
                self.desc_write32(
                    record,
                    STREAM_WRITEBACK_VALID | if end_of_packet { STREAM_WRITEBACK_EOP } else { 0 },
                );
            }
        }
        true
    }

    fn stream_record_offset(&self, engine: &EngineModel, slot: usize) -> usize {
        engine.ring_offset
            + align_up(engine.ring_len as usize * 32, DESCRIPTOR_REGION_ALIGNMENT)
            + DESCRIPTOR_REGION_ALIGNMENT
            + slot * 16
    }

    fn write_completed_count(&self, engine: &EngineModel, value: u32) {
        let offset = engine.ring_offset
            + align_up(engine.ring_len as usize * 32, DESCRIPTOR_REGION_ALIGNMENT);
        self.desc_write32(offset, value);
    }

    fn sync_status(&mut self, index: usize) {
        use crate::internal::register::channel::{
            ChannelStatus, STATUS_OFFSET, STATUS_RC_OFFSET,
        };
        let engine = self.engines[index];
        let mut status = engine.status_extra;
        if engine.halted {
            status |= ChannelStatus::DESCRIPTOR_STOPPED.bits();
        }
        if engine.completed_event {
            status |= ChannelStatus::DESCRIPTOR_COMPLETED.bits();
        }
        let base = match engine.direction {
            ChannelDirection::HostToCard => crate::internal::register::H2C_CHANNEL_BASE,
            ChannelDirection::CardToHost => crate::internal::register::C2H_CHANNEL_BASE,
        };
        let bar = self.bar();
        bar.write32(base + STATUS_OFFSET, status);
        bar.write32(base + STATUS_RC_OFFSET, status);
    }

    // =========================================================================
    // Address Translation
    // =========================================================================

    fn descriptor_offset_of(&self, iova: u64) -> Option<usize> {
        let end = DESC_REGION_IOVA + DESC_REGION_LEN as u64;
        (DESC_REGION_IOVA..end)
            .contains(&iova)
            .then(|| (iova - DESC_REGION_IOVA) as usize)
    }

    fn data_offset_of(&self, iova: u64) -> Option<usize> {
        let end = DATA_REGION_IOVA + DATA_REGION_LEN as u64;
        (DATA_REGION_IOVA..end)
            .contains(&iova)
            .then(|| (iova - DATA_REGION_IOVA) as usize)
    }

    fn desc_read32(&self, offset: usize) -> u32 {
        unsafe { std::ptr::read_volatile(self.desc_mem.as_ptr().add(offset).cast::<u32>()) }
    }

    fn desc_write32(&self, offset: usize, value: u32) {
        unsafe {
            std::ptr::write_volatile(self.desc_mem.as_ptr().add(offset).cast::<u32>(), value);
        }
    }

    fn desc_read64(&self, offset: usize) -> u64 {
        unsafe { std::ptr::read_volatile(self.desc_mem.as_ptr().add(offset).cast::<u64>()) }
    }
}

impl Drop for MockBridge {
    fn drop(&mut self) {
        unsafe {
            let dealloc = |ptr: NonNull<u8>, len: usize| {
                std::alloc::dealloc(
                    ptr.as_ptr(),
                    Layout::from_size_align(len, DESCRIPTOR_REGION_ALIGNMENT).unwrap(),
                );
            };
            dealloc(self.bar_mem, MIN_BAR_LEN);
            dealloc(self.desc_mem, DESC_REGION_LEN);
            dealloc(self.data_mem, DATA_REGION_LEN);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::probe::probe_bridge;

    #[test]
    fn mock_bridge_answers_probe() {
        let mock = MockBridge::new(false, false);
        let info = probe_bridge(&mock.bar());
        assert_eq!(info.num_h2c_channels, 1);
        assert_eq!(info.num_c2h_channels, 1);
    }

    #[test]
    fn mock_card_and_data_memory_helpers() {
        let mut mock = MockBridge::new(false, false);
        mock.write_card(0x100, &[1, 2, 3]);
        assert_eq!(mock.read_card(0x100, 3), vec![1, 2, 3]);

        mock.write_data(0x40, &[9, 8]);
        assert_eq!(mock.read_data(0x40, 2), vec![9, 8]);
    }
}
