//! Core DMA channel driver implementation.
//!
//! This module contains the main [`DmaChannel`] structure and core
//! operations:
//!
//! - Configuration and ring set-up
//! - Populate-and-start descriptor submission
//! - Polling completion reaping
//! - Timeout and engine-error surfacing
//! - Quiescing finalisation
//! - H2C/C2H direction adapters, including continuous C2H stream mode
//!
//! A channel context is single-threaded; distinct channels may run on
//! distinct threads without coordination. All waiting is bounded
//! busy-polling over MMIO and DMA-coherent memory; the caller decides the
//! outer polling cadence.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering, fence};
use std::time::Instant;

use log::{debug, warn};

use crate::internal::constants::{
    DMA_DESCRIPTOR_MAX_ADJACENT, DMA_DESCRIPTOR_MAX_LEN, FINALISE_TIMEOUT,
    COMPLETED_COUNT_WRITEBACK_MASK, STREAM_WRITEBACK_SPIN_LIMIT,
};
use crate::internal::dma::descriptor::DescriptorFlags;
use crate::internal::dma::ring::{self, DescriptorRing};
use crate::internal::register::MIN_BAR_LEN;
use crate::internal::register::channel::{ChannelControl, ChannelRegs, ChannelStatus};
use crate::internal::register::sgdma::{SgdmaCommonRegs, SgdmaRegs, common_channel_bit};
use crate::mapping::{BarMapping, IovaMapping};

use super::config::{ChannelConfig, ChannelDirection, State};
use super::error::{ConfigError, DmaError, Error, IoError, Result};
use super::probe::{ChannelAlignments, ChannelIdentity};

/// Bytes to reserve in the descriptor DMA region for one channel's ring.
///
/// The region holds `num_descriptors` descriptor slots, the
/// completed-count writeback word, and (for C2H stream channels) one
/// writeback record per descriptor, each piece cache-line aligned.
#[must_use]
pub fn descriptor_allocation_size(num_descriptors: u32, stream_c2h: bool) -> usize {
    ring::allocation_size(num_descriptors, stream_c2h)
}

/// Difference between two completed-count values, modulo 2^31.
#[inline]
pub(crate) fn completed_count_delta(previous: u32, current: u32) -> u32 {
    current.wrapping_sub(previous) & COMPLETED_COUNT_WRITEBACK_MASK
}

/// Cut a Memory-Mapped transfer into per-descriptor chunks of at most
/// `chunk` bytes; the remainder lands in the last descriptor.
pub(crate) fn split_mm_transfer(
    host_offset: usize,
    card_address: u64,
    len: u64,
    chunk: u64,
) -> Vec<DescriptorSpec> {
    let mut specs = Vec::with_capacity(len.div_ceil(chunk) as usize);
    let mut remaining = len;
    let mut offset = 0u64;
    while remaining > 0 {
        let this_len = remaining.min(chunk);
        specs.push(DescriptorSpec {
            host_offset: host_offset + offset as usize,
            card_address: card_address + offset,
            len: this_len as u32,
            end_of_packet: false,
        });
        remaining -= this_len;
        offset += this_len;
    }
    specs
}

// =============================================================================
// Caller-Provided Resources
// =============================================================================

/// The mappings and observers a channel borrows for its lifetime.
///
/// The descriptor region may be shared by several channels as long as
/// each carves a disjoint sub-range. The data region's access rules are
/// direction-specific: the device only reads it for H2C and only writes
/// it for C2H.
#[derive(Clone, Copy)]
pub struct ChannelResources<'a> {
    /// Register BAR of the bridge
    pub bar: &'a BarMapping,
    /// DMA region holding descriptor rings and writeback words
    pub descriptor_region: &'a dyn IovaMapping,
    /// DMA region holding transfer data buffers
    pub data_region: &'a dyn IovaMapping,
    /// Cleared (atomically) on the first latched failure
    pub overall_success: &'a AtomicBool,
}

// =============================================================================
// Submission / Completion Records
// =============================================================================

/// One descriptor's worth of a transfer to populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSpec {
    /// Host offset of the buffer inside the data region
    pub host_offset: usize,
    /// Card-side byte address (ignored for AXI Stream channels)
    pub card_address: u64,
    /// Bytes to move
    pub len: u32,
    /// Mark a packet boundary (C2H stream channels)
    pub end_of_packet: bool,
}

/// A reaped transfer.
#[derive(Debug, Clone, Copy)]
pub struct CompletedTransfer {
    /// Host-virtual address of the transfer's first buffer
    pub data: NonNull<u8>,
    /// Bytes moved; for C2H stream this is the engine-reported count,
    /// which may be shorter than the programmed descriptor length
    pub len: usize,
    /// Whether the transfer ended a packet (C2H stream only)
    pub end_of_packet: bool,
}

/// The first failure latched into a channel context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFailure {
    /// Error kind
    pub error: Error,
    /// Formatted diagnostic
    pub message: String,
}

/// Record a failed predicate, evaluating to whether it held.
macro_rules! channel_assert {
    ($channel:expr, $cond:expr) => {{
        let ok = $cond;
        if !ok {
            $channel.record_failure(
                Error::Io(IoError::AssertionFailed),
                format!("assertion failed: {}", stringify!($cond)),
            );
        }
        ok
    }};
}

// =============================================================================
// DMA Channel
// =============================================================================

/// One DMA engine channel: ring, cursors, and the polling state machine.
///
/// Created by [`DmaChannel::configure`], destroyed by
/// [`DmaChannel::finalise`] (which quiesces the engine). In between, the
/// caller populates descriptors, starts them, and reaps completions with
/// [`DmaChannel::poll_completed_transfer`].
pub struct DmaChannel<'a> {
    config: ChannelConfig,
    data_region: &'a dyn IovaMapping,
    overall_success: &'a AtomicBool,
    regs: ChannelRegs<'a>,
    sgdma: SgdmaRegs<'a>,
    common: SgdmaCommonRegs<'a>,
    alignments: ChannelAlignments,
    ring: DescriptorRing,
    state: State,
    /// Slot the next transfer populates
    next_started: u32,
    /// Slot of the oldest un-reaped transfer
    next_completed: u32,
    /// Descriptors handed to the engine and not yet reaped
    num_in_use: u32,
    /// Descriptors the engine retired but the caller has not reaped
    num_pending_completed: u32,
    /// Last observed completed-count writeback value
    previous_num_completed: u32,
    /// Total descriptors started, modulo 2^31
    num_descriptors_started: u32,
    /// Descriptors consumed by the transfer starting at each slot
    descriptors_per_transfer: Vec<u32>,
    /// Host offset of the first buffer of the transfer at each slot
    transfer_host_offsets: Vec<usize>,
    deadline: Option<Instant>,
    failure: Option<ChannelFailure>,
    timeout_awaiting_idle_at_finalisation: bool,
}

impl<'a> DmaChannel<'a> {
    // =========================================================================
    // Configuration
    // =========================================================================

    /// Configure a channel: verify the hardware block, carve and pre-link
    /// the ring, pre-bind buffers, and (for continuous C2H stream)
    /// pre-queue the ring and start the engine.
    ///
    /// # Errors
    /// - `InvalidConfig` - inconsistent configuration or undersized regions
    /// - `ChannelMisconfigured` - identifier signature/direction/stream
    ///   mismatch
    pub fn configure(config: ChannelConfig, resources: ChannelResources<'a>) -> Result<Self> {
        config.validate()?;
        if resources.bar.len() < MIN_BAR_LEN {
            return Err(ConfigError::InvalidConfig.into());
        }

        let identity =
            ChannelIdentity::read(resources.bar, config.direction, config.channel_index)?;
        if identity.stream != config.is_stream() {
            return Err(ConfigError::ChannelMisconfigured.into());
        }
        let alignments =
            ChannelAlignments::read(resources.bar, config.direction, config.channel_index);

        let stream_c2h = config.is_stream() && config.direction == ChannelDirection::CardToHost;
        let num = config.num_descriptors;
        let ring = DescriptorRing::carve(
            resources.descriptor_region,
            config.descriptor_offset,
            num,
            stream_c2h,
        )?;
        ring.prelink();

        if config.bytes_per_buffer > 0 {
            Self::prebind_buffers(&config, &alignments, resources.data_region, &ring)?;
        }

        let regs = ChannelRegs::new(resources.bar, config.direction, config.channel_index);
        let sgdma = SgdmaRegs::new(resources.bar, config.direction, config.channel_index);
        let common = SgdmaCommonRegs::new(resources.bar);

        // The engine must not be running while the ring is rebuilt.
        regs.control_w1c(ChannelControl::RUN.bits());
        let channel_bit = common_channel_bit(config.direction, config.channel_index);
        if config.c2h_stream_continuous {
            common.credit_enable_w1s(channel_bit);
        } else {
            common.credit_enable_w1c(channel_bit);
        }

        let mut channel = Self {
            config,
            data_region: resources.data_region,
            overall_success: resources.overall_success,
            regs,
            sgdma,
            common,
            alignments,
            ring,
            state: State::Idle,
            next_started: 0,
            next_completed: 0,
            num_in_use: 0,
            num_pending_completed: 0,
            previous_num_completed: 0,
            num_descriptors_started: 0,
            descriptors_per_transfer: vec![0; num as usize],
            transfer_host_offsets: vec![0; num as usize],
            deadline: None,
            failure: None,
            timeout_awaiting_idle_at_finalisation: false,
        };

        debug!(
            "{} channel {}: configured, {} descriptors, {}",
            channel.config.direction,
            channel.config.channel_index,
            num,
            if stream_c2h { "stream" } else { "memory-mapped" },
        );

        if channel.config.c2h_stream_continuous {
            // Pre-queue every slot the ring can carry; the engine then
            // runs forever and completions re-arm their slot in place.
            for _ in 0..num - 1 {
                channel.start_next_c2h_buffer();
            }
        }

        Ok(channel)
    }

    fn prebind_buffers(
        config: &ChannelConfig,
        alignments: &ChannelAlignments,
        data_region: &dyn IovaMapping,
        ring: &DescriptorRing,
    ) -> Result<()> {
        let per_buffer = config.bytes_per_buffer;
        let span = config.num_descriptors as usize * per_buffer;
        if per_buffer > DMA_DESCRIPTOR_MAX_LEN as usize
            || config
                .data_buffer_offset
                .checked_add(span)
                .is_none_or(|end| end > data_region.len())
        {
            return Err(ConfigError::InvalidConfig.into());
        }
        // Misaligned offsets are a configuration error here; runtime
        // population latches AlignmentViolation instead.
        let first_iova = data_region.iova_of(config.data_buffer_offset);
        if per_buffer % alignments.len_granularity as usize != 0
            || per_buffer % alignments.addr_alignment as usize != 0
            || first_iova % u64::from(alignments.addr_alignment) != 0
            || config.card_buffer_offset % u64::from(alignments.addr_alignment) != 0
        {
            return Err(ConfigError::InvalidConfig.into());
        }

        for slot in 0..config.num_descriptors {
            let host_iova =
                data_region.iova_of(config.data_buffer_offset + slot as usize * per_buffer);
            let card_addr = config.card_buffer_offset + u64::from(slot) * per_buffer as u64;
            let descriptor = ring.descriptor(slot);
            match config.direction {
                ChannelDirection::HostToCard => {
                    descriptor.set_src_addr(host_iova);
                    if !config.is_stream() {
                        descriptor.set_dst_addr(card_addr);
                    }
                }
                ChannelDirection::CardToHost => {
                    descriptor.set_dst_addr(host_iova);
                    if !config.is_stream() {
                        descriptor.set_src_addr(card_addr);
                    }
                }
            }
            descriptor.set_byte_count(per_buffer as u32);
        }
        Ok(())
    }

    // =========================================================================
    // State Accessors
    // =========================================================================

    /// Current lifecycle state
    #[inline(always)]
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether a failure has latched
    #[inline(always)]
    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }

    /// The first latched failure, if any
    #[inline(always)]
    pub fn failure(&self) -> Option<&ChannelFailure> {
        self.failure.as_ref()
    }

    /// Whether finalise gave up waiting for the engine to go idle
    #[inline(always)]
    pub fn timeout_awaiting_idle_at_finalisation(&self) -> bool {
        self.timeout_awaiting_idle_at_finalisation
    }

    /// The channel's configuration
    #[inline(always)]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// The channel's alignment capabilities
    #[inline(always)]
    pub fn alignments(&self) -> &ChannelAlignments {
        &self.alignments
    }

    /// Descriptors handed to the engine and not yet reaped
    #[inline(always)]
    pub fn num_in_use(&self) -> u32 {
        self.num_in_use
    }

    /// Slot the next transfer populates (for diagnostics)
    #[inline(always)]
    pub fn next_started_slot(&self) -> u32 {
        self.next_started
    }

    /// Slot of the oldest un-reaped transfer (for diagnostics)
    #[inline(always)]
    pub fn next_completed_slot(&self) -> u32 {
        self.next_completed
    }

    fn enqueue_allowed(&self) -> bool {
        matches!(self.state, State::Idle | State::Running) && self.failure.is_none()
    }

    // =========================================================================
    // Failure Recording
    // =========================================================================

    /// Latch a failure into the context.
    ///
    /// The first failure wins: it moves the channel to `Failed`, clears
    /// the caller's overall-success flag, and turns every subsequent
    /// enqueue into a no-op. Completions keep draining so buffers can be
    /// released.
    pub fn record_failure(&mut self, error: Error, message: impl Into<String>) {
        let message = message.into();
        self.overall_success.store(false, Ordering::Release);
        if self.failure.is_some() {
            debug!(
                "{} channel {}: suppressed subsequent failure: {}",
                self.config.direction, self.config.channel_index, message
            );
            return;
        }
        warn!(
            "{} channel {}: {}",
            self.config.direction, self.config.channel_index, message
        );
        self.failure = Some(ChannelFailure { error, message });
        if self.state != State::Finalized {
            self.state = State::Failed;
        }
    }

    // =========================================================================
    // Descriptor Submission
    // =========================================================================

    /// Length of the contiguous free run starting at the start cursor.
    ///
    /// This is what the next submission may populate; it is *not* the
    /// total free count, because a transfer never wraps mid-ring.
    #[must_use]
    pub fn num_free_descriptors(&self) -> u32 {
        if !self.enqueue_allowed() {
            return 0;
        }
        // One slot always stays free so the engine's next pointer never
        // aliases a slot undergoing reuse.
        let free_total = self.ring.len() - 1 - self.num_in_use;
        free_total.min(self.ring.len() - self.next_started)
    }

    /// Populate `specs.len()` descriptors at the start cursor.
    ///
    /// Validates every spec before touching the ring; a rejected
    /// submission leaves no partial state. Returns whether the ring now
    /// holds the populated descriptors (call
    /// [`DmaChannel::start_populated`] to hand them to the engine).
    pub fn populate_descriptors(&mut self, specs: &[DescriptorSpec]) -> bool {
        if !self.enqueue_allowed() {
            return false;
        }
        let count = specs.len() as u32;
        if count == 0 || specs.iter().any(|spec| spec.len == 0) {
            self.record_failure(
                Error::Config(ConfigError::InvalidConfig),
                "zero-length submission".to_string(),
            );
            return false;
        }
        let free = self.num_free_descriptors();
        if count > free {
            self.record_failure(
                Error::Dma(DmaError::RingFull),
                format!("contiguous free run {free} too short for {count} descriptors"),
            );
            return false;
        }
        for spec in specs {
            if !self.validate_spec(spec) {
                return false;
            }
        }

        let stream_c2h =
            self.config.is_stream() && self.config.direction == ChannelDirection::CardToHost;
        for (index, spec) in specs.iter().enumerate() {
            let slot = self.next_started + index as u32;
            let descriptor = self.ring.descriptor(slot);
            let host_iova = self.data_region.iova_of(spec.host_offset);
            match self.config.direction {
                ChannelDirection::HostToCard => {
                    descriptor.set_src_addr(host_iova);
                    descriptor.set_dst_addr(if self.config.is_stream() {
                        0
                    } else {
                        spec.card_address
                    });
                }
                ChannelDirection::CardToHost => {
                    descriptor.set_dst_addr(host_iova);
                    descriptor.set_src_addr(if self.config.is_stream() {
                        0
                    } else {
                        spec.card_address
                    });
                }
            }
            descriptor.set_byte_count(spec.len);
            if stream_c2h {
                self.ring.stream_writeback(slot).clear();
            }
            let last = index as u32 == count - 1;
            descriptor.set_control(
                self.submission_flags(last, stream_c2h && spec.end_of_packet),
                (count - 1 - index as u32).min(DMA_DESCRIPTOR_MAX_ADJACENT),
            );
        }
        self.transfer_host_offsets[self.next_started as usize] = specs[0].host_offset;
        true
    }

    /// Flag policy: Completed always lands on the last descriptor of a
    /// submission; Stop joins it unless the channel runs continuously;
    /// intermediate descriptors carry neither.
    fn submission_flags(&self, last: bool, end_of_packet: bool) -> DescriptorFlags {
        let mut flags = DescriptorFlags::empty();
        if last {
            flags |= DescriptorFlags::COMPLETED;
            if !self.config.c2h_stream_continuous {
                flags |= DescriptorFlags::STOP;
            }
        }
        if end_of_packet {
            flags |= DescriptorFlags::END_OF_PACKET;
        }
        flags
    }

    fn validate_spec(&mut self, spec: &DescriptorSpec) -> bool {
        if spec.len > DMA_DESCRIPTOR_MAX_LEN {
            self.record_failure(
                Error::Dma(DmaError::DescriptorOverflow),
                format!(
                    "descriptor byte count {:#x} exceeds {:#x}",
                    spec.len, DMA_DESCRIPTOR_MAX_LEN
                ),
            );
            return false;
        }
        if spec
            .host_offset
            .checked_add(spec.len as usize)
            .is_none_or(|end| end > self.data_region.len())
        {
            self.record_failure(
                Error::Config(ConfigError::InvalidConfig),
                format!(
                    "host buffer [{:#x}, +{:#x}) outside the data region",
                    spec.host_offset, spec.len
                ),
            );
            return false;
        }
        let host_iova = self.data_region.iova_of(spec.host_offset);
        let addr_alignment = u64::from(self.alignments.addr_alignment);
        let misaligned = spec.len % self.alignments.len_granularity != 0
            || host_iova % addr_alignment != 0
            || (!self.config.is_stream() && spec.card_address % addr_alignment != 0);
        if misaligned {
            self.record_failure(
                Error::Dma(DmaError::AlignmentViolation),
                format!(
                    "host {host_iova:#x}/card {:#x}/len {:#x} violate alignment {}/{}",
                    spec.card_address, spec.len, self.alignments.addr_alignment,
                    self.alignments.len_granularity
                ),
            );
            return false;
        }
        if !self.config.is_stream() {
            let end = spec.card_address.checked_add(u64::from(spec.len));
            if end.is_none_or(|end| end > self.config.bridge_memory_size) {
                self.record_failure(
                    Error::Config(ConfigError::InvalidConfig),
                    format!(
                        "card range [{:#x}, +{:#x}) outside bridge memory of {:#x} bytes",
                        spec.card_address, spec.len, self.config.bridge_memory_size
                    ),
                );
                return false;
            }
        }
        true
    }

    /// Hand `count` populated descriptors to the engine.
    ///
    /// Records the transfer's slot usage, advances the start cursor, and
    /// arms the engine when it is idle. When the engine is already
    /// chasing next pointers no register write is needed. No-op once a
    /// failure has latched.
    pub fn start_populated(&mut self, count: u32) {
        if !self.enqueue_allowed() || count == 0 {
            return;
        }
        if !channel_assert!(self, count <= self.ring.len() - 1 - self.num_in_use) {
            return;
        }
        let first = self.next_started;
        if !channel_assert!(self, self.descriptors_per_transfer[first as usize] == 0) {
            return;
        }

        self.descriptors_per_transfer[first as usize] = count;
        self.num_descriptors_started =
            (self.num_descriptors_started + count) & COMPLETED_COUNT_WRITEBACK_MASK;
        let was_idle = self.num_in_use == 0;
        self.num_in_use += count;
        self.next_started = (self.next_started + count) % self.ring.len();

        if self.config.c2h_stream_continuous {
            // Descriptor writes must land before the engine earns credits
            // to fetch them.
            fence(Ordering::Release);
            self.sgdma.add_descriptor_credits(count);
        }
        if was_idle {
            self.arm_engine(first, count);
        }
    }

    /// Arm the engine at `first`: program the writeback and descriptor
    /// addresses, mask interrupts, and give Run a rising edge.
    fn arm_engine(&mut self, first: u32, count: u32) {
        // Descriptor writes must be visible before the engine fetches.
        fence(Ordering::Release);
        self.regs.control_w1c(ChannelControl::RUN.bits());
        self.regs.set_poll_writeback_addr(self.ring.completed_count_iova());
        self.regs.set_interrupt_enable(0);
        self.sgdma.set_descriptor_addr(self.ring.descriptor_iova(first));
        self.sgdma
            .set_descriptor_adjacent((count - 1).min(DMA_DESCRIPTOR_MAX_ADJACENT));
        self.regs
            .set_control(ChannelControl::POLLMODE_WRITEBACK_ENABLE.bits());
        self.regs.control_w1s(ChannelControl::RUN.bits());
        // Read back to flush the posted Run write.
        let _ = self.regs.control();

        if self.state == State::Idle {
            debug!(
                "{} channel {}: running",
                self.config.direction, self.config.channel_index
            );
            self.state = State::Running;
        }
        self.deadline = self.config.transfer_timeout.map(|timeout| Instant::now() + timeout);
    }

    /// Populate and start a Memory-Mapped transfer, splitting it over as
    /// many descriptors as the per-descriptor maximum requires.
    ///
    /// Returns whether the transfer was started. Oversized or misaligned
    /// requests latch the corresponding failure.
    pub fn start_mm_transfer(&mut self, host_offset: usize, card_address: u64, len: u64) -> bool {
        if !self.enqueue_allowed() {
            return false;
        }
        if self.config.is_stream() {
            self.record_failure(
                Error::Config(ConfigError::InvalidConfig),
                "memory-mapped transfer on a stream channel".to_string(),
            );
            return false;
        }
        if len == 0 {
            self.record_failure(
                Error::Config(ConfigError::InvalidConfig),
                "zero-length submission".to_string(),
            );
            return false;
        }

        let chunk = u64::from(self.alignments.max_descriptor_len(self.config.min_size_alignment));
        let count = len.div_ceil(chunk);
        let free = u64::from(self.num_free_descriptors());
        if count > free {
            self.record_failure(
                Error::Dma(DmaError::RingFull),
                format!("contiguous free run {free} too short for {count} descriptors"),
            );
            return false;
        }

        let specs = split_mm_transfer(host_offset, card_address, len, chunk);
        if !self.populate_descriptors(&specs) {
            return false;
        }
        self.start_populated(specs.len() as u32);
        true
    }

    // =========================================================================
    // Direction Adapters
    // =========================================================================

    /// Host address of the pre-bound H2C buffer the next submission will
    /// send.
    ///
    /// Returns `None` when the channel is not H2C with pre-bound buffers,
    /// or when no slot is free. The caller fills the buffer, then calls
    /// [`DmaChannel::start_h2c_buffers`].
    #[must_use]
    pub fn next_h2c_buffer(&self) -> Option<NonNull<u8>> {
        if self.config.direction != ChannelDirection::HostToCard
            || self.config.bytes_per_buffer == 0
            || self.num_free_descriptors() == 0
        {
            return None;
        }
        Some(self.prebound_buffer_virt(self.next_started))
    }

    /// Submit `count` filled pre-bound H2C buffers as one transfer.
    ///
    /// The first descriptor carries an adjacent count of `count - 1` so
    /// the engine can prefetch the whole batch. Silently does nothing
    /// when the channel cannot accept the submission.
    pub fn start_h2c_buffers(&mut self, count: u32) {
        if self.config.direction != ChannelDirection::HostToCard
            || self.config.bytes_per_buffer == 0
            || count == 0
            || count > self.num_free_descriptors()
        {
            return;
        }
        self.populate_prebound(count, false);
        self.start_populated(count);
    }

    /// Queue the next pre-bound C2H buffer for the engine to fill.
    ///
    /// Silently does nothing when no slot is free or the channel is not
    /// C2H with pre-bound buffers.
    pub fn start_next_c2h_buffer(&mut self) {
        if self.config.direction != ChannelDirection::CardToHost
            || self.config.bytes_per_buffer == 0
            || self.num_free_descriptors() == 0
        {
            return;
        }
        self.populate_prebound(1, false);
        self.start_populated(1);
    }

    /// Toggle flags and byte count on pre-bound slots; addresses were
    /// bound at configure time.
    fn populate_prebound(&mut self, count: u32, end_of_packet: bool) {
        let stream_c2h =
            self.config.is_stream() && self.config.direction == ChannelDirection::CardToHost;
        let first = self.next_started;
        for index in 0..count {
            let slot = (first + index) % self.ring.len();
            let descriptor = self.ring.descriptor(slot);
            descriptor.set_byte_count(self.config.bytes_per_buffer as u32);
            if stream_c2h {
                self.ring.stream_writeback(slot).clear();
            }
            let last = index == count - 1;
            descriptor.set_control(
                self.submission_flags(last, end_of_packet && last),
                (count - 1 - index).min(DMA_DESCRIPTOR_MAX_ADJACENT),
            );
        }
        self.transfer_host_offsets[first as usize] = self.prebound_buffer_offset(first);
    }

    fn prebound_buffer_offset(&self, slot: u32) -> usize {
        self.config.data_buffer_offset + slot as usize * self.config.bytes_per_buffer
    }

    fn prebound_buffer_virt(&self, slot: u32) -> NonNull<u8> {
        self.data_region.virt_at(self.prebound_buffer_offset(slot))
    }

    // =========================================================================
    // Completion Reaping
    // =========================================================================

    /// Reap the oldest completed transfer, if any.
    ///
    /// Reads the engine status once and the completed-count writeback
    /// once; surfaces engine errors and transfer timeouts by latching. In
    /// `Failed` the call keeps draining already-in-flight descriptors; in
    /// `Finalized` it returns `None`.
    pub fn poll_completed_transfer(&mut self) -> Option<CompletedTransfer> {
        match self.state {
            State::Running | State::Failed => {}
            State::Idle | State::Draining | State::Finalized => return None,
        }

        let status = self.regs.status_rc();
        if let Some(errors) = status.errors() {
            self.record_failure(
                Error::Io(IoError::EngineError),
                format!("engine status errors: {errors:?}"),
            );
        }

        let count = self.ring.completed_count();
        let previous = self.previous_num_completed;
        let delta = completed_count_delta(previous, count);
        self.previous_num_completed = count;
        self.num_pending_completed += delta;
        if !channel_assert!(self, self.num_pending_completed <= self.num_in_use) {
            return None;
        }

        let needed = self.descriptors_per_transfer[self.next_completed as usize];
        if needed > 0 && self.num_pending_completed >= needed {
            return self.reap_transfer(needed);
        }

        if self.state == State::Running {
            self.restart_if_stalled(status);
            if delta == 0 && self.num_in_use > 0 {
                self.check_transfer_deadline(count, previous);
            } else if delta > 0 {
                // Progress counts against the deadline.
                self.deadline =
                    self.config.transfer_timeout.map(|timeout| Instant::now() + timeout);
            }
        }
        None
    }

    fn reap_transfer(&mut self, count: u32) -> Option<CompletedTransfer> {
        // The writeback must be observed before the buffers and records
        // it covers.
        fence(Ordering::Acquire);

        let first = self.next_completed;
        let stream_c2h =
            self.config.is_stream() && self.config.direction == ChannelDirection::CardToHost;
        let (len, end_of_packet) = if stream_c2h {
            let mut spins = 0;
            loop {
                let record = self.ring.stream_writeback(first);
                if record.is_valid() {
                    let result = (record.length() as usize, record.end_of_packet());
                    record.clear();
                    break result;
                }
                spins += 1;
                if spins > STREAM_WRITEBACK_SPIN_LIMIT {
                    self.record_failure(
                        Error::Io(IoError::WritebackTimeout),
                        format!("stream writeback for slot {first} never became valid"),
                    );
                    return None;
                }
                core::hint::spin_loop();
            }
        } else {
            let mut total = 0usize;
            for index in 0..count {
                total += self.ring.descriptor(first + index).byte_count() as usize;
            }
            (total, false)
        };

        let data = self.data_region.virt_at(self.transfer_host_offsets[first as usize]);
        self.descriptors_per_transfer[first as usize] = 0;
        self.num_pending_completed -= count;
        self.num_in_use -= count;
        self.next_completed = (self.next_completed + count) % self.ring.len();

        if self.config.c2h_stream_continuous && self.state == State::Running {
            // Re-queue one descriptor so the ring stays full: the slot at
            // the start cursor is the one the engine's next pointer will
            // reach, its buffer bindings intact from configure time.
            self.start_next_c2h_buffer();
        }
        self.deadline = if self.num_in_use > 0 {
            self.config.transfer_timeout.map(|timeout| Instant::now() + timeout)
        } else {
            None
        };

        Some(CompletedTransfer { data, len, end_of_packet })
    }

    /// A submission appended behind a Stop descriptor finds the engine
    /// halted with work outstanding; restart it at the first un-retired
    /// slot.
    fn restart_if_stalled(&mut self, status: ChannelStatus) {
        let outstanding = self.num_in_use - self.num_pending_completed;
        if outstanding == 0
            || !status.contains(ChannelStatus::DESCRIPTOR_STOPPED)
            || status.contains(ChannelStatus::BUSY)
        {
            return;
        }
        let slot = (self.next_completed + self.num_pending_completed) % self.ring.len();
        debug!(
            "{} channel {}: restarting halted engine at slot {}",
            self.config.direction, self.config.channel_index, slot
        );
        self.arm_engine(slot, outstanding);
    }

    fn check_transfer_deadline(&mut self, count: u32, previous: u32) {
        let Some(deadline) = self.deadline else {
            return;
        };
        if Instant::now() < deadline {
            return;
        }
        self.record_failure(
            Error::Io(IoError::EngineTimeout),
            format!(
                "{} channel {}: transfer timeout, completed count {count} (previously {previous})",
                self.config.direction, self.config.channel_index,
            ),
        );
    }

    // =========================================================================
    // Finalisation
    // =========================================================================

    /// Quiesce the engine and retire the context.
    ///
    /// Clears Run and waits up to one second for Busy to drop. A channel
    /// that stays busy is considered wedged:
    /// `timeout_awaiting_idle_at_finalisation` is raised, descriptor
    /// fetch is halted, and the context still moves to `Finalized` (the
    /// device must be reset before the channel is reused). Idempotent.
    pub fn finalise(&mut self) {
        if self.state == State::Finalized {
            return;
        }
        self.state = State::Draining;

        self.regs.control_w1c(ChannelControl::RUN.bits());
        // Read back to flush the posted Run clear before watching Busy.
        let _ = self.regs.control();
        let channel_bit = common_channel_bit(self.config.direction, self.config.channel_index);
        if self.config.c2h_stream_continuous {
            self.common.credit_enable_w1c(channel_bit);
        }

        let deadline = Instant::now() + FINALISE_TIMEOUT;
        while self.regs.status().contains(ChannelStatus::BUSY) {
            if Instant::now() >= deadline {
                warn!(
                    "{} channel {}: still busy after clearing Run; device reset required",
                    self.config.direction, self.config.channel_index
                );
                self.timeout_awaiting_idle_at_finalisation = true;
                self.common.descriptor_control_w1s(channel_bit);
                break;
            }
            core::hint::spin_loop();
        }

        debug!(
            "{} channel {}: finalised",
            self.config.direction, self.config.channel_index
        );
        self.state = State::Finalized;
    }

    // =========================================================================
    // Test Hooks
    // =========================================================================

    /// Seed the wraparound counters as if this many descriptors had
    /// already been started and retired.
    #[cfg(test)]
    pub(crate) fn seed_completed_counters(&mut self, count: u32) {
        self.num_descriptors_started = count & COMPLETED_COUNT_WRITEBACK_MASK;
        self.previous_num_completed = count & COMPLETED_COUNT_WRITEBACK_MASK;
    }
}

// Safety: the channel owns its ring sub-range exclusively and only holds
// pointers into caller mappings that outlive it. It is not Sync; one
// thread drives a channel at a time.
unsafe impl Send for DmaChannel<'_> {}

// =============================================================================
// Tests
// =============================================================================
