//! Configuration types for the DMA bridge driver

use std::time::Duration;

use crate::internal::constants::MAX_CHANNELS_PER_DIRECTION;

use super::error::{ConfigError, ConfigResult};

/// Transfer direction of a DMA engine channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDirection {
    /// Host-to-card (the engine reads host memory)
    HostToCard,
    /// Card-to-host (the engine writes host memory)
    CardToHost,
}

impl ChannelDirection {
    /// Short direction tag used in diagnostics ("H2C" / "C2H")
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ChannelDirection::HostToCard => "H2C",
            ChannelDirection::CardToHost => "C2H",
        }
    }
}

impl core::fmt::Display for ChannelDirection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Configured, engine not yet armed
    Idle,
    /// Engine armed; transfers flow
    Running,
    /// Finalise in progress, waiting for the engine to quiesce
    Draining,
    /// A failure latched; enqueues are no-ops, reaps keep draining
    Failed,
    /// Finalised; the context is inert
    Finalized,
}

/// Configuration for one DMA engine channel
///
/// Read-only after `DmaChannel::configure`. Offsets are relative to the
/// descriptor and data DMA regions handed over in `ChannelResources`.
///
/// # Example
/// ```ignore
/// let config = ChannelConfig::new(ChannelDirection::HostToCard, 16)
///     .with_bridge_memory_size(0x10000)
///     .with_buffers(0x1000, 0, 0)
///     .with_transfer_timeout(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Transfer direction
    pub direction: ChannelDirection,
    /// Channel index within the direction
    pub channel_index: u32,
    /// Number of descriptors in the ring
    pub num_descriptors: u32,
    /// Card-side address space size in bytes; zero means AXI Stream
    pub bridge_memory_size: u64,
    /// Minimum descriptor-length alignment used when splitting transfers
    /// larger than one descriptor
    pub min_size_alignment: u32,
    /// Per-descriptor pre-bound buffer size; zero disables pre-binding
    pub bytes_per_buffer: usize,
    /// Host offset of the first pre-bound buffer in the data region
    pub data_buffer_offset: usize,
    /// Card offset of the first pre-bound buffer (Memory-Mapped only)
    pub card_buffer_offset: u64,
    /// Carve offset of this channel's ring in the descriptor region
    pub descriptor_offset: usize,
    /// Keep a C2H stream channel's ring armed perpetually
    pub c2h_stream_continuous: bool,
    /// Fail a running transfer that makes no progress for this long
    pub transfer_timeout: Option<Duration>,
}

impl ChannelConfig {
    /// Create a configuration with defaults for the given direction and
    /// ring size.
    #[must_use]
    pub const fn new(direction: ChannelDirection, num_descriptors: u32) -> Self {
        Self {
            direction,
            channel_index: 0,
            num_descriptors,
            bridge_memory_size: 0,
            min_size_alignment: 1,
            bytes_per_buffer: 0,
            data_buffer_offset: 0,
            card_buffer_offset: 0,
            descriptor_offset: 0,
            c2h_stream_continuous: false,
            transfer_timeout: None,
        }
    }

    /// Select the channel index within the direction.
    #[must_use]
    pub const fn with_channel_index(mut self, channel_index: u32) -> Self {
        self.channel_index = channel_index;
        self
    }

    /// Set the card-side address space size; zero selects AXI Stream.
    #[must_use]
    pub const fn with_bridge_memory_size(mut self, bytes: u64) -> Self {
        self.bridge_memory_size = bytes;
        self
    }

    /// Set the minimum descriptor-length alignment for split transfers.
    #[must_use]
    pub const fn with_min_size_alignment(mut self, alignment: u32) -> Self {
        self.min_size_alignment = alignment;
        self
    }

    /// Pre-bind each descriptor to a distinct equal-sized buffer.
    #[must_use]
    pub const fn with_buffers(
        mut self,
        bytes_per_buffer: usize,
        data_buffer_offset: usize,
        card_buffer_offset: u64,
    ) -> Self {
        self.bytes_per_buffer = bytes_per_buffer;
        self.data_buffer_offset = data_buffer_offset;
        self.card_buffer_offset = card_buffer_offset;
        self
    }

    /// Set the ring's carve offset inside the descriptor region.
    #[must_use]
    pub const fn with_descriptor_offset(mut self, offset: usize) -> Self {
        self.descriptor_offset = offset;
        self
    }

    /// Run a C2H stream channel continuously (ring armed forever).
    #[must_use]
    pub const fn with_continuous(mut self, continuous: bool) -> Self {
        self.c2h_stream_continuous = continuous;
        self
    }

    /// Fail a running transfer that makes no progress for `timeout`.
    #[must_use]
    pub const fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = Some(timeout);
        self
    }

    /// Whether the card side is an AXI Stream FIFO (no addresses).
    #[inline(always)]
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        self.bridge_memory_size == 0
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.num_descriptors < 2 {
            return Err(ConfigError::InvalidConfig);
        }
        if self.channel_index >= MAX_CHANNELS_PER_DIRECTION {
            return Err(ConfigError::InvalidConfig);
        }
        if self.min_size_alignment == 0 || !self.min_size_alignment.is_power_of_two() {
            return Err(ConfigError::InvalidConfig);
        }
        if self.c2h_stream_continuous {
            // Continuous mode is a fixed subset of stream C2H and needs a
            // buffer bound to every slot it pre-queues.
            if self.direction != ChannelDirection::CardToHost
                || !self.is_stream()
                || self.bytes_per_buffer == 0
            {
                return Err(ConfigError::InvalidConfig);
            }
        }
        if self.is_stream() && self.card_buffer_offset != 0 {
            return Err(ConfigError::InvalidConfig);
        }
        if !self.is_stream() && self.bytes_per_buffer > 0 {
            let span = self.num_descriptors as u64 * self.bytes_per_buffer as u64;
            if self.card_buffer_offset.checked_add(span).is_none_or(|end| end > self.bridge_memory_size)
            {
                return Err(ConfigError::InvalidConfig);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
