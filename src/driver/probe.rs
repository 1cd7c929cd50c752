//! Bridge capability probe
//!
//! Reads the identification block to confirm the subsystem signature and
//! enumerate the configured channels, and reads each channel's alignment
//! capability register.

use log::{debug, warn};

use crate::internal::constants::{DMA_DESCRIPTOR_MAX_LEN, MAX_CHANNELS_PER_DIRECTION};
use crate::internal::register::channel::{
    ALIGNMENTS_ADDR_SHIFT, ALIGNMENTS_FIELD_MASK, ALIGNMENTS_GRANULARITY_SHIFT, ChannelRegs,
};
use crate::internal::register::{
    IDENTIFIER_STREAM, IDENTIFIER_VERSION_MASK, MIN_BAR_LEN, SUBSYSTEM_SIGNATURE,
    config_block_identifier, identifier_channel, identifier_subsystem, identifier_target, target,
};
use crate::mapping::BarMapping;

use super::config::ChannelDirection;
use super::error::{ConfigError, ConfigResult};

// =============================================================================
// Bridge Info
// =============================================================================

/// Channel counts discovered from the identification block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeInfo {
    /// Configured host-to-card channels
    pub num_h2c_channels: u32,
    /// Configured card-to-host channels
    pub num_c2h_channels: u32,
}

/// Enumerate the bridge's channels.
///
/// A missing or mismatched subsystem signature yields zero channels.
#[must_use]
pub fn probe_bridge(bar: &BarMapping) -> BridgeInfo {
    if bar.len() < MIN_BAR_LEN {
        warn!("BAR too small for the bridge register window: {:#x}", bar.len());
        return BridgeInfo::default();
    }

    let identifier = config_block_identifier(bar);
    if identifier_subsystem(identifier) != SUBSYSTEM_SIGNATURE
        || identifier_target(identifier) != target::CONFIG
    {
        warn!("bridge signature mismatch: identifier={identifier:#010x}");
        return BridgeInfo::default();
    }

    let info = BridgeInfo {
        num_h2c_channels: count_channels(bar, ChannelDirection::HostToCard),
        num_c2h_channels: count_channels(bar, ChannelDirection::CardToHost),
    };
    debug!(
        "bridge probe: {} H2C, {} C2H channels",
        info.num_h2c_channels, info.num_c2h_channels
    );
    info
}

fn count_channels(bar: &BarMapping, direction: ChannelDirection) -> u32 {
    let mut count = 0;
    for channel in 0..MAX_CHANNELS_PER_DIRECTION {
        if ChannelIdentity::read(bar, direction, channel).is_err() {
            break;
        }
        count += 1;
    }
    count
}

// =============================================================================
// Channel Identity
// =============================================================================

/// Decoded identifier register of one channel block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelIdentity {
    /// Channel direction the block reported
    pub direction: ChannelDirection,
    /// Whether the channel is configured for AXI Stream
    pub stream: bool,
    /// Channel id field
    pub channel_id: u32,
    /// Hardware version field
    pub version: u32,
}

impl ChannelIdentity {
    /// Read and verify a channel block's identifier.
    ///
    /// Fails with `ChannelMisconfigured` when the signature, target, or
    /// channel id disagree with the requested block.
    pub fn read(
        bar: &BarMapping,
        direction: ChannelDirection,
        channel: u32,
    ) -> ConfigResult<Self> {
        let identifier = ChannelRegs::new(bar, direction, channel).identifier();
        let expected_target = match direction {
            ChannelDirection::HostToCard => target::H2C_CHANNEL,
            ChannelDirection::CardToHost => target::C2H_CHANNEL,
        };
        if identifier_subsystem(identifier) != SUBSYSTEM_SIGNATURE
            || identifier_target(identifier) != expected_target
            || identifier_channel(identifier) != channel
        {
            return Err(ConfigError::ChannelMisconfigured);
        }
        Ok(Self {
            direction,
            stream: identifier & IDENTIFIER_STREAM != 0,
            channel_id: channel,
            version: identifier & IDENTIFIER_VERSION_MASK,
        })
    }
}

// =============================================================================
// Channel Alignments
// =============================================================================

/// Per-channel alignment capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAlignments {
    /// Required byte-address alignment for source and destination
    pub addr_alignment: u32,
    /// Required transfer-length granularity
    pub len_granularity: u32,
    /// Usable address bits
    pub num_address_bits: u32,
}

impl ChannelAlignments {
    /// Read the channel's alignment capability register.
    ///
    /// Fields the hardware leaves at zero fall back to byte granularity
    /// and full 64-bit addressing.
    #[must_use]
    pub fn read(bar: &BarMapping, direction: ChannelDirection, channel: u32) -> Self {
        let raw = ChannelRegs::new(bar, direction, channel).alignments();
        let field = |shift: u32| (raw >> shift) & ALIGNMENTS_FIELD_MASK;
        Self {
            addr_alignment: field(ALIGNMENTS_ADDR_SHIFT).max(1),
            len_granularity: field(ALIGNMENTS_GRANULARITY_SHIFT).max(1),
            num_address_bits: if raw & ALIGNMENTS_FIELD_MASK == 0 {
                64
            } else {
                raw & ALIGNMENTS_FIELD_MASK
            },
        }
    }

    /// Largest per-descriptor byte count that honors both the channel's
    /// granularity and the caller's split alignment.
    #[must_use]
    pub fn max_descriptor_len(&self, min_size_alignment: u32) -> u32 {
        let alignment = min_size_alignment.max(self.len_granularity);
        DMA_DESCRIPTOR_MAX_LEN & !(alignment - 1)
    }
}

// =============================================================================
// Tests
// =============================================================================
