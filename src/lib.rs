//! User-space XDMA Bridge Driver
//!
//! A user-space driver core for the Xilinx "DMA/Bridge Subsystem for PCI
//! Express". It owns single DMA engine channels - host-to-card (H2C) or
//! card-to-host (C2H) - and provides a streaming pipeline in which the
//! application enqueues descriptors and later reaps completed transfers.
//! Both AXI Memory-Mapped and AXI Stream endpoints are supported,
//! including continuous-run C2H stream reception.
//!
//! # Architecture
//!
//! The driver is organized into three layers:
//!
//! 1. **Channel Layer** ([`driver::channel`]): ring lifecycle, the
//!    populate/start/poll state machine, and direction adapters
//! 2. **Probe Layer** ([`driver::probe`]): capability discovery
//! 3. **Mapping Layer** ([`mapping`]): the consumed BAR and IOMMU mapping
//!    interfaces
//!
//! Everything external stays external: PCIe enumeration, BAR mapping, and
//! DMA buffer allocation belong to the application (typically VFIO-based),
//! which hands the driver a [`BarMapping`] and two [`IovaMapping`]
//! regions.
//!
//! # Completion model
//!
//! Polling only. The engine retires descriptors in order and reports
//! progress through a completed-count writeback word (modulo 2^31); C2H
//! stream channels additionally write one record per descriptor carrying
//! the actual byte count and end-of-packet flag. The core never blocks:
//! all waiting is bounded busy-polling, and the caller picks the outer
//! cadence.
//!
//! # Example
//!
//! ```ignore
//! use xdma_bridge::{ChannelConfig, ChannelDirection, ChannelResources, DmaChannel};
//!
//! let info = xdma_bridge::probe_bridge(&bar);
//! assert!(info.num_h2c_channels > 0);
//!
//! let config = ChannelConfig::new(ChannelDirection::HostToCard, 16)
//!     .with_bridge_memory_size(0x10000)
//!     .with_buffers(0x1000, 0, 0);
//! let mut channel = DmaChannel::configure(config, ChannelResources {
//!     bar: &bar,
//!     descriptor_region: &descriptors,
//!     data_region: &data,
//!     overall_success: &success,
//! })?;
//!
//! let buffer = channel.next_h2c_buffer().unwrap();
//! // ... fill the buffer ...
//! channel.start_h2c_buffers(1);
//! while channel.poll_completed_transfer().is_none() {}
//! channel.finalise();
//! ```

// =============================================================================
// Modules
// =============================================================================

pub mod driver;
pub mod mapping;

// Internal implementation details (pub(crate) only)
mod internal;

// Test utilities (only available during testing)
#[cfg(test)]
pub mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use driver::channel::{
    ChannelFailure, ChannelResources, CompletedTransfer, DescriptorSpec, DmaChannel,
    descriptor_allocation_size,
};
pub use driver::config::{ChannelConfig, ChannelDirection, State};
pub use driver::error::{ConfigError, ConfigResult, DmaError, Error, IoError, Result};
pub use driver::probe::{BridgeInfo, ChannelAlignments, ChannelIdentity, probe_bridge};
pub use mapping::{BarMapping, ContiguousMapping, IovaMapping};

/// Low-level register accessors for advanced use.
///
/// These are intentionally separated from the primary facade. Most users
/// should prefer the safe driver APIs instead of touching registers
/// directly.
///
/// # Safety
///
/// Direct register access bypasses driver invariants. Use only if you
/// fully understand the bridge hardware and accept responsibility for
/// correct sequencing and synchronization.
pub mod unsafe_registers {
    pub use crate::internal::register::channel::{ChannelControl, ChannelRegs, ChannelStatus};
    pub use crate::internal::register::sgdma::{SgdmaCommonRegs, SgdmaRegs};
}

/// Shared driver constants.
///
/// These are grouped into a dedicated module to keep the top-level facade
/// focused on driver types.
pub mod constants {
    pub use crate::internal::constants::{
        COMPLETED_COUNT_WRITEBACK_MASK,
        DESCRIPTOR_REGION_ALIGNMENT,
        DMA_DESCRIPTOR_MAX_ADJACENT,
        // Descriptor limits
        DMA_DESCRIPTOR_MAX_LEN,
        // Timing
        FINALISE_TIMEOUT,
        MAX_CHANNELS_PER_DIRECTION,
    };
}
