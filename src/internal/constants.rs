//! Centralized Constants
//!
//! Single source of truth for the magic numbers used throughout the
//! driver.
//!
//! # Note
//!
//! Hardware register bit definitions remain in their respective modules
//! (`register/channel.rs`, `register/sgdma.rs`) as they are specific to
//! those hardware blocks.

use std::time::Duration;

// =============================================================================
// Descriptor Limits
// =============================================================================

/// Maximum byte count a single descriptor can move (2^28 - 1)
pub const DMA_DESCRIPTOR_MAX_LEN: u32 = 0x0FFF_FFFF;

/// Maximum adjacent-descriptor prefetch hint
pub const DMA_DESCRIPTOR_MAX_ADJACENT: u32 = 31;

// =============================================================================
// Completed-Count Writeback
// =============================================================================

/// Low 31 bits of the writeback word carry the retired-descriptor counter
pub const COMPLETED_COUNT_WRITEBACK_MASK: u32 = 0x7FFF_FFFF;

/// The counter wraps modulo 2^31
pub const COMPLETED_COUNT_MODULUS: u32 = 0x8000_0000;

// =============================================================================
// Ring Layout
// =============================================================================

/// Sub-region alignment inside the descriptor DMA region (maximum cache
/// line on supported CPUs)
pub const DESCRIPTOR_REGION_ALIGNMENT: usize = 64;

// =============================================================================
// Channel Enumeration
// =============================================================================

/// Maximum channels the bridge can be configured with per direction
pub const MAX_CHANNELS_PER_DIRECTION: u32 = 4;

// =============================================================================
// Timing Constants
// =============================================================================

/// How long finalise waits for Busy to clear after clearing Run
pub const FINALISE_TIMEOUT: Duration = Duration::from_secs(1);

/// Maximum iterations spinning on a stream writeback validity bit
pub const STREAM_WRITEBACK_SPIN_LIMIT: u32 = 100_000;
