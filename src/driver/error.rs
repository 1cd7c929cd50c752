//! Error types for the DMA bridge driver
//!
//! Errors are organized by domain for better diagnostics:
//! - [`ConfigError`]: Configure-time failures
//! - [`DmaError`]: Descriptor and ring issues
//! - [`IoError`]: Runtime engine failures
//!
//! The unified [`Error`] enum wraps all domain errors. Configure-time
//! operations return `Result`; runtime failures latch into the channel
//! context (`failed` plus a formatted message) because the engine keeps
//! draining already-queued descriptors after a fault.

// =============================================================================
// Configuration Errors
// =============================================================================

/// Configure-time errors
///
/// These occur while validating a channel configuration or probing the
/// bridge's register blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid configuration parameter (ring too small, region too small,
    /// non-power-of-two alignment, mode inconsistent with memory size)
    InvalidConfig,
    /// Channel identifier or signature mismatch at probe
    ChannelMisconfigured,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConfigError {
    /// Returns a human-readable description of the error
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConfigError::InvalidConfig => "invalid configuration",
            ConfigError::ChannelMisconfigured => "channel misconfigured",
        }
    }
}

// =============================================================================
// DMA Errors
// =============================================================================

/// Descriptor and ring errors
///
/// These relate to populating descriptors into the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// Address or length does not honor the channel's alignment rules
    AlignmentViolation,
    /// Requested byte count exceeds the per-descriptor maximum
    DescriptorOverflow,
    /// Contiguous free run at the start cursor is shorter than requested
    RingFull,
}

impl core::fmt::Display for DmaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DmaError {
    /// Returns a human-readable description of the error
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            DmaError::AlignmentViolation => "alignment violation",
            DmaError::DescriptorOverflow => "descriptor byte count overflow",
            DmaError::RingFull => "descriptor ring full",
        }
    }
}

// =============================================================================
// I/O Errors
// =============================================================================

/// Runtime engine errors
///
/// These occur while the engine is processing descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// Engine status reported one or more error bits
    EngineError,
    /// A running transfer did not complete before its deadline
    EngineTimeout,
    /// Busy stayed asserted after Run was cleared at finalisation
    FinaliseTimeout,
    /// A stream writeback record never raised its validity bit
    WritebackTimeout,
    /// Internal bookkeeping assertion failed
    AssertionFailed,
}

impl core::fmt::Display for IoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl IoError {
    /// Returns a human-readable description of the error
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            IoError::EngineError => "engine reported error bits",
            IoError::EngineTimeout => "transfer timed out",
            IoError::FinaliseTimeout => "engine stayed busy at finalisation",
            IoError::WritebackTimeout => "stream writeback never became valid",
            IoError::AssertionFailed => "internal assertion failed",
        }
    }
}

// =============================================================================
// Unified Error Type
// =============================================================================

/// This enum wraps all domain-specific errors for unified handling.
///
/// Match on the inner domain error for specific handling:
/// ```ignore
/// match result {
///     Err(Error::Config(ConfigError::ChannelMisconfigured)) => { /* ... */ }
///     Err(Error::Dma(DmaError::RingFull)) => { /* ... */ }
///     Err(Error::Io(IoError::EngineTimeout)) => { /* ... */ }
///     _ => {}
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Configuration error
    Config(ConfigError),
    /// DMA error
    Dma(DmaError),
    /// I/O error
    Io(IoError),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Config(e) => write!(f, "config: {}", e.as_str()),
            Error::Dma(e) => write!(f, "dma: {}", e.as_str()),
            Error::Io(e) => write!(f, "io: {}", e.as_str()),
        }
    }
}

impl std::error::Error for Error {}

// From impls for automatic conversion
impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<DmaError> for Error {
    fn from(e: DmaError) -> Self {
        Error::Dma(e)
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

/// Result type alias for driver operations
pub type Result<T> = core::result::Result<T, Error>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = core::result::Result<T, ConfigError>;

// =============================================================================
// Unit Tests
// =============================================================================
