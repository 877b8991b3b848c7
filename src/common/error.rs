// src/common/error.rs

use super::address::BusAddr;

/// Main error type for the crate.
///
/// Frame-level anomalies (`ChecksumMismatch`, `LengthMismatch`,
/// `UnknownAddress`, `TransportGap`) are recovered inside the decode
/// pipeline and only surface as counters. They exist here so callers driving
/// the validator directly get a typed reason.
#[derive(Debug, thiserror::Error)]
pub enum AbcdError {
    /// Bytes were lost between the transport and the decoder.
    #[error("Transport gap: {skipped} bytes lost")]
    TransportGap { skipped: usize },

    /// Received CRC does not match calculated CRC.
    #[error("Checksum mismatch: expected {expected:#06x}, calculated {calculated:#06x}")]
    ChecksumMismatch { expected: u16, calculated: u16 },

    /// Declared frame length violates the rule for its frame kind.
    #[error("Length mismatch: declared {declared} bytes, {rule}")]
    LengthMismatch { declared: usize, rule: &'static str },

    /// Source or destination is not a known bus participant.
    #[error("Unknown bus address {0}")]
    UnknownAddress(BusAddr),

    /// The byte source ended. Fatal for the decode task only.
    #[error("Transport closed")]
    TransportClosed,

    /// The archive consumer is gone. Never propagated to decoding.
    #[error("Archive unavailable")]
    ArchiveUnavailable,

    #[error("Invalid bus address: '{0}'")]
    InvalidAddress(String),

    #[error("Invalid register id: '{0}'")]
    InvalidRegister(String),

    /// Buffer provided was too small.
    #[error("Buffer overflow: needed {needed}, got {got}")]
    BufferOverflow { needed: usize, got: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Result type alias using AbcdError.
pub type Result<T> = core::result::Result<T, AbcdError>;

/// Why the validator turned a candidate down.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RejectReason {
    ChecksumMismatch { expected: u16, calculated: u16 },
    LengthMismatch { declared: usize, rule: &'static str },
    UnknownAddress(BusAddr),
}

impl RejectReason {
    /// Short label used for counters and metric labels.
    pub const fn label(&self) -> &'static str {
        match self {
            RejectReason::ChecksumMismatch { .. } => "checksum",
            RejectReason::LengthMismatch { .. } => "length",
            RejectReason::UnknownAddress(_) => "address",
        }
    }
}

impl From<RejectReason> for AbcdError {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::ChecksumMismatch { expected, calculated } => {
                AbcdError::ChecksumMismatch { expected, calculated }
            }
            RejectReason::LengthMismatch { declared, rule } => {
                AbcdError::LengthMismatch { declared, rule }
            }
            RejectReason::UnknownAddress(addr) => AbcdError::UnknownAddress(addr),
        }
    }
}
