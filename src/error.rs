use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::session::RunOutcome;

/// Fatal conditions of a run.
#[derive(Error, Debug)]
pub enum TriageError {
    /// Container header is not a legacy pcap header we understand.
    #[error("unrecognized capture format: {0}")]
    Format(String),

    /// The input stream holds no bytes at all.
    #[error("capture is empty (0 bytes)")]
    EmptyCapture,

    /// The stream ended inside the global header or inside a record.
    /// `partial` carries whatever the complete records produced.
    #[error("capture truncated after {records} complete records")]
    TruncatedCapture {
        records: u64,
        partial: Option<Box<RunOutcome>>,
    },

    /// The per-packet warning budget was exceeded.
    #[error("too many malformed packets ({count} exceeds the limit of {limit})")]
    TooManyMalformedPackets { count: u64, limit: u64 },

    /// A built-in payload pattern failed to compile.
    #[error("invalid payload pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TriageError>;

// ─── Non-fatal conditions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCause {
    /// Header cut short by the end of the captured bytes.
    Truncated,
    /// Header present but its fields are inconsistent.
    Malformed,
}

/// A recognized layer could not be decoded. The record is still copied and
/// analyzed with the layers decoded above it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketDecodeWarning {
    pub packet_index: u64,
    pub layer:        &'static str,
    pub cause:        WarningCause,
    pub reason:       String,
}

impl fmt::Display for PacketDecodeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "packet {}: {} layer {:?}: {}", self.packet_index, self.layer, self.cause, self.reason)
    }
}
