//! Protocol errors

use thiserror::Error;

use super::identity::{FirmwareVersion, Processor};

/// A peripheral board whose firmware is older than the link requires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardMismatch {
    /// Node id on the bus
    pub node_id: u8,
    /// Board model string
    pub model: String,
    /// Firmware reported by the board
    pub actual: FirmwareVersion,
    /// Minimum firmware required for this link generation
    pub required: FirmwareVersion,
}

impl std::fmt::Display for BoardMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "board {:02X} ({}) has firmware {}, requires {}",
            self.node_id, self.model, self.actual, self.required
        )
    }
}

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Link to {0} closed")]
    LinkClosed(String),

    #[error("No identification reply after {attempts} attempts")]
    HandshakeTimeout { attempts: u32 },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Malformed reply: {0:?}")]
    MalformedReply(String),

    #[error("Unrecognized processor type: {0}")]
    UnknownProcessor(String),

    #[error("Firmware version mismatch: {processor} processor requires firmware {required}, but board reports {actual}")]
    FirmwareMismatch {
        processor: Processor,
        required: FirmwareVersion,
        actual: FirmwareVersion,
    },

    #[error("IO board firmware mismatch: {}", format_mismatches(.0))]
    BoardFirmwareMismatch(Vec<BoardMismatch>),

    #[error("Invalid firmware version: {0:?}")]
    InvalidVersion(String),

    #[error("Invalid link state: {0}")]
    InvalidState(String),

    #[error("Outbound queue full")]
    QueueFull,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// Errors worth another attempt under a retry policy
    pub fn is_transient(&self) -> bool {
        matches!(self, ProtocolError::SerialError(_) | ProtocolError::Timeout(_))
    }
}

fn format_mismatches(mismatches: &[BoardMismatch]) -> String {
    mismatches
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<tokio_serial::Error> for ProtocolError {
    fn from(e: tokio_serial::Error) -> Self {
        ProtocolError::SerialError(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Config(e.to_string())
    }
}
