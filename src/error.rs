//! Custom error types for the application.
//!
//! This module defines the primary error type, `ScanError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur, from configuration and I/O issues to
//! wire-protocol and scan precondition problems.
//!
//! ## Error Hierarchy
//!
//! `ScanError` consolidates the error sources of the system:
//!
//! - **`Config`** / **`Configuration`**: loading failures from `figment` and semantic
//!   validation failures (e.g. a port of zero for a production link).
//! - **`Io`** / **`Json`**: file and socket I/O, scan record (de)serialization.
//! - **Codec errors** (`FrameTooLarge`, `FrameTruncated`, `UnknownOpcode`,
//!   `InvalidAngle`, `PayloadTooLarge`): raised by the frame codec. Unknown opcodes are
//!   logged and ignored by the device links, never fatal to a connection.
//! - **Precondition errors** (`NoScanContext`, `MissingCollaborator`, `DeviceNotReady`,
//!   `ScanRunning`, `NotRunning`, `NotPaused`, `ContextLocked`, `InvalidScan`): returned
//!   synchronously by orchestrator and context calls. The call had no effect and may be
//!   retried once the precondition holds.
//!
//! By using `#[from]`, `ScanError` can be created from underlying error types,
//! simplifying error handling throughout the crate with the `?` operator.

use crate::experiment::state::ScanState;
use crate::hardware::DeviceRole;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ScanError>;

/// Error type shared by the codec, device links and the scan orchestrator.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Configuration could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Scan record (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Encoded values do not fit into one fixed-size frame.
    #[error("Frame payload of {bytes} bytes exceeds the {max}-byte frame")]
    FrameTooLarge {
        /// Serialized size that was requested.
        bytes: usize,
        /// Fixed frame size.
        max: usize,
    },

    /// Fewer bytes than one full frame were supplied to the decoder.
    #[error("Truncated frame: got {0} bytes")]
    FrameTruncated(usize),

    /// Opcode byte is not part of the protocol.
    #[error("Unknown opcode {0:#04X}")]
    UnknownOpcode(u8),

    /// Angle cannot be represented on the wire as unsigned centidegrees.
    #[error("Angle {0} cannot be encoded as centidegrees")]
    InvalidAngle(f64),

    /// Device announced a payload larger than the configured limit.
    #[error("Payload of {len} bytes exceeds the limit of {max} bytes")]
    PayloadTooLarge {
        /// Announced payload length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// No scan context has been supplied to the orchestrator.
    #[error("No scan context set")]
    NoScanContext,

    /// The scan context lacks a scan or one of the devices.
    #[error("Scan context has no {0}")]
    MissingCollaborator(&'static str),

    /// A device link has no connected client.
    #[error("{0} device is not ready")]
    DeviceNotReady(DeviceRole),

    /// Operation requires an idle orchestrator.
    #[error("Scan already running (state: {0})")]
    ScanRunning(ScanState),

    /// Operation requires an active scan.
    #[error("No scan is running (state: {0})")]
    NotRunning(ScanState),

    /// Operation requires a paused scan.
    #[error("Scan is not paused (state: {0})")]
    NotPaused(ScanState),

    /// The scan context is locked by a running scan.
    #[error("Scan context is locked by a running scan")]
    ContextLocked,

    /// Scan parameters cannot produce a target angle sequence.
    #[error("Invalid scan: {0}")]
    InvalidScan(String),
}

impl ScanError {
    /// Returns true for errors that reject a call because a precondition does not hold.
    ///
    /// Such calls had no side effects and can be retried once the caller has fixed
    /// the precondition (connected the device, stopped the scan, ...).
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ScanError::NoScanContext
                | ScanError::MissingCollaborator(_)
                | ScanError::DeviceNotReady(_)
                | ScanError::ScanRunning(_)
                | ScanError::NotRunning(_)
                | ScanError::NotPaused(_)
                | ScanError::ContextLocked
                | ScanError::InvalidScan(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScanError::DeviceNotReady(DeviceRole::Positioner);
        assert_eq!(err.to_string(), "Positioner device is not ready");

        let err = ScanError::UnknownOpcode(0x3C);
        assert_eq!(err.to_string(), "Unknown opcode 0x3C");
    }

    #[test]
    fn test_precondition_classification() {
        assert!(ScanError::NoScanContext.is_precondition());
        assert!(ScanError::ScanRunning(ScanState::WaitMove).is_precondition());
        assert!(!ScanError::FrameTruncated(3).is_precondition());
        assert!(!ScanError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            .is_precondition());
    }
}
