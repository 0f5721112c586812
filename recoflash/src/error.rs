//! Error types for recoflash.

use crate::protocol::packet::AckReason;
use std::io;
use thiserror::Error;

/// Result type for recoflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for recoflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No acknowledging response arrived within the retry budget.
    ///
    /// The session itself stays usable; the whole operation may be retried.
    #[error("Device did not acknowledge within the retry budget")]
    Timeout,

    /// The device explicitly rejected a well-formed request.
    #[error("Device rejected request: {0}")]
    Rejected(AckReason),

    /// An acknowledged write whose content does not match the device.
    ///
    /// The device state must be treated as unknown.
    #[error("Verification failed for {length} bytes at {address:#010x}")]
    Verification {
        /// Start address of the mismatching region.
        address: u32,
        /// Length of the compared region in bytes.
        length: usize,
    },

    /// Device info or version retrieval failed while opening the session.
    #[error("Session bootstrap failed: {0}")]
    Bootstrap(#[source] Box<Error>),

    /// The firmware image file could not be parsed.
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    /// A response passed CRC validation but its body is malformed.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
