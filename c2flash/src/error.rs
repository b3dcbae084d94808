//! Error types for c2flash.

use std::io;
use thiserror::Error;

/// Result type for c2flash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A malformed line found while parsing a firmware image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {reason}")]
pub struct LineError {
    /// 1-based line number in the source text.
    pub line: usize,
    /// What was wrong with the line.
    pub reason: String,
}

/// Error type for c2flash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The bridge sent nothing, or fewer bytes than the command requires.
    #[error("{op}: no response @ 0x{address:06X} ({amount} bytes)")]
    NoResponse {
        /// Operation name.
        op: &'static str,
        /// Address the operation targeted (0 for address-less commands).
        address: u32,
        /// Amount of data involved.
        amount: usize,
    },

    /// The bridge answered with a status byte other than the expected ACK.
    #[error("{op}: unexpected ack 0x{actual:02X} (expected 0x{expected:02X}) @ 0x{address:06X}")]
    UnexpectedAck {
        /// Operation name.
        op: &'static str,
        /// Expected status byte.
        expected: u8,
        /// Status byte actually received.
        actual: u8,
        /// Address the operation targeted.
        address: u32,
        /// Amount of data involved.
        amount: usize,
    },

    /// The target reported a checksum mismatch for a write.
    #[error("@ 0x{address:04X}: CRC wrong")]
    ChecksumError {
        /// Address of the rejected write.
        address: u32,
    },

    /// Address or length does not fit the wire field widths.
    #[error("{op}: 0x{address:X} + {amount} bytes exceeds the addressable range")]
    AddressRangeExceeded {
        /// Operation name.
        op: &'static str,
        /// Requested address.
        address: u32,
        /// Requested amount.
        amount: usize,
    },

    /// A firmware image contained malformed lines.
    #[error("Invalid HEX image: {} malformed line(s), first at {}", errors.len(), errors.first().map_or_else(String::new, ToString::to_string))]
    InvalidImage {
        /// All malformed lines, in file order.
        errors: Vec<LineError>,
    },

    /// One bridge-firmware installation attempt failed.
    #[error("Flashing at {baud} baud failed: {reason}")]
    FlashAttemptFailed {
        /// Baud rate of the failed attempt.
        baud: u32,
        /// Why the attempt failed.
        reason: String,
    },

    /// Every candidate baud rate failed.
    #[error("Bridge firmware installation failed at all baud rates {tried:?}")]
    FlashExhausted {
        /// Baud rates that were tried, in order.
        tried: Vec<u32>,
    },

    /// Timeout waiting for the bootloader.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The operation was cancelled (deadline expired or interrupted).
    #[error("Operation cancelled")]
    Cancelled,

    /// Bridge firmware not present on the connected device.
    #[error("C2 interface not detected on {0}")]
    InterfaceNotDetected(String),

    /// Target MCU could not be initialized.
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error came from the target's reply rather than the link.
    pub fn is_protocol_failure(&self) -> bool {
        matches!(
            self,
            Self::NoResponse { .. } | Self::UnexpectedAck { .. } | Self::ChecksumError { .. }
        )
    }

    /// Copy of this error for recording in a session while the original is
    /// returned. I/O errors keep their kind and message only.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
            #[cfg(feature = "native")]
            Self::Serial(e) => Self::Serial(serialport::Error::new(e.kind(), e.description.clone())),
            Self::NoResponse { op, address, amount } => Self::NoResponse {
                op: *op,
                address: *address,
                amount: *amount,
            },
            Self::UnexpectedAck {
                op,
                expected,
                actual,
                address,
                amount,
            } => Self::UnexpectedAck {
                op: *op,
                expected: *expected,
                actual: *actual,
                address: *address,
                amount: *amount,
            },
            Self::ChecksumError { address } => Self::ChecksumError { address: *address },
            Self::AddressRangeExceeded { op, address, amount } => Self::AddressRangeExceeded {
                op: *op,
                address: *address,
                amount: *amount,
            },
            Self::InvalidImage { errors } => Self::InvalidImage {
                errors: errors.clone(),
            },
            Self::FlashAttemptFailed { baud, reason } => Self::FlashAttemptFailed {
                baud: *baud,
                reason: reason.clone(),
            },
            Self::FlashExhausted { tried } => Self::FlashExhausted {
                tried: tried.clone(),
            },
            Self::Timeout(s) => Self::Timeout(s.clone()),
            Self::Cancelled => Self::Cancelled,
            Self::InterfaceNotDetected(s) => Self::InterfaceNotDetected(s.clone()),
            Self::InitializationFailed(s) => Self::InitializationFailed(s.clone()),
            Self::Config(s) => Self::Config(s.clone()),
        }
    }
}
