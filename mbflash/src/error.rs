//! Error types for mbflash.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for mbflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mbflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Script does not fit in the flash region reserved for it.
    #[error("Script too large: {size} bytes with header, flash region holds {capacity}")]
    EncodingLimitExceeded {
        /// Header plus script length in bytes.
        size: usize,
        /// Capacity of the target flash region in bytes.
        capacity: usize,
    },

    /// Encoded block would cross a 64 KiB boundary without an extended address record.
    #[error(
        "Script block at {start:#07x}..{end:#07x} crosses a 64 KiB segment; enable segment records"
    )]
    SegmentOverflow {
        /// First address of the block.
        start: u32,
        /// One past the last address of the block.
        end: u32,
    },

    /// A character cannot be represented as a single byte.
    #[error("Character {ch:?} at position {index} is outside the single-byte range")]
    CodePointOutOfRange {
        /// Offending character.
        ch: char,
        /// Character index within the input.
        index: usize,
    },

    /// The firmware template has no script placeholder.
    #[error("Firmware template does not contain the script placeholder")]
    MarkerNotFound,

    /// The firmware template contains the placeholder more than once.
    #[error("Firmware template contains the script placeholder {count} times")]
    MarkerAmbiguous {
        /// Number of occurrences found.
        count: usize,
    },

    /// Malformed Intel HEX input.
    #[error("Invalid Intel HEX at line {line}: {reason}")]
    InvalidHex {
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// A record payload does not fit the one-byte length field.
    #[error("Intel HEX record payload of {len} bytes exceeds 255")]
    RecordTooLong {
        /// Payload length in bytes.
        len: usize,
    },

    /// No embedded script header was found in a hex image.
    #[error("No embedded script found in hex image")]
    ScriptNotFound,

    /// No enumerated device matches the expected identity.
    #[error("Could not find micro:bit. Plug in device and try again.")]
    DeviceNotFound,

    /// The device was found but could not be opened.
    #[error("Failed to connect to {port}: {reason}")]
    ConnectionFailed {
        /// Port name/path.
        port: String,
        /// Underlying failure.
        reason: String,
    },

    /// A send was attempted without an open connection.
    #[error("No open connection")]
    NotConnected,

    /// The device stopped responding mid-session.
    #[error("Device disconnected")]
    Disconnected,

    /// The session has already been closed.
    #[error("Session already closed")]
    SessionClosed,

    /// The output artifact could not be written.
    #[error("Unable to write {}: {source}. Have you got the micro:bit plugged in?", path.display())]
    WriteFailed {
        /// Destination path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// Unsupported operation on this build.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}
