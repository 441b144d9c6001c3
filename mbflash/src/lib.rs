//! # mbflash
//!
//! A library for putting MicroPython scripts on a BBC micro:bit.
//!
//! This crate provides:
//!
//! - Intel HEX encoding of a script into the MicroPython flash region
//! - Patching an encoded script into a firmware template
//! - Recovering the embedded script from an existing `.hex` image
//! - Locating the micro:bit among the host's serial ports
//! - A serial bridge to the MicroPython REPL
//!
//! ## Features
//!
//! - `native` (default): Serial port access via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use mbflash::{HexEncoder, image};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let template = std::fs::read_to_string("firmware.hex")?;
//!     let hex = image::build_image(&template, "from microbit import *\ndisplay.scroll('hi')", &HexEncoder::default())?;
//!     let path = image::write_hex_file("/media/MICROBIT".as_ref(), "hello.py", &hex)?;
//!     println!("Saved {}", path.display());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod codec;
pub mod device;
pub mod error;
pub mod image;
pub mod port;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativeConnector, NativePort};
pub use {
    bridge::{BridgeState, Connection, ConnectionId, SerialBridge, TerminalSink},
    device::{DetectedPort, DeviceIdentity, DeviceKind, find_device},
    error::{Error, Result},
    image::{HexEncoder, HexEncoderConfig, HexRecord, PLACEHOLDER_MARKER, RecordType},
    port::{Connector, Port, SerialConfig},
};
