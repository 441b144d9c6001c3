//! Firmware image assembly.
//!
//! - [`hex`]: encoding a script into Intel HEX records (and back)
//! - [`firmware`]: splicing the records into the firmware template

pub mod firmware;
pub mod hex;

pub use firmware::{PLACEHOLDER_MARKER, build_image, patch, write_hex_file};
pub use hex::{HexEncoder, HexEncoderConfig, HexRecord, RecordType, decode_script};
