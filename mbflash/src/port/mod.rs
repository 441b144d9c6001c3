//! Port abstraction for serial communication.
//!
//! The bridge never talks to `serialport` directly. It goes through two
//! seams:
//!
//! - [`Port`]: an open byte stream (read, write, clone for a reader thread)
//! - [`Connector`]: enumerates candidate endpoints and opens one of them
//!
//! ```text
//! +------------------+
//! |   SerialBridge   |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+      +------------------+
//! |  Connector trait | ---> |    Port trait    |
//! +--------+---------+      +--------+---------+
//!          |                         |
//!          v                         v
//! +--------+---------+      +--------+---------+
//! | NativeConnector  |      |    NativePort    |
//! |   (serialport)   |      |   (serialport)   |
//! +------------------+      +------------------+
//! ```
//!
//! Tests plug an in-memory implementation into the same traits.

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::device::DetectedPort;
use crate::error::Result;

/// Bit rate of the MicroPython REPL on the micro:bit.
pub const REPL_BAUD_RATE: u32 = 115_200;

/// Read timeout used by the bridge reader loop.
pub const READ_POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout of the reader loop.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: REPL_BAUD_RATE,
            timeout: READ_POLL_TIMEOUT,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Same settings, different port.
    #[must_use]
    pub fn for_port(&self, port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..self.clone()
        }
    }
}

/// An open serial byte stream.
pub trait Port: Read + Write + Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Open a second handle on the same stream, for a dedicated reader.
    fn try_clone_port(&self) -> Result<Box<dyn Port>>;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

/// Enumerates candidate endpoints and opens them.
pub trait Connector {
    /// List the endpoints currently visible to the host.
    fn list_ports(&self) -> Result<Vec<DetectedPort>>;

    /// Open the endpoint named in `config`.
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>>;
}

#[cfg(feature = "native")]
pub use native::{NativeConnector, NativePort};
