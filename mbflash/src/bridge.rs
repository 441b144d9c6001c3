//! Serial bridge between a terminal and the micro:bit REPL.
//!
//! A [`SerialBridge`] walks through `Idle → Locating → Connected → Closed`.
//! While connected it owns exactly one [`Connection`], which runs two worker
//! threads:
//!
//! ```text
//!  terminal ──send_str──► outbound queue ──► writer thread ──► port
//!  terminal ◄───pump──── inbound queue  ◄── reader thread ◄── port
//! ```
//!
//! Each direction is FIFO. Sends are fire-and-forget: they are queued in
//! submission order and written by the writer thread without waiting for
//! completion. Closing is idempotent.

use crate::codec;
use crate::device::{self, DeviceIdentity};
use crate::error::{Error, Result};
use crate::port::{Connector, Port, SerialConfig};
use log::{debug, info, trace, warn};
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Printed when a session starts.
pub const WELCOME_MESSAGE: &str = "MicroPython REPL for the BBC micro:bit.";

/// Printed once the connection is open.
pub const READY_MESSAGE: &str = "Connected: type 'help()' for more information.";

/// Printed when no device could be found or opened.
pub const NOT_FOUND_MESSAGE: &str = "Could not find micro:bit. Plug in device and try again.";

/// Local prompt shown right after connecting.
pub const PROMPT: &str = ">>> ";

const READ_CHUNK_SIZE: usize = 1024;

/// Where the bridge sends text meant for the user.
pub trait TerminalSink {
    /// Display text as-is.
    fn print(&mut self, text: &str);

    /// Display text followed by a line break.
    fn println(&mut self, text: &str) {
        self.print(text);
        self.print("\r\n");
    }
}

impl TerminalSink for String {
    fn print(&mut self, text: &str) {
        self.push_str(text);
    }
}

/// Lifecycle of a bridge session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Not started yet.
    Idle,
    /// Looking for the device.
    Locating,
    /// Connection open, relaying bytes.
    Connected,
    /// Session over; terminal state.
    Closed,
}

/// Opaque identifier of an opened connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An open byte-stream to the device with its reader and writer threads.
pub struct Connection {
    id: ConnectionId,
    port_name: String,
    bit_rate: u32,
    outbound: Option<Sender<Vec<u8>>>,
    inbound: Receiver<Vec<u8>>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Connection {
    /// Take ownership of an open port and start relaying.
    pub fn spawn(mut port: Box<dyn Port>) -> Result<Self> {
        let id = ConnectionId::next();
        let port_name = port.name().to_string();
        let bit_rate = port.baud_rate();

        let mut reader_port = port.try_clone_port()?;
        let running = Arc::new(AtomicBool::new(true));
        let running_reader = running.clone();
        let (inbound_tx, inbound) = mpsc::channel::<Vec<u8>>();
        let (outbound, outbound_rx) = mpsc::channel::<Vec<u8>>();

        // Reader thread: port → inbound queue
        let reader = thread::Builder::new()
            .name(format!("mbflash-rx{id}"))
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK_SIZE];
                while running_reader.load(Ordering::Relaxed) {
                    match reader_port.read(&mut buf) {
                        Ok(0) => {},
                        Ok(n) => {
                            trace!("rx {n} bytes");
                            if inbound_tx
                                .send(buf[..n].to_vec())
                                .is_err()
                            {
                                break;
                            }
                        },
                        Err(ref e)
                            if matches!(
                                e.kind(),
                                ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                            ) => {},
                        Err(e) => {
                            if running_reader.load(Ordering::Relaxed) {
                                warn!("Serial read failed: {e}");
                            }
                            break;
                        },
                    }
                }
                let _ = reader_port.close();
            })?;

        // Writer thread: outbound queue → port, until every sender is gone
        let writer = thread::Builder::new()
            .name(format!("mbflash-tx{id}"))
            .spawn(move || {
                for chunk in outbound_rx {
                    if let Err(e) = port.write_all_bytes(&chunk) {
                        warn!("Serial write failed: {e}");
                        break;
                    }
                    trace!("tx {} bytes", chunk.len());
                }
                let _ = port.close();
            })?;

        info!("Connection {id} open on {port_name} at {bit_rate} baud");
        Ok(Self {
            id,
            port_name,
            bit_rate,
            outbound: Some(outbound),
            inbound,
            running,
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Name of the underlying port.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Bit rate the port was opened at.
    pub fn bit_rate(&self) -> u32 {
        self.bit_rate
    }

    /// Whether the worker threads are still running.
    pub fn is_open(&self) -> bool {
        let alive = |worker: &Option<JoinHandle<()>>| worker.as_ref().is_some_and(|h| !h.is_finished());
        self.outbound.is_some() && alive(&self.writer) && alive(&self.reader)
    }

    /// Queue bytes for the writer thread.
    fn send(&self, bytes: Vec<u8>) -> Result<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or(Error::NotConnected)?;
        outbound
            .send(bytes)
            .map_err(|_| Error::Disconnected)
    }

    /// Wait up to `timeout` for the next inbound chunk.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self.inbound.recv_timeout(timeout) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Disconnected),
        }
    }

    /// Next inbound chunk if one is already waiting.
    fn try_recv(&self) -> Result<Option<Vec<u8>>> {
        match self.inbound.try_recv() {
            Ok(chunk) => Ok(Some(chunk)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Disconnected),
        }
    }

    /// Stop both threads and release the port. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        // Dropping the sender lets the writer flush what is queued and exit
        self.outbound.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
            debug!("Connection {} closed", self.id);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Owns the session state and the single active [`Connection`].
pub struct SerialBridge<C: Connector> {
    connector: C,
    identity: DeviceIdentity,
    serial: SerialConfig,
    state: BridgeState,
    connection: Option<Connection>,
}

impl<C: Connector> SerialBridge<C> {
    /// Create an idle bridge looking for `identity` at 115200 baud.
    pub fn new(connector: C, identity: DeviceIdentity) -> Self {
        Self {
            connector,
            identity,
            serial: SerialConfig::default(),
            state: BridgeState::Idle,
            connection: None,
        }
    }

    /// Override serial settings (the port name is filled in on start).
    #[must_use]
    pub fn with_serial_config(mut self, serial: SerialConfig) -> Self {
        self.serial = serial;
        self
    }

    /// Current state.
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Whether a connection is live.
    pub fn is_open(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(Connection::is_open)
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// Identity this bridge looks for.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Locate the device and open the connection.
    ///
    /// On failure the bridge moves to [`BridgeState::Closed`] after telling
    /// the user; there is no automatic retry.
    pub fn start(&mut self, sink: &mut dyn TerminalSink) -> Result<()> {
        match self.state {
            BridgeState::Idle => {},
            BridgeState::Locating | BridgeState::Connected => return Ok(()),
            BridgeState::Closed => return Err(Error::SessionClosed),
        }

        sink.println(WELCOME_MESSAGE);
        self.state = BridgeState::Locating;
        debug!("Locating device {}", self.identity);

        match self.open_connection() {
            Ok(connection) => {
                self.connection = Some(connection);
                self.state = BridgeState::Connected;
                sink.println(READY_MESSAGE);
                sink.print(PROMPT);
                Ok(())
            },
            Err(e) => {
                warn!("Session start failed: {e}");
                self.state = BridgeState::Closed;
                sink.println(NOT_FOUND_MESSAGE);
                Err(e)
            },
        }
    }

    fn open_connection(&self) -> Result<Connection> {
        let target = device::locate(&self.connector, &self.identity)?;
        info!("micro:bit discovered on {}, connecting", target.name);

        let failed = |e: Error| Error::ConnectionFailed {
            port: target.name.clone(),
            reason: e.to_string(),
        };
        let port = self
            .connector
            .open(&self.serial.for_port(&target.name))
            .map_err(failed)?;
        Connection::spawn(port).map_err(failed)
    }

    /// Encode `text` one byte per character and queue it for the device.
    pub fn send_str(&mut self, text: &str) -> Result<()> {
        let bytes = codec::to_bytes(text)?;
        self.send_bytes(&bytes)
    }

    /// Queue raw bytes for the device.
    ///
    /// If the writer thread has stopped, the session is closed and
    /// [`Error::Disconnected`] is returned.
    pub fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let connection = self
            .connection
            .as_ref()
            .ok_or(Error::NotConnected)?;
        if bytes.is_empty() {
            return Ok(());
        }
        if let Err(e) = connection.send(bytes.to_vec()) {
            self.close();
            return Err(e);
        }
        Ok(())
    }

    /// Forward every inbound chunk already received to `sink`.
    ///
    /// Returns the number of bytes forwarded. If the device went away the
    /// session is closed and [`Error::Disconnected`] is returned.
    pub fn pump(&mut self, sink: &mut dyn TerminalSink) -> Result<usize> {
        self.pump_timeout(sink, Duration::ZERO)
    }

    /// Like [`pump`](Self::pump), but first waits up to `timeout` for data.
    pub fn pump_timeout(&mut self, sink: &mut dyn TerminalSink, timeout: Duration) -> Result<usize> {
        let Some(connection) = self.connection.as_ref() else {
            return Ok(0);
        };

        let mut forwarded = 0;
        let mut next = if timeout.is_zero() {
            connection.try_recv()
        } else {
            connection.recv_timeout(timeout)
        };

        loop {
            match next {
                Ok(Some(chunk)) => {
                    forwarded += chunk.len();
                    sink.print(&codec::to_text(&chunk));
                },
                Ok(None) => return Ok(forwarded),
                Err(e) => {
                    self.close();
                    return Err(e);
                },
            }
            next = connection.try_recv();
        }
    }

    /// Release the connection. Calling this more than once, or before any
    /// connection was made, is a no-op.
    pub fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.shutdown();
            info!("Released connection {}", connection.id());
        }
        self.state = BridgeState::Closed;
    }
}
