//! Interactive REPL command implementation.
//!
//! - Bridge worker threads: serial ↔ inbound/outbound queues
//! - Main thread: keyboard (crossterm raw mode) → bridge, bridge → terminal
//! - Ctrl+]: leave the session; every other key goes to the device

use anyhow::{Context, Result};
use console::style;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use log::debug;
use mbflash::bridge::{SerialBridge, TerminalSink};
use mbflash::port::REPL_BAUD_RATE;
use mbflash::{Connector, NativeConnector, SerialConfig, codec};
use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal, Write as _};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, CliError, device_identity};

const KEY_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Terminal output for the bridge, optionally mirrored to a log file.
struct ReplTerminal {
    log: Option<File>,
}

impl TerminalSink for ReplTerminal {
    fn print(&mut self, text: &str) {
        let mut out = io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();

        if let Some(ref mut log) = self.log {
            // Log the device's bytes unchanged
            let _ = log.write_all(&codec::to_bytes_lossy(text));
        }
    }
}

/// RAII guard to restore terminal mode on drop.
struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Run the REPL until the user presses Ctrl+] or the device goes away.
pub(crate) fn cmd_repl(
    cli: &Cli,
    config: &Config,
    baud: Option<u32>,
    log_file: Option<&PathBuf>,
) -> Result<()> {
    if !io::stdin().is_terminal() {
        return Err(CliError::Usage("The REPL needs an interactive terminal".to_string()).into());
    }

    let identity = device_identity(cli, config);
    let baud = baud
        .or(config.serial.baud)
        .unwrap_or(REPL_BAUD_RATE);
    debug!("REPL for {identity} at {baud} baud");

    let log = if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        if !cli.quiet {
            eprintln!("{} Logging to {}", style("📝").cyan(), path.display());
        }
        Some(file)
    } else {
        None
    };

    let mut output = ReplTerminal { log };
    let mut bridge = SerialBridge::new(NativeConnector, identity)
        .with_serial_config(SerialConfig::new("", baud));
    bridge.start(&mut output)?;

    if !cli.quiet {
        eprint!("{}\r\n", style("Exit with Ctrl+]").dim());
    }

    terminal::enable_raw_mode().context("Failed to enable raw terminal mode")?;
    let raw_guard = RawModeGuard;

    let result = relay(&mut bridge, &mut output);
    // Restore cooked mode before close() logs
    drop(raw_guard);
    bridge.close();

    if !cli.quiet {
        eprintln!();
        eprintln!("{} REPL closed", style("👋").cyan());
    }
    result
}

/// Shuttle bytes both ways until the exit key.
fn relay<C: Connector>(bridge: &mut SerialBridge<C>, output: &mut ReplTerminal) -> Result<()> {
    loop {
        bridge.pump(output)?;

        if !event::poll(KEY_POLL_INTERVAL)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        if is_exit_key(&key) {
            return Ok(());
        }
        if let Some(bytes) = key_to_bytes(&key) {
            bridge.send_bytes(&bytes)?;
        }
    }
}

/// Ctrl+] ends the session. Some terminals report it as Ctrl+5.
fn is_exit_key(key: &KeyEvent) -> bool {
    key.modifiers
        .contains(KeyModifiers::CONTROL)
        && matches!(key.code, KeyCode::Char(']' | '5'))
}

/// Bytes a key press should put on the wire.
fn key_to_bytes(key: &KeyEvent) -> Option<Vec<u8>> {
    let bytes = match key.code {
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
            if !c.is_ascii_alphabetic() {
                return None;
            }
            let letter = u8::try_from(c.to_ascii_lowercase()).ok()?;
            vec![letter - b'a' + 1]
        },
        KeyCode::Char(c) => {
            let mut buf = [0u8; 4];
            codec::to_bytes_lossy(c.encode_utf8(&mut buf))
        },
        KeyCode::Enter => b"\r".to_vec(),
        KeyCode::Backspace => vec![0x08],
        KeyCode::Tab => vec![0x09],
        KeyCode::Esc => vec![0x1B],
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Home => b"\x1b[H".to_vec(),
        KeyCode::End => b"\x1b[F".to_vec(),
        KeyCode::Delete => b"\x1b[3~".to_vec(),
        _ => return None,
    };
    Some(bytes)
}
