//! mbflash CLI - Command-line tool for putting MicroPython scripts on a BBC micro:bit.
//!
//! ## Features
//!
//! - Build a flashable `.hex` image from a script and a firmware template
//! - Print the encoded script records on their own
//! - Recover the script from an existing `.hex` image
//! - Interactive MicroPython REPL over USB serial
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use mbflash::DeviceIdentity;
use mbflash::image::HexEncoderConfig;
use std::env;
use std::io::IsTerminal;
use std::path::PathBuf;

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if symbols/colours should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// mbflash - Flash MicroPython scripts to a BBC micro:bit and talk to its REPL.
///
/// Environment variables:
///   MBFLASH_VID               - USB vendor ID of the device (default: 3368)
///   MBFLASH_PID               - USB product ID of the device (default: 516)
///   MBFLASH_FIRMWARE          - Default firmware template
///   MBFLASH_TARGET_DIR        - Default output directory
///   MBFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "mbflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// USB vendor ID to look for (decimal or 0x-prefixed hex).
    #[arg(long, global = true, env = "MBFLASH_VID", value_parser = parse_u16)]
    pub vid: Option<u16>,

    /// USB product ID to look for (decimal or 0x-prefixed hex).
    #[arg(long, global = true, env = "MBFLASH_PID", value_parser = parse_u16)]
    pub pid: Option<u16>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "MBFLASH_NON_INTERACTIVE")]
    pub non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Build a .hex image from a script and save it to the micro:bit drive.
    Flash {
        /// Path to the MicroPython script.
        script: PathBuf,

        /// Firmware template (.hex containing the script placeholder).
        #[arg(short, long, env = "MBFLASH_FIRMWARE")]
        firmware: Option<PathBuf>,

        /// Directory to write the image into (usually the MICROBIT drive).
        #[arg(short = 'd', long, env = "MBFLASH_TARGET_DIR")]
        target_dir: Option<PathBuf>,

        /// Output name without extension (defaults to the script file stem).
        #[arg(short, long)]
        name: Option<String>,

        #[command(flatten)]
        layout: LayoutArgs,
    },

    /// Print the Intel HEX records for a script to stdout.
    Hexlify {
        /// Path to the MicroPython script.
        script: PathBuf,

        #[command(flatten)]
        layout: LayoutArgs,
    },

    /// Recover the embedded script from a .hex image.
    Extract {
        /// Path to the .hex image.
        hex: PathBuf,

        /// Write the script to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Flash address the script was placed at.
        #[arg(long, value_parser = parse_hex_u32)]
        flash_start: Option<u32>,
    },

    /// Open an interactive MicroPython REPL on the connected device.
    Repl {
        /// Baud rate (default: 115200).
        #[arg(short, long)]
        baud: Option<u32>,

        /// Append everything received from the device to this file.
        #[arg(long, value_name = "FILE")]
        log: Option<PathBuf>,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Where the script goes in flash.
#[derive(clap::Args, Debug, Clone, Copy, Default)]
pub(crate) struct LayoutArgs {
    /// Flash address of the script region (hex, default: 0x3E000).
    #[arg(long, value_parser = parse_hex_u32)]
    pub flash_start: Option<u32>,

    /// Emit an Extended Linear Address record so the block may sit above 64 KiB.
    #[arg(long)]
    pub segment_records: bool,
}

/// Errors raised by the CLI layer itself, each with its own exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad or missing arguments.
    #[error("{0}")]
    Usage(String),
    /// Missing or unusable configuration.
    #[error("{0}")]
    Config(String),
    /// The user cancelled.
    #[error("{0}")]
    Cancelled(String),
}

/// Map an error to the process exit code.
///
/// 0 success, 1 generic, 2 usage, 3 config, 4 device not found or
/// connection failed, 130 cancelled.
pub(crate) fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(cli) = cause.downcast_ref::<CliError>() {
            return match cli {
                CliError::Usage(_) => 2,
                CliError::Config(_) => 3,
                CliError::Cancelled(_) => 130,
            };
        }
        if let Some(lib) = cause.downcast_ref::<mbflash::Error>() {
            match lib {
                mbflash::Error::DeviceNotFound | mbflash::Error::ConnectionFailed { .. } => {
                    return 4;
                },
                _ => {},
            }
        }
    }
    1
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    // Support underscore separators like 0x3_E000
    let s: String = s
        .chars()
        .filter(|c| *c != '_')
        .collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

/// Parse a USB id given in decimal or with a 0x prefix.
fn parse_u16(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
    {
        u16::from_str_radix(hex, 16)
    } else {
        s.parse::<u16>()
    };
    parsed.map_err(|e| format!("Invalid USB id '{s}': {e}"))
}

/// Device identity from flags, then config, then the micro:bit default.
pub(crate) fn device_identity(cli: &Cli, config: &Config) -> DeviceIdentity {
    let default = DeviceIdentity::MICROBIT;
    DeviceIdentity::new(
        cli.vid
            .or(config.device.vendor_id)
            .unwrap_or(default.vendor_id),
        cli.pid
            .or(config.device.product_id)
            .unwrap_or(default.product_id),
    )
}

/// Encoder layout from flags, then config, then the MicroPython defaults.
pub(crate) fn encoder_config(layout: LayoutArgs, config: &Config) -> HexEncoderConfig {
    let mut encoder = HexEncoderConfig::default().with_segment_record(layout.segment_records);
    if let Some(start) = layout
        .flash_start
        .or(config.flash.start_address)
    {
        encoder = encoder.with_flash_start(start);
    }
    if let Some(capacity) = config.flash.capacity {
        encoder = encoder.with_capacity(capacity);
    }
    encoder
}

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(err) => {
            let code = exit_code_for(&err);
            if code == 130 {
                eprintln!("{} {err}", style("⚠").yellow());
            } else {
                eprintln!("{} {err:#}", style("Error:").red().bold());
            }
            code
        },
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = std::io::stderr().is_terminal();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "mbflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            script,
            firmware,
            target_dir,
            name,
            layout,
        } => commands::flash::cmd_flash(
            &cli,
            &config,
            script,
            firmware.as_deref(),
            target_dir.as_deref(),
            name.as_deref(),
            *layout,
        ),
        Commands::Hexlify { script, layout } => {
            commands::flash::cmd_hexlify(&config, script, *layout)
        },
        Commands::Extract {
            hex,
            output,
            flash_start,
        } => commands::flash::cmd_extract(&cli, &config, hex, output.as_deref(), *flash_start),
        Commands::Repl { baud, log } => commands::repl::cmd_repl(&cli, &config, *baud, log.as_ref()),
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(&cli, &config, *json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    // ---- clap validation ----

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from([
            "mbflash",
            "flash",
            "main.py",
            "--firmware",
            "firmware.hex",
            "--target-dir",
            "/media/MICROBIT",
        ])
        .unwrap();
        match cli.command {
            Commands::Flash {
                script,
                firmware,
                target_dir,
                name,
                layout,
            } => {
                assert_eq!(script, PathBuf::from("main.py"));
                assert_eq!(firmware, Some(PathBuf::from("firmware.hex")));
                assert_eq!(target_dir, Some(PathBuf::from("/media/MICROBIT")));
                assert!(name.is_none());
                assert!(layout.flash_start.is_none());
                assert!(!layout.segment_records);
            },
            _ => panic!("expected flash"),
        }
    }

    #[test]
    fn test_cli_parse_flash_with_all_options() {
        let cli = Cli::try_parse_from([
            "mbflash",
            "flash",
            "main.py",
            "-f",
            "fw.hex",
            "-d",
            "out",
            "-n",
            "blinky",
            "--flash-start",
            "0x3E000",
            "--segment-records",
        ])
        .unwrap();
        match cli.command {
            Commands::Flash { name, layout, .. } => {
                assert_eq!(name.as_deref(), Some("blinky"));
                assert_eq!(layout.flash_start, Some(0x3E000));
                assert!(layout.segment_records);
            },
            _ => panic!("expected flash"),
        }
    }

    #[test]
    fn test_cli_parse_hexlify() {
        let cli = Cli::try_parse_from(["mbflash", "hexlify", "main.py"]).unwrap();
        assert!(matches!(cli.command, Commands::Hexlify { .. }));
    }

    #[test]
    fn test_cli_parse_extract() {
        let cli = Cli::try_parse_from(["mbflash", "extract", "micropython.hex", "-o", "out.py"]).unwrap();
        match cli.command {
            Commands::Extract { hex, output, .. } => {
                assert_eq!(hex, PathBuf::from("micropython.hex"));
                assert_eq!(output, Some(PathBuf::from("out.py")));
            },
            _ => panic!("expected extract"),
        }
    }

    #[test]
    fn test_cli_parse_repl() {
        let cli = Cli::try_parse_from(["mbflash", "repl", "--baud", "9600", "--log", "session.log"]).unwrap();
        match cli.command {
            Commands::Repl { baud, log } => {
                assert_eq!(baud, Some(9600));
                assert_eq!(log, Some(PathBuf::from("session.log")));
            },
            _ => panic!("expected repl"),
        }
    }

    #[test]
    fn test_cli_parse_repl_default_baud() {
        let cli = Cli::try_parse_from(["mbflash", "repl"]).unwrap();
        assert!(matches!(cli.command, Commands::Repl { baud: None, log: None }));
    }

    #[test]
    fn test_cli_parse_list_ports_json() {
        let cli = Cli::try_parse_from(["mbflash", "list-ports", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::ListPorts { json: true }));
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["mbflash", "completions", "zsh"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions { shell: Shell::Zsh }
        ));
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::try_parse_from([
            "mbflash",
            "--vid",
            "0x0D28",
            "--pid",
            "516",
            "-vv",
            "--quiet",
            "--non-interactive",
            "--config",
            "/tmp/mbflash.toml",
            "list-ports",
        ])
        .unwrap();
        assert_eq!(cli.vid, Some(3368));
        assert_eq!(cli.pid, Some(516));
        assert_eq!(cli.verbose, 2);
        assert!(cli.quiet);
        assert!(cli.non_interactive);
        assert_eq!(cli.config_path, Some(PathBuf::from("/tmp/mbflash.toml")));
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["mbflash"]).is_err());
    }

    #[test]
    fn test_cli_flash_requires_script() {
        assert!(Cli::try_parse_from(["mbflash", "flash"]).is_err());
    }

    // ---- value parsers ----

    #[test]
    fn test_parse_hex_u32_with_prefix() {
        assert_eq!(parse_hex_u32("0x3E000"), Ok(0x3E000));
        assert_eq!(parse_hex_u32("0X3e000"), Ok(0x3E000));
    }

    #[test]
    fn test_parse_hex_u32_without_prefix() {
        assert_eq!(parse_hex_u32("3E000"), Ok(0x3E000));
    }

    #[test]
    fn test_parse_hex_u32_with_underscores() {
        assert_eq!(parse_hex_u32("0x3_E0_00"), Ok(0x3E000));
    }

    #[test]
    fn test_parse_hex_u32_invalid() {
        assert!(parse_hex_u32("xyz").is_err());
        assert!(parse_hex_u32("0x1_0000_0000").is_err());
    }

    #[test]
    fn test_parse_u16_decimal_and_hex() {
        assert_eq!(parse_u16("3368"), Ok(3368));
        assert_eq!(parse_u16("0x0204"), Ok(516));
        assert!(parse_u16("70000").is_err());
        assert!(parse_u16("0xZZ").is_err());
    }

    // ---- settings resolution ----

    #[test]
    fn test_device_identity_defaults_to_microbit() {
        let cli = Cli::try_parse_from(["mbflash", "list-ports"]).unwrap();
        assert_eq!(device_identity(&cli, &Config::default()), DeviceIdentity::MICROBIT);
    }

    #[test]
    fn test_device_identity_flag_beats_config() {
        let cli = Cli::try_parse_from(["mbflash", "--vid", "1", "list-ports"]).unwrap();
        let mut config = Config::default();
        config.device.vendor_id = Some(2);
        config.device.product_id = Some(3);
        assert_eq!(device_identity(&cli, &config), DeviceIdentity::new(1, 3));
    }

    #[test]
    fn test_encoder_config_layering() {
        let mut config = Config::default();
        config.flash.start_address = Some(0x30000);
        config.flash.capacity = Some(0x1000);

        let from_config = encoder_config(LayoutArgs::default(), &config);
        assert_eq!(from_config.flash_start, 0x30000);
        assert_eq!(from_config.capacity, 0x1000);

        let layout = LayoutArgs {
            flash_start: Some(0x3E000),
            segment_records: true,
        };
        let from_flags = encoder_config(layout, &config);
        assert_eq!(from_flags.flash_start, 0x3E000);
        assert!(from_flags.segment_record);
    }

    // ---- exit codes ----

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), 1);
        assert_eq!(exit_code_for(&CliError::Usage("u".into()).into()), 2);
        assert_eq!(exit_code_for(&CliError::Config("c".into()).into()), 3);
        assert_eq!(exit_code_for(&mbflash::Error::DeviceNotFound.into()), 4);
        assert_eq!(
            exit_code_for(
                &mbflash::Error::ConnectionFailed {
                    port: "COM3".into(),
                    reason: "busy".into(),
                }
                .into()
            ),
            4
        );
        assert_eq!(exit_code_for(&CliError::Cancelled("c".into()).into()), 130);
    }

    #[test]
    fn test_exit_code_sees_through_context() {
        use anyhow::Context;
        let err = Err::<(), _>(mbflash::Error::DeviceNotFound)
            .context("REPL session failed")
            .unwrap_err();
        assert_eq!(exit_code_for(&err), 4);
    }
}
