//! Flash, hexlify, and extract command implementations.

use anyhow::{Context, Result};
use console::style;
use dialoguer::{Error as DialoguerError, Input, theme::ColorfulTheme};
use log::debug;
use mbflash::codec;
use mbflash::image::{self, HexEncoder, firmware};
use std::fs;
use std::io::{self, IsTerminal, Write as _};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::{Cli, CliError, LayoutArgs, encoder_config, use_fancy_output};

/// Read a script file as text, one character per byte if it is not UTF-8.
fn read_script(path: &Path) -> Result<String> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read script {}", path.display()))?;
    Ok(match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => codec::to_text(e.as_bytes()),
    })
}

/// Output file stem: explicit name, else the script's own stem.
fn output_name(script: &Path, name: Option<&str>) -> Result<String> {
    if let Some(name) = name {
        return Ok(name.to_string());
    }
    script
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .ok_or_else(|| {
            CliError::Usage(format!(
                "Cannot derive an output name from {}; pass --name",
                script.display()
            ))
            .into()
        })
}

/// Firmware template path from the flag or config.
fn firmware_path(firmware: Option<&Path>, config: &Config) -> Result<PathBuf> {
    firmware
        .map(Path::to_path_buf)
        .or_else(|| config.flash.firmware.clone())
        .ok_or_else(|| {
            CliError::Config(
                "No firmware template given; pass --firmware or set flash.firmware in mbflash.toml"
                    .to_string(),
            )
            .into()
        })
}

/// Output directory from the flag, config, or an interactive prompt.
fn resolve_target_dir(cli: &Cli, config: &Config, target_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = target_dir
        .map(Path::to_path_buf)
        .or_else(|| config.flash.output_dir.clone())
    {
        return Ok(dir);
    }

    if cli.non_interactive || !(io::stdin().is_terminal() && io::stderr().is_terminal()) {
        return Err(CliError::Usage(
            "No target directory given; pass --target-dir or set flash.output_dir in mbflash.toml"
                .to_string(),
        )
        .into());
    }

    let answer: String = match Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Where is the micro:bit drive mounted?")
        .interact_text()
    {
        Ok(answer) => answer,
        Err(DialoguerError::IO(e)) if e.kind() == io::ErrorKind::Interrupted => {
            return Err(CliError::Cancelled("Cancelled".to_string()).into());
        },
        Err(e) => return Err(e).context("Failed to read target directory"),
    };
    Ok(PathBuf::from(answer.trim()))
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    script: &Path,
    firmware: Option<&Path>,
    target_dir: Option<&Path>,
    name: Option<&str>,
    layout: LayoutArgs,
) -> Result<()> {
    let script_text = read_script(script)?;
    let name = output_name(script, name)?;
    let firmware = firmware_path(firmware, config)?;

    if !cli.quiet {
        eprintln!(
            "{} Loading firmware {}",
            style("📦").cyan(),
            firmware.display()
        );
    }
    let template = firmware::load_template(&firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;

    // Every encoding check happens before anything touches the target drive
    let encoder = HexEncoder::new(encoder_config(layout, config));
    let hex_image = image::build_image(&template, &script_text, &encoder)
        .with_context(|| format!("Failed to embed {}", script.display()))?;
    debug!(
        "Script {} is {} chars, region holds {}",
        script.display(),
        script_text.chars().count(),
        encoder
            .config()
            .max_script_len()
    );

    let dir = resolve_target_dir(cli, config, target_dir)?;
    let path = image::write_hex_file(&dir, &name, &hex_image)?;

    if !cli.quiet {
        let mark = if use_fancy_output() { "🎉" } else { "✓" };
        eprintln!(
            "{} Saved {}",
            style(mark).green().bold(),
            style(path.display()).cyan()
        );
    }
    Ok(())
}

/// Hexlify command implementation: records only, on stdout.
pub(crate) fn cmd_hexlify(config: &Config, script: &Path, layout: LayoutArgs) -> Result<()> {
    let script_text = read_script(script)?;
    let bytes = codec::to_bytes(&script_text)?;
    let encoder = HexEncoder::new(encoder_config(layout, config));
    let records = encoder.encode(&bytes)?;

    let mut out = io::stdout().lock();
    writeln!(out, "{records}")?;
    out.flush()?;
    Ok(())
}

/// Extract command implementation.
pub(crate) fn cmd_extract(
    cli: &Cli,
    config: &Config,
    hex: &Path,
    output: Option<&Path>,
    flash_start: Option<u32>,
) -> Result<()> {
    let text = fs::read_to_string(hex)
        .with_context(|| format!("Failed to read hex image {}", hex.display()))?;
    let layout = LayoutArgs {
        flash_start,
        segment_records: false,
    };
    let script = image::decode_script(&text, &encoder_config(layout, config))
        .with_context(|| format!("Failed to extract script from {}", hex.display()))?;

    if let Some(path) = output {
        fs::write(path, &script)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        if !cli.quiet {
            eprintln!(
                "{} Extracted {} bytes to {}",
                style("✓").green(),
                script.len(),
                style(path.display()).cyan()
            );
        }
    } else {
        let mut out = io::stdout().lock();
        out.write_all(&script)?;
        out.flush()?;
    }
    Ok(())
}
