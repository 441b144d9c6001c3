//! List-ports command implementation.

use anyhow::Result;
use console::style;
use mbflash::DeviceIdentity;
use mbflash::device::{self, DetectedPort};

use crate::config::Config;
use crate::{Cli, device_identity};

/// JSON view of the detected ports.
fn ports_json(ports: &[DetectedPort], identity: &DeviceIdentity) -> serde_json::Value {
    ports
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.name,
                "device": p.device.name(),
                "known": p.device.is_known(),
                "matches": p.matches(identity),
                "vid": p.vid,
                "pid": p.pid,
                "manufacturer": p.manufacturer,
                "product": p.product,
                "serial": p.serial,
            })
        })
        .collect()
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let identity = device_identity(cli, config);
    let detected = device::detect_ports();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&ports_json(&detected, &identity))?
        );
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for (port, line) in detected
        .iter()
        .zip(device::format_port_list(&detected, &identity))
    {
        if port.matches(&identity) {
            eprintln!("  {} {}", style("•").green(), style(line).green().bold());
        } else {
            eprintln!("  {} {line}", style("•").dim());
        }
    }

    if let Some(found) = device::find_device(&detected, &identity) {
        eprintln!(
            "\n{} micro:bit ({identity}) on {}",
            style("→").green().bold(),
            style(&found.name).cyan().bold()
        );
    }
    Ok(())
}
