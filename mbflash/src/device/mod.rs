//! Device discovery and identity matching.
//!
//! The micro:bit exposes its REPL through the DAPLink interface chip, which
//! enumerates as a USB CDC serial port with a fixed vendor/product pair.
//! Discovery lists the host's serial endpoints and picks the first one whose
//! USB identity matches exactly.

use crate::error::{Error, Result};
use crate::port::Connector;
use log::info;

#[cfg(feature = "native")]
use log::{debug, trace};

/// USB vendor/product identity of the target hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceIdentity {
    /// USB Vendor ID.
    pub vendor_id: u16,
    /// USB Product ID.
    pub product_id: u16,
}

impl DeviceIdentity {
    /// BBC micro:bit (ARM DAPLink, VID 3368 / PID 516).
    pub const MICROBIT: Self = Self::new(0x0D28, 0x0204);

    /// Create an identity from a vendor/product pair.
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// Check whether a VID/PID pair matches this identity.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vendor_id == vid && self.product_id == pid
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self::MICROBIT
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vendor_id, self.product_id)
    }
}

/// USB interface chips commonly seen next to a micro:bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// ARM mbed DAPLink interface (micro:bit, Calliope mini).
    DapLink,
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (0x0D28, &[0x0204], DeviceKind::DapLink),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], DeviceKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
];

impl DeviceKind {
    /// Classify a VID/PID combination.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DapLink => "DAPLink",
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known/expected device kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Discovered device endpoint information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedPort {
    /// Endpoint name/path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// A serial endpoint with a USB identity and no descriptor strings.
    pub fn usb(name: impl Into<String>, vid: u16, pid: u16) -> Self {
        Self {
            name: name.into(),
            device: DeviceKind::from_vid_pid(vid, pid),
            vid: Some(vid),
            pid: Some(pid),
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Check whether this endpoint reports the given identity.
    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => identity.matches(vid, pid),
            _ => false,
        }
    }
}

/// Return the first candidate matching `identity`, in the given order.
pub fn find_device<'a>(
    candidates: &'a [DetectedPort],
    identity: &DeviceIdentity,
) -> Option<&'a DetectedPort> {
    candidates
        .iter()
        .find(|p| p.matches(identity))
}

/// Sort endpoints by name so "first match" does not depend on host order.
pub fn sort_ports(ports: &mut [DetectedPort]) {
    ports.sort_by(|a, b| a.name.cmp(&b.name));
}

/// Enumerate serial endpoints with metadata, sorted by name.
#[cfg(feature = "native")]
pub fn enumerate_ports() -> Result<Vec<DetectedPort>> {
    let mut result = Vec::new();

    for port_info in serialport::available_ports()? {
        let mut detected = DetectedPort {
            name: port_info.port_name.clone(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        };

        if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
            detected.vid = Some(usb_info.vid);
            detected.pid = Some(usb_info.pid);
            detected.manufacturer = usb_info.manufacturer;
            detected.product = usb_info.product;
            detected.serial = usb_info.serial_number;
            detected.device = DeviceKind::from_vid_pid(usb_info.vid, usb_info.pid);

            trace!(
                "Found USB port: {} (VID: {:04X}, PID: {:04X}, Device: {:?})",
                port_info.port_name, usb_info.vid, usb_info.pid, detected.device
            );
        }

        result.push(detected);
    }

    sort_ports(&mut result);
    Ok(result)
}

/// Enumerate serial endpoints (stub without native support).
#[cfg(not(feature = "native"))]
pub fn enumerate_ports() -> Result<Vec<DetectedPort>> {
    Err(Error::Unsupported(
        "Port enumeration requires the native feature".to_string(),
    ))
}

/// Detect all available endpoints, treating enumeration failure as "none".
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    enumerate_ports().unwrap_or_else(|e| {
        debug!("Failed to enumerate serial ports: {e}");
        Vec::new()
    })
}

/// Detect all available endpoints (always empty without native support).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Locate the endpoint for `identity` among the ports `connector` sees.
///
/// Candidates are sorted by name first, so the first match is stable.
pub fn locate<C: Connector + ?Sized>(connector: &C, identity: &DeviceIdentity) -> Result<DetectedPort> {
    let mut ports = connector.list_ports()?;
    sort_ports(&mut ports);
    let port = find_device(&ports, identity).ok_or(Error::DeviceNotFound)?;
    info!("Found {identity} on {}", port.name);
    Ok(port.clone())
}

/// Format a list of detected endpoints for display.
///
/// Endpoints matching `identity` are suffixed with `*`.
pub fn format_port_list(ports: &[DetectedPort], identity: &DeviceIdentity) -> Vec<String> {
    let mut result = Vec::new();

    for port in ports {
        let device_info = if port.device.is_known() {
            format!(" [{}]", port.device.name())
        } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };

        let product_info = port
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        let marker = if port.matches(identity) { " *" } else { "" };

        result.push(format!(
            "{}{}{}{}",
            port.name, device_info, product_info, marker
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(name: &str) -> DetectedPort {
        DetectedPort {
            name: name.to_string(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    #[test]
    fn test_microbit_identity_constant() {
        assert_eq!(DeviceIdentity::MICROBIT.vendor_id, 3368);
        assert_eq!(DeviceIdentity::MICROBIT.product_id, 516);
        assert_eq!(DeviceIdentity::default(), DeviceIdentity::MICROBIT);
        assert_eq!(DeviceIdentity::MICROBIT.to_string(), "0D28:0204");
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x0D28, 0x0204), DeviceKind::DapLink);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x6001), DeviceKind::Ftdi);
        assert_eq!(DeviceKind::from_vid_pid(0x0D28, 0x0205), DeviceKind::Unknown);
        assert_eq!(DeviceKind::from_vid_pid(0x1234, 0x5678), DeviceKind::Unknown);
    }

    // ---- find_device ----

    #[test]
    fn test_find_device_second_entry() {
        let ports = vec![
            DetectedPort::usb("/dev/ttyUSB0", 1, 1),
            DetectedPort::usb("/dev/ttyACM0", 3368, 516),
        ];
        let found = find_device(&ports, &DeviceIdentity::new(3368, 516)).unwrap();
        assert_eq!(found, &ports[1]);
    }

    #[test]
    fn test_find_device_none_matching() {
        let ports = vec![
            DetectedPort::usb("/dev/ttyUSB0", 0x1A86, 0x7523),
            DetectedPort::usb("/dev/ttyACM0", 3368, 517),
            plain("/dev/ttyS0"),
        ];
        assert!(find_device(&ports, &DeviceIdentity::MICROBIT).is_none());
        assert!(find_device(&[], &DeviceIdentity::MICROBIT).is_none());
    }

    #[test]
    fn test_find_device_exactly_one_match() {
        let ports = vec![
            plain("/dev/ttyS0"),
            DetectedPort::usb("/dev/ttyACM3", 3368, 516),
        ];
        let found = find_device(&ports, &DeviceIdentity::MICROBIT).unwrap();
        assert_eq!(found.name, "/dev/ttyACM3");
    }

    #[test]
    fn test_find_device_first_match_wins_after_sort() {
        let mut ports = vec![
            DetectedPort::usb("/dev/ttyACM1", 3368, 516),
            DetectedPort::usb("/dev/ttyACM0", 3368, 516),
        ];
        sort_ports(&mut ports);
        let found = find_device(&ports, &DeviceIdentity::MICROBIT).unwrap();
        assert_eq!(found.name, "/dev/ttyACM0");
    }

    #[test]
    fn test_port_without_usb_identity_never_matches() {
        assert!(!plain("/dev/ttyS0").matches(&DeviceIdentity::MICROBIT));
    }

    #[test]
    fn test_custom_identity() {
        let identity = DeviceIdentity::new(0x1366, 0x1015);
        let ports = vec![
            DetectedPort::usb("/dev/ttyACM0", 3368, 516),
            DetectedPort::usb("/dev/ttyACM1", 0x1366, 0x1015),
        ];
        assert_eq!(
            find_device(&ports, &identity)
                .unwrap()
                .name,
            "/dev/ttyACM1"
        );
    }

    // ---- locate ----

    struct FixedPorts(Vec<DetectedPort>);

    impl Connector for FixedPorts {
        fn list_ports(&self) -> Result<Vec<DetectedPort>> {
            Ok(self.0.clone())
        }

        fn open(&self, _config: &crate::port::SerialConfig) -> Result<Box<dyn crate::port::Port>> {
            Err(Error::NotConnected)
        }
    }

    #[test]
    fn test_locate_sorts_before_matching() {
        let connector = FixedPorts(vec![
            DetectedPort::usb("/dev/ttyACM1", 3368, 516),
            plain("/dev/ttyS0"),
            DetectedPort::usb("/dev/ttyACM0", 3368, 516),
        ]);
        let found = locate(&connector, &DeviceIdentity::MICROBIT).unwrap();
        assert_eq!(found.name, "/dev/ttyACM0");
    }

    #[test]
    fn test_locate_without_match_is_not_found() {
        let connector = FixedPorts(vec![DetectedPort::usb("/dev/ttyUSB0", 0x1A86, 0x7523)]);
        assert!(matches!(
            locate(&connector, &DeviceIdentity::MICROBIT),
            Err(Error::DeviceNotFound)
        ));
    }

    #[test]
    fn test_format_port_list() {
        let mut microbit = DetectedPort::usb("/dev/ttyACM0", 3368, 516);
        microbit.product = Some("BBC micro:bit CMSIS-DAP".to_string());
        let ports = vec![
            microbit,
            DetectedPort::usb("/dev/ttyUSB1", 0x1234, 0x5678),
            plain("/dev/ttyS0"),
        ];

        let formatted = format_port_list(&ports, &DeviceIdentity::MICROBIT);
        assert_eq!(formatted.len(), 3);
        assert_eq!(
            formatted[0],
            "/dev/ttyACM0 [DAPLink] - BBC micro:bit CMSIS-DAP *"
        );
        assert_eq!(formatted[1], "/dev/ttyUSB1 [VID:1234 PID:5678]");
        assert_eq!(formatted[2], "/dev/ttyS0");
    }
}
