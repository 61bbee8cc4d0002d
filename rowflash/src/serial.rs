//! Serial port discovery and selection

use log::{debug, info, warn};
use serialport::{available_ports, SerialPortInfo, SerialPortType};

use crate::targets::Chip;

/// Substrings identifying USB-serial bridges found on common dev boards
pub const PORT_PRIORITY_KEYWORDS: &[&str] = &[
    "usb-serial",
    "cp210",
    "silicon labs",
    "cp210x",
    "ftdi",
    "ch340",
    "usb2.0-serial",
];

/// A serial port as reported by the operating system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePort {
    pub path: String,
    pub description: String,
    pub hardware_id: String,
}

impl DevicePort {
    pub fn new(
        path: impl Into<String>,
        description: impl Into<String>,
        hardware_id: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            description: description.into(),
            hardware_id: hardware_id.into(),
        }
    }

    /// Whether the port looks like a USB-serial bridge of a dev board
    pub fn is_bridge(&self) -> bool {
        let combined = format!("{} {}", self.description, self.hardware_id).to_lowercase();
        PORT_PRIORITY_KEYWORDS
            .iter()
            .any(|keyword| combined.contains(keyword))
    }
}

impl From<SerialPortInfo> for DevicePort {
    fn from(info: SerialPortInfo) -> Self {
        let (description, hardware_id) = match &info.port_type {
            SerialPortType::UsbPort(usb) => {
                let description = [usb.manufacturer.as_deref(), usb.product.as_deref()]
                    .into_iter()
                    .flatten()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ");

                let mut hardware_id = format!("USB VID:PID={:04X}:{:04X}", usb.vid, usb.pid);
                if let Some(serial) = usb.serial_number.as_deref().filter(|s| !s.is_empty()) {
                    hardware_id.push_str(&format!(" SER={serial}"));
                }

                (description, hardware_id)
            }
            SerialPortType::PciPort => (String::new(), String::from("PCI")),
            SerialPortType::BluetoothPort => (String::new(), String::from("Bluetooth")),
            SerialPortType::Unknown => (String::new(), String::from("n/a")),
        };

        let description = if description.is_empty() {
            String::from("n/a")
        } else {
            description
        };

        DevicePort::new(info.port_name, description, hardware_id)
    }
}

/// Enumerate the serial ports of the host
///
/// A failed enumeration is logged and reported as no ports at all.
pub fn list_ports() -> Vec<DevicePort> {
    match available_ports() {
        Ok(ports) => ports.into_iter().map(DevicePort::from).collect(),
        Err(e) => {
            warn!("Failed to enumerate serial ports: {e}");
            Vec::new()
        }
    }
}

/// Identifies the chip connected to a serial port
pub trait ChipProbe {
    /// Probe `port`, returning [Chip::Unknown] if nothing could be identified
    fn detect(&self, port: &str) -> Chip;
}

/// Outcome of [select_port]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// The chosen port, if any
    pub port: Option<String>,
    /// The enumeration the choice was made from
    pub ports: Vec<DevicePort>,
    /// Classification of the chosen port, when it was probed
    pub detected_chip: Option<Chip>,
}

/// Choose the serial port most likely to have the device attached
///
/// In order of preference: the `preferred` port (even if it was not
/// enumerated), the only port, the first port with an identifiable chip
/// (when `probe` is set), the first USB-serial bridge, the first port.
pub fn select_port(
    ports: Vec<DevicePort>,
    prober: &dyn ChipProbe,
    preferred: Option<&str>,
    probe: bool,
) -> Selection {
    let mut selection = Selection {
        port: None,
        ports,
        detected_chip: None,
    };

    if let Some(preferred) = preferred {
        if selection.ports.iter().any(|p| p.path == preferred) && probe {
            selection.detected_chip = Some(prober.detect(preferred));
        }
        selection.port = Some(preferred.to_owned());
        info!("Using preferred port {preferred}");
        return selection;
    }

    match selection.ports.as_slice() {
        [] => {
            info!("No serial ports found");
            return selection;
        }
        [only] => {
            let path = only.path.clone();
            if probe {
                selection.detected_chip = Some(prober.detect(&path));
            }
            info!("Using the only serial port, {path}");
            selection.port = Some(path);
            return selection;
        }
        _ => {}
    }

    if probe {
        for port in &selection.ports {
            let chip = prober.detect(&port.path);
            debug!("Probed {}: {chip}", port.path);

            if chip.is_known() {
                info!("Found {chip} on {}", port.path);
                selection.port = Some(port.path.clone());
                selection.detected_chip = Some(chip);
                return selection;
            }
        }
    }

    let chosen = selection
        .ports
        .iter()
        .find(|port| port.is_bridge())
        .or(selection.ports.first())
        .map(|port| port.path.clone());

    if let Some(path) = &chosen {
        info!("Selected serial port {path}");
    }
    selection.port = chosen;

    selection
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashMap};

    use pretty_assertions::assert_eq;
    use serialport::UsbPortInfo;

    use super::*;

    #[derive(Default)]
    struct FakeProber {
        chips: HashMap<&'static str, Chip>,
        probed: RefCell<Vec<String>>,
    }

    impl FakeProber {
        fn with(chips: &[(&'static str, Chip)]) -> Self {
            Self {
                chips: chips.iter().copied().collect(),
                probed: RefCell::default(),
            }
        }

        fn probed(&self) -> Vec<String> {
            self.probed.borrow().clone()
        }
    }

    impl ChipProbe for FakeProber {
        fn detect(&self, port: &str) -> Chip {
            self.probed.borrow_mut().push(port.to_owned());
            self.chips.get(port).copied().unwrap_or_default()
        }
    }

    fn ports() -> Vec<DevicePort> {
        vec![
            DevicePort::new("/dev/ttyS0", "n/a", "PNP0501"),
            DevicePort::new("/dev/ttyACM0", "Espressif USB JTAG", "USB VID:PID=303A:1001"),
            DevicePort::new(
                "/dev/ttyUSB0",
                "Silicon Labs CP2102 USB to UART Bridge Controller",
                "USB VID:PID=10C4:EA60 SER=0001",
            ),
        ]
    }

    #[test]
    fn preferred_port_is_probed_when_present() {
        let prober = FakeProber::with(&[("/dev/ttyACM0", Chip::Esp32s3)]);
        let selection = select_port(ports(), &prober, Some("/dev/ttyACM0"), true);

        assert_eq!(selection.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(selection.detected_chip, Some(Chip::Esp32s3));
        assert_eq!(selection.ports.len(), 3);
        assert_eq!(prober.probed(), vec!["/dev/ttyACM0"]);
    }

    #[test]
    fn preferred_port_is_returned_regardless_of_probe_outcome() {
        let prober = FakeProber::default();
        let selection = select_port(ports(), &prober, Some("/dev/ttyS0"), true);

        assert_eq!(selection.port.as_deref(), Some("/dev/ttyS0"));
        assert_eq!(selection.detected_chip, Some(Chip::Unknown));
    }

    #[test]
    fn absent_preferred_port_is_returned_without_probing() {
        let prober = FakeProber::default();
        let selection = select_port(ports(), &prober, Some("COM9"), true);

        assert_eq!(selection.port.as_deref(), Some("COM9"));
        assert_eq!(selection.detected_chip, None);
        assert!(prober.probed().is_empty());
    }

    #[test]
    fn nothing_to_select() {
        let selection = select_port(Vec::new(), &FakeProber::default(), None, true);

        assert_eq!(selection.port, None);
        assert_eq!(selection.detected_chip, None);
    }

    #[test]
    fn single_port() {
        let only = vec![DevicePort::new("COM3", "n/a", "n/a")];

        let prober = FakeProber::with(&[("COM3", Chip::Esp8266)]);
        let selection = select_port(only.clone(), &prober, None, true);
        assert_eq!(selection.port.as_deref(), Some("COM3"));
        assert_eq!(selection.detected_chip, Some(Chip::Esp8266));

        let prober = FakeProber::default();
        let selection = select_port(only, &prober, None, false);
        assert_eq!(selection.port.as_deref(), Some("COM3"));
        assert_eq!(selection.detected_chip, None);
        assert!(prober.probed().is_empty());
    }

    #[test]
    fn first_identified_chip_wins() {
        let prober = FakeProber::with(&[("/dev/ttyACM0", Chip::Esp32c3), ("/dev/ttyUSB0", Chip::Esp32)]);
        let selection = select_port(ports(), &prober, None, true);

        assert_eq!(selection.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(selection.detected_chip, Some(Chip::Esp32c3));
        assert_eq!(prober.probed(), vec!["/dev/ttyS0", "/dev/ttyACM0"]);
    }

    #[test]
    fn falls_back_to_bridge_keywords() {
        let prober = FakeProber::default();
        let selection = select_port(ports(), &prober, None, true);

        assert_eq!(selection.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(selection.detected_chip, None);
        assert_eq!(prober.probed().len(), 3);

        // Without probing the keywords decide straight away
        let prober = FakeProber::default();
        let selection = select_port(ports(), &prober, None, false);
        assert_eq!(selection.port.as_deref(), Some("/dev/ttyUSB0"));
        assert!(prober.probed().is_empty());
    }

    #[test]
    fn falls_back_to_first_port() {
        let ports = vec![
            DevicePort::new("/dev/ttyS0", "n/a", "PNP0501"),
            DevicePort::new("/dev/ttyS1", "n/a", "PNP0501"),
        ];
        let selection = select_port(ports, &FakeProber::default(), None, false);

        assert_eq!(selection.port.as_deref(), Some("/dev/ttyS0"));
    }

    #[test]
    fn bridge_keywords_are_case_insensitive() {
        assert!(DevicePort::new("COM4", "USB-SERIAL CH340 (COM4)", "n/a").is_bridge());
        assert!(DevicePort::new("COM5", "n/a", "FTDIBUS\\VID_0403").is_bridge());
        assert!(!DevicePort::new("COM1", "Communications Port", "ACPI\\PNP0501").is_bridge());
    }

    #[test]
    fn port_metadata_from_enumeration() {
        let port = DevicePort::from(SerialPortInfo {
            port_name: "/dev/ttyUSB0".to_owned(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid: 0x10c4,
                pid: 0xea60,
                serial_number: Some("0001".to_owned()),
                manufacturer: Some("Silicon Labs".to_owned()),
                product: Some("CP2102 USB to UART Bridge Controller".to_owned()),
            }),
        });

        assert_eq!(
            port,
            DevicePort::new(
                "/dev/ttyUSB0",
                "Silicon Labs CP2102 USB to UART Bridge Controller",
                "USB VID:PID=10C4:EA60 SER=0001"
            )
        );

        let port = DevicePort::from(SerialPortInfo {
            port_name: "/dev/ttyS0".to_owned(),
            port_type: SerialPortType::Unknown,
        });
        assert_eq!(port, DevicePort::new("/dev/ttyS0", "n/a", "n/a"));
    }
}
