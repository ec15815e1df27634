//! Finding the device among the serial ports on this machine.
//!
//! This is a heuristic: ports are matched on their USB product/manufacturer strings.
//! An explicitly configured port always wins over detection.

use serialport::{SerialPortInfo, SerialPortType};
use tracing::{info, warn};

use crate::{config::DetectConfig, error::Error};

/// List the serial ports on this machine.
pub fn available_ports() -> Result<Vec<SerialPortInfo>, Error> {
    serialport::available_ports().map_err(|e| Error::PortListing(e.to_string()))
}

/// A human readable description of a port.
pub fn describe(info: &SerialPortInfo) -> String {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => {
            let words = [usb.product.as_deref(), usb.manufacturer.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>();

            if words.is_empty() {
                format!("USB {:04x}:{:04x}", usb.vid, usb.pid)
            } else {
                words.join(" - ")
            }
        }
        SerialPortType::PciPort => "PCI".into(),
        SerialPortType::BluetoothPort => "Bluetooth".into(),
        SerialPortType::Unknown => "n/a".into(),
    }
}

/// Pick the device port among `ports`.
///
/// The first port whose name or description contains a hint wins.
/// Otherwise, the first port if falling back is allowed.
pub fn select_port(ports: &[SerialPortInfo], config: &DetectConfig) -> Option<String> {
    let hints = config
        .hints
        .iter()
        .map(|hint| hint.to_lowercase())
        .collect::<Vec<_>>();

    let matching = ports.iter().find(|info| {
        let haystack = format!("{} {}", info.port_name, describe(info)).to_lowercase();
        hints.iter().any(|hint| haystack.contains(hint))
    });

    if let Some(info) = matching {
        return Some(info.port_name.clone());
    }

    if config.fallback_to_first {
        ports.first().map(|info| info.port_name.clone())
    } else {
        None
    }
}

/// List the ports on this machine and pick the device.
pub fn detect_port(config: &DetectConfig) -> Option<String> {
    let ports = match available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!(%e, "Auto-detection failed");
            return None;
        }
    };

    if ports.is_empty() {
        warn!("No serial ports found");
        return None;
    }

    for info in &ports {
        info!(port = %info.port_name, description = %describe(info), "Available serial port");
    }

    let selected = select_port(&ports, config);
    match &selected {
        Some(port) => info!(%port, "Auto-detected device"),
        None => warn!(hints = ?config.hints, "No serial port matched"),
    }

    selected
}
