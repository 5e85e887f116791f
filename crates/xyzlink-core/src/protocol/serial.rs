//! Serial port handling
//!
//! Port enumeration and the opener used by the channel manager. The channel
//! only sees a [`BoxedStream`], so tests can substitute in-memory pipes for the
//! physical port through [`PortOpener`].

use async_trait::async_trait;
use serde::Serialize;
use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;

use super::ProtocolError;

/// Byte stream the channel reads lines from and writes commands to
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Type-erased open port
pub type BoxedStream = Box<dyn ByteStream>;

/// Something that can open the printer port
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open `port` at `baud_rate`
    async fn open(&self, port: &str, baud_rate: u32) -> Result<BoxedStream, ProtocolError>;
}

/// Opens physical serial ports (8N1, no flow control)
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

#[async_trait]
impl PortOpener for SerialOpener {
    async fn open(&self, port: &str, baud_rate: u32) -> Result<BoxedStream, ProtocolError> {
        let mut stream = tokio_serial::new(port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;

        // The printer resets on DTR toggles; keep it asserted
        if let Err(e) = tokio_serial::SerialPort::write_data_terminal_ready(&mut stream, true) {
            tracing::debug!("failed to set DTR high on {port}: {e} (continuing)");
        }

        #[cfg(unix)]
        if let Err(e) = stream.set_exclusive(false) {
            tracing::debug!("failed to clear exclusive flag on {port}: {e}");
        }

        Ok(Box::new(stream))
    }
}

/// Information about an available serial port
#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    /// Whether the USB descriptor names an XYZprinting device
    pub fn looks_like_printer(&self) -> bool {
        [&self.manufacturer, &self.product]
            .into_iter()
            .flatten()
            .any(|s| s.to_ascii_lowercase().contains("xyz"))
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
                serial_number: usb.serial_number,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Sort key: ttyACM* first (numeric), then ttyUSB*, then everything else by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    for (rank, prefix) in [(0u8, "ttyACM"), (1u8, "ttyUSB")] {
        if let Some(rest) = basename.strip_prefix(prefix) {
            let num = rest.parse::<usize>().unwrap_or(usize::MAX);
            return (rank, num, basename.to_string());
        }
    }
    (2, 0, basename.to_string())
}

/// List available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    match serialport::available_ports() {
        Ok(ports) => {
            for info in ports {
                let p = PortInfo::from(info);
                map.entry(p.name.clone()).or_insert(p);
            }
        }
        Err(e) => tracing::warn!("port enumeration failed: {e}"),
    }

    // Enumeration misses CDC devices on some kernels
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{fname}");
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut ports: Vec<PortInfo> = map.into_values().collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_ports_does_not_panic() {
        let _ = list_ports();
    }

    #[test]
    fn test_port_sorting() {
        let mut ports: Vec<PortInfo> = [
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ]
        .into_iter()
        .map(|n| PortInfo::bare(n.to_string()))
        .collect();

        ports.sort_by_key(|p| port_sort_key(&p.name));
        let ordered: Vec<String> = ports.into_iter().map(|p| p.name).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn test_printer_detection() {
        let mut port = PortInfo::bare("/dev/ttyACM0".into());
        assert!(!port.looks_like_printer());
        port.manufacturer = Some("XYZprinting".into());
        assert!(port.looks_like_printer());
    }
}
