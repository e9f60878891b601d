//! Serial port handling
//!
//! Opens controller ports as native async streams and lists candidate ports.

use serialport::{SerialPortInfo, SerialPortType};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use super::ProtocolError;

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                product: usb.product,
            },
            _ => Self {
                name: info.port_name,
                vid: None,
                pid: None,
                product: None,
            },
        }
    }
}

/// Sort key: ttyACM* (controllers enumerate as CDC ACM) numerically, then
/// ttyUSB*, then anything else by name
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

/// List available serial ports in a stable order
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
        .collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports.dedup_by(|a, b| a.name == b.name);
    ports
}

/// Open a controller port: 8N1, no flow control, stale input discarded
pub async fn open_port(name: &str, baud_rate: u32) -> Result<SerialStream, ProtocolError> {
    let mut port = tokio_serial::new(name, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()?;

    // Best effort: some USB bridges reject modem-line control
    if let Err(e) = port.write_data_terminal_ready(true) {
        info!("Could not assert DTR on {}: {}", name, e);
    }

    port.clear(tokio_serial::ClearBuffer::Input)?;
    debug!("Opened {} at {}bps", name, baud_rate);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_ports_does_not_panic() {
        for port in list_ports() {
            println!("Found port: {} - {:?}", port.name, port.product);
        }
    }

    #[test]
    fn test_port_sorting() {
        let mut names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ];
        names.sort_by_key(|n| port_sort_key(n));

        assert_eq!(
            names,
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

    #[tokio::test]
    async fn test_open_missing_port_is_serial_error() {
        let result = open_port("/dev/pinlink-does-not-exist", 921_600).await;
        assert!(matches!(result, Err(ProtocolError::SerialError(_))));
    }
}
