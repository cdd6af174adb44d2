//! Serial port backend on top of `serialport` and `tokio-serial`

use super::{PortEnumerator, PortHandle, PortInfo, PortOpener, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serialport::SerialPortType;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};
use tracing::debug;

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

impl std::str::FromStr for SerialFlowControl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "hw" | "hardware" | "rtscts" => Ok(Self::Hardware),
            "sw" | "software" | "xonxoff" => Ok(Self::Software),
            other => Err(format!("unknown flow control '{other}'")),
        }
    }
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            other => Err(format!("unknown parity '{other}'")),
        }
    }
}

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
}

impl SerialConfig {
    /// Create a new serial configuration with default settings
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    /// Reject parameters no UART accepts
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.baud_rate == 0 {
            return Err(TransportError::InvalidConfiguration("baud rate must be non-zero".into()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(TransportError::InvalidConfiguration(format!(
                "data bits must be 5-8, got {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(TransportError::InvalidConfiguration(format!(
                "stop bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        Ok(())
    }

    /// Short `115200 8N1` style description
    pub fn summary(&self) -> String {
        let parity = match self.parity {
            SerialParity::None => 'N',
            SerialParity::Odd => 'O',
            SerialParity::Even => 'E',
        };
        format!("{} {}{}{}", self.baud_rate, self.data_bits, parity, self.stop_bits)
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("COM1", 115200)
    }
}

/// OS serial ports
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl PortEnumerator for SystemPorts {
    fn list_ports(&self) -> Result<Vec<PortInfo>, TransportError> {
        list_ports()
    }
}

#[async_trait]
impl PortOpener for SystemPorts {
    async fn open(&self, config: &SerialConfig) -> Result<PortHandle, TransportError> {
        config.validate()?;

        let data_bits = match config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let parity = match config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let flow_control = match config.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        };

        debug!("Opening {} at {}", config.port, config.summary());

        let stream = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .open_native_async()
            .map_err(|e| map_open_error(&config.port, &e))?;

        Ok(PortHandle::from_stream(stream))
    }
}

fn map_open_error(port: &str, e: &serialport::Error) -> TransportError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => TransportError::PortNotFound(port.to_string()),
        serialport::ErrorKind::InvalidInput => TransportError::InvalidConfiguration(e.to_string()),
        serialport::ErrorKind::Io(io_kind) => match io_kind {
            std::io::ErrorKind::PermissionDenied => TransportError::PermissionDenied(port.to_string()),
            std::io::ErrorKind::NotFound => TransportError::PortNotFound(port.to_string()),
            std::io::ErrorKind::AddrInUse | std::io::ErrorKind::WouldBlock => {
                TransportError::PortInUse(port.to_string())
            }
            _ => TransportError::ConnectionFailed(e.to_string()),
        },
        serialport::ErrorKind::Unknown => TransportError::ConnectionFailed(e.to_string()),
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<PortInfo>, TransportError> {
    let ports =
        serialport::available_ports().map_err(|e| TransportError::Enumeration(e.to_string()))?;

    Ok(ports
        .into_iter()
        .map(|p| match p.port_type {
            SerialPortType::UsbPort(usb) => PortInfo {
                path: p.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                serial_number: usb.serial_number,
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            _ => PortInfo::new(&p.port_name),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(SerialConfig::new("COM3", 9600).validate().is_ok());
        assert!(SerialConfig::new("COM3", 0).validate().is_err());
        assert!(SerialConfig::new("COM3", 9600).data_bits(9).validate().is_err());
        assert!(SerialConfig::new("COM3", 9600).stop_bits(3).validate().is_err());
    }

    #[test]
    fn test_summary() {
        let config = SerialConfig::new("COM3", 9600).parity(SerialParity::Even).stop_bits(2);
        assert_eq!(config.summary(), "9600 8E2");
    }

    #[test]
    fn test_parse_parity_and_flow() {
        assert_eq!("e".parse::<SerialParity>().unwrap(), SerialParity::Even);
        assert!("mark".parse::<SerialParity>().is_err());
        assert_eq!("hw".parse::<SerialFlowControl>().unwrap(), SerialFlowControl::Hardware);
    }

    #[test]
    fn test_map_open_error() {
        let err = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
        assert!(matches!(map_open_error("COM9", &err), TransportError::PortNotFound(_)));

        let err = serialport::Error::new(
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied),
            "denied",
        );
        assert!(matches!(map_open_error("COM9", &err), TransportError::PermissionDenied(_)));
    }
}
