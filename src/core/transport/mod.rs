//! Port layer
//!
//! The engine never touches the OS directly. It talks to two seams:
//!
//! - [`PortEnumerator`] lists serial-capable endpoints with their USB ids
//! - [`PortOpener`] opens one endpoint and hands back a read half and a
//!   write half
//!
//! [`SystemPorts`] implements both on top of `serialport` and
//! `tokio-serial`. The simulator implements them for tests.

mod serial;

pub use serial::{list_ports, SerialConfig, SerialFlowControl, SerialParity, SystemPorts};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Port already in use
    #[error("Port already in use: {0}")]
    PortInUse(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Enumeration failed
    #[error("Port enumeration failed: {0}")]
    Enumeration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// One serial endpoint as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortInfo {
    /// Port path (e.g. COM3, /dev/ttyUSB0)
    pub path: String,
    /// USB vendor id, when the port is a USB device
    pub vid: Option<u16>,
    /// USB product id, when the port is a USB device
    pub pid: Option<u16>,
    /// USB serial number
    pub serial_number: Option<String>,
    /// Manufacturer string
    pub manufacturer: Option<String>,
    /// Product string
    pub product: Option<String>,
}

impl PortInfo {
    /// Port without USB information
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Self::default()
        }
    }

    /// USB port with vendor and product id
    pub fn usb(path: &str, vid: u16, pid: u16) -> Self {
        Self {
            path: path.to_string(),
            vid: Some(vid),
            pid: Some(pid),
            ..Self::default()
        }
    }

    /// Set product string
    #[must_use]
    pub fn with_product(mut self, product: &str) -> Self {
        self.product = Some(product.to_string());
        self
    }

    /// `VVVV:PPPP` identifier, if both ids are known
    pub fn vid_pid(&self) -> Option<String> {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => Some(format!("{vid:04X}:{pid:04X}")),
            _ => None,
        }
    }
}

impl fmt::Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vid_pid() {
            Some(id) => write!(f, "{} [{}]", self.path, id),
            None => write!(f, "{}", self.path),
        }
    }
}

/// Lists serial-capable endpoints
#[cfg_attr(test, mockall::automock)]
pub trait PortEnumerator: Send + Sync {
    /// Currently present ports
    fn list_ports(&self) -> Result<Vec<PortInfo>, TransportError>;
}

/// Opens serial endpoints
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open a port with the given parameters
    async fn open(&self, config: &SerialConfig) -> Result<PortHandle, TransportError>;
}

/// An open port, split into the halves owned by a session's two loops
pub struct PortHandle {
    /// Read half, owned by the read loop
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Write half, owned by the write loop
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl PortHandle {
    /// Split a bidirectional stream
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortHandle").finish_non_exhaustive()
    }
}
