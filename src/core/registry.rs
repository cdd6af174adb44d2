//! Device registry
//!
//! Maps USB vendor/product ids to board families. The built-in table
//! covers common development boards; more entries can be merged from a
//! JSON device database before the engine starts. After startup the
//! registry is shared read-only.

use crate::config::ConfigError;
use crate::core::framing::Terminator;
use crate::core::transport::PortInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Label used for ports that match no signature
pub const UNKNOWN_DEVICE: &str = "unknown device";

/// Board family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardFamily {
    /// Arduino (AVR and SAMD)
    Arduino,
    /// Espressif ESP32 / ESP8266 via USB bridge
    Esp32,
    /// Raspberry Pi Pico (RP2040)
    Pico,
    /// STMicroelectronics STM32
    Stm32,
    /// PJRC Teensy
    Teensy,
    /// Particle
    Particle,
    /// Nordic nRF
    Nordic,
    /// Not in the registry
    #[serde(other)]
    Unknown,
}

impl BoardFamily {
    /// Get all families
    pub fn all() -> &'static [BoardFamily] {
        &[
            BoardFamily::Arduino,
            BoardFamily::Esp32,
            BoardFamily::Pico,
            BoardFamily::Stm32,
            BoardFamily::Teensy,
            BoardFamily::Particle,
            BoardFamily::Nordic,
            BoardFamily::Unknown,
        ]
    }

    /// Get name of family
    pub fn name(&self) -> &'static str {
        match self {
            BoardFamily::Arduino => "arduino",
            BoardFamily::Esp32 => "esp32",
            BoardFamily::Pico => "pico",
            BoardFamily::Stm32 => "stm32",
            BoardFamily::Teensy => "teensy",
            BoardFamily::Particle => "particle",
            BoardFamily::Nordic => "nordic",
            BoardFamily::Unknown => "unknown",
        }
    }

    /// Behavior profile of this family
    pub fn profile(&self) -> BoardProfile {
        match self {
            // Opening the port toggles DTR, which resets the MCU into the bootloader
            BoardFamily::Arduino => BoardProfile {
                family: *self,
                default_baud: Some(9600),
                terminator: Some(Terminator::Auto),
                boot_delay_ms: 2000,
            },
            BoardFamily::Esp32 => BoardProfile {
                family: *self,
                default_baud: Some(115_200),
                terminator: Some(Terminator::Auto),
                boot_delay_ms: 500,
            },
            _ => BoardProfile {
                family: *self,
                default_baud: None,
                terminator: None,
                boot_delay_ms: 0,
            },
        }
    }
}

impl std::fmt::Display for BoardFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for BoardFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        Self::all()
            .iter()
            .find(|f| f.name() == lower)
            .copied()
            .ok_or_else(|| format!("unknown board family '{s}'"))
    }
}

/// Per-family quirks, resolved once when a port is classified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardProfile {
    /// Family this profile belongs to
    pub family: BoardFamily,
    /// Baud rate to use when the caller does not pick one
    pub default_baud: Option<u32>,
    /// Inbound terminator override
    pub terminator: Option<Terminator>,
    /// Settle time after open before the first write
    pub boot_delay_ms: u64,
}

impl BoardProfile {
    /// Boot delay as a duration
    pub fn boot_delay(&self) -> Duration {
        Duration::from_millis(self.boot_delay_ms)
    }
}

/// Known device signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSignature {
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Human-readable board name
    pub board_name: String,
    /// Board family
    pub family: BoardFamily,
}

impl DeviceSignature {
    /// Create new signature
    pub fn new(vendor_id: u16, product_id: u16, board_name: &str, family: BoardFamily) -> Self {
        Self {
            vendor_id,
            product_id,
            board_name: board_name.to_string(),
            family,
        }
    }

    /// `VVVV:PPPP` key
    pub fn key(&self) -> String {
        format!("{:04X}:{:04X}", self.vendor_id, self.product_id)
    }
}

/// Entry of the JSON device database
#[derive(Debug, Deserialize)]
struct DatabaseEntry {
    name: String,
    #[serde(rename = "type")]
    family: BoardFamily,
}

const BUILTIN: &[(u16, u16, &str, BoardFamily)] = &[
    // Arduino
    (0x2341, 0x0043, "Arduino Uno", BoardFamily::Arduino),
    (0x2341, 0x0001, "Arduino Mega", BoardFamily::Arduino),
    (0x2341, 0x0036, "Arduino Leonardo", BoardFamily::Arduino),
    (0x2341, 0x8036, "Arduino Leonardo", BoardFamily::Arduino),
    (0x2341, 0x0010, "Arduino Mega 2560", BoardFamily::Arduino),
    (0x2A03, 0x0043, "Arduino Uno", BoardFamily::Arduino),
    (0x2A03, 0x0001, "Arduino Mega", BoardFamily::Arduino),
    // ESP32
    (0x10C4, 0xEA60, "ESP32 (Silicon Labs CP210x)", BoardFamily::Esp32),
    (0x1A86, 0x7523, "ESP32 (CH340)", BoardFamily::Esp32),
    // Raspberry Pi Pico
    (0x2E8A, 0x0005, "Raspberry Pi Pico", BoardFamily::Pico),
    (0x2E8A, 0x000A, "Raspberry Pi Pico W", BoardFamily::Pico),
    // STM32
    (0x0483, 0x5740, "STM32 Virtual COM Port", BoardFamily::Stm32),
    (0x0483, 0xDF11, "STM32 DFU Mode", BoardFamily::Stm32),
    // Teensy
    (0x16C0, 0x0483, "Teensy", BoardFamily::Teensy),
    (0x16C0, 0x0478, "Teensy Serial", BoardFamily::Teensy),
    // Particle
    (0x2B04, 0xC006, "Particle Photon", BoardFamily::Particle),
    (0x2B04, 0xC008, "Particle P1", BoardFamily::Particle),
    (0x2B04, 0xD006, "Particle Electron", BoardFamily::Particle),
    // Nordic nRF
    (0x1915, 0x521F, "Nordic nRF52 DFU", BoardFamily::Nordic),
    (0x1915, 0x520F, "Nordic nRF52 USB CDC", BoardFamily::Nordic),
];

/// Catalog of known device signatures
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    signatures: HashMap<(u16, u16), DeviceSignature>,
}

impl DeviceRegistry {
    /// Empty registry
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry preloaded with common development boards
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for &(vid, pid, name, family) in BUILTIN {
            registry.add(DeviceSignature::new(vid, pid, name, family));
        }
        registry
    }

    /// Add or replace a signature
    pub fn add(&mut self, signature: DeviceSignature) {
        self.signatures
            .insert((signature.vendor_id, signature.product_id), signature);
    }

    /// Merge a JSON device database (`{"VVVV:PPPP": {"name": .., "type": ..}}`).
    /// Returns the number of entries merged.
    pub fn merge_json(&mut self, json: &str) -> Result<usize, ConfigError> {
        let entries: HashMap<String, DatabaseEntry> = serde_json::from_str(json)?;
        let count = entries.len();
        for (key, entry) in entries {
            let (vid, pid) = parse_key(&key)
                .ok_or_else(|| ConfigError::Invalid(format!("bad device key '{key}'")))?;
            self.add(DeviceSignature::new(vid, pid, &entry.name, entry.family));
        }
        Ok(count)
    }

    /// Merge a JSON device database from a file
    pub fn load_file(&mut self, path: &Path) -> Result<usize, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let count = self.merge_json(&content)?;
        info!("Loaded {} custom device profiles from {}", count, path.display());
        Ok(count)
    }

    /// Look up a vendor/product pair
    pub fn classify(&self, vendor_id: u16, product_id: u16) -> Option<&DeviceSignature> {
        self.signatures.get(&(vendor_id, product_id))
    }

    /// Look up an enumerated port
    pub fn classify_port(&self, port: &PortInfo) -> Option<&DeviceSignature> {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => self.classify(vid, pid),
            _ => None,
        }
    }

    /// All signatures, ordered by vendor/product id
    pub fn signatures(&self) -> Vec<&DeviceSignature> {
        let mut all: Vec<_> = self.signatures.values().collect();
        all.sort_by_key(|s| (s.vendor_id, s.product_id));
        all
    }

    /// Number of signatures
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    /// Whether the registry has no signatures
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

fn parse_key(key: &str) -> Option<(u16, u16)> {
    let (vid, pid) = key.split_once(':')?;
    Some((
        u16::from_str_radix(vid.trim(), 16).ok()?,
        u16::from_str_radix(pid.trim(), 16).ok()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_classification() {
        let registry = DeviceRegistry::builtin();
        let sig = registry.classify(0x2341, 0x0043).unwrap();
        assert_eq!(sig.board_name, "Arduino Uno");
        assert_eq!(sig.family, BoardFamily::Arduino);
        assert_eq!(registry.classify(0x10C4, 0xEA60).unwrap().family, BoardFamily::Esp32);
        assert!(registry.classify(0xFFFF, 0x0001).is_none());
    }

    #[test]
    fn test_port_without_usb_ids_is_unclassified() {
        let registry = DeviceRegistry::builtin();
        assert!(registry.classify_port(&PortInfo::new("/dev/ttyS0")).is_none());
        assert!(registry
            .classify_port(&PortInfo::usb("/dev/ttyACM0", 0x2E8A, 0x0005))
            .is_some());
    }

    #[test]
    fn test_merge_json() {
        let mut registry = DeviceRegistry::empty();
        let count = registry
            .merge_json(r#"{"CAFE:0001": {"name": "Lab Board", "type": "stm32"},
                            "CAFE:0002": {"name": "Odd Board", "type": "riscv"}}"#)
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(registry.classify(0xCAFE, 1).unwrap().family, BoardFamily::Stm32);
        assert_eq!(registry.classify(0xCAFE, 2).unwrap().family, BoardFamily::Unknown);
    }

    #[test]
    fn test_merge_rejects_bad_key() {
        let mut registry = DeviceRegistry::empty();
        assert!(registry
            .merge_json(r#"{"nope": {"name": "x", "type": "pico"}}"#)
            .is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"1234:5678": {{"name": "Custom", "type": "teensy"}}}}"#).unwrap();

        let mut registry = DeviceRegistry::builtin();
        let before = registry.len();
        assert_eq!(registry.load_file(file.path()).unwrap(), 1);
        assert_eq!(registry.len(), before + 1);
    }

    #[test]
    fn test_profiles() {
        assert_eq!(BoardFamily::Arduino.profile().boot_delay(), Duration::from_secs(2));
        assert_eq!(BoardFamily::Pico.profile().boot_delay(), Duration::ZERO);
        assert_eq!("ESP32".parse::<BoardFamily>().unwrap(), BoardFamily::Esp32);
    }
}
