//! Port discovery
//!
//! Periodically enumerates serial ports, diffs them against the ports seen
//! on the previous scan and classifies new arrivals against the device
//! registry. Ports outside the registry are reported as "unknown device"
//! and stay fully usable.
//!
//! Discovery only reports presence. Opening a port is a separate decision
//! made by the engine (manual connect or the auto-connect policy).

use crate::core::event::{EngineEvent, EventBus};
use crate::core::registry::{BoardFamily, BoardProfile, DeviceRegistry, DeviceSignature, UNKNOWN_DEVICE};
use crate::core::transport::{PortEnumerator, PortInfo, TransportError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A present serial endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Port {
    /// Port path, used as the port identifier
    pub id: String,
    /// What the OS reported
    pub info: PortInfo,
    /// Matching registry entry
    pub signature: Option<DeviceSignature>,
    /// Family quirks, resolved at classification
    pub profile: BoardProfile,
    /// Added by hand rather than by enumeration
    pub manual: bool,
}

impl Port {
    /// Classify an enumerated port
    pub fn classify(info: PortInfo, registry: &DeviceRegistry) -> Self {
        let signature = registry.classify_port(&info).cloned();
        let family = signature.as_ref().map_or(BoardFamily::Unknown, |s| s.family);
        Self {
            id: info.path.clone(),
            info,
            signature,
            profile: family.profile(),
            manual: false,
        }
    }

    /// Port with no registry match
    pub fn unclassified(info: PortInfo) -> Self {
        Self::classify(info, &DeviceRegistry::empty())
    }

    /// Board name, or "unknown device"
    pub fn label(&self) -> &str {
        self.signature
            .as_ref()
            .map_or(UNKNOWN_DEVICE, |s| s.board_name.as_str())
    }

    /// Board family
    pub fn family(&self) -> BoardFamily {
        self.profile.family
    }

    /// Whether the registry recognised the port
    pub fn is_known(&self) -> bool {
        self.signature.is_some()
    }
}

/// Result of one scan
#[derive(Debug, Clone, Default)]
pub struct ScanDiff {
    /// Ports that appeared
    pub attached: Vec<Port>,
    /// Paths of ports that vanished
    pub detached: Vec<String>,
}

impl ScanDiff {
    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.attached.is_empty() && self.detached.is_empty()
    }
}

/// Ports observed so far. Empty at startup, replaced on every scan.
#[derive(Default)]
struct KnownPorts {
    present: BTreeMap<String, Port>,
    missing_since: HashMap<String, Instant>,
    manual: BTreeMap<String, Port>,
}

/// Discovery service
pub struct DiscoveryService {
    enumerator: Arc<dyn PortEnumerator>,
    registry: Arc<DeviceRegistry>,
    bus: Arc<EventBus>,
    detach_grace: Duration,
    known: Mutex<KnownPorts>,
}

impl DiscoveryService {
    /// Create new discovery service
    pub fn new(
        enumerator: Arc<dyn PortEnumerator>,
        registry: Arc<DeviceRegistry>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            enumerator,
            registry,
            bus,
            detach_grace: Duration::ZERO,
            known: Mutex::new(KnownPorts::default()),
        }
    }

    /// Only report a port detached after it was missing for `grace`
    #[must_use]
    pub fn with_detach_grace(mut self, grace: Duration) -> Self {
        self.detach_grace = grace;
        self
    }

    /// Enumerate ports once, publish `attached`/`detached` for the
    /// difference and return it. On enumeration failure the known set is
    /// left untouched so the next scan diffs against the last good one.
    pub fn scan(&self) -> Result<ScanDiff, TransportError> {
        let listed = self.enumerator.list_ports()?;
        let now = Instant::now();
        let mut diff = ScanDiff::default();

        {
            let mut known = self.known.lock();
            let mut current = BTreeMap::new();

            for info in listed {
                if known.manual.contains_key(&info.path) || current.contains_key(&info.path) {
                    continue;
                }
                known.missing_since.remove(&info.path);
                let port = match known.present.remove(&info.path) {
                    Some(existing) => existing,
                    None => {
                        let port = Port::classify(info, &self.registry);
                        diff.attached.push(port.clone());
                        port
                    }
                };
                current.insert(port.id.clone(), port);
            }

            // Whatever is left in `present` was not listed this time
            let vanished = std::mem::take(&mut known.present);
            for (id, port) in vanished {
                let since = *known.missing_since.entry(id.clone()).or_insert(now);
                if now.duration_since(since) >= self.detach_grace {
                    known.missing_since.remove(&id);
                    diff.detached.push(id);
                } else {
                    current.insert(id, port);
                }
            }

            known.present = current;
        }

        for port in &diff.attached {
            info!("Port attached: {} ({})", port.info, port.label());
            self.bus.publish(EngineEvent::Attached { port: port.clone() });
        }
        for id in &diff.detached {
            info!("Port detached: {}", id);
            self.bus.publish(EngineEvent::Detached { port_id: id.clone() });
        }
        if diff.is_empty() {
            debug!("Scan found no changes");
        }

        Ok(diff)
    }

    /// Register a port enumeration does not report. Manual ports are never
    /// detached by scans.
    pub fn add_manual_port(&self, path: &str, family: Option<BoardFamily>) -> Port {
        let mut port = Port::unclassified(PortInfo::new(path));
        if let Some(family) = family {
            port.profile = family.profile();
        }
        port.manual = true;

        let fresh = {
            let mut known = self.known.lock();
            known.present.remove(path);
            known.manual.insert(path.to_string(), port.clone()).is_none()
        };
        if fresh {
            self.bus.publish(EngineEvent::Attached { port: port.clone() });
        }
        port
    }

    /// Remove a manual port
    pub fn remove_manual_port(&self, path: &str) -> bool {
        let removed = self.known.lock().manual.remove(path).is_some();
        if removed {
            self.bus.publish(EngineEvent::Detached {
                port_id: path.to_string(),
            });
        }
        removed
    }

    /// Look up a present port
    pub fn port(&self, id: &str) -> Option<Port> {
        let known = self.known.lock();
        known.manual.get(id).or_else(|| known.present.get(id)).cloned()
    }

    /// All present ports, ordered by path
    pub fn ports(&self) -> Vec<Port> {
        let known = self.known.lock();
        let mut all: Vec<Port> = known.present.values().chain(known.manual.values()).cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Registry used for classification
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::MockPortEnumerator;
    use mockall::Sequence;

    fn service(mock: MockPortEnumerator) -> (DiscoveryService, tokio::sync::mpsc::UnboundedReceiver<EngineEvent>) {
        let bus = Arc::new(EventBus::default());
        let events = bus.subscribe_lossless();
        let service = DiscoveryService::new(Arc::new(mock), Arc::new(DeviceRegistry::builtin()), bus);
        (service, events)
    }

    #[test]
    fn test_attach_classify_and_detach() {
        let mut mock = MockPortEnumerator::new();
        let mut seq = Sequence::new();
        mock.expect_list_ports()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                Ok(vec![
                    PortInfo::usb("/dev/ttyACM0", 0x2341, 0x0043),
                    PortInfo::usb("/dev/ttyUSB0", 0x10C4, 0xEA60),
                    PortInfo::usb("/dev/ttyUSB1", 0xDEAD, 0xBEEF),
                ])
            });
        mock.expect_list_ports()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                Ok(vec![
                    PortInfo::usb("/dev/ttyACM0", 0x2341, 0x0043),
                    PortInfo::usb("/dev/ttyUSB0", 0x10C4, 0xEA60),
                ])
            });

        let (discovery, mut events) = service(mock);

        let diff = discovery.scan().unwrap();
        assert_eq!(diff.attached.len(), 3);
        let labels: Vec<_> = diff.attached.iter().map(|p| p.label().to_string()).collect();
        assert_eq!(
            labels,
            vec!["Arduino Uno", "ESP32 (Silicon Labs CP210x)", UNKNOWN_DEVICE]
        );
        assert_eq!(diff.attached[2].family(), BoardFamily::Unknown);

        let diff = discovery.scan().unwrap();
        assert!(diff.attached.is_empty());
        assert_eq!(diff.detached, vec!["/dev/ttyUSB1".to_string()]);
        assert_eq!(discovery.ports().len(), 2);

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names, vec!["attached", "attached", "attached", "detached"]);
    }

    #[test]
    fn test_enumeration_error_keeps_known_set() {
        let mut mock = MockPortEnumerator::new();
        let mut seq = Sequence::new();
        mock.expect_list_ports()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![PortInfo::new("/dev/ttyS0")]));
        mock.expect_list_ports()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(TransportError::Enumeration("udev unavailable".into())));
        mock.expect_list_ports()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![PortInfo::new("/dev/ttyS0")]));

        let (discovery, _events) = service(mock);
        assert_eq!(discovery.scan().unwrap().attached.len(), 1);
        assert!(discovery.scan().is_err());
        assert!(discovery.scan().unwrap().is_empty());
    }

    #[test]
    fn test_detach_grace() {
        let mut mock = MockPortEnumerator::new();
        let mut seq = Sequence::new();
        mock.expect_list_ports()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![PortInfo::new("/dev/ttyS1")]));
        mock.expect_list_ports()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(Vec::new()));

        let bus = Arc::new(EventBus::default());
        let discovery = DiscoveryService::new(Arc::new(mock), Arc::new(DeviceRegistry::builtin()), bus)
            .with_detach_grace(Duration::from_secs(3600));

        discovery.scan().unwrap();
        assert!(discovery.scan().unwrap().detached.is_empty());
        assert_eq!(discovery.ports().len(), 1);
    }

    #[test]
    fn test_manual_ports_survive_scans() {
        let mut mock = MockPortEnumerator::new();
        mock.expect_list_ports().returning(|| Ok(Vec::new()));

        let (discovery, _events) = service(mock);
        let port = discovery.add_manual_port("/dev/rfcomm0", Some(BoardFamily::Esp32));
        assert!(port.manual);
        assert_eq!(port.family(), BoardFamily::Esp32);

        assert!(discovery.scan().unwrap().is_empty());
        assert!(discovery.port("/dev/rfcomm0").is_some());
        assert!(discovery.remove_manual_port("/dev/rfcomm0"));
        assert!(discovery.port("/dev/rfcomm0").is_none());
    }
}
