//! Virtual Device Simulator
//!
//! Scriptable stand-ins for real boards. A [`VirtualDevice`] answers lines
//! according to its response rules and can emit periodic telemetry.
//! [`VirtualBus`] plugs devices into the engine by implementing both
//! [`PortEnumerator`] and [`PortOpener`], so discovery and sessions run
//! unchanged against simulated hardware.

use crate::core::framing::{LineFramer, Terminator, DEFAULT_MAX_LINE_LEN};
use crate::core::matcher::LinePattern;
use crate::core::transport::{PortEnumerator, PortHandle, PortInfo, PortOpener, SerialConfig, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const LINK_BUFFER: usize = 8 * 1024;

/// Response rule condition, evaluated against one received line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchCondition {
    /// Whole line equals text
    Exact {
        /// Expected line
        text: String,
    },
    /// Line contains text
    Text {
        /// Substring
        text: String,
        /// Case sensitive comparison
        #[serde(default)]
        case_sensitive: bool,
    },
    /// Line matches a regular expression
    Regex {
        /// Pattern
        pattern: LinePattern,
    },
    /// Any line
    Any,
    /// Any of the conditions
    OneOf {
        /// Alternatives
        conditions: Vec<MatchCondition>,
    },
}

impl MatchCondition {
    /// Check if a line matches this condition
    pub fn matches(&self, line: &str) -> bool {
        match self {
            Self::Exact { text } => line == text,
            Self::Text { text, case_sensitive } => {
                if *case_sensitive {
                    line.contains(text.as_str())
                } else {
                    line.to_lowercase().contains(&text.to_lowercase())
                }
            }
            Self::Regex { pattern } => pattern.is_match_str(line),
            Self::Any => true,
            Self::OneOf { conditions } => conditions.iter().any(|c| c.matches(line)),
        }
    }
}

/// Response action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseAction {
    /// Reply with a line
    SendLine {
        /// Reply text
        text: String,
    },
    /// Echo the line back
    Echo,
    /// Echo with prefix and suffix
    EchoModified {
        /// Text before the echoed line
        prefix: String,
        /// Text after the echoed line
        suffix: String,
    },
    /// Pause before the next action
    Delay {
        /// Pause length
        ms: u64,
    },
    /// Pause for a random time in a range
    RandomDelay {
        /// Lower bound
        min_ms: u64,
        /// Upper bound
        max_ms: u64,
    },
    /// Increment a counter and reply with it (`{}` is replaced)
    Counter {
        /// Counter name
        name: String,
        /// Reply format
        format: String,
    },
    /// Several actions in order
    Sequence {
        /// Actions
        actions: Vec<ResponseAction>,
    },
    /// Drop the link, as a board that resets or crashes would
    Hangup,
    /// No response
    None,
}

/// Response rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRule {
    /// Rule name
    pub name: String,
    /// Match condition
    pub condition: MatchCondition,
    /// Response action
    pub action: ResponseAction,
    /// Priority (higher = checked first)
    #[serde(default)]
    pub priority: i32,
    /// One-shot (disable after first match)
    #[serde(default)]
    pub one_shot: bool,
    /// Match count
    #[serde(skip)]
    pub match_count: u64,
    #[serde(skip)]
    spent: bool,
}

impl ResponseRule {
    /// Rule with default priority
    pub fn new(name: &str, condition: MatchCondition, action: ResponseAction) -> Self {
        Self {
            name: name.to_string(),
            condition,
            action,
            priority: 0,
            one_shot: false,
            match_count: 0,
            spent: false,
        }
    }

    /// Create a simple echo rule
    pub fn echo(name: &str) -> Self {
        Self::new(name, MatchCondition::Any, ResponseAction::Echo)
    }

    /// Reply with `reply` to a line equal to `line`
    pub fn reply(name: &str, line: &str, reply: &str) -> Self {
        let mut rule = Self::new(
            name,
            MatchCondition::Exact { text: line.to_string() },
            ResponseAction::SendLine { text: reply.to_string() },
        );
        rule.priority = 10;
        rule
    }

    /// Set priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Disable after the first match
    #[must_use]
    pub fn once(mut self) -> Self {
        self.one_shot = true;
        self
    }
}

/// Periodic output of a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    /// Period
    pub interval_ms: u64,
    /// Lines emitted in rotation
    pub lines: Vec<String>,
}

/// What a device does in reaction to a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOutput {
    /// Write a line to the host
    Line(String),
    /// Drop the link
    Hangup,
}

/// Virtual device simulator
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    name: String,
    rules: Vec<ResponseRule>,
    greeting: Vec<String>,
    telemetry: Option<Telemetry>,
    line_ending: String,
    counters: HashMap<String, u64>,
}

impl VirtualDevice {
    /// Create new virtual device
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rules: Vec::new(),
            greeting: Vec::new(),
            telemetry: None,
            line_ending: "\r\n".to_string(),
            counters: HashMap::new(),
        }
    }

    /// Add a response rule
    pub fn add_rule(&mut self, rule: ResponseRule) {
        self.rules.push(rule);
        // Stable sort keeps insertion order within a priority
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Builder form of [`VirtualDevice::add_rule`]
    #[must_use]
    pub fn with_rule(mut self, rule: ResponseRule) -> Self {
        self.add_rule(rule);
        self
    }

    /// Lines written as soon as the port is opened
    #[must_use]
    pub fn with_greeting(mut self, lines: &[&str]) -> Self {
        self.greeting = lines.iter().map(|l| (*l).to_string()).collect();
        self
    }

    /// Emit `lines` in rotation every `interval`
    #[must_use]
    pub fn with_telemetry(mut self, interval: Duration, lines: &[&str]) -> Self {
        self.telemetry = Some(Telemetry {
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            lines: lines.iter().map(|l| (*l).to_string()).collect(),
        });
        self
    }

    /// Terminator appended to every written line
    #[must_use]
    pub fn with_line_ending(mut self, ending: &str) -> Self {
        self.line_ending = ending.to_string();
        self
    }

    /// Get device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get all rules
    pub fn rules(&self) -> &[ResponseRule] {
        &self.rules
    }

    /// Current value of a counter
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// React to one received line. Only the first matching rule fires.
    pub async fn process(&mut self, line: &str) -> Vec<DeviceOutput> {
        let Some(index) = self
            .rules
            .iter()
            .position(|r| !r.spent && r.condition.matches(line))
        else {
            return Vec::new();
        };

        let action = {
            let rule = &mut self.rules[index];
            rule.match_count += 1;
            if rule.one_shot {
                rule.spent = true;
            }
            rule.action.clone()
        };

        let mut steps = Vec::new();
        flatten(action, &mut steps);

        let mut outputs = Vec::new();
        for step in steps {
            match step {
                ResponseAction::SendLine { text } => outputs.push(DeviceOutput::Line(text)),
                ResponseAction::Echo => outputs.push(DeviceOutput::Line(line.to_string())),
                ResponseAction::EchoModified { prefix, suffix } => {
                    outputs.push(DeviceOutput::Line(format!("{prefix}{line}{suffix}")));
                }
                ResponseAction::Delay { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
                ResponseAction::RandomDelay { min_ms, max_ms } => {
                    let delay = if max_ms > min_ms {
                        rand::thread_rng().gen_range(min_ms..=max_ms)
                    } else {
                        min_ms
                    };
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                ResponseAction::Counter { name, format } => {
                    let count = self.counters.entry(name).or_insert(0);
                    *count += 1;
                    outputs.push(DeviceOutput::Line(format.replace("{}", &count.to_string())));
                }
                ResponseAction::Hangup => outputs.push(DeviceOutput::Hangup),
                ResponseAction::Sequence { .. } | ResponseAction::None => {}
            }
        }
        outputs
    }
}

fn flatten(action: ResponseAction, out: &mut Vec<ResponseAction>) {
    match action {
        ResponseAction::Sequence { actions } => {
            for action in actions {
                flatten(action, out);
            }
        }
        other => out.push(other),
    }
}

/// Preset device templates
pub struct DeviceTemplates;

impl DeviceTemplates {
    /// Simple echo device
    pub fn echo() -> VirtualDevice {
        VirtualDevice::new("Echo Device").with_rule(ResponseRule::echo("echo_all"))
    }

    /// Answers `PING` with `PONG`
    pub fn ping_pong() -> VirtualDevice {
        VirtualDevice::new("Ping Device")
            .with_rule(ResponseRule::reply("ping", "PING", "PONG"))
            .with_rule(ResponseRule::new(
                "unknown",
                MatchCondition::Any,
                ResponseAction::SendLine {
                    text: "ERR unknown command".to_string(),
                },
            ))
    }

    /// Temperature sensor: answers `READ` and streams readings
    pub fn thermometer(interval: Duration) -> VirtualDevice {
        VirtualDevice::new("Thermometer")
            .with_greeting(&["BOOT OK"])
            .with_telemetry(interval, &["TEMP:21", "TEMP:22", "TEMP:23", "TEMP:22"])
            .with_rule(ResponseRule::reply("read", "READ", "TEMP:22"))
            .with_rule(ResponseRule::new(
                "seq",
                MatchCondition::Exact { text: "SEQ".to_string() },
                ResponseAction::Counter {
                    name: "seq".to_string(),
                    format: "SEQ:{}".to_string(),
                },
            ))
    }

    /// AT command responder
    pub fn at_modem() -> VirtualDevice {
        VirtualDevice::new("AT Modem")
            .with_rule(ResponseRule::reply("at", "AT", "OK"))
            .with_rule(
                ResponseRule::new(
                    "ati",
                    MatchCondition::Exact { text: "ATI".to_string() },
                    ResponseAction::Sequence {
                        actions: vec![
                            ResponseAction::SendLine {
                                text: "Boardmon Virtual Modem v1.0".to_string(),
                            },
                            ResponseAction::SendLine { text: "OK".to_string() },
                        ],
                    },
                )
                .with_priority(10),
            )
            .with_rule(
                ResponseRule::new(
                    "unknown",
                    MatchCondition::Text {
                        text: "AT".to_string(),
                        case_sensitive: false,
                    },
                    ResponseAction::SendLine { text: "ERROR".to_string() },
                )
                .with_priority(1),
            )
    }
}

struct Link {
    inject: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl Link {
    fn is_alive(&self) -> bool {
        !self.finished.is_cancelled()
    }
}

struct Slot {
    info: PortInfo,
    present: bool,
    device: VirtualDevice,
    open_failure: Option<String>,
    link: Option<Link>,
    received: Arc<Mutex<Vec<String>>>,
}

/// Simulated serial bus
///
/// Unplugging only removes a port from enumeration; the open link stays up
/// until the host closes it or [`VirtualBus::break_link`] is called.
#[derive(Default)]
pub struct VirtualBus {
    slots: Mutex<BTreeMap<String, Slot>>,
}

impl VirtualBus {
    /// Create empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug a device in, replacing whatever was at the same path
    pub fn plug(&self, info: PortInfo, device: VirtualDevice) {
        debug!("Virtual device '{}' plugged at {}", device.name(), info.path);
        let mut slots = self.slots.lock();
        let slot = slots.entry(info.path.clone()).or_insert_with(|| Slot {
            info: info.clone(),
            present: true,
            device: device.clone(),
            open_failure: None,
            link: None,
            received: Arc::new(Mutex::new(Vec::new())),
        });
        slot.info = info;
        slot.device = device;
        slot.present = true;
    }

    /// Remove a device from enumeration
    pub fn unplug(&self, path: &str) -> bool {
        match self.slots.lock().get_mut(path) {
            Some(slot) if slot.present => {
                slot.present = false;
                true
            }
            _ => false,
        }
    }

    /// Make the device write a line to the host
    pub fn inject(&self, path: &str, line: &str) -> bool {
        self.slots
            .lock()
            .get(path)
            .and_then(|s| s.link.as_ref())
            .filter(|l| l.is_alive())
            .is_some_and(|l| l.inject.send(line.to_string()).is_ok())
    }

    /// Drop the open link; the host sees end of stream
    pub fn break_link(&self, path: &str) -> bool {
        match self.slots.lock().get(path).and_then(|s| s.link.as_ref()) {
            Some(link) if link.is_alive() => {
                link.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Fail the next open of `path` with `reason`
    pub fn fail_next_open(&self, path: &str, reason: &str) {
        if let Some(slot) = self.slots.lock().get_mut(path) {
            slot.open_failure = Some(reason.to_string());
        }
    }

    /// Whether a host currently holds the port open
    pub fn is_open(&self, path: &str) -> bool {
        self.slots
            .lock()
            .get(path)
            .and_then(|s| s.link.as_ref())
            .is_some_and(Link::is_alive)
    }

    /// Lines the device received so far
    pub fn received(&self, path: &str) -> Vec<String> {
        self.slots
            .lock()
            .get(path)
            .map(|s| s.received.lock().clone())
            .unwrap_or_default()
    }
}

impl PortEnumerator for VirtualBus {
    fn list_ports(&self) -> Result<Vec<PortInfo>, TransportError> {
        Ok(self
            .slots
            .lock()
            .values()
            .filter(|s| s.present)
            .map(|s| s.info.clone())
            .collect())
    }
}

#[async_trait]
impl PortOpener for VirtualBus {
    async fn open(&self, config: &SerialConfig) -> Result<PortHandle, TransportError> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(&config.port)
            .filter(|s| s.present)
            .ok_or_else(|| TransportError::PortNotFound(config.port.clone()))?;

        if let Some(reason) = slot.open_failure.take() {
            return Err(TransportError::ConnectionFailed(reason));
        }
        if slot.link.as_ref().is_some_and(Link::is_alive) {
            return Err(TransportError::PortInUse(config.port.clone()));
        }

        let (host, device_end) = tokio::io::duplex(LINK_BUFFER);
        let (inject, inject_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();

        tokio::spawn(run_device(
            slot.device.clone(),
            device_end,
            inject_rx,
            cancel.clone(),
            finished.clone(),
            Arc::clone(&slot.received),
        ));
        slot.link = Some(Link {
            inject,
            cancel,
            finished,
        });

        debug!("Virtual port {} opened at {} baud", config.port, config.baud_rate);
        Ok(PortHandle::from_stream(host))
    }
}

struct TelemetryTicker {
    interval: tokio::time::Interval,
    lines: Vec<String>,
    next: usize,
}

impl TelemetryTicker {
    fn new(telemetry: &Telemetry) -> Option<Self> {
        if telemetry.lines.is_empty() || telemetry.interval_ms == 0 {
            return None;
        }
        let period = Duration::from_millis(telemetry.interval_ms);
        Some(Self {
            interval: tokio::time::interval_at(tokio::time::Instant::now() + period, period),
            lines: telemetry.lines.clone(),
            next: 0,
        })
    }
}

async fn next_telemetry(ticker: &mut Option<TelemetryTicker>) -> String {
    match ticker {
        Some(t) => {
            t.interval.tick().await;
            let line = t.lines[t.next % t.lines.len()].clone();
            t.next += 1;
            line
        }
        None => std::future::pending().await,
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str, ending: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(ending.as_bytes()).await?;
    writer.flush().await
}

async fn run_device(
    mut device: VirtualDevice,
    stream: DuplexStream,
    mut inject: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    finished: CancellationToken,
    received: Arc<Mutex<Vec<String>>>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut framer = LineFramer::new(Terminator::Auto, DEFAULT_MAX_LINE_LEN);
    let mut ticker = device.telemetry.as_ref().and_then(TelemetryTicker::new);
    let ending = device.line_ending.clone();
    let mut buf = [0u8; 256];

    for line in device.greeting.clone() {
        if write_line(&mut writer, &line, &ending).await.is_err() {
            finished.cancel();
            return;
        }
    }

    'link: loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some(line) = inject.recv() => {
                if write_line(&mut writer, &line, &ending).await.is_err() {
                    break;
                }
            }
            line = next_telemetry(&mut ticker) => {
                if write_line(&mut writer, &line, &ending).await.is_err() {
                    break;
                }
            }
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                for raw in framer.push(&buf[..n]) {
                    let text = String::from_utf8_lossy(&raw).into_owned();
                    received.lock().push(text.clone());
                    for output in device.process(&text).await {
                        match output {
                            DeviceOutput::Line(reply) => {
                                if write_line(&mut writer, &reply, &ending).await.is_err() {
                                    break 'link;
                                }
                            }
                            DeviceOutput::Hangup => break 'link,
                        }
                    }
                }
            }
        }
    }

    debug!("Virtual device '{}' link closed", device.name());
    finished.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_echo_device() {
        let mut device = DeviceTemplates::echo();
        let outputs = device.process("Hello").await;
        assert_eq!(outputs, vec![DeviceOutput::Line("Hello".to_string())]);
    }

    #[tokio::test]
    async fn test_at_modem() {
        let mut device = DeviceTemplates::at_modem();
        assert_eq!(device.process("AT").await, vec![DeviceOutput::Line("OK".to_string())]);
        assert_eq!(device.process("ATI").await.len(), 2);
        assert_eq!(device.process("AT+FOO").await, vec![DeviceOutput::Line("ERROR".to_string())]);
    }

    #[tokio::test]
    async fn test_counter_and_one_shot() {
        let mut device = VirtualDevice::new("test")
            .with_rule(ResponseRule::reply("first", "HELLO", "FIRST").once())
            .with_rule(ResponseRule::new(
                "count",
                MatchCondition::Any,
                ResponseAction::Counter {
                    name: "n".to_string(),
                    format: "N={}".to_string(),
                },
            ));

        assert_eq!(device.process("HELLO").await, vec![DeviceOutput::Line("FIRST".to_string())]);
        assert_eq!(device.process("HELLO").await, vec![DeviceOutput::Line("N=1".to_string())]);
        assert_eq!(device.process("x").await, vec![DeviceOutput::Line("N=2".to_string())]);
        assert_eq!(device.counter("n"), 2);
    }

    #[test]
    fn test_match_conditions() {
        let text = MatchCondition::Text {
            text: "hello".to_string(),
            case_sensitive: false,
        };
        assert!(text.matches("Hello World"));

        let exact = MatchCondition::Exact { text: "PING".to_string() };
        assert!(exact.matches("PING"));
        assert!(!exact.matches("PING2"));

        let regex = MatchCondition::Regex {
            pattern: LinePattern::new(r"^SET \d+$").unwrap(),
        };
        assert!(regex.matches("SET 42"));
        assert!(!regex.matches("SET x"));
    }

    #[tokio::test]
    async fn test_bus_open_reply_and_exclusive_access() {
        let bus = VirtualBus::new();
        bus.plug(PortInfo::usb("/dev/ttyV0", 0x2341, 0x0043), DeviceTemplates::ping_pong());
        assert_eq!(bus.list_ports().unwrap().len(), 1);

        let config = SerialConfig::new("/dev/ttyV0", 9600);
        let handle = bus.open(&config).await.unwrap();
        assert!(bus.is_open("/dev/ttyV0"));
        assert!(matches!(
            bus.open(&config).await,
            Err(TransportError::PortInUse(_))
        ));

        let mut writer = handle.writer;
        let mut reader = BufReader::new(handle.reader);
        writer.write_all(b"PING\r\n").await.unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "PONG\r\n");
        assert_eq!(bus.received("/dev/ttyV0"), vec!["PING".to_string()]);

        assert!(bus.inject("/dev/ttyV0", "HELLO"));
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "HELLO\r\n");

        assert!(bus.break_link("/dev/ttyV0"));
        line.clear();
        assert_eq!(reader.read_line(&mut line).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unplugged_and_failing_opens() {
        let bus = VirtualBus::new();
        bus.plug(PortInfo::new("/dev/ttyV1"), DeviceTemplates::echo());
        bus.fail_next_open("/dev/ttyV1", "permission denied");

        let config = SerialConfig::new("/dev/ttyV1", 9600);
        assert!(matches!(
            bus.open(&config).await,
            Err(TransportError::ConnectionFailed(_))
        ));
        assert!(bus.open(&config).await.is_ok());

        assert!(bus.unplug("/dev/ttyV1"));
        assert!(bus.list_ports().unwrap().is_empty());
        assert!(matches!(
            bus.open(&SerialConfig::new("/dev/ttyV1", 9600)).await,
            Err(TransportError::PortNotFound(_))
        ));
    }
}
