//! Output formatting
//!
//! Renders engine events, ports and sessions as human-readable text or as
//! one JSON object per line.

use crate::core::discovery::Port;
use crate::core::event::EngineEvent;
use crate::core::session::{Direction, SessionInfo};
use serde::Serialize;

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Text for terminals
    #[default]
    Text,
    /// JSON lines
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown output format '{other}'")),
        }
    }
}

/// Which events are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFilter {
    /// Raw lines
    pub lines: bool,
    /// Metric samples
    pub metrics: bool,
    /// Port and session lifecycle
    pub lifecycle: bool,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            lines: true,
            metrics: true,
            lifecycle: true,
        }
    }
}

impl EventFilter {
    /// Whether an event passes the filter
    pub fn accepts(&self, event: &EngineEvent) -> bool {
        match event {
            EngineEvent::RawLine(_) => self.lines,
            EngineEvent::MetricSample(_) | EngineEvent::ExtractionError(_) => self.metrics,
            _ => self.lifecycle,
        }
    }
}

/// Render one event
pub fn format_event(event: &EngineEvent, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => to_json(event),
        OutputFormat::Text => event_text(event),
    }
}

fn event_text(event: &EngineEvent) -> String {
    match event {
        EngineEvent::Attached { port } => format!("+ {} {}", port.info, port.label()),
        EngineEvent::Detached { port_id } => format!("- {port_id}"),
        EngineEvent::SessionStateChanged {
            port_id, from, to, reason, ..
        } => match reason {
            Some(reason) => format!("{port_id}: {from} -> {to} ({reason})"),
            None => format!("{port_id}: {from} -> {to}"),
        },
        EngineEvent::SessionFailed { port_id, cause, .. } => format!("{port_id}: FAILED {cause}"),
        EngineEvent::RawLine(line) => {
            let arrow = match line.direction {
                Direction::Inbound => "<",
                Direction::Outbound => ">",
            };
            format!("{} {} {}", line.timestamp.format("%H:%M:%S%.3f"), arrow, line.text())
        }
        EngineEvent::MetricSample(sample) => format!(
            "{} {} = {}",
            sample.timestamp.format("%H:%M:%S%.3f"),
            sample.metric,
            sample.value
        ),
        EngineEvent::ExtractionError(err) => format!("! {err}"),
        EngineEvent::TaskStateChanged { name, state, error, .. } => match error {
            Some(error) => format!("task {name}: {state} ({error})"),
            None => format!("task {name}: {state}"),
        },
    }
}

/// Render a port
pub fn format_port(port: &Port, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => to_json(port),
        OutputFormat::Text => {
            let ids = port.info.vid_pid().unwrap_or_else(|| "-".to_string());
            format!("{:<24} {:<10} {:<9} {}", port.id, ids, port.family(), port.label())
        }
    }
}

/// Render a session
pub fn format_session(session: &SessionInfo, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => to_json(session),
        OutputFormat::Text => format!(
            "{} {:<24} {:<12} {} in={} out={}",
            session.id,
            session.port_id,
            session.state,
            session.board,
            session.stats.lines_in,
            session.stats.lines_out
        ),
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!(r#"{{"error":"{e}"}}"#))
}
