//! # Boardmon Core Library
//!
//! A multi-device serial session engine for microcontroller boards:
//! - USB serial port discovery and board classification by VID/PID
//! - One session per port with independent read and write loops
//! - Commands with response matching and timeouts
//! - Extraction rules that turn log lines into metric samples
//! - Script tasks that send, wait and assert across boards
//!
//! ## Example
//!
//! ```rust,no_run
//! use boardmon_core::{AppConfig, Engine, EngineEvent};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Engine::with_system_ports(AppConfig::load()?)?;
//!     let mut events = engine.subscribe();
//!     engine.start();
//!
//!     while let Some(event) = events.recv().await {
//!         if let EngineEvent::MetricSample(sample) = event {
//!             println!("{} = {}", sample.metric, sample.value);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OutputFormat};
pub use crate::config::{AppConfig, AutoConnect, ConfigError};
pub use crate::core::discovery::{DiscoveryService, Port, ScanDiff};
pub use crate::core::dispatcher::{CommandHandle, CommandRequest, CommandResult, Dispatcher};
pub use crate::core::engine::Engine;
pub use crate::core::error::{EngineError, PortFault, Result};
pub use crate::core::event::{EngineEvent, EventBus, Subscription};
pub use crate::core::framing::{LineEnding, LineFramer, Terminator};
pub use crate::core::macros::{CommandLibrary, CommandMacro, Favorite};
pub use crate::core::matcher::LinePattern;
pub use crate::core::pipeline::{DataPipeline, ExtractionError, ExtractionRule, MetricSample, MetricValue, ValueSpec};
pub use crate::core::registry::{BoardFamily, BoardProfile, DeviceRegistry, DeviceSignature};
pub use crate::core::script::{
    Condition, MetricPredicate, ScriptBuilder, ScriptEngine, ScriptTask, Step, TaskState, TaskStatus,
};
pub use crate::core::session::{Direction, RawLine, Session, SessionId, SessionInfo, SessionState, SessionTable};
pub use crate::core::simulator::{DeviceTemplates, VirtualBus, VirtualDevice};
pub use crate::core::transport::{PortEnumerator, PortInfo, PortOpener, SerialConfig, SystemPorts, TransportError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
