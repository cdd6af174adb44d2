//! Engine settings

use super::ConfigError;
use crate::core::framing::{LineEnding, Terminator, DEFAULT_MAX_LINE_LEN};
use crate::core::pipeline::ExtractionRule;
use crate::core::registry::BoardFamily;
use crate::core::transport::{SerialConfig, SerialFlowControl, SerialParity};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
///
/// Every section falls back to its defaults, so a file only needs the keys
/// it changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Port parameters for new sessions
    pub serial: SerialDefaults,
    /// Port discovery
    pub discovery: DiscoveryConfig,
    /// Session behavior
    pub session: SessionConfig,
    /// Data pipeline
    pub pipeline: PipelineConfig,
    /// Script execution
    pub scripting: ScriptingConfig,
    /// Diagnostic logging
    pub logging: LoggingConfig,
    /// Device registry
    pub registry: RegistryConfig,
    /// Command macros and favorites
    pub commands: CommandsConfig,
    /// Extraction rules applied to new sessions
    pub rules: Vec<RuleBinding>,
    /// Ports open at the last save, reopened by `restore_sessions`
    pub connections: Vec<SerialConfig>,
}

impl AppConfig {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        super::config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Load config from the default location, or defaults if there is none
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load config from a file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::default_path()
            .ok_or_else(|| ConfigError::Invalid("could not determine config directory".into()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.save_to(&path)
    }

    /// Save config to a file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid("serial.baud_rate must be non-zero".into()));
        }
        if self.discovery.scan_interval_ms == 0 {
            return Err(ConfigError::Invalid("discovery.scan_interval_ms must be non-zero".into()));
        }
        if self.session.max_line_len == 0 {
            return Err(ConfigError::Invalid("session.max_line_len must be non-zero".into()));
        }
        if self.pipeline.display_queue_capacity == 0 {
            return Err(ConfigError::Invalid("pipeline.display_queue_capacity must be non-zero".into()));
        }
        if let Some(saved) = self.connections.iter().find(|c| c.baud_rate == 0) {
            return Err(ConfigError::Invalid(format!("connection {} has a zero baud rate", saved.port)));
        }
        Ok(())
    }

    /// Rules for sessions of a board family: global bindings first
    pub fn rules_for(&self, family: Option<BoardFamily>) -> Vec<ExtractionRule> {
        self.rules
            .iter()
            .filter(|b| b.family == family)
            .map(|b| b.rule.clone())
            .collect()
    }
}

/// Serial port defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialDefaults {
    /// Baud rate when the board profile has none
    pub baud_rate: u32,
    /// Data bits
    pub data_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Stop bits
    pub stop_bits: u8,
    /// Flow control
    pub flow_control: SerialFlowControl,
    /// Inbound terminator when the board profile has none
    pub terminator: Terminator,
    /// Ending appended to text commands
    pub line_ending: LineEnding,
}

impl Default for SerialDefaults {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            parity: SerialParity::None,
            stop_bits: 1,
            flow_control: SerialFlowControl::None,
            terminator: Terminator::Auto,
            line_ending: LineEnding::Lf,
        }
    }
}

impl SerialDefaults {
    /// Port parameters for a path
    pub fn serial_config(&self, port: &str, baud_rate: u32) -> SerialConfig {
        SerialConfig::new(port, baud_rate)
            .data_bits(self.data_bits)
            .parity(self.parity)
            .stop_bits(self.stop_bits)
            .flow_control(self.flow_control)
    }
}

/// When discovered ports are opened automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoConnect {
    /// Only on request
    Never,
    /// Ports that match a registry entry
    #[default]
    Known,
    /// Every port
    Always,
}

impl AutoConnect {
    /// Get name of policy
    pub fn name(&self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Known => "known",
            Self::Always => "always",
        }
    }
}

impl std::str::FromStr for AutoConnect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "never" => Ok(Self::Never),
            "known" => Ok(Self::Known),
            "always" => Ok(Self::Always),
            other => Err(format!("unknown auto-connect policy '{other}'")),
        }
    }
}

/// Discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Time between scans
    pub scan_interval_ms: u64,
    /// Auto-connect policy
    pub auto_connect: AutoConnect,
    /// How long a port may be missing before it counts as detached
    pub detach_grace_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 2000,
            auto_connect: AutoConnect::Known,
            detach_grace_ms: 0,
        }
    }
}

impl DiscoveryConfig {
    /// Scan interval as a duration
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Detach grace as a duration
    pub fn detach_grace(&self) -> Duration {
        Duration::from_millis(self.detach_grace_ms)
    }
}

/// Session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Quiet period before a session reports `Idle` (0 disables)
    pub idle_after_ms: u64,
    /// Longest inbound line
    pub max_line_len: usize,
    /// Upper bound for closing a session
    pub close_timeout_ms: u64,
    /// Wait out the board's boot delay before the first write
    pub apply_boot_delay: bool,
    /// Reopen the saved connections when the engine starts
    pub restore_on_start: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_after_ms: 1000,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            close_timeout_ms: 2000,
            apply_boot_delay: true,
            restore_on_start: false,
        }
    }
}

impl SessionConfig {
    /// Idle threshold, `None` when disabled
    pub fn idle_after(&self) -> Option<Duration> {
        (self.idle_after_ms > 0).then(|| Duration::from_millis(self.idle_after_ms))
    }

    /// Close timeout as a duration
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-subscriber queue of display subscribers; the oldest events are
    /// dropped when it is full
    pub display_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            display_queue_capacity: 1024,
        }
    }
}

/// Script settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptingConfig {
    /// Write timeout of `send` steps without their own
    pub send_timeout_ms: u64,
    /// Where relative script paths are looked up
    pub script_dir: Option<PathBuf>,
    /// Longest a whole script may run (0 disables)
    pub max_execution_ms: u64,
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 5000,
            script_dir: super::script_dir(),
            max_execution_ms: 60_000,
        }
    }
}

impl ScriptingConfig {
    /// Script run limit, `None` when disabled
    pub fn max_execution(&self) -> Option<Duration> {
        (self.max_execution_ms > 0).then(|| Duration::from_millis(self.max_execution_ms))
    }

    /// Resolve a script path against the script directory
    pub fn resolve(&self, path: &Path) -> PathBuf {
        match &self.script_dir {
            Some(dir) if path.is_relative() && !path.exists() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// Command library settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// JSON file holding macros and favorites
    pub library: Option<PathBuf>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            library: super::data_dir().map(|d| d.join("commands.json")),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `boardmon_core=debug`
    pub level: String,
    /// Emit JSON lines
    pub json: bool,
    /// Also write to this file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

/// Registry settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Extra JSON device database merged over the built-in table
    pub device_db: Option<PathBuf>,
}

/// Extraction rule, optionally limited to one board family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleBinding {
    /// Family the rule applies to; every session when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<BoardFamily>,
    /// The rule
    #[serde(flatten)]
    pub rule: ExtractionRule,
}
