//! Configuration module
//!
//! Handles engine settings and the platform directories they live in

mod settings;

pub use settings::{
    AppConfig, AutoConnect, CommandsConfig, DiscoveryConfig, LoggingConfig, PipelineConfig, RegistryConfig, RuleBinding,
    ScriptingConfig, SerialDefaults, SessionConfig,
};

use directories::ProjectDirs;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration and data file errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed TOML
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// Value could not be written as TOML
    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Malformed JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed YAML
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Well-formed but unusable content
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "boardmon", "Boardmon")
}

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the application data directory
pub fn data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

/// Get the default script directory
pub fn script_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("scripts"))
}

/// Get the log directory
pub fn log_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("logs"))
}

/// Initialize application directories
pub fn init_directories() -> std::io::Result<()> {
    for dir in [config_dir(), data_dir(), script_dir(), log_dir()].into_iter().flatten() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(())
}
