//! Command macros and favorites
//!
//! A macro is a named list of command texts run in order against one
//! session. An entry of the form `DELAY:<seconds>` pauses instead of
//! sending. Favorites are single commands kept for quick reuse. Both live
//! in a [`CommandLibrary`], stored as JSON next to the other user data.

use crate::config::ConfigError;
use crate::core::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Prefix of pause entries
pub const DELAY_PREFIX: &str = "DELAY:";

/// One parsed macro entry
#[derive(Debug, Clone, PartialEq)]
pub enum MacroStep {
    /// Command text to send
    Send(String),
    /// Pause
    Delay(Duration),
}

impl MacroStep {
    /// Parse one macro entry
    pub fn parse(entry: &str) -> Result<Self> {
        let Some(seconds) = entry.strip_prefix(DELAY_PREFIX) else {
            return Ok(Self::Send(entry.to_string()));
        };
        seconds
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .map(Self::Delay)
            .ok_or_else(|| EngineError::InvalidMacro(format!("bad delay '{entry}'")))
    }
}

/// Named command sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMacro {
    /// Macro name
    pub name: String,
    /// Entries, run in order
    pub commands: Vec<String>,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Last change
    pub last_modified: DateTime<Utc>,
}

impl CommandMacro {
    /// Parsed entries
    pub fn steps(&self) -> Result<Vec<MacroStep>> {
        self.commands.iter().map(|c| MacroStep::parse(c)).collect()
    }

    /// Number of entries that send something
    pub fn command_count(&self) -> usize {
        self.commands.iter().filter(|c| !c.starts_with(DELAY_PREFIX)).count()
    }
}

/// Saved single command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Favorite {
    /// Command text
    pub command: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// When it was added
    pub added: DateTime<Utc>,
}

/// Macros and favorites
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandLibrary {
    macros: BTreeMap<String, CommandMacro>,
    favorites: Vec<Favorite>,
}

impl CommandLibrary {
    /// Load a library file
    pub fn load_file(path: &Path) -> std::result::Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let library: Self = serde_json::from_str(&content)?;
        for m in library.macros.values() {
            m.steps().map_err(|e| ConfigError::Invalid(format!("macro '{}': {e}", m.name)))?;
        }
        Ok(library)
    }

    /// Write the library to a file
    pub fn save_file(&self, path: &Path) -> std::result::Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Add a macro. Names are unique and entries must parse.
    pub fn create_macro(&mut self, name: &str, commands: Vec<String>, description: &str) -> Result<()> {
        if self.macros.contains_key(name) {
            return Err(EngineError::InvalidMacro(format!("macro '{name}' already exists")));
        }
        for entry in &commands {
            MacroStep::parse(entry)?;
        }
        let now = Utc::now();
        self.macros.insert(
            name.to_string(),
            CommandMacro {
                name: name.to_string(),
                commands,
                description: description.to_string(),
                created: now,
                last_modified: now,
            },
        );
        Ok(())
    }

    /// Change the entries and/or description of a macro
    pub fn update_macro(
        &mut self,
        name: &str,
        commands: Option<Vec<String>>,
        description: Option<&str>,
    ) -> Result<()> {
        if let Some(commands) = &commands {
            for entry in commands {
                MacroStep::parse(entry)?;
            }
        }
        let existing = self
            .macros
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownMacro(name.to_string()))?;
        if let Some(commands) = commands {
            existing.commands = commands;
        }
        if let Some(description) = description {
            existing.description = description.to_string();
        }
        existing.last_modified = Utc::now();
        Ok(())
    }

    /// Remove a macro
    pub fn delete_macro(&mut self, name: &str) -> Result<CommandMacro> {
        self.macros
            .remove(name)
            .ok_or_else(|| EngineError::UnknownMacro(name.to_string()))
    }

    /// Look up a macro
    pub fn get_macro(&self, name: &str) -> Option<&CommandMacro> {
        self.macros.get(name)
    }

    /// Every macro, by name
    pub fn macros(&self) -> impl Iterator<Item = &CommandMacro> {
        self.macros.values()
    }

    /// Add a favorite. Returns false if the command is already one.
    pub fn add_favorite(&mut self, command: &str, description: &str) -> bool {
        if self.favorites.iter().any(|f| f.command == command) {
            return false;
        }
        self.favorites.push(Favorite {
            command: command.to_string(),
            description: description.to_string(),
            added: Utc::now(),
        });
        true
    }

    /// Remove the favorite at `index`
    pub fn remove_favorite(&mut self, index: usize) -> Option<Favorite> {
        (index < self.favorites.len()).then(|| self.favorites.remove(index))
    }

    /// Favorites in the order they were added
    pub fn favorites(&self) -> &[Favorite] {
        &self.favorites
    }
}
