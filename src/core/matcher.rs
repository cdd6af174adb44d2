//! Line patterns
//!
//! Response matchers, script waits and extraction rules all match lines
//! with a [`LinePattern`]: a compiled regular expression that remembers its
//! source so it can be serialized and shown back to the user.

use crate::core::error::{EngineError, Result};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Compiled line pattern
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LinePattern {
    source: String,
    regex: Regex,
}

impl LinePattern {
    /// Compile a regular expression
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| EngineError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Pattern matching `text` literally anywhere in the line
    pub fn literal(text: &str) -> Result<Self> {
        Self::new(&regex::escape(text))
    }

    /// Pattern source
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Check if a line matches
    pub fn is_match(&self, line: &[u8]) -> bool {
        self.regex.is_match(&lossy(line))
    }

    /// Check if text matches
    pub fn is_match_str(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// Capture groups of the first match in `text`
    pub fn captures<'t>(&self, text: &'t str) -> Option<Captures<'t>> {
        self.regex.captures(text)
    }

    /// Underlying regex
    pub fn regex(&self) -> &Regex {
        &self.regex
    }
}

pub(crate) fn lossy(line: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(line)
}

impl PartialEq for LinePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl fmt::Debug for LinePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinePattern({:?})", self.source)
    }
}

impl fmt::Display for LinePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for LinePattern {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<LinePattern> for String {
    fn from(pattern: LinePattern) -> Self {
        pattern.source
    }
}

impl std::str::FromStr for LinePattern {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}
