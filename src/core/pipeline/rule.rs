//! Extraction rules
//!
//! A rule pairs a line pattern with a value spec. A line that matches the
//! pattern yields one sample, or several for the key/value and JSON specs.

use crate::core::error::Result;
use crate::core::matcher::LinePattern;
use crate::core::session::{RawLine, SessionId};
use chrono::{DateTime, Utc};
use regex::Captures;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capture group reference, by index or by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CaptureGroup {
    /// Numbered group (0 is the whole match)
    Index(usize),
    /// Named group
    Name(String),
}

impl Default for CaptureGroup {
    fn default() -> Self {
        Self::Index(1)
    }
}

impl fmt::Display for CaptureGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Name(n) => write!(f, "'{n}'"),
        }
    }
}

fn whole_match() -> CaptureGroup {
    CaptureGroup::Index(0)
}

fn unit_scale() -> f64 {
    1.0
}

fn default_pair_separator() -> char {
    ','
}

fn default_kv_separator() -> char {
    '='
}

/// How a matching line becomes a value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueSpec {
    /// Capture parsed as a number, then multiplied by `scale`
    Number {
        /// Group holding the number
        #[serde(default)]
        group: CaptureGroup,
        /// Multiplier applied to the parsed value
        #[serde(default = "unit_scale")]
        scale: f64,
    },
    /// Capture kept as text
    Text {
        /// Group holding the text
        #[serde(default)]
        group: CaptureGroup,
    },
    /// 1.0 whenever the pattern matches
    Presence,
    /// `key=value` pairs, one sample per numeric pair
    KeyValue {
        /// Group holding the pairs
        #[serde(default = "whole_match")]
        group: CaptureGroup,
        /// Separator between pairs
        #[serde(default = "default_pair_separator")]
        pair_separator: char,
        /// Separator between key and value
        #[serde(default = "default_kv_separator")]
        kv_separator: char,
    },
    /// JSON object, one sample per numeric field
    Json {
        /// Group holding the object
        #[serde(default = "whole_match")]
        group: CaptureGroup,
    },
}

impl Default for ValueSpec {
    fn default() -> Self {
        Self::Number {
            group: CaptureGroup::default(),
            scale: 1.0,
        }
    }
}

/// Extracted value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// Numeric value
    Number(f64),
    /// Text value
    Text(String),
}

impl MetricValue {
    /// Numeric value, if any
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    /// Text value, if any
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Number(_) => None,
            Self::Text(t) => Some(t),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(v) => write!(f, "{v}"),
            Self::Text(t) => f.write_str(t),
        }
    }
}

/// One structured value derived from a line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    /// Session the line came from
    pub session_id: SessionId,
    /// Metric name
    pub metric: String,
    /// Value
    pub value: MetricValue,
    /// Timestamp of the source line
    pub timestamp: DateTime<Utc>,
}

/// A rule matched but its value was unusable
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionError {
    /// Session the line came from
    pub session_id: SessionId,
    /// Metric the rule produces
    pub metric: String,
    /// Offending line
    pub line: String,
    /// What went wrong
    pub reason: String,
    /// Timestamp of the source line
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (line '{}')", self.metric, self.reason, self.line)
    }
}

/// Pattern-to-value mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRule {
    /// Metric name (prefix for multi-value specs, may be empty there)
    pub metric: String,
    /// Line pattern
    pub pattern: LinePattern,
    /// Value spec
    #[serde(default)]
    pub value: ValueSpec,
}

impl ExtractionRule {
    /// Numeric rule reading capture group 1
    pub fn number(metric: &str, pattern: &str) -> Result<Self> {
        Ok(Self {
            metric: metric.to_string(),
            pattern: LinePattern::new(pattern)?,
            value: ValueSpec::default(),
        })
    }

    /// Text rule reading capture group 1
    pub fn text(metric: &str, pattern: &str) -> Result<Self> {
        Ok(Self {
            metric: metric.to_string(),
            pattern: LinePattern::new(pattern)?,
            value: ValueSpec::Text {
                group: CaptureGroup::default(),
            },
        })
    }

    /// Presence rule
    pub fn presence(metric: &str, pattern: &str) -> Result<Self> {
        Ok(Self {
            metric: metric.to_string(),
            pattern: LinePattern::new(pattern)?,
            value: ValueSpec::Presence,
        })
    }

    /// Replace the value spec
    #[must_use]
    pub fn with_value(mut self, value: ValueSpec) -> Self {
        self.value = value;
        self
    }

    /// Evaluate against one line. A non-matching line yields no samples;
    /// a matching line with an unusable capture yields an error.
    pub fn extract(&self, line: &RawLine) -> std::result::Result<Vec<MetricSample>, ExtractionError> {
        let text = line.text();
        let Some(caps) = self.pattern.captures(&text) else {
            return Ok(Vec::new());
        };

        let sample = |metric: String, value: MetricValue| MetricSample {
            session_id: line.session_id,
            metric,
            value,
            timestamp: line.timestamp,
        };
        let fail = |reason: String| ExtractionError {
            session_id: line.session_id,
            metric: self.metric.clone(),
            line: text.to_string(),
            reason,
            timestamp: line.timestamp,
        };

        match &self.value {
            ValueSpec::Number { group, scale } => {
                let raw = capture(&caps, group).map_err(fail)?;
                let value = parse_number(raw).map_err(fail)?;
                Ok(vec![sample(self.metric.clone(), MetricValue::Number(value * scale))])
            }
            ValueSpec::Text { group } => {
                let raw = capture(&caps, group).map_err(fail)?;
                Ok(vec![sample(self.metric.clone(), MetricValue::Text(raw.to_string()))])
            }
            ValueSpec::Presence => Ok(vec![sample(self.metric.clone(), MetricValue::Number(1.0))]),
            ValueSpec::KeyValue {
                group,
                pair_separator,
                kv_separator,
            } => {
                let raw = capture(&caps, group).map_err(fail)?;
                let pairs = parse_key_value(raw, *pair_separator, *kv_separator);
                if pairs.is_empty() {
                    return Err(fail("no numeric key/value pairs".to_string()));
                }
                Ok(pairs
                    .into_iter()
                    .map(|(key, value)| sample(self.child_name(&key), MetricValue::Number(value)))
                    .collect())
            }
            ValueSpec::Json { group } => {
                let raw = capture(&caps, group).map_err(fail)?;
                let fields = parse_json(raw).map_err(fail)?;
                Ok(fields
                    .into_iter()
                    .map(|(key, value)| sample(self.child_name(&key), MetricValue::Number(value)))
                    .collect())
            }
        }
    }

    fn child_name(&self, key: &str) -> String {
        if self.metric.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.metric, key)
        }
    }
}

fn capture<'t>(caps: &Captures<'t>, group: &CaptureGroup) -> std::result::Result<&'t str, String> {
    let m = match group {
        CaptureGroup::Index(i) => caps.get(*i),
        CaptureGroup::Name(n) => caps.name(n),
    };
    m.map(|m| m.as_str())
        .ok_or_else(|| format!("capture group {group} did not match"))
}

fn parse_number(raw: &str) -> std::result::Result<f64, String> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("'{raw}' is not a number"))?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(format!("'{raw}' is not a finite number"))
    }
}

fn parse_key_value(text: &str, pair_separator: char, kv_separator: char) -> Vec<(String, f64)> {
    let mut result = Vec::new();

    for pair in text.split(pair_separator) {
        let parts: Vec<&str> = pair.split(kv_separator).collect();
        if parts.len() == 2 {
            let key = parts[0].trim();
            if key.is_empty() {
                continue;
            }
            if let Ok(value) = parse_number(parts[1]) {
                result.push((key.to_string(), value));
            }
        }
    }

    result
}

fn parse_json(text: &str) -> std::result::Result<Vec<(String, f64)>, String> {
    let obj: serde_json::Value =
        serde_json::from_str(text.trim()).map_err(|e| format!("invalid JSON: {e}"))?;
    let map = obj
        .as_object()
        .ok_or_else(|| "JSON value is not an object".to_string())?;

    let result: Vec<_> = map
        .iter()
        .filter_map(|(key, value)| value.as_f64().map(|num| (key.clone(), num)))
        .collect();

    if result.is_empty() {
        Err("no numeric fields in JSON object".to_string())
    } else {
        Ok(result)
    }
}
