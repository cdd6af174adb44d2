//! Script task definitions
//!
//! A [`ScriptTask`] is a named list of [`Step`]s. Tasks are built in code
//! with [`ScriptBuilder`] or loaded from TOML, JSON or YAML files.

use super::condition::{Condition, MetricPredicate};
use crate::config::ConfigError;
use crate::core::framing::LineEnding;
use crate::core::matcher::LinePattern;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// One script step
///
/// `session` fields take a session id or a port path; a port path resolves
/// to the session currently bound to that port when the step runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Write a command
    Send {
        /// Target session
        session: String,
        /// Command text (`\x` hex and `\b` binary prefixes allowed)
        payload: String,
        /// Line ending, defaulting to the engine's
        #[serde(default)]
        line_ending: Option<LineEnding>,
        /// Response the send itself waits for
        #[serde(default)]
        expect: Option<LinePattern>,
        /// Timeout for write and response
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Wait for an inbound line
    WaitForLine {
        /// Session to watch
        session: String,
        /// Pattern the line must match
        pattern: LinePattern,
        /// Give up after this long
        timeout_ms: u64,
    },
    /// Wait for a metric sample
    WaitForMetric {
        /// Session to watch
        session: String,
        /// Metric name
        metric: String,
        /// Test the value must pass
        #[serde(default)]
        predicate: MetricPredicate,
        /// Give up after this long
        timeout_ms: u64,
    },
    /// Pause
    Sleep {
        /// Pause length
        ms: u64,
    },
    /// Fail the task unless a condition holds
    Assert {
        /// Condition
        condition: Condition,
        /// Failure message
        #[serde(default)]
        message: Option<String>,
    },
}

impl Step {
    /// Step kind as used in serialized scripts
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::WaitForLine { .. } => "wait_for_line",
            Self::WaitForMetric { .. } => "wait_for_metric",
            Self::Sleep { .. } => "sleep",
            Self::Assert { .. } => "assert",
        }
    }

    /// Whether the step suspends its task
    pub fn is_wait(&self) -> bool {
        matches!(
            self,
            Self::WaitForLine { .. } | Self::WaitForMetric { .. } | Self::Sleep { .. }
        )
    }

    /// Session a wait step watches
    pub(crate) fn waits_on(&self) -> Option<&str> {
        match self {
            Self::WaitForLine { session, .. } | Self::WaitForMetric { session, .. } => Some(session),
            _ => None,
        }
    }
}

/// Automation task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptTask {
    /// Task name
    pub name: String,
    /// Longest the whole task may run, overriding the engine setting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_ms: Option<u64>,
    /// Steps, run in order
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl ScriptTask {
    /// Create empty task
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_execution_ms: None,
            steps: Vec::new(),
        }
    }

    /// Load a task; the format follows the file extension
    /// (`toml`, `json`, `yaml`/`yml`)
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let mut task: Self = match ext.as_str() {
            "toml" => toml::from_str(&content)?,
            "json" => serde_json::from_str(&content)?,
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unsupported script format '{other}' ({})",
                    path.display()
                )))
            }
        };

        if task.name.is_empty() {
            task.name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("script")
                .to_string();
        }
        Ok(task)
    }
}

/// Task builder with fluent API
pub struct ScriptBuilder {
    task: ScriptTask,
}

impl ScriptBuilder {
    /// Start a task
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            task: ScriptTask::new(name),
        }
    }

    /// Send a command
    #[must_use]
    pub fn send(mut self, session: &str, payload: &str) -> Self {
        self.task.steps.push(Step::Send {
            session: session.to_string(),
            payload: payload.to_string(),
            line_ending: None,
            expect: None,
            timeout_ms: None,
        });
        self
    }

    /// Send a command and wait for its response
    #[must_use]
    pub fn send_expect(mut self, session: &str, payload: &str, expect: LinePattern, timeout: Duration) -> Self {
        self.task.steps.push(Step::Send {
            session: session.to_string(),
            payload: payload.to_string(),
            line_ending: None,
            expect: Some(expect),
            timeout_ms: Some(millis(timeout)),
        });
        self
    }

    /// Wait for a line
    #[must_use]
    pub fn wait_for_line(mut self, session: &str, pattern: LinePattern, timeout: Duration) -> Self {
        self.task.steps.push(Step::WaitForLine {
            session: session.to_string(),
            pattern,
            timeout_ms: millis(timeout),
        });
        self
    }

    /// Wait for a metric
    #[must_use]
    pub fn wait_for_metric(
        mut self,
        session: &str,
        metric: &str,
        predicate: MetricPredicate,
        timeout: Duration,
    ) -> Self {
        self.task.steps.push(Step::WaitForMetric {
            session: session.to_string(),
            metric: metric.to_string(),
            predicate,
            timeout_ms: millis(timeout),
        });
        self
    }

    /// Add delay
    #[must_use]
    pub fn sleep(mut self, duration: Duration) -> Self {
        self.task.steps.push(Step::Sleep { ms: millis(duration) });
        self
    }

    /// Assert a condition
    #[must_use]
    pub fn assert(mut self, condition: Condition, message: &str) -> Self {
        self.task.steps.push(Step::Assert {
            condition,
            message: Some(message.to_string()),
        });
        self
    }

    /// Limit the run time of the whole task
    #[must_use]
    pub fn max_execution(mut self, limit: Duration) -> Self {
        self.task.max_execution_ms = Some(millis(limit));
        self
    }

    /// Build task
    pub fn build(self) -> ScriptTask {
        self.task
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, not yet scheduled
    Pending,
    /// Executing a step
    Running,
    /// Suspended in a wait or sleep step
    Waiting,
    /// All steps done
    Completed,
    /// A step failed
    Failed,
    /// Cancelled
    Cancelled,
}

impl TaskState {
    /// Task has finished
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Get name of state
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Progress of a task
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    /// Task id
    pub id: Uuid,
    /// Task name
    pub name: String,
    /// Current state
    pub state: TaskState,
    /// Index of the step being run (or the failing step)
    pub current_step: usize,
    /// Number of steps
    pub total_steps: usize,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Finish time
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure message
    pub error: Option<String>,
}
