//! Script conditions
//!
//! Predicates over metric values and the boolean conditions `assert` steps
//! evaluate. Conditions read engine state through [`ConditionContext`] so
//! they can be checked against a live engine or a fixed test context.

use crate::core::error::EngineError;
use crate::core::matcher::LinePattern;
use crate::core::pipeline::MetricValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Test applied to a metric value
///
/// Written as a short expression: `>100`, `<=3.3`, `==1`, `!=0`,
/// `10..20` (inclusive range), `=armed` (text equality) or `*` (any value).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MetricPredicate {
    /// Any value
    #[default]
    Any,
    /// Greater than
    Gt(f64),
    /// Greater than or equal
    Ge(f64),
    /// Less than
    Lt(f64),
    /// Less than or equal
    Le(f64),
    /// Numerically equal
    Eq(f64),
    /// Numerically different
    Ne(f64),
    /// Inclusive range
    Between(f64, f64),
    /// Text equality
    TextEquals(String),
}

impl MetricPredicate {
    /// Check a value
    pub fn matches(&self, value: &MetricValue) -> bool {
        if let Self::TextEquals(expected) = self {
            return match value {
                MetricValue::Text(t) => t == expected,
                MetricValue::Number(n) => expected.parse::<f64>().is_ok_and(|e| (e - n).abs() < f64::EPSILON),
            };
        }
        if matches!(self, Self::Any) {
            return true;
        }

        let Some(v) = value.as_f64() else {
            return false;
        };
        match *self {
            Self::Gt(x) => v > x,
            Self::Ge(x) => v >= x,
            Self::Lt(x) => v < x,
            Self::Le(x) => v <= x,
            Self::Eq(x) => (v - x).abs() < f64::EPSILON,
            Self::Ne(x) => (v - x).abs() >= f64::EPSILON,
            Self::Between(lo, hi) => v >= lo && v <= hi,
            Self::Any | Self::TextEquals(_) => true,
        }
    }
}

impl FromStr for MetricPredicate {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || EngineError::InvalidPattern {
            pattern: s.to_string(),
            reason: "expected a predicate like '>100', '10..20' or '=text'".to_string(),
        };
        let number = |t: &str| t.trim().parse::<f64>().map_err(|_| invalid());

        if s.is_empty() || s == "*" || s.eq_ignore_ascii_case("any") {
            return Ok(Self::Any);
        }
        if let Some((lo, hi)) = s.split_once("..") {
            let (lo, hi) = (number(lo)?, number(hi)?);
            return if lo <= hi { Ok(Self::Between(lo, hi)) } else { Err(invalid()) };
        }

        // Longest operators first
        for (op, make) in [
            (">=", Self::Ge as fn(f64) -> Self),
            ("<=", Self::Le),
            ("==", Self::Eq),
            ("!=", Self::Ne),
            (">", Self::Gt),
            ("<", Self::Lt),
        ] {
            if let Some(rest) = s.strip_prefix(op) {
                return number(rest).map(make);
            }
        }
        if let Some(rest) = s.strip_prefix('=') {
            return Ok(Self::TextEquals(rest.trim().to_string()));
        }
        Err(invalid())
    }
}

impl TryFrom<String> for MetricPredicate {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MetricPredicate> for String {
    fn from(predicate: MetricPredicate) -> Self {
        predicate.to_string()
    }
}

impl fmt::Display for MetricPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Gt(x) => write!(f, ">{x}"),
            Self::Ge(x) => write!(f, ">={x}"),
            Self::Lt(x) => write!(f, "<{x}"),
            Self::Le(x) => write!(f, "<={x}"),
            Self::Eq(x) => write!(f, "=={x}"),
            Self::Ne(x) => write!(f, "!={x}"),
            Self::Between(lo, hi) => write!(f, "{lo}..{hi}"),
            Self::TextEquals(t) => write!(f, "={t}"),
        }
    }
}

/// Engine state a condition can look at
pub trait ConditionContext {
    /// Latest value of a metric on a session (id or port path)
    fn latest_metric(&self, session: &str, metric: &str) -> Option<MetricValue>;
    /// Most recent inbound line of a session
    fn last_line(&self, session: &str) -> Option<String>;
    /// Whether a session is open
    fn is_connected(&self, session: &str) -> bool;
}

/// Condition checked by `assert` steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Latest value of a metric satisfies a predicate
    Metric {
        /// Session id or port path
        session: String,
        /// Metric name
        metric: String,
        /// Predicate
        predicate: MetricPredicate,
    },
    /// Most recent line matches a pattern
    LastLine {
        /// Session id or port path
        session: String,
        /// Pattern
        pattern: LinePattern,
    },
    /// Session is open
    Connected {
        /// Session id or port path
        session: String,
    },
    /// Negation
    Not {
        /// Negated condition
        condition: Box<Condition>,
    },
    /// Every condition holds
    All {
        /// Conditions
        conditions: Vec<Condition>,
    },
    /// At least one condition holds
    Any {
        /// Conditions
        conditions: Vec<Condition>,
    },
    /// Always true
    Always,
}

impl Condition {
    /// Metric condition
    pub fn metric(session: &str, metric: &str, predicate: MetricPredicate) -> Self {
        Self::Metric {
            session: session.to_string(),
            metric: metric.to_string(),
            predicate,
        }
    }

    /// Evaluate condition against context
    pub fn evaluate(&self, context: &dyn ConditionContext) -> bool {
        match self {
            Self::Metric {
                session,
                metric,
                predicate,
            } => context
                .latest_metric(session, metric)
                .is_some_and(|v| predicate.matches(&v)),
            Self::LastLine { session, pattern } => context
                .last_line(session)
                .is_some_and(|l| pattern.is_match_str(&l)),
            Self::Connected { session } => context.is_connected(session),
            Self::Not { condition } => !condition.evaluate(context),
            Self::All { conditions } => conditions.iter().all(|c| c.evaluate(context)),
            Self::Any { conditions } => conditions.iter().any(|c| c.evaluate(context)),
            Self::Always => true,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metric {
                session,
                metric,
                predicate,
            } => write!(f, "{session}:{metric} {predicate}"),
            Self::LastLine { session, pattern } => write!(f, "{session} last line ~ /{pattern}/"),
            Self::Connected { session } => write!(f, "{session} connected"),
            Self::Not { condition } => write!(f, "not {condition}"),
            Self::All { conditions } => write_joined(f, conditions, " and "),
            Self::Any { conditions } => write_joined(f, conditions, " or "),
            Self::Always => f.write_str("always"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, conditions: &[Condition], sep: &str) -> fmt::Result {
    f.write_str("(")?;
    for (i, c) in conditions.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{c}")?;
    }
    f.write_str(")")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Fixed {
        metrics: HashMap<(String, String), MetricValue>,
        line: Option<String>,
        connected: bool,
    }

    impl ConditionContext for Fixed {
        fn latest_metric(&self, session: &str, metric: &str) -> Option<MetricValue> {
            self.metrics.get(&(session.to_string(), metric.to_string())).cloned()
        }

        fn last_line(&self, _session: &str) -> Option<String> {
            self.line.clone()
        }

        fn is_connected(&self, _session: &str) -> bool {
            self.connected
        }
    }

    #[test]
    fn test_predicate_parsing() {
        assert_eq!(">100".parse::<MetricPredicate>().unwrap(), MetricPredicate::Gt(100.0));
        assert_eq!(">= 3.3".parse::<MetricPredicate>().unwrap(), MetricPredicate::Ge(3.3));
        assert_eq!("10..20".parse::<MetricPredicate>().unwrap(), MetricPredicate::Between(10.0, 20.0));
        assert_eq!("=armed".parse::<MetricPredicate>().unwrap(), MetricPredicate::TextEquals("armed".into()));
        assert_eq!("*".parse::<MetricPredicate>().unwrap(), MetricPredicate::Any);
        assert!("~5".parse::<MetricPredicate>().is_err());
        assert!("20..10".parse::<MetricPredicate>().is_err());
        assert!(">abc".parse::<MetricPredicate>().is_err());
    }

    #[test]
    fn test_predicate_display_parses_back() {
        for text in [">100", "<=2.5", "!=0", "1..2", "=on", "*"] {
            let predicate: MetricPredicate = text.parse().unwrap();
            assert_eq!(predicate.to_string().parse::<MetricPredicate>().unwrap(), predicate);
        }
    }

    #[test]
    fn test_predicate_matching() {
        let gt = MetricPredicate::Gt(100.0);
        assert!(gt.matches(&MetricValue::Number(120.0)));
        assert!(!gt.matches(&MetricValue::Number(45.0)));
        assert!(!gt.matches(&MetricValue::Text("120".into())));
        assert!(MetricPredicate::TextEquals("on".into()).matches(&MetricValue::Text("on".into())));
        assert!(MetricPredicate::Any.matches(&MetricValue::Text("x".into())));
    }

    #[test]
    fn test_condition_evaluation() {
        let mut metrics = HashMap::new();
        metrics.insert(("dev".to_string(), "temp".to_string()), MetricValue::Number(120.0));
        let ctx = Fixed {
            metrics,
            line: Some("STATUS OK".to_string()),
            connected: true,
        };

        let hot = Condition::metric("dev", "temp", MetricPredicate::Gt(100.0));
        assert!(hot.evaluate(&ctx));
        assert!(!Condition::metric("dev", "hum", MetricPredicate::Any).evaluate(&ctx));

        let all = Condition::All {
            conditions: vec![
                hot.clone(),
                Condition::Connected { session: "dev".into() },
                Condition::LastLine {
                    session: "dev".into(),
                    pattern: LinePattern::new("OK$").unwrap(),
                },
            ],
        };
        assert!(all.evaluate(&ctx));
        assert!(!Condition::Not { condition: Box::new(all) }.evaluate(&ctx));
        assert_eq!(hot.to_string(), "dev:temp >100");
    }

    #[test]
    fn test_condition_deserializes() {
        let json = r#"{"kind": "all", "conditions": [
            {"kind": "metric", "session": "/dev/ttyACM0", "metric": "temp", "predicate": ">100"},
            {"kind": "connected", "session": "/dev/ttyACM0"}
        ]}"#;
        let condition: Condition = serde_json::from_str(json).unwrap();
        match condition {
            Condition::All { conditions } => assert_eq!(conditions.len(), 2),
            other => panic!("unexpected condition {other:?}"),
        }
    }
}
