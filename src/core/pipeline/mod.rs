//! Data pipeline
//!
//! Turns inbound lines into [`MetricSample`]s. Every attached session has
//! its own worker fed by the session's read loop, so lines of one session
//! are evaluated in arrival order and never block another session.
//!
//! Rules are kept per session as an immutable snapshot. Each line is
//! evaluated against the snapshot current when evaluation starts, so a
//! concurrent [`DataPipeline::replace_rules`] never produces a line
//! evaluated against a mix of old and new rules.

mod rule;

pub use rule::{CaptureGroup, ExtractionError, ExtractionRule, MetricSample, MetricValue, ValueSpec};

use crate::core::error::{EngineError, Result};
use crate::core::event::{EngineEvent, EventBus};
use crate::core::registry::BoardFamily;
use crate::core::session::{Direction, RawLine, SessionId};
use crate::core::waiters::{WaiterGuard, WaiterSet};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Rules applied to a session when it is attached
#[derive(Debug, Clone, Default)]
struct DefaultRules {
    global: Vec<ExtractionRule>,
    by_family: HashMap<BoardFamily, Vec<ExtractionRule>>,
}

struct SessionPipeline {
    rules: RwLock<Arc<Vec<ExtractionRule>>>,
    waiters: WaiterSet<MetricSample>,
    latest: RwLock<BTreeMap<String, MetricSample>>,
}

/// Rule evaluation for all sessions
pub struct DataPipeline {
    bus: Arc<EventBus>,
    defaults: RwLock<DefaultRules>,
    sessions: RwLock<HashMap<SessionId, Arc<SessionPipeline>>>,
}

impl DataPipeline {
    /// Create pipeline with no rules
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            defaults: RwLock::new(DefaultRules::default()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Set the rules new sessions start with. `None` sets the rules for
    /// every board; a family sets extra rules for boards of that family.
    pub fn set_default_rules(&self, family: Option<BoardFamily>, rules: Vec<ExtractionRule>) {
        let mut defaults = self.defaults.write();
        match family {
            None => defaults.global = rules,
            Some(family) => {
                defaults.by_family.insert(family, rules);
            }
        }
    }

    /// Rules a new session of `family` starts with
    pub fn default_rules_for(&self, family: BoardFamily) -> Vec<ExtractionRule> {
        let defaults = self.defaults.read();
        let mut rules = defaults.global.clone();
        if let Some(extra) = defaults.by_family.get(&family) {
            rules.extend(extra.iter().cloned());
        }
        rules
    }

    /// Attach a session and spawn its worker. Lines sent on the returned
    /// channel are evaluated in order; the session is detached once the
    /// channel closes.
    pub fn attach(self: &Arc<Self>, session_id: SessionId, family: BoardFamily) -> mpsc::UnboundedSender<RawLine> {
        let rules = self.default_rules_for(family);
        debug!("Pipeline attached to {} with {} rules", session_id, rules.len());

        let entry = Arc::new(SessionPipeline {
            rules: RwLock::new(Arc::new(rules)),
            waiters: WaiterSet::new(),
            latest: RwLock::new(BTreeMap::new()),
        });
        self.sessions.write().insert(session_id, entry);

        let (tx, mut rx) = mpsc::unbounded_channel::<RawLine>();
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                pipeline.process_line(&line);
            }
            pipeline.detach(session_id);
        });
        tx
    }

    /// Drop a session's rules and fail its pending metric waiters
    pub fn detach(&self, session_id: SessionId) {
        if let Some(entry) = self.sessions.write().remove(&session_id) {
            entry.waiters.close();
            debug!("Pipeline detached from {}", session_id);
        }
    }

    /// Whether a session is attached
    pub fn is_attached(&self, session_id: SessionId) -> bool {
        self.sessions.read().contains_key(&session_id)
    }

    /// Replace a session's rules. Takes effect from the next line.
    pub fn replace_rules(&self, session_id: SessionId, rules: Vec<ExtractionRule>) -> Result<()> {
        let entry = self.entry(session_id)?;
        debug!("Replacing rules for {} ({} rules)", session_id, rules.len());
        *entry.rules.write() = Arc::new(rules);
        Ok(())
    }

    /// Current rules of a session
    pub fn rules(&self, session_id: SessionId) -> Result<Vec<ExtractionRule>> {
        let entry = self.entry(session_id)?;
        let rules = entry.rules.read().iter().cloned().collect();
        Ok(rules)
    }

    /// Wait for a sample of `session_id` satisfying `predicate`. The
    /// receiver errors if the session is detached first.
    pub fn register_waiter<F>(
        &self,
        session_id: SessionId,
        predicate: F,
    ) -> Result<(WaiterGuard<MetricSample>, oneshot::Receiver<MetricSample>)>
    where
        F: Fn(&MetricSample) -> bool + Send + 'static,
    {
        let entry = self.entry(session_id)?;
        Ok(entry.waiters.register(predicate))
    }

    /// Most recent sample of a metric
    pub fn latest(&self, session_id: SessionId, metric: &str) -> Option<MetricSample> {
        let sessions = self.sessions.read();
        let entry = sessions.get(&session_id)?;
        let latest = entry.latest.read();
        latest.get(metric).cloned()
    }

    /// Most recent sample of every metric, ordered by name
    pub fn latest_all(&self, session_id: SessionId) -> Vec<MetricSample> {
        self.sessions
            .read()
            .get(&session_id)
            .map(|entry| entry.latest.read().values().cloned().collect())
            .unwrap_or_default()
    }

    /// Evaluate one line against its session's rules. Returns the number
    /// of samples produced.
    pub fn process_line(&self, line: &RawLine) -> usize {
        if line.direction != Direction::Inbound {
            return 0;
        }
        let Some(entry) = self.sessions.read().get(&line.session_id).cloned() else {
            return 0;
        };

        // One snapshot for the whole line
        let rules = Arc::clone(&entry.rules.read());
        let mut produced = 0;

        for rule in rules.iter() {
            match rule.extract(line) {
                Ok(samples) => {
                    for sample in samples {
                        trace!("{} {} = {}", sample.session_id, sample.metric, sample.value);
                        entry.waiters.offer(&sample);
                        entry.latest.write().insert(sample.metric.clone(), sample.clone());
                        self.bus.publish(EngineEvent::MetricSample(sample));
                        produced += 1;
                    }
                }
                Err(err) => {
                    warn!("Extraction failed for {}: {}", line.session_id, err);
                    self.bus.publish(EngineEvent::ExtractionError(err));
                }
            }
        }

        produced
    }

    fn entry(&self, session_id: SessionId) -> Result<Arc<SessionPipeline>> {
        self.sessions
            .read()
            .get(&session_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))
    }
}
