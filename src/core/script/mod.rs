//! Scripting engine
//!
//! Every [`ScriptTask`] runs as its own tokio task. Steps of one task run in
//! order; different tasks progress independently, also against the same
//! session. Wait and sleep steps suspend only their task and every
//! suspension point also watches the task's cancellation token, so a
//! cancelled task stops at once, drops its waiters and sends nothing more.
//!
//! A `send` step directly followed by a wait on the same session arms the
//! wait before the command is written, so a reply that arrives while the
//! send is still completing is not missed.

mod condition;
mod task;

pub use condition::{Condition, ConditionContext, MetricPredicate};
pub use task::{ScriptBuilder, ScriptTask, Step, TaskState, TaskStatus};

use crate::core::dispatcher::{CommandRequest, Dispatcher};
use crate::core::error::{EngineError, Result};
use crate::core::event::{EngineEvent, EventBus};
use crate::core::framing::LineEnding;
use crate::core::pipeline::{DataPipeline, MetricSample, MetricValue};
use crate::core::session::{Direction, RawLine, Session, SessionTable};
use crate::core::waiters::WaiterGuard;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Script engine settings
#[derive(Debug, Clone)]
pub struct ScriptSettings {
    /// Timeout of `send` steps that do not set one
    pub send_timeout: Duration,
    /// Line ending of `send` steps that do not set one
    pub line_ending: LineEnding,
    /// Longest a task may run when it sets no limit of its own
    pub max_execution: Option<Duration>,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            line_ending: LineEnding::Lf,
            max_execution: None,
        }
    }
}

/// A wait registered ahead of its step
enum Armed {
    Line(WaiterGuard<RawLine>, oneshot::Receiver<RawLine>),
    Metric(WaiterGuard<MetricSample>, oneshot::Receiver<MetricSample>),
}

struct TaskEntry {
    cancel: CancellationToken,
    status: watch::Receiver<TaskStatus>,
}

/// Runs script tasks against the engine's sessions
pub struct ScriptEngine {
    sessions: Arc<SessionTable>,
    dispatcher: Arc<Dispatcher>,
    pipeline: Arc<DataPipeline>,
    bus: Arc<EventBus>,
    settings: ScriptSettings,
    tasks: Mutex<HashMap<Uuid, TaskEntry>>,
}

impl ScriptEngine {
    /// Create script engine
    pub fn new(
        sessions: Arc<SessionTable>,
        dispatcher: Arc<Dispatcher>,
        pipeline: Arc<DataPipeline>,
        bus: Arc<EventBus>,
        settings: ScriptSettings,
    ) -> Self {
        Self {
            sessions,
            dispatcher,
            pipeline,
            bus,
            settings,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Schedule a task and return its id
    pub fn start_task(self: &Arc<Self>, task: ScriptTask) -> Uuid {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(TaskStatus {
            id,
            name: task.name.clone(),
            state: TaskState::Pending,
            current_step: 0,
            total_steps: task.steps.len(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        });

        self.tasks.lock().insert(
            id,
            TaskEntry {
                cancel: cancel.clone(),
                status: status_rx,
            },
        );
        self.publish(&status_tx.borrow());

        info!("Starting script '{}' ({} steps) as {}", task.name, task.steps.len(), id);
        tokio::spawn(Arc::clone(self).run_task(task, cancel, status_tx));
        id
    }

    /// Request cancellation. Returns false for unknown or finished tasks.
    pub fn cancel_task(&self, id: Uuid) -> bool {
        let tasks = self.tasks.lock();
        match tasks.get(&id) {
            Some(entry) if !entry.status.borrow().state.is_finished() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every running task
    pub fn cancel_all(&self) {
        for entry in self.tasks.lock().values() {
            entry.cancel.cancel();
        }
    }

    /// Current status of a task
    pub fn task_status(&self, id: Uuid) -> Option<TaskStatus> {
        self.tasks.lock().get(&id).map(|e| e.status.borrow().clone())
    }

    /// Status of every task, oldest first
    pub fn tasks(&self) -> Vec<TaskStatus> {
        let mut all: Vec<_> = self
            .tasks
            .lock()
            .values()
            .map(|e| e.status.borrow().clone())
            .collect();
        all.sort_by_key(|s| s.started_at);
        all
    }

    /// Wait until a task finishes and return its final status
    pub async fn wait(&self, id: Uuid) -> Result<TaskStatus> {
        let mut status = self
            .tasks
            .lock()
            .get(&id)
            .map(|e| e.status.clone())
            .ok_or(EngineError::UnknownTask(id))?;

        let finished = status
            .wait_for(|s| s.state.is_finished())
            .await
            .map(|s| s.clone())
            .ok();
        // Sender gone: the runner ended, its last status is final
        Ok(finished.unwrap_or_else(|| status.borrow().clone()))
    }

    /// Forget finished tasks
    pub fn prune(&self) -> usize {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, e| !e.status.borrow().state.is_finished());
        before - tasks.len()
    }

    fn publish(&self, status: &TaskStatus) {
        self.bus.publish(EngineEvent::TaskStateChanged {
            task_id: status.id,
            name: status.name.clone(),
            state: status.state,
            error: status.error.clone(),
        });
    }

    /// Apply a change; state changes reach the event bus before watchers
    fn update(&self, status: &watch::Sender<TaskStatus>, f: impl FnOnce(&mut TaskStatus)) {
        let mut next = status.borrow().clone();
        let before = next.state;
        f(&mut next);
        if next.state != before {
            self.publish(&next);
        }
        status.send_replace(next);
    }

    async fn run_task(
        self: Arc<Self>,
        task: ScriptTask,
        cancel: CancellationToken,
        status: watch::Sender<TaskStatus>,
    ) {
        let mut armed: Option<Armed> = None;
        let mut outcome = Ok(());
        let limit = task
            .max_execution_ms
            .map(Duration::from_millis)
            .or(self.settings.max_execution)
            .map(|limit| (tokio::time::Instant::now() + limit, limit));
        let overran = |limit: Duration| EngineError::ScriptTimeout {
            what: format!("script '{}' to finish", task.name),
            timeout: limit,
        };

        for (index, step) in task.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome = Err(EngineError::ScriptCancelled);
                break;
            }
            if let Some((deadline, limit)) = limit {
                if tokio::time::Instant::now() >= deadline {
                    outcome = Err(overran(limit));
                    break;
                }
            }
            let state = if step.is_wait() { TaskState::Waiting } else { TaskState::Running };
            self.update(&status, |s| {
                s.current_step = index;
                s.state = state;
            });
            debug!("Script '{}' step {}: {}", task.name, index + 1, step.kind());

            let next = task.steps.get(index + 1);
            let running = self.run_step(step, next, &mut armed, &cancel);
            let result = match limit {
                Some((deadline, limit)) => tokio::time::timeout_at(deadline, running)
                    .await
                    .unwrap_or_else(|_| Err(overran(limit))),
                None => running.await,
            };
            if let Err(e) = result {
                outcome = Err(e);
                break;
            }
        }
        drop(armed);

        let (state, error) = match outcome {
            Ok(()) => (TaskState::Completed, None),
            Err(EngineError::ScriptCancelled) => (TaskState::Cancelled, None),
            Err(e) => (TaskState::Failed, Some(e.to_string())),
        };
        match &error {
            Some(e) => warn!("Script '{}' failed: {}", task.name, e),
            None => info!("Script '{}' {}", task.name, state),
        }
        self.update(&status, |s| {
            s.state = state;
            s.error = error;
            s.finished_at = Some(Utc::now());
        });
    }

    async fn run_step(
        &self,
        step: &Step,
        next: Option<&Step>,
        armed: &mut Option<Armed>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match step {
            Step::Send {
                session,
                payload,
                line_ending,
                expect,
                timeout_ms,
            } => {
                let target = self.sessions.resolve(session)?;
                // Selectors may name the session by id or by port path
                let same_session = |n: &&Step| {
                    n.waits_on()
                        .and_then(|sel| self.sessions.resolve(sel).ok())
                        .is_some_and(|s| s.id() == target.id())
                };
                if let Some(next) = next.filter(same_session) {
                    *armed = Some(self.arm(next, &target)?);
                }

                let mut request = CommandRequest::parse(
                    target.id(),
                    payload,
                    line_ending.unwrap_or(self.settings.line_ending),
                )?
                .with_timeout(timeout_ms.map_or(self.settings.send_timeout, Duration::from_millis));
                if let Some(pattern) = expect {
                    request = request.expect(pattern.clone());
                }

                let handle = self.dispatcher.submit(request)?;
                cancellable(cancel, handle.wait()).await.map(|_| ())
            }
            Step::WaitForLine {
                session,
                pattern,
                timeout_ms,
            } => {
                let (_guard, rx) = match armed.take() {
                    Some(Armed::Line(guard, rx)) => (guard, rx),
                    _ => {
                        let target = self.sessions.resolve(session)?;
                        let pattern = pattern.clone();
                        target.line_waiters().register(move |line: &RawLine| {
                            line.direction == Direction::Inbound && pattern.is_match(&line.content)
                        })
                    }
                };
                let what = format!("line matching '{pattern}' on {session}");
                wait_for(cancel, rx, *timeout_ms, what, session).await.map(|_| ())
            }
            Step::WaitForMetric {
                session,
                metric,
                predicate,
                timeout_ms,
            } => {
                let (_guard, rx) = match armed.take() {
                    Some(Armed::Metric(guard, rx)) => (guard, rx),
                    _ => {
                        let target = self.sessions.resolve(session)?;
                        self.metric_waiter(&target, metric, predicate)?
                    }
                };
                let what = format!("{metric} {predicate} on {session}");
                wait_for(cancel, rx, *timeout_ms, what, session).await.map(|_| ())
            }
            Step::Sleep { ms } => {
                cancellable(cancel, async {
                    tokio::time::sleep(Duration::from_millis(*ms)).await;
                    Ok(())
                })
                .await
            }
            Step::Assert { condition, message } => {
                if condition.evaluate(self) {
                    Ok(())
                } else {
                    Err(EngineError::ScriptAssertionFailed(
                        message.clone().unwrap_or_else(|| condition.to_string()),
                    ))
                }
            }
        }
    }

    fn arm(&self, step: &Step, target: &Session) -> Result<Armed> {
        match step {
            Step::WaitForLine { pattern, .. } => {
                let pattern = pattern.clone();
                let (guard, rx) = target.line_waiters().register(move |line: &RawLine| {
                    line.direction == Direction::Inbound && pattern.is_match(&line.content)
                });
                Ok(Armed::Line(guard, rx))
            }
            Step::WaitForMetric { metric, predicate, .. } => {
                let (guard, rx) = self.metric_waiter(target, metric, predicate)?;
                Ok(Armed::Metric(guard, rx))
            }
            other => Err(EngineError::InvalidPayload(format!(
                "step '{}' cannot be armed",
                other.kind()
            ))),
        }
    }

    fn metric_waiter(
        &self,
        target: &Session,
        metric: &str,
        predicate: &MetricPredicate,
    ) -> Result<(WaiterGuard<MetricSample>, oneshot::Receiver<MetricSample>)> {
        let metric = metric.to_string();
        let predicate = predicate.clone();
        self.pipeline
            .register_waiter(target.id(), move |s: &MetricSample| {
                s.metric == metric && predicate.matches(&s.value)
            })
            .map_err(|_| EngineError::SessionNotConnected(target.port_id().to_string()))
    }
}

impl ConditionContext for ScriptEngine {
    fn latest_metric(&self, session: &str, metric: &str) -> Option<MetricValue> {
        let target = self.sessions.resolve(session).ok()?;
        self.pipeline.latest(target.id(), metric).map(|s| s.value)
    }

    fn last_line(&self, session: &str) -> Option<String> {
        let target = self.sessions.resolve(session).ok()?;
        target.last_line().map(|l| l.text().into_owned())
    }

    fn is_connected(&self, session: &str) -> bool {
        self.sessions
            .resolve(session)
            .is_ok_and(|s| s.state().is_connected())
    }
}

async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(EngineError::ScriptCancelled),
        r = fut => r,
    }
}

async fn wait_for<T>(
    cancel: &CancellationToken,
    rx: oneshot::Receiver<T>,
    timeout_ms: u64,
    what: String,
    session: &str,
) -> Result<T> {
    let timeout = Duration::from_millis(timeout_ms);
    cancellable(cancel, async move {
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(EngineError::ScriptTimeout { what, timeout }),
            Ok(Err(_)) => Err(EngineError::SessionNotConnected(session.to_string())),
            Ok(Ok(item)) => Ok(item),
        }
    })
    .await
}
