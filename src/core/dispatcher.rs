//! Command dispatch
//!
//! [`Dispatcher::submit`] queues a payload on a session's write loop and,
//! when the request carries a response pattern, arms a matcher on the
//! session's inbound lines before the payload is queued. The returned
//! [`CommandHandle`] resolves with the first matching line, or with
//! `CommandTimeout` once the request's deadline passes. A timed-out matcher
//! is retired with the handle, so a late line can never resolve it.

use crate::core::error::{EngineError, Result};
use crate::core::framing::{parse_payload, LineEnding};
use crate::core::macros::{CommandLibrary, MacroStep};
use crate::core::matcher::LinePattern;
use crate::core::session::{Direction, RawLine, SessionId, SessionTable, WriteAck};
use crate::core::waiters::WaiterGuard;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default time a command may take, write and response included
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum remembered submissions
pub const MAX_HISTORY: usize = 100;

/// Outbound command
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Target session
    pub session_id: SessionId,
    /// Bytes to write, line ending included
    pub payload: Bytes,
    /// Response to wait for
    pub response: Option<LinePattern>,
    /// Deadline for write and response together
    pub timeout: Duration,
}

impl CommandRequest {
    /// Fire-and-forget request for raw bytes
    pub fn new(session_id: SessionId, payload: impl Into<Bytes>) -> Self {
        Self {
            session_id,
            payload: payload.into(),
            response: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Request from command text (`\x` hex, `\b` binary, else text plus `line_ending`)
    pub fn parse(session_id: SessionId, command: &str, line_ending: LineEnding) -> Result<Self> {
        Ok(Self::new(session_id, parse_payload(command, line_ending)?))
    }

    /// Wait for a line matching `pattern`
    #[must_use]
    pub fn expect(mut self, pattern: LinePattern) -> Self {
        self.response = Some(pattern);
        self
    }

    /// Set timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Outcome of a completed command
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    /// Session the command went to
    pub session_id: SessionId,
    /// Write completion time
    pub written_at: DateTime<Utc>,
    /// Matching line, when a response pattern was given
    pub response: Option<RawLine>,
}

struct PendingMatch {
    _guard: WaiterGuard<RawLine>,
    rx: oneshot::Receiver<RawLine>,
    pattern: LinePattern,
}

/// Pending command
pub struct CommandHandle {
    session_id: SessionId,
    port_id: String,
    timeout: Duration,
    deadline: Instant,
    written: oneshot::Receiver<WriteAck>,
    matcher: Option<PendingMatch>,
}

impl CommandHandle {
    /// Session the command went to
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Wait for the write and, if requested, the response
    pub async fn wait(self) -> Result<CommandResult> {
        let Self {
            session_id,
            port_id,
            timeout,
            deadline,
            written,
            matcher,
        } = self;

        let timed_out = |what: &str| EngineError::CommandTimeout {
            pattern: what.to_string(),
            timeout,
        };
        let what = matcher
            .as_ref()
            .map_or_else(|| "write completion".to_string(), |m| m.pattern.to_string());

        let written_at = match tokio::time::timeout_at(deadline, written).await {
            Err(_) => return Err(timed_out(&what)),
            Ok(Err(_)) => return Err(EngineError::SessionNotConnected(port_id)),
            Ok(Ok(ack)) => ack?,
        };

        let response = match matcher {
            None => None,
            Some(PendingMatch { _guard, rx, pattern }) => {
                match tokio::time::timeout_at(deadline, rx).await {
                    Err(_) => {
                        debug!("No response matching '{}' on {}", pattern, port_id);
                        return Err(timed_out(&what));
                    }
                    Ok(Err(_)) => return Err(EngineError::SessionNotConnected(port_id)),
                    Ok(Ok(line)) => Some(line),
                }
            }
        };

        Ok(CommandResult {
            session_id,
            written_at,
            response,
        })
    }
}

/// One remembered submission
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    /// Target session
    pub session_id: SessionId,
    /// Target port
    pub port_id: String,
    /// Payload as text
    pub payload: String,
    /// Submission time
    pub submitted_at: DateTime<Utc>,
}

/// Routes command requests to session write loops
pub struct Dispatcher {
    sessions: Arc<SessionTable>,
    history: Mutex<VecDeque<HistoryEntry>>,
    schedules: Mutex<HashMap<Uuid, CancellationToken>>,
    library: Mutex<CommandLibrary>,
}

impl Dispatcher {
    /// Create dispatcher over a session table
    pub fn new(sessions: Arc<SessionTable>) -> Self {
        Self {
            sessions,
            history: Mutex::new(VecDeque::with_capacity(MAX_HISTORY)),
            schedules: Mutex::new(HashMap::new()),
            library: Mutex::new(CommandLibrary::default()),
        }
    }

    /// Queue a request. Fails at once if the session is not open.
    pub fn submit(&self, request: CommandRequest) -> Result<CommandHandle> {
        let session = self
            .sessions
            .get(request.session_id)
            .ok_or_else(|| EngineError::UnknownSession(request.session_id.to_string()))?;
        if !session.state().is_connected() {
            return Err(EngineError::SessionNotConnected(session.port_id().to_string()));
        }

        let deadline = Instant::now() + request.timeout;

        // Armed before the write is queued so a fast reply cannot slip past
        let matcher = request.response.map(|pattern| {
            let armed = pattern.clone();
            let (guard, rx) = session
                .line_waiters()
                .register(move |line: &RawLine| line.direction == Direction::Inbound && armed.is_match(&line.content));
            PendingMatch {
                _guard: guard,
                rx,
                pattern,
            }
        });

        let written = session.enqueue(request.payload.clone())?;
        self.remember(request.session_id, session.port_id(), &request.payload);

        Ok(CommandHandle {
            session_id: request.session_id,
            port_id: session.port_id().to_string(),
            timeout: request.timeout,
            deadline,
            written,
            matcher,
        })
    }

    /// Submit and wait
    pub async fn execute(&self, request: CommandRequest) -> Result<CommandResult> {
        self.submit(request)?.wait().await
    }

    /// Send the same payload to every open session. Sessions that cannot
    /// take it are reported in the result, the others still get it.
    pub fn broadcast(&self, payload: &Bytes) -> Vec<(SessionId, Result<CommandHandle>)> {
        self.sessions
            .open_sessions()
            .into_iter()
            .map(|session| {
                let id = session.id();
                (id, self.submit(CommandRequest::new(id, payload.clone())))
            })
            .collect()
    }

    /// Submit `request` after `delay`, then every `repeat` if given, until
    /// cancelled or the session goes away. Returns the schedule id.
    pub fn schedule(self: &Arc<Self>, request: CommandRequest, delay: Duration, repeat: Option<Duration>) -> Uuid {
        let id = Uuid::new_v4();
        let target = request.session_id;
        let cancel = CancellationToken::new();
        self.schedules.lock().insert(id, cancel.clone());

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut wait = delay;
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(wait) => {}
                }

                let outcome = match dispatcher.submit(request.clone()) {
                    Ok(handle) => tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        r = handle.wait() => r.map(|_| ()),
                    },
                    Err(e) => {
                        warn!("Scheduled command {} stopped: {}", id, e);
                        break;
                    }
                };
                if let Err(e) = outcome {
                    warn!("Scheduled command {} failed: {}", id, e);
                }

                match repeat {
                    Some(interval) => wait = interval,
                    None => break,
                }
            }
            dispatcher.schedules.lock().remove(&id);
        });

        info!("Scheduled command {} for {}", id, target);
        id
    }

    /// Stop a scheduled command
    pub fn cancel_schedule(&self, id: Uuid) -> bool {
        match self.schedules.lock().remove(&id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of running schedules
    pub fn schedules(&self) -> Vec<Uuid> {
        self.schedules.lock().keys().copied().collect()
    }

    /// Stop every scheduled command
    pub fn cancel_all_schedules(&self) {
        for (_, cancel) in self.schedules.lock().drain() {
            cancel.cancel();
        }
    }

    /// Macros and favorites
    pub fn library(&self) -> MutexGuard<'_, CommandLibrary> {
        self.library.lock()
    }

    /// Swap in a loaded library
    pub fn replace_library(&self, library: CommandLibrary) {
        *self.library.lock() = library;
    }

    /// Run macro `name` against a session: sends each command and waits
    /// for its write, sleeps on `DELAY:` entries. Stops at the first
    /// failure. Returns how many commands were sent.
    pub async fn run_macro(
        &self,
        name: &str,
        session_id: SessionId,
        line_ending: LineEnding,
        timeout: Duration,
    ) -> Result<usize> {
        let steps = self
            .library
            .lock()
            .get_macro(name)
            .ok_or_else(|| EngineError::UnknownMacro(name.to_string()))?
            .steps()?;

        let mut sent = 0;
        for step in steps {
            match step {
                MacroStep::Delay(pause) => tokio::time::sleep(pause).await,
                MacroStep::Send(command) => {
                    let request = CommandRequest::parse(session_id, &command, line_ending)?.with_timeout(timeout);
                    self.execute(request).await?;
                    sent += 1;
                }
            }
        }
        debug!("Macro '{}' sent {} commands to {}", name, sent, session_id);
        Ok(sent)
    }

    /// Recent submissions, oldest first
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().iter().cloned().collect()
    }

    fn remember(&self, session_id: SessionId, port_id: &str, payload: &Bytes) {
        let mut history = self.history.lock();
        if history.len() == MAX_HISTORY {
            history.pop_front();
        }
        history.push_back(HistoryEntry {
            session_id,
            port_id: port_id.to_string(),
            payload: String::from_utf8_lossy(payload).trim_end().to_string(),
            submitted_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::discovery::Port;
    use crate::core::event::EventBus;
    use crate::core::session::{Session, SessionOptions};
    use crate::core::simulator::{DeviceTemplates, VirtualBus, VirtualDevice};
    use crate::core::transport::PortInfo;
    use tokio::sync::mpsc;

    async fn open(bus: &VirtualBus, table: &SessionTable, path: &str, device: VirtualDevice) -> Arc<Session> {
        bus.plug(PortInfo::new(path), device);
        let mut options = SessionOptions::new(path, 115_200);
        options.idle_after = None;
        let session = Session::new(
            &Port::unclassified(PortInfo::new(path)),
            options,
            Arc::new(EventBus::default()),
        );
        table.insert(Arc::clone(&session)).unwrap();
        let (sink, _lines) = mpsc::unbounded_channel();
        session.start(bus, sink).await.unwrap();
        session
    }

    fn ping(session_id: SessionId) -> CommandRequest {
        CommandRequest::parse(session_id, "PING", LineEnding::CrLf).unwrap()
    }

    #[tokio::test]
    async fn test_response_resolves_command() {
        let bus = VirtualBus::new();
        let table = Arc::new(SessionTable::new());
        let session = open(&bus, &table, "/dev/ttyD0", DeviceTemplates::ping_pong()).await;
        let dispatcher = Dispatcher::new(Arc::clone(&table));

        let result = dispatcher
            .execute(ping(session.id()).expect(LinePattern::literal("PONG").unwrap()))
            .await
            .unwrap();

        let response = result.response.unwrap();
        assert_eq!(response.text(), "PONG");
        assert!(response.timestamp >= result.written_at);
        assert_eq!(dispatcher.history().len(), 1);
        assert_eq!(dispatcher.history()[0].payload, "PING");
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_timeout_retires_matcher() {
        let bus = VirtualBus::new();
        let table = Arc::new(SessionTable::new());
        let session = open(&bus, &table, "/dev/ttyD1", VirtualDevice::new("mute")).await;
        let dispatcher = Dispatcher::new(Arc::clone(&table));

        let request = ping(session.id())
            .expect(LinePattern::literal("PONG").unwrap())
            .with_timeout(Duration::from_millis(100));
        let err = dispatcher.execute(request).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(session.line_waiters().is_empty());
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_not_connected_fails_immediately() {
        let bus = VirtualBus::new();
        let table = Arc::new(SessionTable::new());
        let session = open(&bus, &table, "/dev/ttyD2", DeviceTemplates::echo()).await;
        let dispatcher = Dispatcher::new(Arc::clone(&table));
        session.disconnect().await;

        assert!(matches!(
            dispatcher.submit(ping(session.id())),
            Err(EngineError::SessionNotConnected(_))
        ));
        assert!(matches!(
            dispatcher.submit(ping(Uuid::new_v4())),
            Err(EngineError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_matchers_share_a_line() {
        let bus = VirtualBus::new();
        let table = Arc::new(SessionTable::new());
        let session = open(&bus, &table, "/dev/ttyD3", VirtualDevice::new("mute")).await;
        let dispatcher = Dispatcher::new(Arc::clone(&table));

        let a = dispatcher
            .submit(CommandRequest::new(session.id(), "A\n").expect(LinePattern::new("^READY").unwrap()))
            .unwrap();
        let b = dispatcher
            .submit(CommandRequest::new(session.id(), "B\n").expect(LinePattern::new("READY$").unwrap()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bus.inject("/dev/ttyD3", "READY"));

        let (a, b) = tokio::join!(a.wait(), b.wait());
        assert_eq!(a.unwrap().response.unwrap().text(), "READY");
        assert_eq!(b.unwrap().response.unwrap().text(), "READY");
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_broadcast_and_schedule() {
        let bus = VirtualBus::new();
        let table = Arc::new(SessionTable::new());
        let first = open(&bus, &table, "/dev/ttyD4", DeviceTemplates::echo()).await;
        let second = open(&bus, &table, "/dev/ttyD5", DeviceTemplates::echo()).await;
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&table)));

        let handles = dispatcher.broadcast(&Bytes::from_static(b"HELLO\r\n"));
        assert_eq!(handles.len(), 2);
        for (_, handle) in handles {
            handle.unwrap().wait().await.unwrap();
        }

        let id = dispatcher.schedule(
            CommandRequest::new(first.id(), "TICK\r\n"),
            Duration::from_millis(10),
            Some(Duration::from_millis(20)),
        );
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(dispatcher.cancel_schedule(id));
        assert!(!dispatcher.cancel_schedule(id));

        let ticks = bus.received("/dev/ttyD4").iter().filter(|l| *l == "TICK").count();
        assert!(ticks >= 2, "expected repeated submissions, got {ticks}");
        assert_eq!(bus.received("/dev/ttyD5"), vec!["HELLO".to_string()]);

        first.disconnect().await;
        second.disconnect().await;
    }

    #[test]
    fn test_history_is_bounded() {
        let dispatcher = Dispatcher::new(Arc::new(SessionTable::new()));
        for i in 0..(MAX_HISTORY + 5) {
            dispatcher.remember(Uuid::nil(), "/dev/null", &Bytes::from(format!("CMD{i}\r\n")));
        }
        let history = dispatcher.history();
        assert_eq!(history.len(), MAX_HISTORY);
        assert_eq!(history[0].payload, "CMD5");
    }
}
