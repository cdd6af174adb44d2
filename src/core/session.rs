//! Session management for connected boards
//!
//! A Session is the runtime binding to one open port. It owns the port
//! through two independent loops:
//!
//! - the read loop reassembles bytes into [`RawLine`]s, stamps each with the
//!   arrival time of its terminator and hands it to response matchers, the
//!   data pipeline and the event bus, in that order, before reading on
//! - the write loop drains a FIFO of write jobs, so commands for one session
//!   are written strictly in submission order
//!
//! Any I/O error on either loop moves the session to `Error` and tears it
//! down. `disconnect()` and a port detach are the other ways out.

use crate::core::discovery::Port;
use crate::core::error::{EngineError, PortFault, Result};
use crate::core::event::{EngineEvent, EventBus};
use crate::core::framing::{LineFramer, Terminator, DEFAULT_MAX_LINE_LEN};
use crate::core::registry::BoardFamily;
use crate::core::state_machine::SessionStateMachine;
use crate::core::transport::{PortOpener, SerialConfig};
use crate::core::waiters::WaiterSet;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Serialize, Serializer};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use crate::core::state_machine::SessionState;

/// Session identifier
pub type SessionId = Uuid;

const READ_BUFFER_SIZE: usize = 1024;

/// Line direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from the board
    Inbound,
    /// Sent to the board
    Outbound,
}

/// One terminator-delimited unit of received or sent bytes
#[derive(Debug, Clone, Serialize)]
pub struct RawLine {
    /// Owning session
    pub session_id: SessionId,
    /// Arrival time of the terminator (inbound) or write completion (outbound)
    pub timestamp: DateTime<Utc>,
    /// Line bytes without terminator
    #[serde(serialize_with = "serialize_lossy")]
    pub content: Bytes,
    /// Direction
    pub direction: Direction,
}

impl RawLine {
    /// Line content as text, invalid UTF-8 replaced
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

fn serialize_lossy<S: Serializer>(content: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(content))
}

/// Per-session traffic counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    /// Bytes received
    pub bytes_in: u64,
    /// Bytes written
    pub bytes_out: u64,
    /// Lines received
    pub lines_in: u64,
    /// Writes completed
    pub lines_out: u64,
    /// I/O errors
    pub errors: u64,
}

/// Session parameters, fixed at creation
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Port parameters
    pub serial: SerialConfig,
    /// Inbound line terminator
    pub terminator: Terminator,
    /// Longest line kept before a forced flush
    pub max_line_len: usize,
    /// Quiet period after which the session is reported `Idle`
    pub idle_after: Option<Duration>,
    /// Delay before the write loop starts draining
    pub boot_delay: Duration,
    /// Upper bound for the loops to stop on disconnect
    pub close_timeout: Duration,
}

impl SessionOptions {
    /// Options with defaults for a port path and baud rate
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            serial: SerialConfig::new(port, baud_rate),
            terminator: Terminator::Auto,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            idle_after: Some(Duration::from_secs(1)),
            boot_delay: Duration::ZERO,
            close_timeout: Duration::from_secs(2),
        }
    }
}

/// Snapshot of a session for display
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session id
    pub id: SessionId,
    /// Port path
    pub port_id: String,
    /// Board name, or "unknown device"
    pub board: String,
    /// Board family
    pub family: BoardFamily,
    /// Current state
    pub state: SessionState,
    /// Port parameters
    pub serial: SerialConfig,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last byte received or written
    pub last_activity_at: DateTime<Utc>,
    /// Traffic counters
    pub stats: SessionStats,
    /// Failure cause, if the session failed
    pub failure: Option<String>,
}

/// Wall clock anchored to a monotonic origin, so line stamps never go back
struct LineClock {
    wall: DateTime<Utc>,
    origin: Instant,
}

impl LineClock {
    fn new() -> Self {
        Self {
            wall: Utc::now(),
            origin: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }
}

pub(crate) type WriteAck = Result<DateTime<Utc>>;

struct WriteJob {
    payload: Bytes,
    done: oneshot::Sender<WriteAck>,
}

/// Active session
pub struct Session {
    id: SessionId,
    port_id: String,
    board: String,
    family: BoardFamily,
    options: SessionOptions,
    created_at: DateTime<Utc>,
    clock: LineClock,
    machine: Mutex<SessionStateMachine>,
    last_activity: RwLock<DateTime<Utc>>,
    last_line: RwLock<Option<RawLine>>,
    stats: RwLock<SessionStats>,
    failure: RwLock<Option<String>>,
    bus: Arc<EventBus>,
    line_waiters: WaiterSet<RawLine>,
    write_tx: mpsc::UnboundedSender<WriteJob>,
    write_rx: Mutex<Option<mpsc::UnboundedReceiver<WriteJob>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Create a session for `port` in the `Connecting` state.
    /// Nothing is opened until [`Session::start`].
    pub fn new(port: &Port, options: SessionOptions, bus: Arc<EventBus>) -> Arc<Self> {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let now = Utc::now();

        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            port_id: port.id.clone(),
            board: port.label().to_string(),
            family: port.family(),
            options,
            created_at: now,
            clock: LineClock::new(),
            machine: Mutex::new(SessionStateMachine::new()),
            last_activity: RwLock::new(now),
            last_line: RwLock::new(None),
            stats: RwLock::new(SessionStats::default()),
            failure: RwLock::new(None),
            bus,
            line_waiters: WaiterSet::new(),
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        session.set_state(SessionState::Connecting, None);
        session
    }

    /// Get session ID
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Port path
    pub fn port_id(&self) -> &str {
        &self.port_id
    }

    /// Board family
    pub fn family(&self) -> BoardFamily {
        self.family
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.machine.lock().state()
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Most recent inbound line
    pub fn last_line(&self) -> Option<RawLine> {
        self.last_line.read().clone()
    }

    /// Failure cause, if the session failed
    pub fn failure(&self) -> Option<String> {
        self.failure.read().clone()
    }

    /// Snapshot for display
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            port_id: self.port_id.clone(),
            board: self.board.clone(),
            family: self.family,
            state: self.state(),
            serial: self.options.serial.clone(),
            created_at: self.created_at,
            last_activity_at: *self.last_activity.read(),
            stats: self.stats.read().clone(),
            failure: self.failure(),
        }
    }

    pub(crate) fn line_waiters(&self) -> &WaiterSet<RawLine> {
        &self.line_waiters
    }

    /// Open the port and start both loops. Inbound lines are forwarded to
    /// `sink` after response matchers have seen them.
    ///
    /// An open failure leaves the session in `Error`; there is no retry.
    pub async fn start(
        self: &Arc<Self>,
        opener: &dyn PortOpener,
        sink: mpsc::UnboundedSender<RawLine>,
    ) -> Result<()> {
        let handle = match opener.open(&self.options.serial).await {
            Ok(handle) => handle,
            Err(e) => {
                let err = EngineError::port_unavailable(&self.port_id, &e);
                self.fail(&e.to_string());
                return Err(err);
            }
        };

        // A disconnect may have raced with the open
        if !self.set_state(SessionState::Connected, None) {
            return Err(self.not_connected());
        }

        let Some(write_rx) = self.write_rx.lock().take() else {
            return Err(self.not_connected());
        };

        let reader = tokio::spawn(Arc::clone(self).read_loop(handle.reader, sink));
        let writer = tokio::spawn(Arc::clone(self).write_loop(handle.writer, write_rx));
        self.tasks.lock().extend([reader, writer]);

        info!(
            "Session {} opened on {} ({}, {})",
            self.id,
            self.port_id,
            self.board,
            self.options.serial.summary()
        );
        Ok(())
    }

    /// Queue a payload on the write loop
    pub(crate) fn enqueue(&self, payload: Bytes) -> Result<oneshot::Receiver<WriteAck>> {
        if !self.state().is_connected() {
            return Err(self.not_connected());
        }
        let (done, rx) = oneshot::channel();
        self.write_tx
            .send(WriteJob { payload, done })
            .map_err(|_| self.not_connected())?;
        Ok(rx)
    }

    /// Close the session. Calling it on a session that already ended is a no-op.
    pub async fn disconnect(&self) {
        self.close("disconnect requested").await;
    }

    /// Forced close, e.g. when the port vanished
    pub async fn close(&self, reason: &str) {
        if self.set_state(SessionState::Disconnected, Some(reason)) {
            info!("Session {} on {} closed: {}", self.id, self.port_id, reason);
        }
        self.stop_io();

        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.options.close_timeout, handle).await.is_err() {
                warn!("Session {} loop did not stop in time, aborting", self.id);
                abort.abort();
            }
        }
    }

    fn not_connected(&self) -> EngineError {
        EngineError::SessionNotConnected(self.port_id.clone())
    }

    fn stop_io(&self) {
        self.cancel.cancel();
        self.line_waiters.close();
    }

    /// Apply a transition and publish it. Returns false if the table rejects it.
    fn set_state(&self, to: SessionState, reason: Option<&str>) -> bool {
        let mut machine = self.machine.lock();
        match machine.transition(to, reason) {
            Ok(transition) => {
                debug!("Session {}: {} -> {}", self.id, transition.from, transition.to);
                self.bus.publish(EngineEvent::SessionStateChanged {
                    session_id: self.id,
                    port_id: self.port_id.clone(),
                    from: transition.from,
                    to: transition.to,
                    reason: transition.reason,
                    timestamp: transition.timestamp,
                });
                true
            }
            Err(_) => false,
        }
    }

    fn fail(&self, cause: &str) {
        if self.set_state(SessionState::Error, Some(cause)) {
            *self.failure.write() = Some(cause.to_string());
            self.stats.write().errors += 1;
            error!("Session {} on {} failed: {}", self.id, self.port_id, cause);
            self.bus.publish(EngineEvent::SessionFailed {
                session_id: self.id,
                port_id: self.port_id.clone(),
                cause: cause.to_string(),
            });
        }
        self.stop_io();
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        sink: mpsc::UnboundedSender<RawLine>,
    ) {
        self.set_state(SessionState::Streaming, None);

        let mut framer = LineFramer::new(self.options.terminator.clone(), self.options.max_line_len);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let idle_after = self.options.idle_after;

        loop {
            let read = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                r = read_chunk(&mut reader, &mut buf, idle_after) => r,
            };

            match read {
                None => {
                    self.set_state(SessionState::Idle, None);
                }
                Some(Ok(0)) => {
                    if let Some(rest) = framer.flush() {
                        self.emit_inbound(rest, self.clock.now(), &sink);
                    }
                    self.fail("port closed (end of stream)");
                    break;
                }
                Some(Ok(n)) => {
                    // One stamp per chunk: every terminator in it arrived now
                    let now = self.clock.now();
                    *self.last_activity.write() = now;
                    self.stats.write().bytes_in += n as u64;
                    if self.state() == SessionState::Idle {
                        self.set_state(SessionState::Streaming, None);
                    }
                    for line in framer.push(&buf[..n]) {
                        self.emit_inbound(line, now, &sink);
                    }
                }
                Some(Err(e)) => {
                    self.fail(&format!("read error: {e}"));
                    break;
                }
            }
        }

        debug!("Read loop for {} stopped", self.port_id);
    }

    fn emit_inbound(&self, content: Bytes, timestamp: DateTime<Utc>, sink: &mpsc::UnboundedSender<RawLine>) {
        let line = RawLine {
            session_id: self.id,
            timestamp,
            content,
            direction: Direction::Inbound,
        };

        self.stats.write().lines_in += 1;
        *self.last_line.write() = Some(line.clone());

        self.line_waiters.offer(&line);
        // The pipeline worker only goes away during teardown
        let _ = sink.send(line.clone());
        self.bus.publish(EngineEvent::RawLine(line));
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: Box<dyn AsyncWrite + Send + Unpin>,
        mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    ) {
        let boot_delay = self.options.boot_delay;
        let ready = if boot_delay.is_zero() {
            true
        } else {
            debug!("Waiting {:?} for {} to boot", boot_delay, self.port_id);
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => false,
                () = tokio::time::sleep(boot_delay) => true,
            }
        };

        while ready {
            let job = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let written = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    let _ = job.done.send(Err(self.not_connected()));
                    break;
                }
                r = write_payload(&mut writer, &job.payload) => r,
            };

            match written {
                Ok(()) => {
                    let now = self.clock.now();
                    *self.last_activity.write() = now;
                    {
                        let mut stats = self.stats.write();
                        stats.bytes_out += job.payload.len() as u64;
                        stats.lines_out += 1;
                    }
                    self.bus.publish(EngineEvent::RawLine(RawLine {
                        session_id: self.id,
                        timestamp: now,
                        content: strip_line_ending(&job.payload),
                        direction: Direction::Outbound,
                    }));
                    let _ = job.done.send(Ok(now));
                }
                Err(e) => {
                    let reason = format!("write error: {e}");
                    let _ = job.done.send(Err(EngineError::IoFailure {
                        session: self.id,
                        reason: reason.clone(),
                    }));
                    self.fail(&reason);
                    break;
                }
            }
        }

        jobs.close();
        while let Ok(job) = jobs.try_recv() {
            let _ = job.done.send(Err(self.not_connected()));
        }
        debug!("Write loop for {} stopped", self.port_id);
    }
}

async fn read_chunk(
    reader: &mut Box<dyn AsyncRead + Send + Unpin>,
    buf: &mut [u8],
    idle_after: Option<Duration>,
) -> Option<std::io::Result<usize>> {
    match idle_after {
        Some(idle) => tokio::time::timeout(idle, reader.read(buf)).await.ok(),
        None => Some(reader.read(buf).await),
    }
}

async fn write_payload(
    writer: &mut Box<dyn AsyncWrite + Send + Unpin>,
    payload: &[u8],
) -> std::io::Result<()> {
    writer.write_all(payload).await?;
    writer.flush().await
}

fn strip_line_ending(payload: &Bytes) -> Bytes {
    let mut end = payload.len();
    while end > 0 && matches!(payload[end - 1], b'\r' | b'\n') {
        end -= 1;
    }
    payload.slice(..end)
}

/// All sessions known to the engine
///
/// Enforces at most one live session per port. Ended sessions stay
/// visible until pruned or replaced by a new session on the same port.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionTable {
    /// Create empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, rejecting it if its port already has a live one
    pub fn insert(&self, session: Arc<Session>) -> Result<()> {
        let mut sessions = self.sessions.write();

        let busy = sessions
            .values()
            .any(|s| s.port_id() == session.port_id() && !s.state().is_terminal());
        if busy {
            return Err(EngineError::PortUnavailable {
                port: session.port_id().to_string(),
                fault: PortFault::InUse,
                reason: "a session is already open on this port".to_string(),
            });
        }

        sessions.retain(|_, s| s.port_id() != session.port_id());
        sessions.insert(session.id(), session);
        Ok(())
    }

    /// Get session by id
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Live session on a port
    pub fn by_port(&self, port_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .find(|s| s.port_id() == port_id && !s.state().is_terminal())
            .cloned()
    }

    /// Resolve a session id or port path. A port with only an ended
    /// session resolves to that session.
    pub fn resolve(&self, selector: &str) -> Result<Arc<Session>> {
        if let Ok(id) = Uuid::parse_str(selector) {
            return self
                .get(id)
                .ok_or_else(|| EngineError::UnknownSession(selector.to_string()));
        }

        let sessions = self.sessions.read();
        let mut candidates: Vec<_> = sessions.values().filter(|s| s.port_id() == selector).collect();
        candidates.sort_by_key(|s| (!s.state().is_terminal(), s.created_at()));
        candidates
            .last()
            .map(|s| Arc::clone(s))
            .ok_or_else(|| EngineError::UnknownSession(selector.to_string()))
    }

    /// Sessions whose port is open
    pub fn open_sessions(&self) -> Vec<Arc<Session>> {
        let mut open: Vec<_> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.state().is_connected())
            .cloned()
            .collect();
        open.sort_by_key(|s| s.created_at());
        open
    }

    /// All sessions, oldest first
    pub fn all(&self) -> Vec<Arc<Session>> {
        let mut all: Vec<_> = self.sessions.read().values().cloned().collect();
        all.sort_by_key(|s| s.created_at());
        all
    }

    /// Remove a session
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.write().remove(&id)
    }

    /// Drop ended sessions, returning how many were removed
    pub fn prune(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !s.state().is_terminal());
        before - sessions.len()
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{PortHandle, PortInfo, TransportError};
    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    /// Opener handing out one pre-made duplex end
    struct OneShotOpener {
        stream: Mutex<Option<DuplexStream>>,
    }

    impl OneShotOpener {
        fn new() -> (Self, DuplexStream) {
            let (host, device) = tokio::io::duplex(1024);
            (
                Self {
                    stream: Mutex::new(Some(host)),
                },
                device,
            )
        }
    }

    #[async_trait]
    impl PortOpener for OneShotOpener {
        async fn open(&self, config: &SerialConfig) -> std::result::Result<PortHandle, TransportError> {
            self.stream
                .lock()
                .take()
                .map(PortHandle::from_stream)
                .ok_or_else(|| TransportError::PortInUse(config.port.clone()))
        }
    }

    fn port(path: &str) -> Port {
        Port::unclassified(PortInfo::new(path))
    }

    fn options(path: &str) -> SessionOptions {
        let mut options = SessionOptions::new(path, 115_200);
        options.idle_after = None;
        options
    }

    #[tokio::test]
    async fn test_lines_reach_sink_in_order_with_monotonic_stamps() {
        let bus = Arc::new(EventBus::default());
        let (opener, mut device) = OneShotOpener::new();
        let session = Session::new(&port("/dev/ttyT0"), options("/dev/ttyT0"), bus);
        let (sink, mut lines) = mpsc::unbounded_channel();

        session.start(&opener, sink).await.unwrap();
        device.write_all(b"a\r\nb\nc").await.unwrap();
        device.write_all(b"\r\n").await.unwrap();

        let mut last = None;
        for expected in ["a", "b", "c"] {
            let line = lines.recv().await.unwrap();
            assert_eq!(line.text(), expected);
            assert_eq!(line.direction, Direction::Inbound);
            if let Some(prev) = last {
                assert!(line.timestamp >= prev);
            }
            last = Some(line.timestamp);
        }
        assert!(session.state().is_connected());
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_writes_are_fifo() {
        let bus = Arc::new(EventBus::default());
        let (opener, mut device) = OneShotOpener::new();
        let session = Session::new(&port("/dev/ttyT1"), options("/dev/ttyT1"), bus);
        let (sink, _lines) = mpsc::unbounded_channel();
        session.start(&opener, sink).await.unwrap();

        let acks: Vec<_> = (0..5)
            .map(|i| session.enqueue(Bytes::from(format!("{i};"))).unwrap())
            .collect();
        for ack in acks {
            ack.await.unwrap().unwrap();
        }

        let mut buf = [0u8; 10];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"0;1;2;3;4;");
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_eof_fails_session() {
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe_lossless();
        let (opener, device) = OneShotOpener::new();
        let session = Session::new(&port("/dev/ttyT2"), options("/dev/ttyT2"), bus);
        let (sink, _lines) = mpsc::unbounded_channel();
        session.start(&opener, sink).await.unwrap();

        drop(device);

        loop {
            if let EngineEvent::SessionFailed { session_id, .. } = events.recv().await.unwrap() {
                assert_eq!(session_id, session.id());
                break;
            }
        }
        assert_eq!(session.state(), SessionState::Error);
        assert!(session.failure().is_some());
        assert!(session.enqueue(Bytes::from_static(b"x")).is_err());
    }

    #[tokio::test]
    async fn test_open_failure_goes_to_error() {
        let bus = Arc::new(EventBus::default());
        let (opener, _device) = OneShotOpener::new();
        opener.stream.lock().take();

        let session = Session::new(&port("/dev/ttyT3"), options("/dev/ttyT3"), bus);
        let (sink, _lines) = mpsc::unbounded_channel();
        let err = session.start(&opener, sink).await.unwrap_err();

        assert!(matches!(
            err,
            EngineError::PortUnavailable {
                fault: PortFault::InUse,
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let bus = Arc::new(EventBus::default());
        let (opener, _device) = OneShotOpener::new();
        let session = Session::new(&port("/dev/ttyT4"), options("/dev/ttyT4"), bus);
        let (sink, _lines) = mpsc::unbounded_channel();
        session.start(&opener, sink).await.unwrap();

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_idle_and_back() {
        let bus = Arc::new(EventBus::default());
        let (opener, mut device) = OneShotOpener::new();
        let mut opts = options("/dev/ttyT5");
        opts.idle_after = Some(Duration::from_millis(150));
        let session = Session::new(&port("/dev/ttyT5"), opts, bus);
        let (sink, mut lines) = mpsc::unbounded_channel();
        session.start(&opener, sink).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(session.state(), SessionState::Idle);

        device.write_all(b"wake\n").await.unwrap();
        lines.recv().await.unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        session.disconnect().await;
    }

    #[test]
    fn test_table_one_live_session_per_port() {
        let bus = Arc::new(EventBus::default());
        let table = SessionTable::new();
        let first = Session::new(&port("/dev/ttyT6"), options("/dev/ttyT6"), Arc::clone(&bus));
        let second = Session::new(&port("/dev/ttyT6"), options("/dev/ttyT6"), Arc::clone(&bus));

        table.insert(Arc::clone(&first)).unwrap();
        assert!(table.insert(Arc::clone(&second)).is_err());

        first.fail("gone");
        table.insert(Arc::clone(&second)).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.resolve("/dev/ttyT6").unwrap().id(), second.id());
        assert_eq!(table.resolve(&second.id().to_string()).unwrap().id(), second.id());
        assert!(table.resolve("/dev/nope").is_err());
    }

    #[test]
    fn test_strip_line_ending() {
        assert_eq!(&strip_line_ending(&Bytes::from_static(b"PING\r\n"))[..], b"PING");
        assert_eq!(&strip_line_ending(&Bytes::from_static(b"\n"))[..], b"");
    }
}
