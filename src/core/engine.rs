//! Engine facade
//!
//! [`Engine`] owns one instance of every service and wires them together:
//! discovery results open and close sessions, every session feeds the data
//! pipeline, and commands and scripts run against the shared session table.

use crate::config::{AppConfig, AutoConnect, ConfigError};
use crate::core::discovery::{DiscoveryService, Port, ScanDiff};
use crate::core::dispatcher::{CommandHandle, CommandRequest, CommandResult, Dispatcher, HistoryEntry};
use crate::core::error::{EngineError, PortFault, Result};
use crate::core::event::{EngineEvent, EventBus, Subscription};
use crate::core::framing::parse_payload;
use crate::core::macros::CommandLibrary;
use crate::core::matcher::LinePattern;
use crate::core::pipeline::{DataPipeline, ExtractionRule, MetricSample};
use crate::core::registry::{BoardFamily, DeviceRegistry};
use crate::core::script::{ScriptEngine, ScriptSettings, ScriptTask, TaskStatus};
use crate::core::session::{Session, SessionId, SessionInfo, SessionOptions, SessionTable};
use crate::core::transport::{PortEnumerator, PortOpener, SerialConfig, SystemPorts, TransportError};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Multi-device session engine
pub struct Engine {
    config: AppConfig,
    bus: Arc<EventBus>,
    discovery: Arc<DiscoveryService>,
    sessions: Arc<SessionTable>,
    pipeline: Arc<DataPipeline>,
    dispatcher: Arc<Dispatcher>,
    scripts: Arc<ScriptEngine>,
    opener: Arc<dyn PortOpener>,
    shutdown: CancellationToken,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Create engine on explicit port seams
    pub fn new(
        config: AppConfig,
        registry: DeviceRegistry,
        enumerator: Arc<dyn PortEnumerator>,
        opener: Arc<dyn PortOpener>,
    ) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(config.pipeline.display_queue_capacity));
        let discovery = Arc::new(
            DiscoveryService::new(enumerator, Arc::new(registry), Arc::clone(&bus))
                .with_detach_grace(config.discovery.detach_grace()),
        );
        let sessions = Arc::new(SessionTable::new());

        let pipeline = Arc::new(DataPipeline::new(Arc::clone(&bus)));
        pipeline.set_default_rules(None, config.rules_for(None));
        for family in BoardFamily::all() {
            let rules = config.rules_for(Some(*family));
            if !rules.is_empty() {
                pipeline.set_default_rules(Some(*family), rules);
            }
        }

        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&sessions)));
        let scripts = Arc::new(ScriptEngine::new(
            Arc::clone(&sessions),
            Arc::clone(&dispatcher),
            Arc::clone(&pipeline),
            Arc::clone(&bus),
            ScriptSettings {
                send_timeout: Duration::from_millis(config.scripting.send_timeout_ms),
                line_ending: config.serial.line_ending,
                max_execution: config.scripting.max_execution(),
            },
        ));

        Arc::new(Self {
            config,
            bus,
            discovery,
            sessions,
            pipeline,
            dispatcher,
            scripts,
            opener,
            shutdown: CancellationToken::new(),
            scanner: Mutex::new(None),
        })
    }

    /// Create engine on the OS serial ports, with the built-in registry and
    /// the configured device database merged over it
    pub fn with_system_ports(config: AppConfig) -> std::result::Result<Arc<Self>, ConfigError> {
        let mut registry = DeviceRegistry::builtin();
        if let Some(path) = &config.registry.device_db {
            let added = registry.load_file(path)?;
            info!("Loaded {} device signatures from {}", added, path.display());
        }
        let ports = Arc::new(SystemPorts);
        let engine = Self::new(config, registry, ports.clone(), ports);
        engine.load_command_library()?;
        Ok(engine)
    }

    /// Engine configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Event bus
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Discovery service
    pub fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }

    /// Data pipeline
    pub fn pipeline(&self) -> &Arc<DataPipeline> {
        &self.pipeline
    }

    /// Command dispatcher
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Script engine
    pub fn scripts(&self) -> &Arc<ScriptEngine> {
        &self.scripts
    }

    /// Start periodic discovery. The first scan runs immediately, followed
    /// by [`Engine::restore_sessions`] when `session.restore_on_start` is set.
    pub fn start(self: &Arc<Self>) {
        let mut scanner = self.scanner.lock();
        if scanner.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let engine = Arc::clone(self);
        let period = self.config.discovery.scan_interval();
        info!("Discovery started (every {:?})", period);
        *scanner = Some(tokio::spawn(async move {
            if engine.config.session.restore_on_start {
                if let Err(e) = engine.scan_now().await {
                    warn!("Port scan before restore failed: {}", e);
                }
                engine.restore_sessions().await;
            }
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = engine.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = engine.scan_now().await {
                            warn!("Port scan failed, retrying next interval: {}", e);
                        }
                    }
                }
            }
            debug!("Discovery stopped");
        }));
    }

    /// Scan once: close sessions on vanished ports, then apply the
    /// auto-connect policy to new ones
    pub async fn scan_now(&self) -> std::result::Result<ScanDiff, TransportError> {
        let diff = self.discovery.scan()?;

        for port_id in &diff.detached {
            if let Some(session) = self.sessions.by_port(port_id) {
                session.close("port detached").await;
            }
        }

        for port in &diff.attached {
            if !self.should_auto_connect(port) {
                continue;
            }
            if let Err(e) = self.open_port(port, None).await {
                warn!("Auto-connect to {} failed: {}", port.id, e);
            }
        }
        Ok(diff)
    }

    fn should_auto_connect(&self, port: &Port) -> bool {
        match self.config.discovery.auto_connect {
            AutoConnect::Never => false,
            AutoConnect::Known => port.is_known(),
            AutoConnect::Always => true,
        }
    }

    /// Present ports
    pub fn ports(&self) -> Vec<Port> {
        self.discovery.ports()
    }

    /// Register a port enumeration does not report
    pub fn add_manual_port(&self, path: &str, family: Option<BoardFamily>) -> Port {
        self.discovery.add_manual_port(path, family)
    }

    /// Remove a manual port and close the session bound to it
    pub async fn remove_manual_port(&self, path: &str) -> bool {
        if !self.discovery.remove_manual_port(path) {
            return false;
        }
        if let Some(session) = self.sessions.by_port(path) {
            session.close("port removed").await;
        }
        true
    }

    /// Options a session on `port` is opened with: board profile first,
    /// then the configured defaults
    pub fn session_options(&self, port: &Port, baud_rate: Option<u32>) -> SessionOptions {
        let profile = &port.profile;
        let baud = baud_rate
            .or(profile.default_baud)
            .unwrap_or(self.config.serial.baud_rate);

        let mut options = SessionOptions::new(&port.id, baud);
        options.serial = self.config.serial.serial_config(&port.id, baud);
        options.terminator = profile
            .terminator
            .clone()
            .unwrap_or_else(|| self.config.serial.terminator.clone());
        options.max_line_len = self.config.session.max_line_len;
        options.idle_after = self.config.session.idle_after();
        options.close_timeout = self.config.session.close_timeout();
        if self.config.session.apply_boot_delay {
            options.boot_delay = profile.boot_delay();
        }
        options
    }

    /// Open a session on a present port
    pub async fn connect(&self, port_id: &str) -> Result<SessionId> {
        self.connect_with_baud(port_id, None).await
    }

    /// Open a session with an explicit baud rate
    pub async fn connect_with_baud(&self, port_id: &str, baud_rate: Option<u32>) -> Result<SessionId> {
        let port = self
            .discovery
            .port(port_id)
            .ok_or_else(|| EngineError::PortUnavailable {
                port: port_id.to_string(),
                fault: PortFault::NotFound,
                reason: "port not found".to_string(),
            })?;
        self.open_port(&port, baud_rate).await
    }

    /// Open a session with fully custom options
    pub async fn connect_with(&self, port: &Port, options: SessionOptions) -> Result<SessionId> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Shutdown);
        }

        let session = Session::new(port, options, Arc::clone(&self.bus));
        self.sessions.insert(Arc::clone(&session))?;

        let sink: mpsc::UnboundedSender<_> = self.pipeline.attach(session.id(), port.family());
        session.start(self.opener.as_ref(), sink).await?;
        Ok(session.id())
    }

    async fn open_port(&self, port: &Port, baud_rate: Option<u32>) -> Result<SessionId> {
        let options = self.session_options(port, baud_rate);
        self.connect_with(port, options).await
    }

    /// Serial settings of every open session, in the form stored in
    /// `AppConfig::connections`
    pub fn saved_connections(&self) -> Vec<SerialConfig> {
        let mut saved: Vec<_> = self.sessions.open_sessions().iter().map(|s| s.info().serial).collect();
        saved.sort_by(|a, b| a.port.cmp(&b.port));
        saved
    }

    /// Reopen the configured connections with their saved serial settings.
    /// Ports that are absent or already open are reported and skipped.
    pub async fn restore_sessions(&self) -> Vec<(String, Result<SessionId>)> {
        let mut restored = Vec::with_capacity(self.config.connections.len());
        for saved in &self.config.connections {
            let outcome = match self.discovery.port(&saved.port) {
                Some(port) => {
                    let mut options = self.session_options(&port, Some(saved.baud_rate));
                    options.serial = saved.clone();
                    self.connect_with(&port, options).await
                }
                None => Err(EngineError::PortUnavailable {
                    port: saved.port.clone(),
                    fault: PortFault::NotFound,
                    reason: "saved port is not present".to_string(),
                }),
            };
            match &outcome {
                Ok(_) => info!("Restored session on {} ({})", saved.port, saved.summary()),
                Err(e) => warn!("Could not restore {}: {}", saved.port, e),
            }
            restored.push((saved.port.clone(), outcome));
        }
        restored
    }

    /// Close a session by id or port path
    pub async fn disconnect(&self, selector: &str) -> Result<()> {
        self.sessions.resolve(selector)?.disconnect().await;
        Ok(())
    }

    /// Snapshot of every session
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.all().iter().map(|s| s.info()).collect()
    }

    /// Snapshot of one session
    pub fn session(&self, selector: &str) -> Result<SessionInfo> {
        self.sessions.resolve(selector).map(|s| s.info())
    }

    /// Session table
    pub fn session_table(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Forget sessions that ended
    pub fn prune_sessions(&self) -> usize {
        self.sessions.prune()
    }

    /// Submit a command
    pub fn submit(&self, request: CommandRequest) -> Result<CommandHandle> {
        self.dispatcher.submit(request)
    }

    /// Send command text to a session, optionally waiting for a response
    pub async fn send_text(
        &self,
        selector: &str,
        text: &str,
        expect: Option<LinePattern>,
        timeout: Option<Duration>,
    ) -> Result<CommandResult> {
        let session = self.sessions.resolve(selector)?;
        let mut request = CommandRequest::parse(session.id(), text, self.config.serial.line_ending)?;
        if let Some(pattern) = expect {
            request = request.expect(pattern);
        }
        if let Some(timeout) = timeout {
            request = request.with_timeout(timeout);
        }
        self.dispatcher.execute(request).await
    }

    /// Send command text to every open session
    pub fn broadcast(&self, text: &str) -> Result<Vec<(SessionId, Result<CommandHandle>)>> {
        let payload = parse_payload(text, self.config.serial.line_ending)?;
        Ok(self.dispatcher.broadcast(&payload))
    }

    /// Submit a command after `delay`, then every `repeat` if given
    pub fn schedule(&self, request: CommandRequest, delay: Duration, repeat: Option<Duration>) -> Uuid {
        self.dispatcher.schedule(request, delay, repeat)
    }

    /// Recent commands
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.dispatcher.history()
    }

    /// Load macros and favorites from `commands.library`, if the file exists
    pub fn load_command_library(&self) -> std::result::Result<(), ConfigError> {
        let Some(path) = self.config.commands.library.as_deref().filter(|p| p.exists()) else {
            return Ok(());
        };
        let library = CommandLibrary::load_file(path)?;
        info!("Loaded {} macros from {}", library.macros().count(), path.display());
        self.dispatcher.replace_library(library);
        Ok(())
    }

    /// Write macros and favorites to `commands.library`
    pub fn save_command_library(&self) -> std::result::Result<(), ConfigError> {
        let path = self
            .config
            .commands
            .library
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("commands.library is not set".into()))?;
        let library = self.dispatcher.library().clone();
        library.save_file(path)
    }

    /// Run a macro against a session by id or port path
    pub async fn run_macro(&self, name: &str, selector: &str) -> Result<usize> {
        let session = self.sessions.resolve(selector)?;
        let timeout = Duration::from_millis(self.config.scripting.send_timeout_ms);
        self.dispatcher
            .run_macro(name, session.id(), self.config.serial.line_ending, timeout)
            .await
    }

    /// Swap a session's extraction rules
    pub fn replace_rules(&self, selector: &str, rules: Vec<ExtractionRule>) -> Result<()> {
        let session = self.sessions.resolve(selector)?;
        self.pipeline.replace_rules(session.id(), rules)
    }

    /// Latest value of every metric of a session
    pub fn latest_metrics(&self, selector: &str) -> Result<Vec<MetricSample>> {
        let session = self.sessions.resolve(selector)?;
        Ok(self.pipeline.latest_all(session.id()))
    }

    /// Load a script file, looking relative paths up in the script directory
    pub fn load_script(&self, path: &Path) -> std::result::Result<ScriptTask, ConfigError> {
        ScriptTask::load(&self.config.scripting.resolve(path))
    }

    /// Start a script task
    pub fn run_script(&self, task: ScriptTask) -> Uuid {
        self.scripts.start_task(task)
    }

    /// Cancel a script task
    pub fn cancel_task(&self, id: Uuid) -> bool {
        self.scripts.cancel_task(id)
    }

    /// Status of a script task
    pub fn task_status(&self, id: Uuid) -> Option<TaskStatus> {
        self.scripts.task_status(id)
    }

    /// Wait for a script task to finish
    pub async fn wait_task(&self, id: Uuid) -> Result<TaskStatus> {
        self.scripts.wait(id).await
    }

    /// Display subscription; the oldest events are dropped when it lags
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// Subscription that sees every event
    pub fn subscribe_lossless(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        self.bus.subscribe_lossless()
    }

    /// Stop discovery, cancel scripts and schedules, close every session
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Engine shutting down");
        self.shutdown.cancel();

        let scanner = self.scanner.lock().take();
        if let Some(handle) = scanner {
            let _ = handle.await;
        }
        self.scripts.cancel_all();
        self.dispatcher.cancel_all_schedules();
        let open = self.sessions.open_sessions();
        futures::future::join_all(open.iter().map(|s| s.disconnect())).await;
    }

    /// Whether [`Engine::shutdown`] was called
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
