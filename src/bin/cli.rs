//! Boardmon CLI - Command-line interface
//!
//! Discovers boards, streams their output and runs scripts against them
//! without a GUI.

use anyhow::{anyhow, Context};
use boardmon_core::cli::{format_event, format_port, format_session, print_exit_codes, EventFilter};
use boardmon_core::config::{LoggingConfig, RuleBinding};
use boardmon_core::core::script::ScriptBuilder;
use boardmon_core::{
    AppConfig, AutoConnect, BoardFamily, CliResult, ConfigError, DeviceRegistry, DeviceTemplates, Engine,
    EngineError, ExitCodes, ExtractionRule, LinePattern, MetricPredicate, OutputFormat, PortInfo, TaskState,
    VirtualBus,
};
use clap::{Parser, Subcommand};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

/// Boardmon CLI
#[derive(Parser, Debug)]
#[command(
    name = "boardmon",
    author = "Boardmon Team",
    version,
    about = "Monitor and script microcontroller boards over USB serial",
    long_about = None
)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, env = "BOARDMON_CONFIG")]
    config: Option<PathBuf>,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Verbose logging (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,

    /// Also write the diagnostic log to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List and classify serial ports
    Ports {
        /// Only ports the registry recognises
        #[arg(short, long)]
        known: bool,
    },

    /// Show the device registry
    Devices,

    /// Stream events from connected boards
    Monitor {
        /// Ports to open in addition to auto-connected ones
        #[arg(short, long)]
        port: Vec<String>,

        /// Baud rate for explicitly opened ports
        #[arg(short, long)]
        baud: Option<u32>,

        /// Auto-connect policy (never, known, always)
        #[arg(long)]
        auto: Option<AutoConnect>,

        /// Hide raw lines
        #[arg(long)]
        no_lines: bool,

        /// Hide metric samples
        #[arg(long)]
        no_metrics: bool,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Send one command and print the response
    Send {
        /// Port path
        port: String,

        /// Command text (`\x` hex and `\b` binary prefixes allowed)
        text: String,

        /// Regex the response line must match
        #[arg(short, long)]
        expect: Option<LinePattern>,

        /// Response timeout (ms)
        #[arg(short, long, default_value = "2000")]
        timeout: u64,

        /// Baud rate
        #[arg(short, long)]
        baud: Option<u32>,
    },

    /// Run a saved command macro on a port
    Macro {
        /// Macro name
        name: String,

        /// Port path
        port: String,

        /// Baud rate
        #[arg(short, long)]
        baud: Option<u32>,
    },

    /// List saved macros and favorites
    Macros,

    /// Run script files
    Run {
        /// Script files (TOML, JSON or YAML)
        #[arg(required = true)]
        scripts: Vec<PathBuf>,

        /// Ports to open before the scripts start
        #[arg(short, long)]
        port: Vec<String>,

        /// Baud rate for explicitly opened ports
        #[arg(short, long)]
        baud: Option<u32>,
    },

    /// Run against simulated boards
    Demo {
        /// Stop after this many seconds
        #[arg(long, default_value = "5")]
        duration: u64,
    },

    /// Print the exit code table
    ExitCodes,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => return report(&CliResult::from(e), cli.quiet),
    };

    let _guard = match init_logging(&config.logging, cli.verbose, cli.quiet, cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            None
        }
    };

    let result = match run(&cli, config).await {
        Ok(result) => result,
        Err(e) => classify(&e),
    };
    report(&result, cli.quiet)
}

fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match path {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
}

fn init_logging(
    config: &LoggingConfig,
    verbose: u8,
    quiet: bool,
    log_file: Option<&Path>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = match (quiet, verbose) {
        (true, _) => "error".to_string(),
        (false, 0) => config.level.clone(),
        (false, 1) => "debug".to_string(),
        (false, _) => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries events; diagnostics go to stderr
    let console = if config.json {
        fmt::layer().json().with_writer(io::stderr).boxed()
    } else {
        fmt::layer().with_target(false).with_writer(io::stderr).boxed()
    };

    let (file_layer, guard) = match log_file.or(config.file.as_deref()) {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow!("invalid log file path {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(filter)
        .try_init()?;
    Ok(guard)
}

fn report(result: &CliResult, quiet: bool) -> ExitCode {
    match result {
        CliResult::Success(Some(msg)) if !quiet => println!("{msg}"),
        CliResult::Error(_, msg) => eprintln!("Error: {msg}"),
        _ => {}
    }
    result.to_exit_code()
}

fn classify(err: &anyhow::Error) -> CliResult {
    if let Some(engine) = err.downcast_ref::<EngineError>() {
        return CliResult::from(engine);
    }
    if let Some(config) = err.downcast_ref::<ConfigError>() {
        return CliResult::error(ExitCodes::CONFIG_ERROR, config.to_string());
    }
    CliResult::error(ExitCodes::ERROR, format!("{err:#}"))
}

/// Token cancelled on Ctrl+C
fn interrupt_token() -> anyhow::Result<CancellationToken> {
    let token = CancellationToken::new();
    let handler = token.clone();
    ctrlc::set_handler(move || handler.cancel()).context("failed to install Ctrl+C handler")?;
    Ok(token)
}

async fn run(cli: &Cli, config: AppConfig) -> anyhow::Result<CliResult> {
    match &cli.command {
        Commands::Ports { known } => list_ports(cli, config, *known).await,
        Commands::Devices => list_devices(cli, &config),
        Commands::Monitor {
            port,
            baud,
            auto,
            no_lines,
            no_metrics,
            duration,
        } => {
            let filter = EventFilter {
                lines: !no_lines,
                metrics: !no_metrics,
                lifecycle: true,
            };
            monitor(cli, config, port, *baud, *auto, filter, *duration).await
        }
        Commands::Send {
            port,
            text,
            expect,
            timeout,
            baud,
        } => send(cli, config, port, text, expect.clone(), *timeout, *baud).await,
        Commands::Macro { name, port, baud } => run_macro(config, name, port, *baud).await,
        Commands::Macros => list_macros(cli, config),
        Commands::Run { scripts, port, baud } => run_scripts(cli, config, scripts, port, *baud).await,
        Commands::Demo { duration } => demo(cli, *duration).await,
        Commands::ExitCodes => {
            print_exit_codes();
            Ok(CliResult::success())
        }
    }
}

async fn list_ports(cli: &Cli, mut config: AppConfig, known: bool) -> anyhow::Result<CliResult> {
    config.discovery.auto_connect = AutoConnect::Never;
    let engine = Engine::with_system_ports(config)?;
    engine.scan_now().await?;

    let ports: Vec<_> = engine.ports().into_iter().filter(|p| !known || p.is_known()).collect();
    if ports.is_empty() {
        return Ok(CliResult::success_with_message("No serial ports found."));
    }
    for port in &ports {
        println!("{}", format_port(port, cli.format));
    }
    Ok(CliResult::success())
}

fn list_devices(cli: &Cli, config: &AppConfig) -> anyhow::Result<CliResult> {
    let mut registry = DeviceRegistry::builtin();
    if let Some(path) = &config.registry.device_db {
        registry.load_file(path)?;
    }

    for signature in registry.signatures() {
        match cli.format {
            OutputFormat::Json => println!("{}", serde_json::to_string(signature)?),
            OutputFormat::Text => println!(
                "{}  {:<9} {}",
                signature.key(),
                signature.family,
                signature.board_name
            ),
        }
    }
    Ok(CliResult::success())
}

/// Open `ports` on an engine, registering any that enumeration missed
async fn open_ports(engine: &Engine, ports: &[String], baud: Option<u32>) -> anyhow::Result<()> {
    for path in ports {
        if engine.discovery().port(path).is_none() {
            engine.add_manual_port(path, None);
        }
        if engine.session_table().by_port(path).is_some() {
            continue;
        }
        engine
            .connect_with_baud(path, baud)
            .await
            .with_context(|| format!("failed to open {path}"))?;
    }
    Ok(())
}

async fn monitor(
    cli: &Cli,
    mut config: AppConfig,
    ports: &[String],
    baud: Option<u32>,
    auto: Option<AutoConnect>,
    filter: EventFilter,
    duration: Option<u64>,
) -> anyhow::Result<CliResult> {
    if let Some(auto) = auto {
        config.discovery.auto_connect = auto;
    }
    let engine = Engine::with_system_ports(config)?;
    stream(cli, &engine, ports, baud, filter, duration).await
}

async fn stream(
    cli: &Cli,
    engine: &Arc<Engine>,
    ports: &[String],
    baud: Option<u32>,
    filter: EventFilter,
    duration: Option<u64>,
) -> anyhow::Result<CliResult> {
    let stop = interrupt_token()?;
    let mut events = engine.subscribe();

    engine.scan_now().await?;
    open_ports(engine, ports, baud).await?;
    engine.start();

    let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => break,
            event = events.recv() => match event {
                Some(event) if filter.accepts(&event) => println!("{}", format_event(&event, cli.format)),
                Some(_) => {}
                None => break,
            },
        }
    }

    if events.dropped() > 0 {
        warn!("Output fell behind, {} events dropped", events.dropped());
    }
    engine.shutdown().await;
    Ok(CliResult::success())
}

async fn send(
    cli: &Cli,
    mut config: AppConfig,
    port: &str,
    text: &str,
    expect: Option<LinePattern>,
    timeout_ms: u64,
    baud: Option<u32>,
) -> anyhow::Result<CliResult> {
    config.discovery.auto_connect = AutoConnect::Never;
    let engine = Engine::with_system_ports(config)?;
    engine.scan_now().await?;
    open_ports(&engine, &[port.to_string()], baud).await?;

    let outcome = engine
        .send_text(port, text, expect, Some(Duration::from_millis(timeout_ms)))
        .await;
    engine.shutdown().await;

    let result = outcome?;
    match (cli.format, &result.response) {
        (OutputFormat::Json, Some(line)) => println!("{}", serde_json::to_string(line)?),
        (OutputFormat::Text, Some(line)) => println!("{}", line.text()),
        (_, None) => info!("Sent {} bytes to {}", text.len(), port),
    }
    Ok(CliResult::success())
}

async fn run_macro(mut config: AppConfig, name: &str, port: &str, baud: Option<u32>) -> anyhow::Result<CliResult> {
    config.discovery.auto_connect = AutoConnect::Never;
    let engine = Engine::with_system_ports(config)?;
    engine.scan_now().await?;
    open_ports(&engine, &[port.to_string()], baud).await?;

    let outcome = engine.run_macro(name, port).await;
    engine.shutdown().await;

    let sent = outcome?;
    info!("Macro '{}' sent {} commands to {}", name, sent, port);
    Ok(CliResult::success())
}

fn list_macros(cli: &Cli, config: AppConfig) -> anyhow::Result<CliResult> {
    let engine = Engine::with_system_ports(config)?;
    let library = engine.dispatcher().library().clone();

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&library)?),
        OutputFormat::Text => {
            for m in library.macros() {
                println!("{:<16} {:>2} commands  {}", m.name, m.command_count(), m.description);
            }
            for (index, favorite) in library.favorites().iter().enumerate() {
                println!("*{:<3} {:<24} {}", index, favorite.command, favorite.description);
            }
        }
    }
    Ok(CliResult::success())
}

async fn run_scripts(
    cli: &Cli,
    config: AppConfig,
    scripts: &[PathBuf],
    ports: &[String],
    baud: Option<u32>,
) -> anyhow::Result<CliResult> {
    let engine = Engine::with_system_ports(config)?;

    let mut tasks = Vec::new();
    for path in scripts {
        let task = engine
            .load_script(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        tasks.push(task);
    }

    let stop = interrupt_token()?;
    engine.scan_now().await?;
    open_ports(&engine, ports, baud).await?;

    let ids: Vec<_> = tasks.into_iter().map(|task| engine.run_script(task)).collect();
    let mut worst = CliResult::success();
    for id in ids {
        let status = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                engine.scripts().cancel_all();
                engine.wait_task(id).await?
            }
            status = engine.wait_task(id) => status?,
        };

        match cli.format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&status)?),
            OutputFormat::Text => match &status.error {
                Some(error) => println!("{}: {} at step {} ({})", status.name, status.state, status.current_step + 1, error),
                None => println!("{}: {}", status.name, status.state),
            },
        }

        let code = match status.state {
            TaskState::Failed => ExitCodes::SCRIPT_ERROR,
            TaskState::Cancelled => ExitCodes::CANCELLED,
            _ => continue,
        };
        if worst.is_success() {
            worst = CliResult::error(code, format!("script '{}' {}", status.name, status.state));
        }
    }

    for session in engine.sessions() {
        info!("{}", format_session(&session, OutputFormat::Text));
    }
    engine.shutdown().await;
    Ok(worst)
}

async fn demo(cli: &Cli, duration: u64) -> anyhow::Result<CliResult> {
    let bus = Arc::new(VirtualBus::new());
    bus.plug(
        PortInfo::usb("/dev/ttyVIRT0", 0x2341, 0x0043).with_product("Arduino Uno"),
        DeviceTemplates::thermometer(Duration::from_millis(500)),
    );
    bus.plug(
        PortInfo::usb("/dev/ttyVIRT1", 0x10C4, 0xEA60).with_product("CP2102"),
        DeviceTemplates::ping_pong(),
    );
    bus.plug(PortInfo::usb("/dev/ttyVIRT2", 0xFFFF, 0x0001), DeviceTemplates::echo());

    let mut config = AppConfig::default();
    config.discovery.auto_connect = AutoConnect::Always;
    config.session.apply_boot_delay = false;
    config.rules.push(RuleBinding {
        family: Some(BoardFamily::Arduino),
        rule: ExtractionRule::number("temp", r"TEMP:(\d+)")?,
    });

    let engine = Engine::new(config, DeviceRegistry::builtin(), bus.clone(), bus);
    let script = ScriptBuilder::new("demo")
        .send_expect(
            "/dev/ttyVIRT1",
            "PING",
            LinePattern::literal("PONG")?,
            Duration::from_secs(2),
        )
        .wait_for_metric("/dev/ttyVIRT0", "temp", MetricPredicate::Any, Duration::from_secs(3))
        .send("/dev/ttyVIRT2", "hello")
        .build();

    let printer = {
        let engine = Arc::clone(&engine);
        let format = cli.format;
        tokio::spawn(async move {
            // Wait for the sessions before the script starts
            tokio::time::sleep(Duration::from_millis(50)).await;
            let id = engine.run_script(script);
            match engine.wait_task(id).await {
                Ok(status) if format == OutputFormat::Text => println!("script {}: {}", status.name, status.state),
                Ok(status) => println!("{}", serde_json::to_string(&status).unwrap_or_default()),
                Err(e) => warn!("Demo script failed: {}", e),
            }
        })
    };

    let result = stream(cli, &engine, &[], None, EventFilter::default(), Some(duration)).await;
    printer.abort();
    result
}
