//! Tag communication daemon entry point.
//!
//! Builds the configured tags over the selected transport, keeps them
//! synchronized through a tag listener, and logs every change until a
//! shutdown signal arrives.

mod signals;
mod transport;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tagcomm_codec::ValueCodec;
use tagcomm_common::CommConfig;
use tagcomm_runtime::{build_listener, ListenerEvents, TagAccess, TagArena, TagListener};
use tracing::{error, info, warn};

use crate::signals::SignalHandler;

/// Tag communication daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "tagcomm-daemon",
    about = "Keeps PLC tags synchronized and reports their changes",
    version,
    long_about = None
)]
struct Args {
    /// Path to a configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Stop after this many refresh periods (0 = run until signalled).
    #[arg(long, default_value = "0")]
    max_cycles: u64,

    /// Print change events as JSON lines on stdout.
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting tag communication daemon");

    let config = load_config(&args)?;
    config.validate().context("Invalid configuration")?;

    info!(
        driver = ?config.transport.driver,
        mode = ?config.listener.mode,
        refresh_rate = %humantime::format_duration(config.polling.refresh_rate),
        tags = config.tags.len(),
        "Configuration loaded"
    );

    let signal_handler = SignalHandler::new().context("Failed to set up signal handlers")?;

    run_daemon(&config, &signal_handler, &args)
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!(
        "tagcomm_daemon={level},tagcomm_runtime={level},tagcomm_transport={level},\
         tagcomm_codec={level},tagcomm_common={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `TAGCOMM_CONFIG_PATH` environment variable
/// 3. `/etc/tagcomm/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<CommConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return CommConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("TAGCOMM_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from TAGCOMM_CONFIG_PATH");
            return CommConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from TAGCOMM_CONFIG_PATH={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "TAGCOMM_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for candidate in ["/etc/tagcomm/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(candidate);
        if config_path.exists() {
            info!(?config_path, "Loading config file");
            return CommConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {config_path:?}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(CommConfig::default())
}

/// Main daemon run loop.
fn run_daemon(config: &CommConfig, signal_handler: &SignalHandler, args: &Args) -> Result<()> {
    let transport = transport::create_transport(config)?;
    let access = Arc::new(TagAccess::new(
        Arc::new(TagArena::new()),
        transport,
        Arc::new(ValueCodec::new()),
    ));
    let listener = build_listener(Arc::clone(&access), config).context("Failed to create tag listener")?;

    let tracked = register_tags(&access, listener.as_ref(), config)?;
    let reporter = EventReporter::attach(listener.events(), args.json);

    listener.start().context("Failed to start tag listener")?;
    info!(tracked, connected = listener.is_connected(), "Tag listener started");

    let mut cycles: u64 = 0;
    let outcome = loop {
        if signal_handler.shutdown_requested() {
            info!(signal = ?signal_handler.state().last_signal(), "Shutdown requested");
            break Ok(());
        }
        if signal_handler.take_reload_request() {
            warn!("Reload requested; configuration changes take effect after a restart");
        }
        if args.max_cycles > 0 && cycles >= args.max_cycles {
            info!(cycles, "Max cycles reached");
            break Ok(());
        }
        if !listener.is_running() {
            error!(cycles, "Tag listener terminated");
            break Err(anyhow::anyhow!("tag listener terminated after a fatal communication problem"));
        }
        thread::sleep(config.polling.refresh_rate);
        cycles += 1;
    };

    listener.stop();
    info!(
        cycles,
        changes = reporter.changes(),
        problems = reporter.problems(),
        "Daemon stopped"
    );
    outcome
}

/// Create the configured tags and hand them to the listener.
///
/// Struct tags are tracked through their members so that each field is
/// decoded with its own elementary type. Returns the number of tracked tags.
fn register_tags(access: &TagAccess, listener: &dyn TagListener, config: &CommConfig) -> Result<usize> {
    let arena = access.arena();
    for def in &config.tags {
        let id = arena
            .create_from_definition(def)
            .with_context(|| format!("Invalid tag definition {}.{}", def.scope, def.name))?;
        let children = arena.children(id);
        let targets = if children.is_empty() { vec![id] } else { children };
        for target in targets {
            listener
                .add_tag(target)
                .with_context(|| format!("Failed to track tag {}.{}", def.scope, def.name))?;
        }
    }
    let tracked = listener.tags().len();
    if tracked == 0 {
        bail!("no tags configured");
    }
    Ok(tracked)
}

/// Logs listener events and keeps totals for the shutdown summary.
struct EventReporter {
    changes: Arc<AtomicU64>,
    problems: Arc<AtomicU64>,
}

impl EventReporter {
    fn attach(events: &ListenerEvents, json: bool) -> Self {
        let changes = Arc::new(AtomicU64::new(0));
        let problems = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&changes);
        events.tag_changed.subscribe(move |event| {
            counter.fetch_add(1, Ordering::Relaxed);
            if json {
                print_json("tag_changed", event);
            } else {
                info!(tag = %event.path, old = ?event.old, new = ?event.new, "Tag changed");
            }
        });

        events.connection_state_changed.subscribe(move |event| {
            if json {
                print_json("connection_state_changed", event);
            }
            if event.connected {
                info!("PLC connection established");
            } else {
                warn!("PLC connection lost");
            }
        });

        let counter = Arc::clone(&problems);
        events.communication_problem.subscribe(move |problem| {
            counter.fetch_add(1, Ordering::Relaxed);
            if json {
                print_json("communication_problem", problem);
            }
            if problem.fatal {
                error!(source = %problem.source, tag = ?problem.tag, reason = %problem.reason, "Communication failed");
            } else {
                warn!(source = %problem.source, tag = ?problem.tag, reason = %problem.reason, "Communication problem");
            }
        });

        Self { changes, problems }
    }

    fn changes(&self) -> u64 {
        self.changes.load(Ordering::Relaxed)
    }

    fn problems(&self) -> u64 {
        self.problems.load(Ordering::Relaxed)
    }
}

#[derive(Serialize)]
struct JsonLine<'a, T: Serialize> {
    event: &'a str,
    data: &'a T,
}

fn print_json<T: Serialize>(event: &str, data: &T) {
    match serde_json::to_string(&JsonLine { event, data }) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(event, error = %e, "Failed to serialize event"),
    }
}
