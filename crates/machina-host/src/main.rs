//! machina-host - the machina daemon binary.
//!
//! Three roles in one binary:
//!
//! - `run <request.json>`: execute a single run request and exit with the
//!   run's status.
//! - `worker --queue <dir> --workers N`: the durable-queue daemon - crash
//!   recovery, feeder, checkpointing, and N step-loop workers. SIGTERM or
//!   SIGINT drains cooperatively.
//! - `toolhost serve|run|list <plugin>`: the out-of-process plugin host the
//!   executor's session pool spawns.
//!
//! Everything interesting lives in `machina-core`; this binary is wiring,
//! signals, and metrics.

mod metrics;
mod toolhost_cmd;
mod worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use machina_core::genesis::GenesisConfig;
use machina_core::queue::{QueueDirs, QueueRuntime, RuntimeConfig};
use machina_core::selector::PolicyConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::metrics::HostMetrics;
use crate::worker::RunContext;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// machina host daemon
#[derive(Parser, Debug)]
#[command(name = "machina-host")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute one run request document and exit.
    Run {
        /// Path to the run request JSON.
        request: PathBuf,
        /// Workspace root (defaults to the request's directory).
        #[arg(long)]
        root: Option<PathBuf>,
        /// Enable the Genesis pipeline.
        #[arg(long)]
        genesis: bool,
        /// External policy command line (empty disables the policy hook).
        #[arg(long, default_value = "")]
        policy_cmd: String,
    },

    /// Run the queue worker daemon.
    Worker {
        /// Queue root directory.
        #[arg(long)]
        queue: PathBuf,
        /// Worker thread count.
        #[arg(long, default_value_t = 1)]
        workers: usize,
        /// Workspace root (defaults to the queue's parent).
        #[arg(long)]
        root: Option<PathBuf>,
        /// Feeder scan interval in milliseconds (clamped 20..5000).
        #[arg(long, default_value_t = 150)]
        scan_ms: u64,
        /// fsync the WAL on every append.
        #[arg(long)]
        wal_fsync: bool,
        /// Enable the Genesis pipeline.
        #[arg(long)]
        genesis: bool,
        /// External policy command line.
        #[arg(long, default_value = "")]
        policy_cmd: String,
    },

    /// Toolhost child-process modes.
    Toolhost {
        #[command(subcommand)]
        mode: ToolhostMode,
    },
}

#[derive(Subcommand, Debug)]
enum ToolhostMode {
    /// Persistent NDJSON server over stdin/stdout.
    Serve {
        /// Plugin shared object to host.
        plugin: PathBuf,
        /// Require leases for tier > 0 tools.
        #[arg(long)]
        enforce_leases: bool,
    },
    /// One request from stdin, one response to stdout.
    Run {
        /// Plugin shared object to host.
        plugin: PathBuf,
        /// Tool to execute.
        aid: String,
    },
    /// Emit the plugin's tool descriptors.
    List {
        /// Plugin shared object to inspect.
        plugin: PathBuf,
    },
}

extern "C" fn on_signal(_sig: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    #[cfg(unix)]
    {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: the handler only stores to an atomic.
        unsafe {
            let _ = sigaction(Signal::SIGTERM, &action);
            let _ = sigaction(Signal::SIGINT, &action);
        }
    }
}

fn genesis_config(enabled: bool) -> GenesisConfig {
    let toolhost_bin = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("machina-host"));
    GenesisConfig {
        enabled,
        toolhost_bin,
        ..GenesisConfig::default()
    }
}

fn policy_config(command: &str, root: &std::path::Path) -> PolicyConfig {
    PolicyConfig {
        command: command.to_string(),
        script_root: root.join("policies"),
        ..PolicyConfig::default()
    }
}

fn cmd_run(request: PathBuf, root: Option<PathBuf>, genesis: bool, policy_cmd: &str) -> Result<i32> {
    let root = root.unwrap_or_else(|| {
        request
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    });
    let ctx = RunContext::new(&root, genesis_config(genesis), policy_config(policy_cmd, &root));
    let report = ctx.run_job(&request);
    info!(exit_code = report.exit_code, log = %report.log_path, "run complete");
    Ok(report.exit_code)
}

fn cmd_worker(
    queue: PathBuf,
    workers: usize,
    root: Option<PathBuf>,
    scan_ms: u64,
    wal_fsync: bool,
    genesis: bool,
    policy_cmd: &str,
) -> Result<i32> {
    let root = root
        .or_else(|| queue.parent().map(std::path::Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));

    let dirs = QueueDirs::ensure(&queue).context("cannot create queue directories")?;
    let config = RuntimeConfig {
        workers: workers.clamp(1, 64),
        scan_interval: Duration::from_millis(scan_ms.clamp(20, 5000)),
        wal_fsync,
        ..RuntimeConfig::default()
    };
    let runtime = Arc::new(QueueRuntime::new(dirs, config).context("cannot open queue runtime")?);
    let metrics = Arc::new(HostMetrics::new().context("cannot build metrics")?);
    let run_ctx = Arc::new(RunContext::new(
        &root,
        genesis_config(genesis),
        policy_config(policy_cmd, &root),
    ));

    runtime.recover();
    info!(queue = %queue.display(), workers, "queue worker daemon up");

    let handler = {
        let run_ctx = Arc::clone(&run_ctx);
        let metrics = Arc::clone(&metrics);
        Arc::new(move |path: &std::path::Path| {
            let report = run_ctx.run_job(path);
            metrics.job_finished(report.exit_code == 0);
            for m in &report.metrics {
                metrics.tool_invoked(&m.aid, m.ok, m.duration_ms);
            }
            report
        })
    };
    let threads = runtime.start(handler);

    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
    info!("shutdown signal received; draining");
    runtime.shutdown();
    QueueRuntime::join(threads);
    runtime.write_checkpoint();

    match metrics.encode_text() {
        Ok(text) => {
            let path = queue.join("metrics.prom");
            if let Err(err) = std::fs::write(&path, text) {
                warn!(error = %err, "cannot write metrics snapshot");
            }
        }
        Err(err) => warn!(error = %err, "cannot encode metrics"),
    }

    let (processed, ok, fail) = runtime.counters();
    info!(processed, ok, fail, "queue worker daemon down");
    Ok(0)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    install_signal_handlers();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Run {
            request,
            root,
            genesis,
            policy_cmd,
        } => cmd_run(request, root, genesis, &policy_cmd),
        Command::Worker {
            queue,
            workers,
            root,
            scan_ms,
            wal_fsync,
            genesis,
            policy_cmd,
        } => cmd_worker(queue, workers, root, scan_ms, wal_fsync, genesis, &policy_cmd),
        Command::Toolhost { mode } => match mode {
            ToolhostMode::Serve {
                plugin,
                enforce_leases,
            } => toolhost_cmd::serve(&plugin, enforce_leases).map(|()| 0),
            ToolhostMode::Run { plugin, aid } => toolhost_cmd::run_once(&plugin, &aid).map(|()| 0),
            ToolhostMode::List { plugin } => toolhost_cmd::list(&plugin).map(|()| 0),
        },
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("machina-host: {err:#}");
            std::process::exit(2);
        }
    }
}
