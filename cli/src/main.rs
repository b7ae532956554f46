//! Portwatch CLI - Report listening port lifecycle events
//!
//! Runs the port watcher in sampling or kernel event mode, and offers
//! one-shot diagnostics for the sampler and the PID resolver.

mod commands;
mod signals;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use portwatch_core::{BackendChoice, ConfigStore, Mode, WatchConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "portwatch")]
#[command(author, version, about = "Watch listening ports and report open/close events")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    options: WatchOptions,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "PORTWATCH_LOG_JSON")]
    log_json: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch ports and emit lifecycle events (default)
    Watch,

    /// Print one filtered socket table sample
    #[command(alias = "ls")]
    Sample {
        /// Attribute owning PIDs to each port
        #[arg(short, long)]
        pids: bool,
    },

    /// Print the PIDs owning a port
    Resolve {
        /// Port number to attribute
        port: u16,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Polling,
    Ebpf,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Polling => Mode::Polling,
            ModeArg::Ebpf => Mode::Ebpf,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Auto,
    Ss,
    Proc,
}

impl From<BackendArg> for BackendChoice {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Auto => BackendChoice::Auto,
            BackendArg::Ss => BackendChoice::Ss,
            BackendArg::Proc => BackendChoice::Proc,
        }
    }
}

/// Overrides layered over the config file. Unset flags keep the file's value.
#[derive(Args)]
struct WatchOptions {
    /// Config file (default: ~/.portwatch/config.json)
    #[arg(long, global = true, env = "PORTWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Observation mode
    #[arg(long, global = true, value_enum, env = "PORTWATCH_MODE")]
    mode: Option<ModeArg>,

    /// Milliseconds between sampling cycles
    #[arg(long, global = true, env = "PORTWATCH_INTERVAL_MS")]
    interval_ms: Option<u64>,

    /// Samples per cycle
    #[arg(long, global = true, env = "PORTWATCH_BURST_COUNT")]
    burst_count: Option<u32>,

    /// Milliseconds between samples of one cycle
    #[arg(long, global = true, env = "PORTWATCH_BURST_DELAY_MS")]
    burst_delay_ms: Option<u64>,

    /// Socket table backend
    #[arg(long, global = true, value_enum, env = "PORTWATCH_BACKEND")]
    backend: Option<BackendArg>,

    /// Closure debounce window in milliseconds
    #[arg(long, global = true, env = "PORTWATCH_GRACE_MS")]
    grace_ms: Option<u64>,

    /// Port allow-list, e.g. "22,80,8000-8100"
    #[arg(long, global = true, env = "PORTWATCH_PORTS")]
    ports: Option<String>,

    /// Collector endpoint receiving JSON events
    #[arg(long, global = true, env = "PORTWATCH_SINK_URL")]
    sink_url: Option<String>,

    /// Per-request sink timeout in milliseconds
    #[arg(long, global = true, env = "PORTWATCH_SINK_TIMEOUT_MS")]
    sink_timeout_ms: Option<u64>,

    /// Per-strategy PID lookup timeout in milliseconds
    #[arg(long, global = true, env = "PORTWATCH_RESOLVE_TIMEOUT_MS")]
    resolve_timeout_ms: Option<u64>,

    /// Snapshot file for the open port set
    #[arg(long, global = true, env = "PORTWATCH_SNAPSHOT_PATH")]
    snapshot_path: Option<PathBuf>,

    /// Do not write the snapshot file
    #[arg(long, global = true, conflicts_with = "snapshot_path")]
    no_snapshot: bool,

    /// Container id reported with every event
    #[arg(long, global = true, env = "PORTWATCH_CONTAINER_ID")]
    container_id: Option<String>,

    /// Container name reported with every event
    #[arg(long, global = true, env = "PORTWATCH_CONTAINER_NAME")]
    container_name: Option<String>,

    /// Kernel tracer command line, split on whitespace
    #[arg(long, global = true, env = "PORTWATCH_TRACER")]
    tracer: Option<String>,
}

impl WatchOptions {
    fn apply(self, config: &mut WatchConfig) {
        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if let Some(v) = self.interval_ms {
            config.interval_ms = v;
        }
        if let Some(v) = self.burst_count {
            config.burst_count = v;
        }
        if let Some(v) = self.burst_delay_ms {
            config.burst_delay_ms = v;
        }
        if let Some(backend) = self.backend {
            config.backend = backend.into();
        }
        if let Some(v) = self.grace_ms {
            config.grace_ms = v;
        }
        if self.ports.is_some() {
            config.ports = self.ports;
        }
        if self.sink_url.is_some() {
            config.sink_url = self.sink_url;
        }
        if let Some(v) = self.sink_timeout_ms {
            config.sink_timeout_ms = v;
        }
        if let Some(v) = self.resolve_timeout_ms {
            config.resolve_timeout_ms = v;
        }
        if self.no_snapshot {
            config.snapshot_path = None;
        } else if self.snapshot_path.is_some() {
            config.snapshot_path = self.snapshot_path;
        }
        if let Some(v) = self.container_id {
            config.container_id = v;
        }
        if let Some(v) = self.container_name {
            config.container_name = v;
        }
        if let Some(cmd) = self.tracer {
            config.tracer_command = cmd.split_whitespace().map(str::to_string).collect();
        }
    }
}

fn init_tracing(verbose: u8, json: bool) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().with_target(true).init();
    } else {
        builder.with_target(false).init();
    }
}

async fn load_config(options: WatchOptions) -> anyhow::Result<WatchConfig> {
    let store = match &options.config {
        Some(path) => ConfigStore::with_path(path.clone()),
        None => ConfigStore::new()?,
    };
    tracing::debug!(path = %store.path().display(), "loading config");
    let mut config = store.load().await?;
    options.apply(&mut config);
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let config = load_config(cli.options).await?;

    match cli.command {
        None | Some(Commands::Watch) => {
            commands::watch::run(config).await?;
        }
        Some(Commands::Sample { pids }) => {
            commands::sample::run(&config, pids, cli.json).await?;
        }
        Some(Commands::Resolve { port }) => {
            commands::resolve::run(&config, port, cli.json).await?;
        }
    }

    Ok(())
}
