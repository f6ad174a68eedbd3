mod config;
mod kill;
mod reset;
mod rpc;
mod signals;
mod stall;
mod status;
mod supervisor;
mod watchdog;

use clap::{CommandFactory, Parser};
use config::{LoadedConfig, Overrides, Settings};
use kill::{KillEscalator, NixSignaller};
use rpc::EthRpcClient;
use signals::SignalRelay;
use std::path::PathBuf;
use supervisor::{ChildCommand, Supervisor};
use tracing_subscriber::EnvFilter;
use watchdog::Monitor;

/// Runs a blockchain node under a liveness watchdog: poll the node's RPC,
/// and restart the node whenever its chain height stops advancing.
#[derive(Parser, Debug)]
#[command(name = "heightwatch", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "heightwatch.toml")]
    config: PathBuf,

    /// Node RPC endpoint (overrides config)
    #[arg(long)]
    rpc_url: Option<String>,

    /// Poll interval in seconds (overrides config)
    #[arg(long)]
    interval: Option<i64>,

    /// Consecutive polls without progress before the node is restarted (overrides config)
    #[arg(long)]
    threshold: Option<i64>,

    /// Append logs to this file instead of stderr (overrides config)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Write a JSON status snapshot to this path (overrides config)
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (sync progress, first observations)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Node command followed by its arguments, passed through verbatim
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            rpc_url: self.rpc_url.clone(),
            poll_interval_secs: self.interval,
            stall_threshold: self.threshold,
            log_file: self.log_file.clone(),
            status_file: self.status_file.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    println!(
        "heightwatch start with {}",
        std::env::args().collect::<Vec<_>>().join(" ")
    );

    let Some(command) = ChildCommand::from_argv(&cli.command) else {
        eprintln!("{}", Cli::command().render_usage());
        std::process::exit(1);
    };

    let (loaded, config_error) = match config::load_config(&cli.config) {
        Ok(loaded) => (loaded, None),
        Err(e) => (LoadedConfig::default(), Some(e)),
    };
    let settings = loaded.config.resolve(&cli.overrides());

    init_tracing(&settings, cli.verbose, cli.quiet);
    if let Some(e) = config_error {
        tracing::warn!(error = %e, "using default configuration");
    }
    for problem in &loaded.ignored {
        tracing::warn!(path = %cli.config.display(), %problem, "ignoring config key");
    }
    tracing::info!(
        command = %command,
        rpc_url = %settings.rpc_url,
        poll_interval_secs = settings.poll_interval.as_secs(),
        stall_threshold = settings.stall_threshold,
        "heightwatch starting"
    );

    if cli.dry_run {
        print_settings(&settings, &command);
        return;
    }

    let source = match EthRpcClient::new(settings.rpc_url.clone()) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "cannot create RPC client");
            std::process::exit(1);
        }
    };
    tracing::debug!(url = source.url(), "RPC client ready");

    // Installed before the first spawn so a Ctrl-C always reaches the relay.
    let mut relay = match SignalRelay::install() {
        Ok(relay) => relay,
        Err(e) => {
            tracing::error!(error = %e, "cannot install signal handlers");
            std::process::exit(1);
        }
    };

    let (reset_tx, reset_rx) = reset::reset_channel();
    let (supervisor, child_rx) = Supervisor::new(command, reset_tx, settings.restart_delay);
    let escalator = KillEscalator::new(NixSignaller, child_rx, settings.grace_period);
    let mut monitor = Monitor::new(source, escalator, reset_rx, &settings);

    tokio::spawn(supervisor.run());

    let signal = monitor.run(relay.recv()).await;
    tracing::info!(%signal, "heightwatch exiting");
    std::process::exit(0);
}

fn init_tracing(settings: &Settings, verbose: bool, quiet: bool) {
    let default_directive = if verbose {
        "heightwatch=debug"
    } else if quiet {
        "heightwatch=warn"
    } else {
        "heightwatch=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);

    let Some(path) = &settings.log_file else {
        builder.with_writer(std::io::stderr).init();
        return;
    };

    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        Ok(file) => builder
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init(),
        Err(e) => {
            builder.with_writer(std::io::stderr).init();
            tracing::warn!(error = %e, path = %path.display(), "cannot open log file, logging to stderr");
        }
    }
}

fn print_settings(settings: &Settings, command: &ChildCommand) {
    println!("Dry run mode: settings resolved, not running.");
    println!("  command:            {command}");
    println!("  rpc_url:            {}", settings.rpc_url);
    println!("  poll_interval_secs: {}", settings.poll_interval.as_secs());
    println!("  stall_threshold:    {}", settings.stall_threshold);
    println!("  restart_delay_secs: {}", settings.restart_delay.as_secs());
    match settings.grace_period {
        Some(grace) => println!("  grace_period_secs:  {}", grace.as_secs()),
        None => println!("  grace_period_secs:  unbounded"),
    }
    if let Some(path) = &settings.log_file {
        println!("  log_file:           {}", path.display());
    }
    if let Some(path) = &settings.status_file {
        println!("  status_file:        {}", path.display());
    }
}
