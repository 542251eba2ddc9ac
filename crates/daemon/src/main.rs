//! Boxwire Daemon
//!
//! Serves sandbox sessions to remote clients.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::Server;
use tracing_subscriber::EnvFilter;

/// Boxwire Daemon - sandboxed file operations and processes for remote clients.
#[derive(Parser, Debug)]
#[command(name = "boxwire-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon and serve until a shutdown signal arrives
    Start,

    /// Validate the configuration and print the effective settings
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Initialize tracing; RUST_LOG wins over the configured level
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Start => {
            tracing::info!("Boxwire daemon starting...");
            let code = run(config).await?;
            std::process::exit(code);
        }
        Commands::CheckConfig => {
            let path = cli.config.unwrap_or_else(default_config_path);
            println!("# {}", path.display());
            print!("{}", config.to_toml()?);
            println!("# configuration OK");
        }
    }

    Ok(())
}

/// Serves until a shutdown signal and returns the process exit code.
async fn run(config: Config) -> anyhow::Result<i32> {
    let server = Server::new(config)?;
    let listener = server.listen().await?;
    tracing::info!("Listening on {}", listener.local_endpoint()?);

    let shutdown = server.shutdown_token();
    let mut signals = ShutdownSignals::register()?;
    tokio::spawn(async move {
        let signal = signals.recv().await;
        tracing::info!("Received {}, shutting down", signal);
        shutdown.cancel();
    });

    let report = server.run(listener).await;
    if report.is_clean() {
        Ok(0)
    } else {
        tracing::error!(
            "Failed to clean up {} of {} sessions",
            report.failed,
            report.sessions
        );
        Ok(1)
    }
}

/// SIGINT, SIGTERM and SIGHUP.
struct ShutdownSignals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sighup: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sighup: signal(SignalKind::hangup())?,
        })
    }

    /// Waits for the first of the signals and returns its name.
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sighup.recv() => "SIGHUP",
        }
    }
}
