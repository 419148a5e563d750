mod controller;
mod daemon;
mod pane;
mod relay_client;
mod share;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::daemon::DaemonOptions;
use crate::pane::TmuxPane;
use crate::share::ShareOptions;

#[derive(Parser, Debug)]
#[command(
    name = "porthole-host",
    about = "Stream a tmux pane to remote viewers through a porthole relay",
    version
)]
struct Cli {
    /// Relay server URL
    #[arg(
        long,
        global = true,
        env = "PORTHOLE_RELAY",
        default_value = "ws://127.0.0.1:3010"
    )]
    relay: String,

    /// Secret asserting session ownership in the relay directory
    #[arg(long, global = true, env = "PORTHOLE_USER_SECRET")]
    user_secret: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    /// Minimum log level (error, warn, info, debug, trace)
    #[arg(long = "log-level", global = true, env = "PORTHOLE_LOG", default_value = "info")]
    level: String,

    /// Write logs to a file instead of stderr
    #[arg(long = "log-file", global = true, value_name = "PATH")]
    file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Share one tmux session with remote viewers
    Share(ShareArgs),
    /// Serve many sessions over one connection, accepting remote commands
    Daemon(DaemonArgs),
}

#[derive(Args, Debug)]
struct ShareArgs {
    /// Relay session id
    session: String,

    /// tmux target to capture (defaults to the session id)
    #[arg(long)]
    target: Option<String>,

    /// Capture poll interval in milliseconds
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,

    /// Disable end-to-end encryption (frames travel in the clear)
    #[arg(long)]
    plain: bool,
}

#[derive(Args, Debug)]
struct DaemonArgs {
    /// Capture poll interval in milliseconds, per attached session
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.logging)?;

    let pane: Arc<dyn pane::PaneBackend> = Arc::new(TmuxPane::new());

    match cli.command {
        Command::Share(args) => {
            let target = args.target.unwrap_or_else(|| args.session.clone());
            share::run(
                ShareOptions {
                    server: cli.relay,
                    session_id: args.session,
                    target,
                    interval: Duration::from_millis(args.interval_ms),
                    encrypted: !args.plain,
                    user_secret: cli.user_secret,
                },
                pane,
            )
            .await
        }
        Command::Daemon(args) => {
            daemon::run(
                DaemonOptions {
                    server: cli.relay,
                    interval: Duration::from_millis(args.interval_ms),
                    user_secret: cli.user_secret,
                },
                pane,
            )
            .await
        }
    }
}

fn init_logging(args: &LoggingArgs) -> Result<()> {
    let filter = EnvFilter::try_new(&args.level)
        .with_context(|| format!("invalid log level: {}", args.level))?;
    match &args.file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}
