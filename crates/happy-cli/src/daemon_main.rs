//! `happy-daemon` — control the persistent background daemon.

use clap::{Parser, Subcommand};
use happy_cli::{boot, EXIT_FATAL, EXIT_OK, EXIT_UNREACHABLE};
use happy_daemon::errors::DaemonError;
use happy_daemon::{ipc, state_file, Daemon};

/// Happy background daemon control.
#[derive(Parser, Debug)]
#[command(name = "happy-daemon", version, about = "Happy daemon control")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground.
    Start,
    /// Ask a running daemon to shut down gracefully.
    Stop,
    /// Print a running daemon's status document.
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    match cli.command {
        Command::Start => start().await,
        Command::Stop => call(ipc::METHOD_SHUTDOWN).await,
        Command::Status => call(ipc::METHOD_STATUS).await,
    }
}

async fn start() -> i32 {
    let ctx = match boot() {
        Ok(ctx) => ctx,
        Err(code) => return code,
    };
    happy_core::logging::init_subscriber("info");

    match Daemon::start(ctx.config).await {
        Ok(daemon) => {
            let signal_daemon = daemon.clone();
            let _ = tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                signal_daemon.shutdown();
            });
            daemon.run().await;
            EXIT_OK
        }
        Err(DaemonError::AlreadyRunning { pid, port }) => {
            eprintln!("happy-daemon: already running (pid {pid}, port {port})");
            EXIT_FATAL
        }
        Err(e) => {
            eprintln!("happy-daemon: {e}");
            EXIT_FATAL
        }
    }
}

async fn call(method: &str) -> i32 {
    let ctx = match boot() {
        Ok(ctx) => ctx,
        Err(code) => return code,
    };
    let Some(state) = state_file::load(&ctx.config.state_file()) else {
        eprintln!("happy-daemon: not running");
        return EXIT_UNREACHABLE;
    };
    match ipc::call(state.port, &state.token, method, serde_json::json!({})).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default());
            EXIT_OK
        }
        Err(DaemonError::NotRunning) => {
            eprintln!("happy-daemon: not running (stale state file)");
            EXIT_UNREACHABLE
        }
        Err(e) => {
            eprintln!("happy-daemon: {e}");
            EXIT_FATAL
        }
    }
}
