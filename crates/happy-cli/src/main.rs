//! `happy` — open an assistant session mirrored to the relay.

use clap::Parser;
use happy_cli::{boot, exit_code_for, run_offline_session, SessionArgs, EXIT_FATAL, EXIT_OK};
use happy_core::entities::{Flavor, PermissionMode};
use happy_daemon::control;
use happy_daemon::errors::DaemonError;
use happy_daemon::session::SessionRuntime;

/// Remote-control wrapper for interactive coding assistants.
#[derive(Parser, Debug)]
#[command(name = "happy", version, about = "Run an assistant session synced to your devices")]
struct Cli {
    /// Assistant flavor: claude (default), codex, or gemini.
    #[arg(value_parser = parse_flavor, default_value = "claude")]
    flavor: Flavor,

    /// Model id override.
    #[arg(long)]
    model: Option<String>,

    /// Permission mode: default, accept-edits, plan, bypass-permissions.
    #[arg(long, value_parser = parse_permission_mode, default_value = "default")]
    permission_mode: PermissionMode,

    /// Working directory (defaults to the current directory).
    #[arg(long)]
    dir: Option<std::path::PathBuf>,

    /// Auto-approve plan-mode tool calls.
    #[arg(long)]
    auto_approve_plan: bool,
}

fn parse_flavor(s: &str) -> Result<Flavor, String> {
    s.parse()
}

fn parse_permission_mode(s: &str) -> Result<PermissionMode, String> {
    serde_json::from_value(serde_json::json!(s)).map_err(|_| {
        format!("unknown permission mode '{s}' (default, accept-edits, plan, bypass-permissions)")
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let ctx = match boot() {
        Ok(ctx) => ctx,
        Err(code) => return code,
    };

    // Files only: the terminal belongs to the assistant while a session
    // is live.
    let _ = happy_core::logging::init_daemon_subscriber("info", ctx.config.logs_dir());

    let args = SessionArgs {
        flavor: cli.flavor,
        model: cli.model,
        permission_mode: cli.permission_mode,
        working_dir: cli.dir,
        auto_approve_plan: cli.auto_approve_plan,
    };
    let session_config = match args.into_session_config(&ctx) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("happy: {e}");
            return EXIT_FATAL;
        }
    };

    match SessionRuntime::start(session_config.clone()).await {
        Ok(runtime) => {
            // First keypress on this terminal takes control back.
            let _ = tokio::spawn(control::watch_terminal_keys(runtime.control()));
            tokio::select! {
                () = runtime.done() => {}
                _ = tokio::signal::ctrl_c() => {
                    runtime.stop(&session_config.daemon).await;
                }
            }
            EXIT_OK
        }
        Err(DaemonError::ServerUnreachable) => match run_offline_session(session_config).await {
            Ok(()) => EXIT_OK,
            Err(e) => {
                eprintln!("happy: {e}");
                exit_code_for(&e)
            }
        },
        Err(e) => {
            eprintln!("happy: {e}");
            exit_code_for(&e)
        }
    }
}
