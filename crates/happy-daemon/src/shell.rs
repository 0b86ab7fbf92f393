//! Shell-prefix command short-circuit.
//!
//! A remote message starting with `$ ` or `! ` never reaches the
//! assistant: it runs in a bounded-timeout subprocess and its output is
//! pushed back to the session log as an agent message, formatted as a
//! fenced code block. Non-zero exits append an `*Exit code: N*` footer.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

fn danger_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"rm\s+(-[^\s]*\s+)*-[^\s]*[rR][^\s]*\s+/($|\s|;|\|)",
            r"rm\s+(-[^\s]*\s+)*-[^\s]*[rR][^\s]*\s+/\*",
            r"rm\s+(-[^\s]*\s+)*-[^\s]*[rR][^\s]*\s+/(usr|etc|var|home|boot|dev|proc|sys)\b",
            r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
            r"dd\s+.*of=/dev/[sh]d",
            r"mkfs\.\w+\s+/dev/",
            r">\s*/dev/[sh]d",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Whether a command matches a known destructive pattern and must not
/// run from a remote message.
pub fn is_dangerous(command: &str) -> bool {
    danger_patterns().iter().any(|p| p.is_match(command))
}

/// Extract the shell command from a message, if it is one.
pub fn shell_command(text: &str) -> Option<&str> {
    let trimmed = text.trim_start();
    trimmed
        .strip_prefix("$ ")
        .or_else(|| trimmed.strip_prefix("! "))
        .map(str::trim)
        .filter(|cmd| !cmd.is_empty())
}

/// Result of a short-circuited shell command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellOutput {
    /// Exit code (`-1` when killed by signal or timeout).
    pub exit_code: i32,
    /// Combined stdout + stderr.
    pub output: String,
    /// Whether the timeout fired.
    pub timed_out: bool,
}

/// Run `bash -c <command>` in `working_dir` with a timeout. Destructive
/// patterns are refused before anything is spawned.
pub async fn run_shell(command: &str, working_dir: &Path, timeout: Duration) -> ShellOutput {
    if is_dangerous(command) {
        return ShellOutput {
            exit_code: -1,
            output: "refused: destructive command pattern".into(),
            timed_out: false,
        };
    }
    let child = Command::new("bash")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.is_empty() {
                if !combined.is_empty() && !combined.ends_with('\n') {
                    combined.push('\n');
                }
                combined.push_str(&stderr);
            }
            ShellOutput {
                exit_code: output.status.code().unwrap_or(-1),
                output: combined,
                timed_out: false,
            }
        }
        Ok(Err(e)) => ShellOutput {
            exit_code: -1,
            output: format!("failed to run command: {e}"),
            timed_out: false,
        },
        Err(_) => ShellOutput {
            exit_code: -1,
            output: String::new(),
            timed_out: true,
        },
    }
}

/// Format the command and its output as the agent-text message body.
pub fn format_shell_result(command: &str, result: &ShellOutput) -> String {
    let mut body = String::from("```bash\n$ ");
    body.push_str(command);
    body.push('\n');
    if result.timed_out {
        body.push_str("(timed out)\n");
    } else if !result.output.is_empty() {
        body.push_str(&result.output);
        if !result.output.ends_with('\n') {
            body.push('\n');
        }
    }
    body.push_str("```");
    if result.exit_code != 0 {
        body.push_str(&format!("\n*Exit code: {}*", result.exit_code));
    }
    body
}
