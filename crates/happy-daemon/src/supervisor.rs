//! Assistant child-process supervision.
//!
//! The child speaks JSON lines on stdio: the runtime writes user turns
//! to stdin and translates each stdout line into an [`AssistantEvent`].
//! Arrival order matches the assistant's emission order — a single read
//! loop serializes the stream. On exit the supervisor reports the exit
//! code; it never restarts a crashed child.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use happy_core::entities::{Flavor, PermissionMode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::DaemonError;

/// One event parsed from the child's stdout stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum AssistantEvent {
    /// A chunk of assistant text.
    Text {
        /// The text.
        text: String,
    },
    /// The assistant invoked a tool.
    ToolCall {
        /// Tool name.
        tool_name: String,
        /// Assistant-assigned call id.
        call_id: String,
        /// Tool arguments.
        arguments: Value,
    },
    /// A tool call finished.
    ToolDone {
        /// Call id being resolved.
        call_id: String,
        /// Whether the tool succeeded.
        ok: bool,
    },
    /// The assistant requests consent for a tool.
    PermissionAsk {
        /// Tool name.
        tool_name: String,
        /// Tool arguments.
        arguments: Value,
    },
    /// Turn complete, usage attached.
    Ready {
        /// Usage counters.
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
    },
    /// The assistant hit a limit.
    LimitReached {
        /// Description.
        reason: String,
    },
}

/// What the runtime writes to the child's stdin.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum AssistantInput {
    /// One or more user messages delivered together.
    User {
        /// Message texts.
        texts: Vec<String>,
    },
    /// Clear the assistant's context.
    Clear,
    /// Compact the assistant's context.
    Compact,
    /// Resolution of a pending permission ask.
    Permission {
        /// Whether the tool may run.
        allow: bool,
    },
}

/// Spawn parameters for one assistant child.
#[derive(Clone, Debug)]
pub struct ChildConfig {
    /// Which assistant to run.
    pub flavor: Flavor,
    /// Working directory.
    pub working_dir: PathBuf,
    /// Model override.
    pub model: Option<String>,
    /// Initial permission mode (shapes the child's sandbox flags).
    pub permission_mode: PermissionMode,
    /// Extra environment (hook/tool server URLs, session file path).
    pub env: HashMap<String, String>,
    /// Extra command-line arguments.
    pub args: Vec<String>,
    /// Override the program entirely (tests use a script here).
    pub program_override: Option<(String, Vec<String>)>,
}

impl ChildConfig {
    fn command(&self) -> Command {
        let mut cmd = match &self.program_override {
            Some((program, args)) => {
                let mut c = Command::new(program);
                let _ = c.args(args);
                c
            }
            None => {
                let mut c = Command::new(match self.flavor {
                    Flavor::Claude => "claude",
                    Flavor::Codex => "codex",
                    Flavor::Gemini => "gemini",
                });
                if let Some(model) = &self.model {
                    let _ = c.arg("--model").arg(model);
                }
                let _ = c.arg("--permission-mode").arg(match self.permission_mode {
                    PermissionMode::Default => "default",
                    PermissionMode::AcceptEdits => "accept-edits",
                    PermissionMode::Plan => "plan",
                    PermissionMode::BypassPermissions => "bypass-permissions",
                });
                let _ = c.args(&self.args);
                c
            }
        };
        let _ = cmd
            .current_dir(&self.working_dir)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Handle to a running assistant child.
pub struct RunningChild {
    stdin: ChildStdin,
    child: Child,
}

/// Everything a spawn produces: the handle and the event stream. Exit
/// is observed through [`RunningChild::wait`] or [`RunningChild::stop`].
pub struct SpawnedChild {
    /// Input/lifecycle handle.
    pub handle: RunningChild,
    /// Parsed stdout events, in emission order.
    pub events: mpsc::Receiver<AssistantEvent>,
}

/// Spawn an assistant child and wire its stdio.
pub fn spawn(config: &ChildConfig) -> Result<SpawnedChild, DaemonError> {
    let mut child = config
        .command()
        .spawn()
        .map_err(|e| DaemonError::Spawn(e.to_string()))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| DaemonError::Spawn("no stdin pipe".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| DaemonError::Spawn("no stdout pipe".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| DaemonError::Spawn("no stderr pipe".into()))?;

    let (event_tx, events) = mpsc::channel(256);

    // Single stdout pump: serialization point for assistant events.
    let _ = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AssistantEvent>(&line) {
                Ok(event) => {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!(error = %e, "unparseable assistant line"),
            }
        }
    });

    // Stderr goes to logs only, never to the live terminal.
    let _ = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "assistant", "{line}");
        }
    });

    Ok(SpawnedChild {
        handle: RunningChild { stdin, child },
        events,
    })
}

impl RunningChild {
    /// Write one input document as a JSON line.
    pub async fn send(&mut self, input: &AssistantInput) -> Result<(), DaemonError> {
        let mut line = serde_json::to_string(input)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Wait for the child to exit, returning its exit code.
    pub async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(error = %e, "wait on child failed");
                None
            }
        }
    }

    /// Stop the child: close stdin, give it a grace period, then kill.
    pub async fn stop(mut self, grace: Duration) -> Option<i32> {
        drop(self.stdin);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(_)) => None,
            Err(_) => {
                info!("grace period expired, killing child");
                let _ = self.child.kill().await;
                None
            }
        }
    }

    /// Process id, while running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}
