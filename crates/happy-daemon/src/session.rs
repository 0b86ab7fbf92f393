//! One session: child process, message pump, sync bridge.
//!
//! The runtime owns the spawned assistant exclusively. Remote messages
//! flow in through the sync client and the pump; child output flows out
//! as encrypted session messages; permission asks park the child until
//! a remote decision (or the deny timeout) resolves them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use happy_core::entities::{
    AgentState, EntityRef, Flavor, PermissionMode, Scope, SessionLifecycle, SessionMetadata,
};
use happy_core::messages::{AgentEvent, MessageBody, ToolCallStatus};
use happy_core::protocol::ConnectionKind;
use happy_core::{MachineId, SessionId};
use happy_crypto::SecretBox;
use happy_sync::{MutateOptions, SyncClient, SyncConfig, SyncError, SyncEvent};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DaemonConfig;
use crate::control::{ControlMode, ControlTracker};
use crate::errors::DaemonError;
use crate::hooks::{self, HookServer, SessionRotated};
use crate::machine;
use crate::permissions::{Decision, PermissionBroker};
use crate::queue::{MessagePump, ModeFingerprint, PumpItem};
use crate::shell;
use crate::supervisor::{self, AssistantEvent, AssistantInput, ChildConfig, RunningChild};
use crate::tools::ToolServer;

/// RPC methods this runtime serves for its session scope.
pub const RPC_PROCESS_PERMISSION: &str = "processPermissionRequest";
/// Flip control mode from a remote client.
pub const RPC_SET_CONTROL_MODE: &str = "setControlMode";
/// Read a file in the session's working directory.
pub const RPC_READ_FILE: &str = "readFile";

/// Everything needed to start one session.
#[derive(Clone)]
pub struct SessionConfig {
    /// Daemon-level configuration.
    pub daemon: DaemonConfig,
    /// Assistant implementation.
    pub flavor: Flavor,
    /// Working directory.
    pub working_dir: PathBuf,
    /// Model override.
    pub model: Option<String>,
    /// Initial permission mode.
    pub permission_mode: PermissionMode,
    /// Owning machine.
    pub machine_id: MachineId,
    /// Relay bearer token.
    pub token: String,
    /// Content crypto.
    pub crypto: SecretBox,
    /// Auto-approve plan-mode tool calls.
    pub auto_approve_plan: bool,
    /// Test hook: replace the assistant binary.
    pub program_override: Option<(String, Vec<String>)>,
}

/// A running session.
pub struct SessionRuntime {
    /// Server-assigned session id.
    pub session_id: SessionId,
    sync: Arc<SyncClient>,
    pump: Arc<MessagePump>,
    permissions: Arc<PermissionBroker>,
    control: Arc<ControlTracker>,
    cancel: CancellationToken,
    fingerprint: Mutex<ModeFingerprint>,
    working_dir: PathBuf,
    shell_timeout: Duration,
    child: Arc<tokio::sync::Mutex<Option<RunningChild>>>,
    // Held for their Drop (abort) behavior.
    _tool_server: ToolServer,
    _hook_server: HookServer,
}

impl SessionRuntime {
    /// Run the full session start sequence (spec order): session entity,
    /// session-scoped sync connection, auxiliary local services, hook
    /// settings, child spawn, pumps.
    pub async fn start(config: SessionConfig) -> Result<Arc<Self>, DaemonError> {
        // 1. Session entity, idempotent on a fresh random tag.
        let tag = Uuid::now_v7().to_string();
        let session_id = create_session(&config.daemon.server_url, &config.token, &tag).await?;
        info!(session_id = %session_id, "session created");

        // 2. Session-scoped sync connection.
        let sync = SyncClient::connect(
            SyncConfig {
                server_url: config.daemon.server_url.clone(),
                token: config.token.clone(),
                connection_kind: ConnectionKind::SessionScoped,
                scope_ref: Some(session_id.to_string()),
                backoff: config.daemon.backoff.clone(),
                outbox_capacity: 256,
                cursor_path: Some(config.daemon.cursors_file()),
                heartbeat_interval_secs: 20,
            },
            config.crypto.clone(),
        )
        .await
        .map_err(|e| match e {
            SyncError::Transport => DaemonError::ServerUnreachable,
            other => DaemonError::Sync(other),
        })?;
        let sync = Arc::new(sync);
        sync.subscribe(Scope::session(session_id.as_str())).await?;

        // 3. Auxiliary local services.
        let (hook_tx, hook_rx) = mpsc::channel::<SessionRotated>(8);
        let tool_server = ToolServer::start(
            config.working_dir.clone(),
            Duration::from_secs(config.daemon.shell_timeout_secs),
        )
        .await?;
        let hook_server = HookServer::start(hook_tx).await?;

        // 4. Hook-settings file + session transcript path for the child.
        let session_dir = config.daemon.state_dir.join("sessions").join(session_id.as_str());
        std::fs::create_dir_all(&session_dir)?;
        let hook_settings = session_dir.join("hooks.json");
        hooks::write_hook_settings(&hook_settings, hook_server.addr, tool_server.addr)?;
        let transcript = session_dir.join("transcript.jsonl");

        // 5. Spawn the assistant child.
        let mut env = HashMap::new();
        let _ = env.insert(
            "HAPPY_HOOK_SETTINGS".to_owned(),
            hook_settings.display().to_string(),
        );
        let _ = env.insert(
            "HAPPY_SESSION_FILE".to_owned(),
            transcript.display().to_string(),
        );
        let spawned = supervisor::spawn(&ChildConfig {
            flavor: config.flavor,
            working_dir: config.working_dir.clone(),
            model: config.model.clone(),
            permission_mode: config.permission_mode,
            env,
            args: Vec::new(),
            program_override: config.program_override.clone(),
        })?;

        let runtime = Arc::new(Self {
            session_id: session_id.clone(),
            sync: sync.clone(),
            pump: MessagePump::new(),
            permissions: PermissionBroker::new(
                Duration::from_secs(config.daemon.permission_timeout_secs),
                config.auto_approve_plan,
            ),
            control: ControlTracker::new(ControlMode::Remote),
            cancel: CancellationToken::new(),
            fingerprint: Mutex::new(ModeFingerprint {
                permission_mode: config.permission_mode,
                model: config.model.clone(),
                ..ModeFingerprint::default()
            }),
            working_dir: config.working_dir.clone(),
            shell_timeout: Duration::from_secs(config.daemon.shell_timeout_secs),
            child: Arc::new(tokio::sync::Mutex::new(Some(spawned.handle))),
            _tool_server: tool_server,
            _hook_server: hook_server,
        });

        // 6. Publish the initial session record.
        runtime.publish_session_record(&config, SessionLifecycle::Running).await?;

        // 7. RPC surface + pumps.
        runtime.register_rpc_handlers(&config).await?;
        runtime.spawn_inbound_loop();
        runtime.spawn_pump_consumer();
        runtime.spawn_child_event_loop(spawned.events, config.permission_mode);
        runtime.spawn_control_watcher();
        runtime.spawn_hook_loop(hook_rx);

        Ok(runtime)
    }

    /// The session's mode fingerprint right now.
    pub fn fingerprint(&self) -> ModeFingerprint {
        self.fingerprint.lock().clone()
    }

    /// The message pump (exposed for the daemon's IPC surface).
    pub fn pump(&self) -> Arc<MessagePump> {
        self.pump.clone()
    }

    /// Stop the session: archive, kill the child with grace, clean up.
    pub async fn stop(&self, config: &DaemonConfig) {
        self.cancel.cancel();
        self.permissions.deny_all();
        self.pump.drain();

        if let Some(child) = self.child.lock().await.take() {
            let _ = child
                .stop(Duration::from_secs(config.child_kill_grace_secs))
                .await;
        }

        let _ = self
            .sync
            .send_message(
                self.session_id.clone(),
                MessageBody::AgentEvent {
                    event: AgentEvent::SessionDeath {
                        exit_code: None,
                        reason: Some("stopped".into()),
                    },
                },
            )
            .await;
        self.archive().await;

        // Hook files are per-run; the transcript stays (offline seeding).
        let session_dir = config
            .state_dir
            .join("sessions")
            .join(self.session_id.as_str());
        let _ = std::fs::remove_file(session_dir.join("hooks.json"));
    }

    async fn archive(&self) {
        let entity = EntityRef::session(self.session_id.as_str());
        let result = self
            .sync
            .mutate(
                entity,
                MutateOptions {
                    lifecycle: Some(SessionLifecycle::Archived),
                    machine_status: None,
                },
                move |current| {
                    let mut doc = current.cloned().unwrap_or_else(|| json!({}));
                    doc["metadata"]["lifecycle"] = json!("archived");
                    doc
                },
            )
            .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to archive session");
        }
    }

    async fn publish_session_record(
        &self,
        config: &SessionConfig,
        lifecycle: SessionLifecycle,
    ) -> Result<(), DaemonError> {
        let metadata = SessionMetadata {
            machine_id: config.machine_id.clone(),
            working_dir: config.working_dir.display().to_string(),
            flavor: config.flavor,
            lifecycle,
            permission_mode: config.permission_mode,
            tools: vec!["read-file".into(), "write-file".into(), "list-files".into(), "bash".into()],
            model: config.model.clone(),
            host: Some(machine::hostname()),
        };
        let state = AgentState {
            thinking: false,
            controlled_by_user: false,
            current_model: config.model.clone(),
        };
        let entity = EntityRef::session(self.session_id.as_str());
        let doc = json!({"metadata": metadata, "agentState": state});
        let _ = self
            .sync
            .mutate(entity, MutateOptions::default(), move |_| doc.clone())
            .await?;
        Ok(())
    }

    async fn publish_agent_state<F>(&self, update: F)
    where
        F: Fn(&mut Value) + Send + Sync + 'static,
    {
        let entity = EntityRef::session(self.session_id.as_str());
        let update = Arc::new(update);
        let result = self
            .sync
            .mutate(entity, MutateOptions::default(), move |current| {
                let mut doc = current.cloned().unwrap_or_else(|| json!({}));
                if doc["agentState"].is_null() {
                    doc["agentState"] = json!({});
                }
                update(&mut doc["agentState"]);
                doc
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to publish agent state");
        }
    }

    async fn register_rpc_handlers(&self, config: &SessionConfig) -> Result<(), DaemonError> {
        let scope = Scope::session(self.session_id.as_str());

        let permissions = self.permissions.clone();
        self.sync
            .register(scope.clone(), RPC_PROCESS_PERMISSION, move |req| {
                let permissions = permissions.clone();
                Box::pin(async move {
                    let request_id = req["requestId"].as_str().unwrap_or_default().to_owned();
                    let decision = if req["allow"].as_bool().unwrap_or(false) {
                        Decision::Allow
                    } else {
                        Decision::Deny
                    };
                    if permissions.resolve(&request_id, decision) {
                        Ok(json!({"resolved": true}))
                    } else {
                        Err(json!({"error": "unknown or resolved request"}))
                    }
                })
            })
            .await?;

        let control = self.control.clone();
        self.sync
            .register(scope.clone(), RPC_SET_CONTROL_MODE, move |req| {
                let control = control.clone();
                Box::pin(async move {
                    let changed = match req["mode"].as_str() {
                        Some("local") => control.take_local(),
                        Some("remote") => control.release_to_remote(),
                        _ => return Err(json!({"error": "mode must be local or remote"})),
                    };
                    Ok(json!({"changed": changed}))
                })
            })
            .await?;

        let working_dir = config.working_dir.clone();
        self.sync
            .register(scope, RPC_READ_FILE, move |req| {
                let working_dir = working_dir.clone();
                Box::pin(async move {
                    let path = req["path"].as_str().unwrap_or_default();
                    let resolved = working_dir.join(path);
                    match tokio::fs::read_to_string(&resolved).await {
                        Ok(content) => Ok(json!({"content": content})),
                        Err(e) => Err(json!({"error": e.to_string()})),
                    }
                })
            })
            .await?;

        Ok(())
    }

    /// Remote messages → shell short-circuit or the pump.
    fn spawn_inbound_loop(self: &Arc<Self>) {
        let runtime = Arc::clone(self);
        let mut events = self.sync.events();
        let cancel = self.cancel.clone();
        let _ = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    () = cancel.cancelled() => return,
                };
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    // Lagged: skip what was lost and keep draining.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                };
                if let SyncEvent::MessageReceived { session_id, message } = event {
                    if session_id != runtime.session_id {
                        continue;
                    }
                    if let MessageBody::UserText { text } = message.body {
                        runtime.handle_remote_text(text).await;
                    }
                }
            }
        });
    }

    async fn handle_remote_text(self: &Arc<Self>, text: String) {
        // Shell prefix short-circuits: never forwarded to the assistant.
        if let Some(command) = shell::shell_command(&text) {
            let output = shell::run_shell(command, &self.working_dir, self.shell_timeout).await;
            let body = shell::format_shell_result(command, &output);
            let _ = self
                .sync
                .send_message(
                    self.session_id.clone(),
                    MessageBody::AgentText { text: body },
                )
                .await;
            return;
        }

        match text.trim() {
            "/clear" => self.pump.push_clear(),
            "/compact" => self.pump.push_compact(),
            _ => self.pump.push_message(text, self.fingerprint()),
        }
    }

    /// Pump consumer: single feeder into the child's stdin.
    fn spawn_pump_consumer(self: &Arc<Self>) {
        let runtime = Arc::clone(self);
        let cancel = self.cancel.clone();
        let _ = tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    item = runtime.pump.next() => item,
                    () = cancel.cancelled() => return,
                };
                let input = match item {
                    PumpItem::Batch(batch) => AssistantInput::User { texts: batch.texts },
                    PumpItem::Clear => AssistantInput::Clear,
                    PumpItem::Compact => AssistantInput::Compact,
                };
                let mut guard = runtime.child.lock().await;
                let Some(child) = guard.as_mut() else { return };
                if let Err(e) = child.send(&input).await {
                    warn!(error = %e, "failed to feed assistant");
                    return;
                }
            }
        });
    }

    /// Child stdout → protocol messages; exit → ready + session-death.
    fn spawn_child_event_loop(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<AssistantEvent>,
        mode: PermissionMode,
    ) {
        let runtime = Arc::clone(self);
        let _ = tokio::spawn(async move {
            let mut last_usage: Option<Value> = None;
            while let Some(event) = events.recv().await {
                match &event {
                    AssistantEvent::Ready { usage } => {
                        last_usage = usage.clone();
                        runtime
                            .publish_agent_state(|state| state["thinking"] = json!(false))
                            .await;
                        // Usage ticks are hints, not state: best-effort.
                        if let Some(usage) = usage.clone() {
                            let _ = runtime
                                .sync
                                .emit_ephemeral(
                                    Scope::session(runtime.session_id.as_str()),
                                    "usage",
                                    Some(usage),
                                )
                                .await;
                        }
                    }
                    AssistantEvent::Text { .. } | AssistantEvent::ToolCall { .. } => {
                        runtime
                            .publish_agent_state(|state| state["thinking"] = json!(true))
                            .await;
                    }
                    _ => {}
                }

                match event {
                    AssistantEvent::PermissionAsk { tool_name, arguments } => {
                        runtime.handle_permission_ask(tool_name, arguments, mode).await;
                    }
                    other => {
                        if let Some(body) = translate_event(other) {
                            if let Err(e) = runtime
                                .sync
                                .send_message(runtime.session_id.clone(), body)
                                .await
                            {
                                warn!(error = %e, "failed to publish assistant message");
                            }
                        }
                    }
                }
            }

            // Stream closed: the child exited (or was killed).
            let exit_code = {
                let mut guard = runtime.child.lock().await;
                match guard.as_mut() {
                    Some(child) => child.wait().await,
                    None => None,
                }
            };
            if runtime.cancel.is_cancelled() {
                return; // stop() already reported the death
            }
            info!(?exit_code, "assistant exited");

            let _ = runtime
                .sync
                .send_message(
                    runtime.session_id.clone(),
                    MessageBody::AgentEvent {
                        event: AgentEvent::Ready {
                            usage: last_usage.clone(),
                        },
                    },
                )
                .await;
            let _ = runtime
                .sync
                .send_message(
                    runtime.session_id.clone(),
                    MessageBody::AgentEvent {
                        event: AgentEvent::SessionDeath {
                            exit_code,
                            reason: if exit_code == Some(0) {
                                None
                            } else {
                                Some("assistant crashed".into())
                            },
                        },
                    },
                )
                .await;
            runtime.archive().await;
            runtime.cancel.cancel();
        });
    }

    async fn handle_permission_ask(
        self: &Arc<Self>,
        tool_name: String,
        arguments: Value,
        mode: PermissionMode,
    ) {
        let (request, decision) = self.permissions.open(tool_name, arguments, mode);
        let _ = self
            .sync
            .send_message(
                self.session_id.clone(),
                MessageBody::AgentEvent {
                    event: AgentEvent::PermissionRequest {
                        request_id: request.request_id.clone(),
                        tool_name: request.tool_name.clone(),
                        arguments: request.arguments.clone(),
                    },
                },
            )
            .await;

        let runtime = Arc::clone(self);
        let _ = tokio::spawn(async move {
            let allow = decision.await == Decision::Allow;
            let mut guard = runtime.child.lock().await;
            if let Some(child) = guard.as_mut() {
                let _ = child.send(&AssistantInput::Permission { allow }).await;
            }
        });
    }

    /// Control flips → persistent agentState updates + log events.
    fn spawn_control_watcher(self: &Arc<Self>) {
        let runtime = Arc::clone(self);
        let mut watch = self.control.watch();
        let cancel = self.cancel.clone();
        let _ = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = watch.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    () = cancel.cancelled() => return,
                }
                let by_user = *watch.borrow() == ControlMode::Local;
                runtime
                    .publish_agent_state(move |state| {
                        state["controlledByUser"] = json!(by_user);
                    })
                    .await;
                let _ = runtime
                    .sync
                    .send_message(
                        runtime.session_id.clone(),
                        MessageBody::AgentEvent {
                            event: AgentEvent::SwitchMode {
                                controlled_by_user: by_user,
                            },
                        },
                    )
                    .await;
            }
        });
    }

    fn spawn_hook_loop(self: &Arc<Self>, mut hook_rx: mpsc::Receiver<SessionRotated>) {
        let cancel = self.cancel.clone();
        let _ = tokio::spawn(async move {
            loop {
                tokio::select! {
                    rotated = hook_rx.recv() => {
                        let Some(rotated) = rotated else { return };
                        debug!(
                            new_session_id = %rotated.new_session_id,
                            "assistant rotated its internal session"
                        );
                    }
                    () = cancel.cancelled() => return,
                }
            }
        });
    }

    /// The control tracker (the CLI wires the terminal to it).
    pub fn control(&self) -> Arc<ControlTracker> {
        self.control.clone()
    }

    /// Completion signal: resolves when the session is over.
    pub async fn done(&self) {
        self.cancel.cancelled().await;
    }
}

/// Translate one assistant event into a session log message.
pub fn translate_event(event: AssistantEvent) -> Option<MessageBody> {
    match event {
        AssistantEvent::Text { text } => Some(MessageBody::AgentText { text }),
        AssistantEvent::ToolCall {
            tool_name,
            call_id,
            arguments,
        } => Some(MessageBody::ToolCall {
            tool_name,
            call_id,
            arguments,
            status: ToolCallStatus::Running,
            children: Vec::new(),
        }),
        AssistantEvent::Ready { usage } => Some(MessageBody::AgentEvent {
            event: AgentEvent::Ready { usage },
        }),
        AssistantEvent::LimitReached { reason } => Some(MessageBody::AgentEvent {
            event: AgentEvent::LimitReached { reason },
        }),
        // Tool completion and permission asks have their own paths.
        AssistantEvent::ToolDone { .. } | AssistantEvent::PermissionAsk { .. } => None,
    }
}

/// Create (or re-resolve) a session over the HTTP surface.
pub async fn create_session(
    server_url: &str,
    token: &str,
    tag: &str,
) -> Result<SessionId, DaemonError> {
    let url = format!("{}/v1/sessions", server_url.trim_end_matches('/'));
    let response: Value = reqwest::Client::new()
        .post(&url)
        .bearer_auth(token)
        .json(&json!({"tag": tag}))
        .send()
        .await
        .map_err(|_| DaemonError::ServerUnreachable)?
        .error_for_status()?
        .json()
        .await?;
    response["id"]
        .as_str()
        .map(SessionId::from)
        .ok_or_else(|| DaemonError::Ipc("malformed session response".into()))
}

/// Seed a freshly created session from an on-disk transcript (offline
/// recovery). Each transcript line is `{"role": "user"|"agent",
/// "text": ...}`.
pub async fn seed_from_transcript(
    sync: &SyncClient,
    session_id: &SessionId,
    transcript: &std::path::Path,
) -> Result<usize, DaemonError> {
    let Ok(data) = std::fs::read_to_string(transcript) else {
        return Ok(0); // nothing recorded yet
    };
    let mut seeded = 0;
    for line in data.lines().filter(|l| !l.trim().is_empty()) {
        let Ok(entry) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(text) = entry["text"].as_str() else {
            continue;
        };
        let body = match entry["role"].as_str() {
            Some("user") => MessageBody::UserText { text: text.into() },
            _ => MessageBody::AgentText { text: text.into() },
        };
        if sync.send_message(session_id.clone(), body).await.is_ok() {
            seeded += 1;
        }
    }
    Ok(seeded)
}
