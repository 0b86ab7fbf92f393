//! Shared plumbing for the `happy` and `happy-daemon` binaries.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use happy_core::entities::{EntityRef, Flavor, PermissionMode, Scope, SessionLifecycle};
use happy_core::messages::MessageBody;
use happy_core::protocol::ConnectionKind;
use happy_crypto::{credentials, SecretBox};
use happy_daemon::config::DaemonConfig;
use happy_daemon::errors::DaemonError;
use happy_daemon::session::{self, SessionConfig};
use happy_daemon::supervisor::{self, AssistantInput, ChildConfig};
use happy_sync::{MutateOptions, SyncClient, SyncConfig, SyncEvent};
use serde_json::json;
use tracing::{info, warn};

/// Normal exit.
pub const EXIT_OK: i32 = 0;
/// Fatal error.
pub const EXIT_FATAL: i32 = 1;
/// Authentication failure.
pub const EXIT_AUTH: i32 = 2;
/// Server unreachable at start (and offline mode impossible).
pub const EXIT_UNREACHABLE: i32 = 3;

/// Resolved boot context: config, bearer token, content crypto.
pub struct BootContext {
    /// Daemon/session configuration.
    pub config: DaemonConfig,
    /// Relay bearer token.
    pub token: String,
    /// Content crypto.
    pub crypto: SecretBox,
}

/// Load configuration and credentials, or explain which exit code fits.
pub fn boot() -> Result<BootContext, i32> {
    let config = DaemonConfig::from_env();
    let creds_path = credentials::credentials_path(&config.state_dir);
    let Some(creds) = credentials::load_credentials(&creds_path) else {
        eprintln!("happy: not authenticated (no credentials at {})", creds_path.display());
        return Err(EXIT_AUTH);
    };
    let Some(secret) = credentials::resolve_master_secret(&config.state_dir) else {
        eprintln!("happy: credentials file has no usable master secret");
        return Err(EXIT_AUTH);
    };
    let crypto = SecretBox::new(&secret.derive_content_key(&creds.account_id));
    Ok(BootContext {
        config,
        token: creds.token,
        crypto,
    })
}

/// Map a session start failure to an exit code.
pub fn exit_code_for(err: &DaemonError) -> i32 {
    match err {
        DaemonError::NotAuthenticated(_) => EXIT_AUTH,
        DaemonError::ServerUnreachable => EXIT_UNREACHABLE,
        DaemonError::Sync(happy_sync::SyncError::Auth { .. }) => EXIT_AUTH,
        _ => EXIT_FATAL,
    }
}

/// Session parameters parsed from the command line.
#[derive(Clone, Debug)]
pub struct SessionArgs {
    /// Assistant implementation.
    pub flavor: Flavor,
    /// Model override (falls back to the flavor's env var).
    pub model: Option<String>,
    /// Permission mode.
    pub permission_mode: PermissionMode,
    /// Working directory (defaults to the current directory).
    pub working_dir: Option<PathBuf>,
    /// Auto-approve plan-mode tool calls.
    pub auto_approve_plan: bool,
}

impl SessionArgs {
    /// Resolve the model: explicit flag first, flavor env var second.
    pub fn resolved_model(&self) -> Option<String> {
        self.model
            .clone()
            .or_else(|| std::env::var(self.flavor.model_env_var()).ok())
    }

    /// Build the full session config.
    pub fn into_session_config(self, ctx: &BootContext) -> Result<SessionConfig, DaemonError> {
        let model = self.resolved_model();
        let working_dir = match self.working_dir {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        Ok(SessionConfig {
            daemon: ctx.config.clone(),
            flavor: self.flavor,
            working_dir,
            model,
            permission_mode: self.permission_mode,
            machine_id: happy_daemon::machine::local_machine_id(),
            token: ctx.token.clone(),
            crypto: ctx.crypto.clone(),
            auto_approve_plan: self.auto_approve_plan,
            program_override: None,
        })
    }
}

/// Offline fallback: run the assistant locally while a background loop
/// polls the relay; on reconnect a fresh session is created and the
/// conversation so far is seeded from the assistant's transcript file.
pub async fn run_offline_session(config: SessionConfig) -> Result<(), DaemonError> {
    warn!("relay unreachable, starting in offline mode");

    let session_dir = config.daemon.state_dir.join("sessions").join("offline");
    std::fs::create_dir_all(&session_dir)?;
    let transcript = session_dir.join("transcript.jsonl");

    let mut env = HashMap::new();
    let _ = env.insert(
        "HAPPY_SESSION_FILE".to_owned(),
        transcript.display().to_string(),
    );
    let mut spawned = supervisor::spawn(&ChildConfig {
        flavor: config.flavor,
        working_dir: config.working_dir.clone(),
        model: config.model.clone(),
        permission_mode: config.permission_mode,
        env,
        args: Vec::new(),
        program_override: config.program_override.clone(),
    })?;

    // Reconnect loop: create a fresh session once the relay answers and
    // seed it from disk so nothing typed so far is lost.
    let reconnect_config = config.clone();
    let reconnect_transcript = transcript.clone();
    let bridge = tokio::spawn(async move {
        let mut attempt: u32 = 0;
        loop {
            let delay = reconnect_config.daemon.backoff.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;

            let tag = uuid_tag();
            let Ok(session_id) = session::create_session(
                &reconnect_config.daemon.server_url,
                &reconnect_config.token,
                &tag,
            )
            .await
            else {
                continue;
            };
            let Ok(sync) = SyncClient::connect(
                SyncConfig {
                    server_url: reconnect_config.daemon.server_url.clone(),
                    token: reconnect_config.token.clone(),
                    connection_kind: ConnectionKind::SessionScoped,
                    scope_ref: Some(session_id.to_string()),
                    backoff: reconnect_config.daemon.backoff.clone(),
                    outbox_capacity: 256,
                    cursor_path: None,
                    heartbeat_interval_secs: 20,
                },
                reconnect_config.crypto.clone(),
            )
            .await
            else {
                continue;
            };

            info!(session_id = %session_id, "relay reachable again, seeding fresh session");
            let _ = sync.subscribe(Scope::session(session_id.as_str())).await;
            let entity = EntityRef::session(session_id.as_str());
            let flavor = reconnect_config.flavor;
            let mode = reconnect_config.permission_mode;
            let dir = reconnect_config.working_dir.display().to_string();
            let _ = sync
                .mutate(entity, MutateOptions::default(), move |_| {
                    json!({
                        "metadata": {
                            "workingDir": dir,
                            "flavor": flavor,
                            "lifecycle": "running",
                            "permissionMode": mode,
                        },
                        "agentState": {"thinking": false, "controlledByUser": true},
                    })
                })
                .await;
            let seeded =
                session::seed_from_transcript(&sync, &session_id, &reconnect_transcript)
                    .await
                    .unwrap_or(0);
            info!(seeded, "offline conversation seeded");
            return (session_id, sync);
        }
    });

    // Foreground: relay remote user text into the child once the bridge
    // is up; publish child text either way (the transcript captures the
    // offline stretch).
    let mut online: Option<(happy_core::SessionId, SyncClient)> = None;
    let mut bridge = Some(bridge);
    let mut events_rx: Option<tokio::sync::broadcast::Receiver<SyncEvent>> = None;

    loop {
        if online.is_none() {
            if let Some(handle) = bridge.as_mut() {
                if handle.is_finished() {
                    if let Ok(pair) = bridge.take().expect("bridge present").await {
                        events_rx = Some(pair.1.events());
                        online = Some(pair);
                    }
                }
            }
        }

        tokio::select! {
            event = spawned.events.recv() => {
                let Some(event) = event else { break };
                if let Some((session_id, sync)) = &online {
                    if let Some(body) = session::translate_event(event) {
                        let _ = sync.send_message(session_id.clone(), body).await;
                    }
                }
            }
            remote = async {
                match events_rx.as_mut() {
                    Some(rx) => rx.recv().await.ok(),
                    None => std::future::pending().await,
                }
            } => {
                if let Some(SyncEvent::MessageReceived { message, .. }) = remote {
                    if let MessageBody::UserText { text } = message.body {
                        let _ = spawned
                            .handle
                            .send(&AssistantInput::User { texts: vec![text] })
                            .await;
                    }
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(200)), if online.is_none() => {
                // Poll the bridge until it resolves.
            }
        }
    }

    let exit_code = spawned.handle.wait().await;
    if let Some(handle) = bridge {
        handle.abort();
    }
    if let Some((session_id, sync)) = online {
        let _ = sync
            .send_message(
                session_id.clone(),
                MessageBody::AgentEvent {
                    event: happy_core::messages::AgentEvent::SessionDeath {
                        exit_code,
                        reason: None,
                    },
                },
            )
            .await;
        let entity = EntityRef::session(session_id.as_str());
        let _ = sync
            .mutate(
                entity,
                MutateOptions {
                    lifecycle: Some(SessionLifecycle::Archived),
                    machine_status: None,
                },
                |current| current.cloned().unwrap_or_else(|| json!({})),
            )
            .await;
    }
    Ok(())
}

fn uuid_tag() -> String {
    // The session tag only needs to be unique per account.
    format!("offline-{}", happy_core::SessionId::new())
}
