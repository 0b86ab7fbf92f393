//! The persistent background daemon.
//!
//! Owns the machine identity, the machine-scoped sync connection, the
//! local control IPC, and the table of supervised sessions. One daemon
//! per state directory — the state file is the lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use happy_core::entities::{EntityRef, Flavor, MachineStatus, PermissionMode, Scope};
use happy_core::protocol::ConnectionKind;
use happy_core::{now_ms, MachineId, SessionId};
use happy_crypto::{credentials, SecretBox};
use happy_sync::{MutateOptions, SyncClient, SyncConfig, SyncError};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DaemonConfig;
use crate::errors::DaemonError;
use crate::ipc::{self, IpcHandler};
use crate::machine;
use crate::session::{SessionConfig, SessionRuntime};
use crate::state_file::{self, DaemonState};

/// The daemon.
pub struct Daemon {
    config: DaemonConfig,
    token: String,
    crypto: SecretBox,
    machine_id: MachineId,
    sync: RwLock<Option<Arc<SyncClient>>>,
    sessions: DashMap<String, Arc<SessionRuntime>>,
    ipc_token: String,
    ipc_port: u16,
    cancel: CancellationToken,
    restart_pending: AtomicBool,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("machine_id", &self.machine_id)
            .field("ipc_port", &self.ipc_port)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Boot the daemon: claim the state directory, load credentials,
    /// resolve machine identity, connect, bind IPC, write the state
    /// file, start background tasks.
    pub async fn start(config: DaemonConfig) -> Result<Arc<Self>, DaemonError> {
        let state_path = config.state_file();
        let _stale = state_file::claim(&state_path)?;

        let creds = credentials::load_credentials(&credentials::credentials_path(&config.state_dir))
            .ok_or_else(|| DaemonError::NotAuthenticated("no credentials file".into()))?;
        let secret = credentials::resolve_master_secret(&config.state_dir)
            .ok_or_else(|| DaemonError::NotAuthenticated("no master secret".into()))?;
        let crypto = SecretBox::new(&secret.derive_content_key(&creds.account_id));

        let machine_id = machine::local_machine_id();

        // Machine-scoped connection; unreachable relay leaves the daemon
        // in offline mode with a reconnect loop.
        let sync = match SyncClient::connect(
            SyncConfig {
                server_url: config.server_url.clone(),
                token: creds.token.clone(),
                connection_kind: ConnectionKind::MachineScoped,
                scope_ref: Some(machine_id.to_string()),
                backoff: config.backoff.clone(),
                outbox_capacity: 128,
                cursor_path: Some(config.cursors_file()),
                heartbeat_interval_secs: 20,
            },
            crypto.clone(),
        )
        .await
        {
            Ok(client) => Some(Arc::new(client)),
            Err(SyncError::Auth { reason }) => return Err(DaemonError::NotAuthenticated(reason)),
            Err(_) => {
                warn!("relay unreachable, daemon starting offline");
                None
            }
        };

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let ipc_port = listener.local_addr()?.port();
        let ipc_token = Uuid::now_v7().to_string();

        state_file::save(
            &state_path,
            &DaemonState {
                pid: std::process::id(),
                port: ipc_port,
                token: ipc_token.clone(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                started_at: now_ms(),
            },
        )?;

        let daemon = Arc::new(Self {
            config,
            token: creds.token,
            crypto,
            machine_id,
            sync: RwLock::new(sync),
            sessions: DashMap::new(),
            ipc_token,
            ipc_port,
            cancel: CancellationToken::new(),
            restart_pending: AtomicBool::new(false),
        });

        daemon.spawn_ipc(listener);
        daemon.spawn_heartbeat();
        daemon.spawn_update_check();
        if daemon.sync.read().await.is_some() {
            daemon.register_machine_rpc().await;
        } else {
            daemon.spawn_reconnect();
        }
        info!(port = daemon.ipc_port, machine_id = %daemon.machine_id, "daemon started");
        Ok(daemon)
    }

    /// The machine identity this daemon publishes under.
    pub fn machine_id(&self) -> &MachineId {
        &self.machine_id
    }

    /// Control IPC port (from the state file, for tests).
    pub fn ipc_port(&self) -> u16 {
        self.ipc_port
    }

    /// Block until shutdown is requested, then tear down.
    pub async fn run(self: &Arc<Self>) {
        self.cancel.cancelled().await;
        self.teardown().await;
    }

    /// Request a graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn teardown(self: &Arc<Self>) {
        info!("daemon shutting down");
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.stop(&self.config).await;
            }
        }

        if let Some(sync) = self.sync.read().await.clone() {
            // Graceful exit: publish `shutdown` so the grace timer never
            // downgrades it to a mere `offline`.
            let record = machine::machine_record(MachineStatus::Shutdown, Vec::new());
            let entity = EntityRef::machine(self.machine_id.as_str());
            let _ = sync
                .mutate(
                    entity,
                    MutateOptions {
                        machine_status: Some(MachineStatus::Shutdown),
                        lifecycle: None,
                    },
                    move |_| serde_json::to_value(&record).unwrap_or_default(),
                )
                .await;
            sync.close();
        }
        state_file::remove(&self.config.state_file());
    }

    // ── Background tasks ────────────────────────────────────────────

    fn spawn_ipc(self: &Arc<Self>, listener: TcpListener) {
        let daemon = Arc::clone(self);
        let handler: IpcHandler = Arc::new(move |method, params| {
            let daemon = Arc::clone(&daemon);
            Box::pin(async move { daemon.handle_ipc(&method, params).await })
        });
        let token = self.ipc_token.clone();
        let cancel = self.cancel.clone();
        let _ = tokio::spawn(ipc::serve(listener, token, handler, cancel));
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let daemon = Arc::clone(self);
        let _ = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                daemon.config.heartbeat_interval_secs,
            ));
            loop {
                tokio::select! {
                    _ = interval.tick() => daemon.publish_machine_record().await,
                    () = daemon.cancel.cancelled() => return,
                }
            }
        });
    }

    async fn publish_machine_record(self: &Arc<Self>) {
        let Some(sync) = self.sync.read().await.clone() else {
            return;
        };
        let active: Vec<SessionId> = self
            .sessions
            .iter()
            .map(|e| SessionId::from(e.key().as_str()))
            .collect();
        let record = machine::machine_record(MachineStatus::Online, active);
        let entity = EntityRef::machine(self.machine_id.as_str());
        let result = sync
            .mutate(entity, MutateOptions::default(), move |_| {
                serde_json::to_value(&record).unwrap_or_default()
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "machine heartbeat failed");
        }
    }

    fn spawn_update_check(self: &Arc<Self>) {
        let daemon = Arc::clone(self);
        let _ = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                daemon.config.update_check_interval_secs,
            ));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if daemon.newer_version_installed() {
                            daemon.restart_pending.store(true, Ordering::Relaxed);
                        }
                        // Restart only once the daemon is idle.
                        if daemon.restart_pending.load(Ordering::Relaxed)
                            && daemon.sessions.is_empty()
                        {
                            info!("newer version installed and no active sessions, restarting");
                            daemon.shutdown();
                            return;
                        }
                    }
                    () = daemon.cancel.cancelled() => return,
                }
            }
        });
    }

    /// Compare the on-disk package version against this binary.
    fn newer_version_installed(&self) -> bool {
        let marker = self.config.state_dir.join("installed-version");
        match std::fs::read_to_string(marker) {
            Ok(installed) => installed.trim() != env!("CARGO_PKG_VERSION"),
            Err(_) => false,
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let daemon = Arc::clone(self);
        let _ = tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                let delay = daemon.config.backoff.delay_for_attempt(attempt);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    () = daemon.cancel.cancelled() => return,
                }
                match SyncClient::connect(
                    SyncConfig {
                        server_url: daemon.config.server_url.clone(),
                        token: daemon.token.clone(),
                        connection_kind: ConnectionKind::MachineScoped,
                        scope_ref: Some(daemon.machine_id.to_string()),
                        backoff: daemon.config.backoff.clone(),
                        outbox_capacity: 128,
                        cursor_path: Some(daemon.config.cursors_file()),
                        heartbeat_interval_secs: 20,
                    },
                    daemon.crypto.clone(),
                )
                .await
                {
                    Ok(client) => {
                        info!("relay reachable again, daemon online");
                        *daemon.sync.write().await = Some(Arc::new(client));
                        daemon.register_machine_rpc().await;
                        return;
                    }
                    Err(SyncError::Auth { reason }) => {
                        warn!(reason, "credentials rejected during reconnect");
                        return;
                    }
                    Err(_) => continue,
                }
            }
        });
    }

    /// Serve `spawnSession` on the machine scope so a phone can start
    /// sessions on this host.
    async fn register_machine_rpc(self: &Arc<Self>) {
        let Some(sync) = self.sync.read().await.clone() else {
            return;
        };
        let daemon = Arc::clone(self);
        let result = sync
            .register(
                Scope::machine(self.machine_id.as_str()),
                ipc::METHOD_SPAWN_SESSION,
                move |params| {
                    let daemon = Arc::clone(&daemon);
                    Box::pin(async move {
                        daemon
                            .handle_ipc(ipc::METHOD_SPAWN_SESSION, params)
                            .await
                            .map_err(|e| json!({"error": e}))
                    })
                },
            )
            .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to register machine rpc");
        }
    }

    // ── Control surface (shared by IPC and machine RPC) ─────────────

    async fn handle_ipc(self: &Arc<Self>, method: &str, params: Value) -> Result<Value, String> {
        match method {
            ipc::METHOD_SPAWN_SESSION => self.spawn_session(params).await,
            ipc::METHOD_LIST_SESSIONS => Ok(json!({
                "sessions": self
                    .sessions
                    .iter()
                    .map(|e| json!({"id": e.key()}))
                    .collect::<Vec<_>>(),
            })),
            ipc::METHOD_STOP_SESSION => {
                let id = params["sessionId"].as_str().unwrap_or_default().to_owned();
                match self.sessions.remove(&id) {
                    Some((_, session)) => {
                        session.stop(&self.config).await;
                        Ok(json!({"stopped": true}))
                    }
                    None => Err(format!("unknown session: {id}")),
                }
            }
            ipc::METHOD_STATUS => Ok(json!({
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "machineId": self.machine_id.as_str(),
                "activeSessions": self.sessions.len(),
                "connected": self.sync.read().await.is_some(),
                "restartPending": self.restart_pending.load(Ordering::Relaxed),
            })),
            ipc::METHOD_SHUTDOWN => {
                self.shutdown();
                Ok(json!({"shuttingDown": true}))
            }
            other => Err(format!("unknown method: {other}")),
        }
    }

    async fn spawn_session(self: &Arc<Self>, params: Value) -> Result<Value, String> {
        if self.sync.read().await.is_none() {
            return Err("daemon is offline".into());
        }
        let working_dir = params["workingDir"]
            .as_str()
            .ok_or("workingDir required")?
            .to_owned();
        let flavor: Flavor = params["flavor"]
            .as_str()
            .unwrap_or("claude")
            .parse()
            .map_err(|e: String| e)?;
        let permission_mode = params["permissionMode"]
            .as_str()
            .map(|m| serde_json::from_value(json!(m)))
            .transpose()
            .map_err(|e| format!("bad permissionMode: {e}"))?
            .unwrap_or(PermissionMode::Default);

        let session = SessionRuntime::start(SessionConfig {
            daemon: self.config.clone(),
            flavor,
            working_dir: working_dir.into(),
            model: params["model"].as_str().map(str::to_owned),
            permission_mode,
            machine_id: self.machine_id.clone(),
            token: self.token.clone(),
            crypto: self.crypto.clone(),
            auto_approve_plan: params["autoApprovePlan"].as_bool().unwrap_or(false),
            program_override: None,
        })
        .await
        .map_err(|e| e.to_string())?;

        let id = session.session_id.to_string();
        let _ = self.sessions.insert(id.clone(), session.clone());

        // Reap the table entry when the session ends on its own.
        let daemon = Arc::clone(self);
        let reap_id = id.clone();
        let _ = tokio::spawn(async move {
            session.done().await;
            let _ = daemon.sessions.remove(&reap_id);
        });

        Ok(json!({"sessionId": id}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use happy_crypto::{Credentials, MasterSecret};

    fn seeded_config() -> DaemonConfig {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::with_dirs(
            dir.path().to_path_buf(),
            // Nothing listens here: daemon boots offline.
            "http://127.0.0.1:1".into(),
        );
        let secret = MasterSecret::random();
        let creds = Credentials::new("acct-test", "tok-test", &secret);
        credentials::save_credentials(
            &credentials::credentials_path(&config.state_dir),
            &creds,
        )
        .unwrap();
        // Leak the tempdir so the state dir outlives the test body.
        std::mem::forget(dir);
        config
    }

    #[tokio::test]
    async fn boot_without_credentials_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::with_dirs(dir.path().to_path_buf(), "http://127.0.0.1:1".into());
        let err = Daemon::start(config).await.unwrap_err();
        assert!(matches!(err, DaemonError::NotAuthenticated(_)));
    }

    #[tokio::test]
    async fn boots_offline_when_relay_unreachable() {
        let config = seeded_config();
        let daemon = Daemon::start(config).await.unwrap();
        let status = daemon.handle_ipc(ipc::METHOD_STATUS, json!({})).await.unwrap();
        assert_eq!(status["connected"], false);
        assert_eq!(status["activeSessions"], 0);
        daemon.shutdown();
    }

    #[tokio::test]
    async fn state_file_written_and_removed() {
        let config = seeded_config();
        let state_path = config.state_file();
        let daemon = Daemon::start(config).await.unwrap();
        let state = state_file::load(&state_path).unwrap();
        assert_eq!(state.port, daemon.ipc_port());
        assert_eq!(state.pid, std::process::id());

        daemon.shutdown();
        daemon.run().await;
        assert!(state_file::load(&state_path).is_none(), "state file cleaned up");
    }

    #[tokio::test]
    async fn second_daemon_is_rejected() {
        let config = seeded_config();
        let daemon = Daemon::start(config.clone()).await.unwrap();
        let err = Daemon::start(config).await.unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyRunning { .. }));
        daemon.shutdown();
    }

    #[tokio::test]
    async fn ipc_status_over_the_wire() {
        let config = seeded_config();
        let state_path = config.state_file();
        let daemon = Daemon::start(config).await.unwrap();
        let state = state_file::load(&state_path).unwrap();

        let status = ipc::call(state.port, &state.token, ipc::METHOD_STATUS, json!({}))
            .await
            .unwrap();
        assert_eq!(status["pid"], std::process::id());
        assert_eq!(status["version"], env!("CARGO_PKG_VERSION"));
        daemon.shutdown();
    }

    #[tokio::test]
    async fn spawn_session_offline_is_refused() {
        let config = seeded_config();
        let daemon = Daemon::start(config).await.unwrap();
        let err = daemon
            .handle_ipc(
                ipc::METHOD_SPAWN_SESSION,
                json!({"workingDir": "/tmp", "flavor": "claude"}),
            )
            .await
            .unwrap_err();
        assert!(err.contains("offline"));
        daemon.shutdown();
    }

    #[tokio::test]
    async fn unknown_ipc_method_is_error() {
        let config = seeded_config();
        let daemon = Daemon::start(config).await.unwrap();
        let err = daemon.handle_ipc("bogus", json!({})).await.unwrap_err();
        assert!(err.contains("unknown method"));
        daemon.shutdown();
    }

    #[tokio::test]
    async fn newer_version_marker_sets_restart_flag() {
        let config = seeded_config();
        std::fs::write(config.state_dir.join("installed-version"), "99.0.0").unwrap();
        let daemon = Daemon::start(config).await.unwrap();
        assert!(daemon.newer_version_installed());
        daemon.shutdown();
    }

    #[tokio::test]
    async fn same_version_marker_is_not_an_update() {
        let config = seeded_config();
        std::fs::write(
            config.state_dir.join("installed-version"),
            env!("CARGO_PKG_VERSION"),
        )
        .unwrap();
        let daemon = Daemon::start(config).await.unwrap();
        assert!(!daemon.newer_version_installed());
        daemon.shutdown();
    }
}
