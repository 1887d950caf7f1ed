//! Coordinator session lifecycle
//!
//! `SessionController` is the single owner of the coordinator session:
//!
//! ```text
//! Idle -> Authenticating -> Syncing -> Connecting -> Announcing -> Active
//!                                         ^                          |
//!                                         +------ Reconnecting <-----+
//! ```
//!
//! `ShutDown` is reachable from every state. Acknowledgments are matched to
//! their request by ack id, and both timers live inside the controller, so
//! nothing outside its event loop can fire or cancel them.

pub mod channel;
pub mod protocol;
pub mod timer;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::certs::CertInstaller;
use crate::config::{Config, SessionConfig};
use crate::coordinator::PROTOCOL_VERSION;
use crate::counters::Counters;
use crate::credentials::{CredentialManager, Token};
use crate::download::{DownloadCoordinator, SyncReport};
use crate::error::NodeError;
use crate::manifest::ManifestClient;
use crate::shutdown;
use channel::{ChannelHandle, Connector, Inbound};
use protocol::ack_result;
use timer::TimerSlot;

pub const EVENT_ENABLE: &str = "enable";
pub const EVENT_KEEP_ALIVE: &str = "keep-alive";
pub const EVENT_REQUEST_CERT: &str = "request-cert";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Authenticating,
    Syncing,
    Connecting,
    Announcing,
    Active,
    Reconnecting,
    ShutDown,
}

/// Payload of the `enable` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub host: String,
    pub port: u16,
    pub version: String,
    pub byoc: bool,
    pub no_fast_enable: bool,
}

impl Announcement {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.session.public_host.clone(),
            port: config.announced_port(),
            version: PROTOCOL_VERSION.to_string(),
            byoc: config.session.byoc,
            no_fast_enable: false,
        }
    }
}

/// Served usage as `{hits, bytes}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub hits: u64,
    pub bytes: u64,
}

impl Usage {
    /// Usage since `baseline`. A counter below its baseline has rolled over
    /// and is reported whole.
    pub fn since(self, baseline: Usage) -> Usage {
        let delta = |current: u64, base: u64| {
            if current >= base {
                current - base
            } else {
                current
            }
        };
        Usage {
            hits: delta(self.hits, baseline.hits),
            bytes: delta(self.bytes, baseline.bytes),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CertMaterial {
    cert: String,
    key: String,
}

/// What an outstanding ack id belongs to
#[derive(Debug, Clone, Copy)]
enum Request {
    Enable,
    KeepAlive { sampled: Usage, delta: Usage },
    RequestCert,
}

struct Session {
    state: SessionState,
    token: Option<Token>,
    channel: Option<ChannelHandle>,
    last_heartbeat_sent_at: Option<Instant>,
    heartbeat: TimerSlot,
    timeout: TimerSlot,
    pending: HashMap<u64, Request>,
    next_ack_id: u64,
    /// Usage the coordinator has acknowledged
    reported: Usage,
    reconnect_after: Duration,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            token: None,
            channel: None,
            last_heartbeat_sent_at: None,
            heartbeat: TimerSlot::new(),
            timeout: TimerSlot::new(),
            pending: HashMap::new(),
            next_ack_id: 0,
            reported: Usage::default(),
            reconnect_after: Duration::ZERO,
        }
    }
}

enum Wake {
    Inbound(Inbound),
    HeartbeatDue,
    AckTimeout,
}

/// Collaborators the controller drives
pub struct SessionParts {
    pub credentials: Arc<CredentialManager>,
    pub manifest: ManifestClient,
    pub downloads: DownloadCoordinator,
    pub connector: Arc<dyn Connector>,
    pub counters: Arc<dyn Counters>,
    pub certs: Arc<dyn CertInstaller>,
}

pub struct SessionController {
    credentials: Arc<CredentialManager>,
    manifest: ManifestClient,
    downloads: DownloadCoordinator,
    connector: Arc<dyn Connector>,
    counters: Arc<dyn Counters>,
    certs: Arc<dyn CertInstaller>,
    announcement: Announcement,
    config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
    shutdown: watch::Receiver<bool>,
    session: Session,
}

impl SessionController {
    pub fn new(
        parts: SessionParts,
        announcement: Announcement,
        config: SessionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            credentials: parts.credentials,
            manifest: parts.manifest,
            downloads: parts.downloads,
            connector: parts.connector,
            counters: parts.counters,
            certs: parts.certs,
            announcement,
            config,
            state_tx,
            shutdown,
            session: Session::new(),
        }
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    /// Drive the session until shutdown
    pub async fn run(mut self) {
        let mut stop = self.shutdown.clone();
        info!(host = %self.announcement.host, port = self.announcement.port, "Session controller started");

        while self.session.state != SessionState::ShutDown {
            tokio::select! {
                _ = shutdown::wait_for(&mut stop) => break,
                _ = self.step() => {}
            }
        }

        self.teardown();
        self.transition(SessionState::ShutDown);
        info!("Session controller stopped");
    }

    async fn step(&mut self) {
        match self.session.state {
            SessionState::Idle => self.transition(SessionState::Authenticating),
            SessionState::Authenticating => match self.credentials.get_token().await {
                Ok(token) => {
                    self.session.token = Some(token);
                    self.transition(SessionState::Syncing);
                }
                Err(e) => {
                    warn!(error = %e, "Cannot authenticate, retrying");
                    tokio::time::sleep(self.config.reconnect_delay()).await;
                }
            },
            SessionState::Syncing => match self.synchronize().await {
                Ok(_) => self.transition(SessionState::Connecting),
                Err(e) => {
                    error!(
                        error = %e,
                        retry_secs = self.config.sync_retry_delay_secs,
                        "Sync failed, serving what is present until the retry"
                    );
                    tokio::time::sleep(self.config.sync_retry_delay()).await;
                }
            },
            SessionState::Connecting => self.connect().await,
            SessionState::Announcing | SessionState::Active => self.drive().await,
            SessionState::Reconnecting => {
                tokio::time::sleep(self.session.reconnect_after).await;
                self.transition(SessionState::Connecting);
            }
            SessionState::ShutDown => {}
        }
    }

    fn transition(&mut self, next: SessionState) {
        let previous = self.session.state;
        if previous == next {
            return;
        }
        info!(from = ?previous, to = ?next, "Session state changed");
        self.session.state = next;
        self.state_tx.send_replace(next);
    }

    async fn synchronize(&mut self) -> Result<SyncReport, NodeError> {
        let manifest = self.manifest.fetch_manifest().await?;
        let report = self.downloads.sync(&manifest).await?;
        if !report.is_complete() {
            warn!(
                failed = report.failed.len(),
                "Continuing with objects that could not be fetched"
            );
        }
        Ok(report)
    }

    async fn connect(&mut self) {
        // Reconnects keep the session's token until it expires
        let held = self.session.token.clone().filter(|t| !t.is_expired());
        let token = match held {
            Some(token) => token,
            None => match self.credentials.get_token().await {
                Ok(token) => token,
                Err(e) => {
                    warn!(error = %e, "No token for session channel");
                    self.enter_reconnecting(self.config.reconnect_delay());
                    return;
                }
            },
        };

        match self.connector.connect(&token.value).await {
            Ok(channel) => {
                self.session.token = Some(token);
                self.session.channel = Some(channel);
                self.transition(SessionState::Announcing);
                if let Err(e) = self.announce().await {
                    warn!(error = %e, "Announcement failed");
                    self.enter_reconnecting(self.config.reconnect_delay());
                }
            }
            Err(e) => {
                warn!(error = %e, "Session channel connect failed");
                self.enter_reconnecting(self.config.reconnect_delay());
            }
        }
    }

    /// Provision a certificate if we need one, otherwise enable right away
    async fn announce(&mut self) -> Result<(), NodeError> {
        if !self.announcement.byoc && !self.certs.has_material().await {
            info!("No TLS material present, requesting certificate");
            return self.request(Request::RequestCert, EVENT_REQUEST_CERT, Vec::new()).await;
        }
        self.send_enable().await
    }

    async fn send_enable(&mut self) -> Result<(), NodeError> {
        let payload = serde_json::to_value(&self.announcement)?;
        self.request(Request::Enable, EVENT_ENABLE, vec![payload]).await
    }

    async fn request(
        &mut self,
        request: Request,
        event: &str,
        args: Vec<Value>,
    ) -> Result<(), NodeError> {
        let channel = self
            .session
            .channel
            .as_ref()
            .ok_or_else(|| NodeError::Session("No open channel".into()))?;
        let id = self.session.next_ack_id;
        self.session.next_ack_id += 1;

        channel.emit(event, args, Some(id)).await?;
        self.session.pending.insert(id, request);
        debug!(event, id, "Request sent");
        Ok(())
    }

    async fn drive(&mut self) {
        let Some(channel) = self.session.channel.as_mut() else {
            self.enter_reconnecting(self.config.reconnect_delay());
            return;
        };

        let wake = tokio::select! {
            message = channel.recv() => Wake::Inbound(message),
            _ = self.session.heartbeat.fired() => Wake::HeartbeatDue,
            _ = self.session.timeout.fired() => Wake::AckTimeout,
        };

        match wake {
            Wake::Inbound(message) => self.on_inbound(message).await,
            Wake::HeartbeatDue => self.send_heartbeat().await,
            Wake::AckTimeout => {
                let waited_ms = self
                    .session
                    .last_heartbeat_sent_at
                    .map(|sent| sent.elapsed().as_millis() as u64);
                warn!(
                    timeout_secs = self.config.ack_timeout_secs,
                    ?waited_ms,
                    "Keep-alive not acknowledged, reconnecting"
                );
                self.enter_reconnecting(Duration::ZERO);
            }
        }
    }

    async fn on_inbound(&mut self, message: Inbound) {
        match message {
            Inbound::Closed(reason) => {
                warn!(reason = %reason, "Session channel closed");
                self.enter_reconnecting(self.config.reconnect_delay());
            }
            Inbound::Event { name, args } => {
                debug!(event = %name, ?args, "Unsolicited coordinator event");
            }
            Inbound::Ack { id, args } => match self.session.pending.remove(&id) {
                Some(request) => self.on_ack(request, &args).await,
                None => warn!(id, "Acknowledgment for unknown request"),
            },
        }
    }

    async fn on_ack(&mut self, request: Request, args: &[Value]) {
        let delay = self.config.reconnect_delay();
        match request {
            Request::Enable => match ack_result(args) {
                Ok(Value::Bool(true)) => {
                    info!("Coordinator enabled this node");
                    self.transition(SessionState::Active);
                    self.session.heartbeat.arm(self.config.heartbeat_interval());
                }
                Ok(other) => {
                    error!(ack = %other, "Enable not confirmed");
                    self.enter_reconnecting(delay);
                }
                Err(message) => {
                    error!(error = %message, "Coordinator rejected enable");
                    self.enter_reconnecting(delay);
                }
            },
            Request::KeepAlive { sampled, delta } => {
                self.session.timeout.disarm();
                match ack_result(args) {
                    Ok(_) => {
                        self.session.reported = sampled;
                        info!(hits = delta.hits, bytes = delta.bytes, "Keep-alive acknowledged");
                        self.session.heartbeat.arm(self.config.heartbeat_interval());
                    }
                    Err(message) => {
                        error!(error = %message, "Coordinator rejected keep-alive");
                        self.enter_reconnecting(delay);
                    }
                }
            }
            Request::RequestCert => {
                let installed = match ack_result(args) {
                    Ok(value) => match serde_json::from_value::<CertMaterial>(value) {
                        Ok(material) => self.certs.install(&material.cert, &material.key).await,
                        Err(e) => Err(NodeError::Session(format!("Invalid certificate payload: {}", e))),
                    },
                    Err(message) => Err(NodeError::Session(message)),
                };
                let enabled = match installed {
                    Ok(()) => self.send_enable().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = enabled {
                    error!(error = %e, "Certificate provisioning failed");
                    self.enter_reconnecting(delay);
                }
            }
        }
    }

    async fn send_heartbeat(&mut self) {
        let sampled = Usage {
            hits: self.counters.current_hit_count(),
            bytes: self.counters.current_byte_count(),
        };
        let delta = sampled.since(self.session.reported);
        let payload = json!({
            "time": unix_secs(),
            "hits": delta.hits,
            "bytes": delta.bytes,
        });

        match self
            .request(Request::KeepAlive { sampled, delta }, EVENT_KEEP_ALIVE, vec![payload])
            .await
        {
            Ok(()) => {
                self.session.last_heartbeat_sent_at = Some(Instant::now());
                self.session.timeout.arm(self.config.ack_timeout());
            }
            Err(e) => {
                warn!(error = %e, "Keep-alive send failed");
                self.enter_reconnecting(self.config.reconnect_delay());
            }
        }
    }

    /// Drop the channel and everything tied to it. The token is kept.
    fn enter_reconnecting(&mut self, after: Duration) {
        self.teardown();
        self.session.reconnect_after = after;
        self.transition(SessionState::Reconnecting);
    }

    fn teardown(&mut self) {
        if let Some(channel) = self.session.channel.take() {
            channel.close();
        }
        self.session.heartbeat.disarm();
        self.session.timeout.disarm();
        self.session.pending.clear();
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
