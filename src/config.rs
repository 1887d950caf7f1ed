//! Node configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::NodeError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Cluster identity used for the challenge/signature handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster ID issued by the coordinator
    #[serde(default)]
    pub id: String,

    /// Shared cluster secret (HMAC key)
    #[serde(default)]
    pub secret: String,

    /// Attempts per token fetch before giving up
    #[serde(default = "default_auth_retries")]
    pub auth_retries: u32,

    /// Delay between token fetch attempts
    #[serde(default = "default_auth_retry_delay")]
    pub auth_retry_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Base URL of the coordinator
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Timeout for individual HTTP requests
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the object store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Number of concurrent download workers
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Attempts per object before it is reported as failed (0 = unlimited)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pause before a failed object is requeued
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// How often sync progress is sampled and logged
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,

    /// Number of samples in the rolling throughput window
    #[serde(default = "default_window")]
    pub window_secs: usize,

    /// Longest wait for response headers or the next body chunk of an object
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries idle for longer than this are swept
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,

    /// Ceiling on the total cached bytes
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,

    /// Sweep cadence
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Hostname announced to the coordinator
    #[serde(default)]
    pub public_host: String,

    /// Port announced to the coordinator (defaults to api.http_port)
    #[serde(default)]
    pub public_port: Option<u16>,

    /// Node brings its own certificate
    #[serde(default)]
    pub byoc: bool,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// How long to wait for a heartbeat acknowledgment
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Delay before retrying a failed manifest fetch
    #[serde(default = "default_sync_retry_delay")]
    pub sync_retry_delay_secs: u64,

    /// Where provisioned certificates are written
    #[serde(default = "default_ssl_dir")]
    pub ssl_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP serving port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

// Defaults
fn default_auth_retries() -> u32 { 3 }
fn default_auth_retry_delay() -> u64 { 5 }
fn default_base_url() -> String { "https://openbmclapi.bangbang93.com".to_string() }
fn default_request_timeout() -> u64 { 60 }
fn default_data_dir() -> PathBuf { PathBuf::from("./cache") }
fn default_max_parallel() -> usize { 32 }
fn default_max_attempts() -> u32 { 10 }
fn default_retry_delay_ms() -> u64 { 500 }
fn default_progress_interval() -> u64 { 1 }
fn default_window() -> usize { 5 }
fn default_idle_timeout() -> u64 { 60 }
fn default_idle_ttl() -> u64 { 1440 }
fn default_cache_max_bytes() -> u64 { 512 * 1024 * 1024 } // 512MiB
fn default_sweep_interval() -> u64 { 5 }
fn default_heartbeat_interval() -> u64 { 5 }
fn default_ack_timeout() -> u64 { 30 }
fn default_reconnect_delay() -> u64 { 5 }
fn default_sync_retry_delay() -> u64 { 60 }
fn default_ssl_dir() -> PathBuf { PathBuf::from(".ssl") }
fn default_http_port() -> u16 { 8800 }

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            secret: String::new(),
            auth_retries: default_auth_retries(),
            auth_retry_delay_secs: default_auth_retry_delay(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: default_data_dir() }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            progress_interval_secs: default_progress_interval(),
            window_secs: default_window(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl(),
            max_bytes: default_cache_max_bytes(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            public_host: String::new(),
            public_port: None,
            byoc: false,
            heartbeat_interval_secs: default_heartbeat_interval(),
            ack_timeout_secs: default_ack_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
            sync_retry_delay_secs: default_sync_retry_delay(),
            ssl_dir: default_ssl_dir(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { http_port: default_http_port() }
    }
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self, NodeError> {
        toml::from_str(content).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Reject configurations the node cannot run with
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.cluster.id.is_empty() {
            return Err(NodeError::Config("cluster.id is not set".into()));
        }
        if self.cluster.secret.is_empty() {
            return Err(NodeError::Config("cluster.secret is not set".into()));
        }
        if self.download.max_parallel == 0 {
            return Err(NodeError::Config("download.max_parallel must be at least 1".into()));
        }
        if self.session.heartbeat_interval_secs == 0 {
            return Err(NodeError::Config(
                "session.heartbeat_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Port announced to the coordinator
    pub fn announced_port(&self) -> u16 {
        self.session.public_port.unwrap_or(self.api.http_port)
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn sync_retry_delay(&self) -> Duration {
        Duration::from_secs(self.sync_retry_delay_secs)
    }
}
