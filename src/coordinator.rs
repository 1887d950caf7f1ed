//! HTTP access to the coordinator
//!
//! Every outbound request carries the cluster user agent. Authenticated
//! requests take a bearer token snapshot from the caller.
//!
//! Control requests (challenge, token, manifest) are bounded by the request
//! timeout end to end. Object transfers only get the connect timeout here;
//! the download worker bounds them by idle time between chunks.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};

use crate::config::CoordinatorConfig;
use crate::error::NodeError;

/// Version of this binary
pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cluster protocol version announced to the coordinator
pub const PROTOCOL_VERSION: &str = "1.9.7";

pub const CHALLENGE_PATH: &str = "/openbmclapi-agent/challenge";
pub const TOKEN_PATH: &str = "/openbmclapi-agent/token";
pub const FILES_PATH: &str = "/openbmclapi/files";

pub fn user_agent() -> String {
    format!("openbmclapi-cluster/{} mirror-node/{}", PROTOCOL_VERSION, CURRENT_VERSION)
}

/// Shared HTTP client bound to one coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    http: Client,
    base_url: String,
    request_timeout: Duration,
}

impl CoordinatorClient {
    pub fn new(config: &CoordinatorConfig) -> Result<Self, NodeError> {
        let request_timeout = Duration::from_secs(config.request_timeout_secs);
        let http = Client::builder()
            .user_agent(user_agent())
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| NodeError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout,
        })
    }

    /// Absolute URL for a coordinator path
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.http.get(self.url(path)).timeout(self.request_timeout)
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.http.post(self.url(path)).timeout(self.request_timeout)
    }

    /// GET with a bearer token
    pub fn get_authed(&self, path: &str, token: &str) -> RequestBuilder {
        self.get(path).bearer_auth(token)
    }

    /// Authenticated object fetch with no overall deadline
    pub fn get_object(&self, path: &str, token: &str) -> RequestBuilder {
        self.http.get(self.url(path)).bearer_auth(token)
    }

    /// Websocket endpoint of the session channel
    pub fn socket_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        format!("{}/socket.io/?EIO=4&transport=websocket", ws_base)
    }
}
