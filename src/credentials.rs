//! Cluster credential lifecycle
//!
//! Tokens come from a two-step handshake with the coordinator:
//! 1. Request a challenge for our cluster ID
//! 2. Sign it with HMAC-SHA256 over the cluster secret
//! 3. Exchange `{clusterId, challenge, signature}` for `{token, ttl}`
//!
//! A token is refreshed 10 minutes before it expires. Callers always get an
//! owned snapshot, never a reference into the manager.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::coordinator::{CoordinatorClient, CHALLENGE_PATH, TOKEN_PATH};
use crate::error::NodeError;

type HmacSha256 = Hmac<Sha256>;

/// Refresh this long before the coordinator-declared expiry
pub const REFRESH_MARGIN: Duration = Duration::from_secs(600);

/// A bearer token snapshot
#[derive(Debug, Clone)]
pub struct Token {
    pub value: String,
    pub expires_at: Instant,
}

impl Token {
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    challenge: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    cluster_id: &'a str,
    challenge: &'a str,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    /// Lifetime in milliseconds
    ttl: f64,
}

/// Delay until the next refresh for a token with the given lifetime.
///
/// Zero means refresh immediately.
pub fn refresh_delay(ttl_ms: u64) -> Duration {
    Duration::from_millis(ttl_ms).saturating_sub(REFRESH_MARGIN)
}

/// Hex HMAC-SHA256 of the challenge keyed by the cluster secret
pub fn sign_challenge(secret: &str, challenge: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(challenge.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Default)]
struct TokenState {
    token: Option<Token>,
    refresh_at: Option<Instant>,
}

/// Owns the cluster token and keeps it fresh
pub struct CredentialManager {
    client: CoordinatorClient,
    cluster_id: String,
    secret: String,
    retries: u32,
    retry_delay: Duration,
    state: RwLock<TokenState>,
}

impl CredentialManager {
    pub fn new(client: CoordinatorClient, config: &ClusterConfig) -> Self {
        Self {
            client,
            cluster_id: config.id.clone(),
            secret: config.secret.clone(),
            retries: config.auth_retries.max(1),
            retry_delay: Duration::from_secs(config.auth_retry_delay_secs),
            state: RwLock::new(TokenState::default()),
        }
    }

    /// Current token, fetching one if none is cached or the cached one expired.
    ///
    /// Never returns a token whose lifetime has elapsed.
    pub async fn get_token(&self) -> Result<Token, NodeError> {
        if let Some(token) = self.cached().await {
            return Ok(token);
        }
        self.fetch_with_retries().await
    }

    /// Cached token if it is still valid
    pub async fn cached(&self) -> Option<Token> {
        let state = self.state.read().await;
        state.token.as_ref().filter(|t| !t.is_expired()).cloned()
    }

    /// Time until the scheduled refresh, if one is scheduled
    pub async fn next_refresh_in(&self) -> Option<Duration> {
        let state = self.state.read().await;
        state
            .refresh_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    async fn fetch_with_retries(&self) -> Result<Token, NodeError> {
        let mut last_error = None;
        for attempt in 1..=self.retries {
            match self.fetch_token().await {
                Ok(token) => return Ok(token),
                Err(e) => {
                    warn!(attempt, max = self.retries, error = %e, "Token fetch failed");
                    last_error = Some(e);
                    if attempt < self.retries {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        // A concurrent refresh may have succeeded meanwhile
        if let Some(token) = self.cached().await {
            return Ok(token);
        }

        Err(NodeError::Auth(
            last_error.map_or_else(|| "no attempts made".to_string(), |e| e.to_string()),
        ))
    }

    /// Run the handshake once and cache the result.
    ///
    /// The latest successful fetch wins; concurrent fetches are harmless.
    pub async fn fetch_token(&self) -> Result<Token, NodeError> {
        let response = self
            .client
            .get(CHALLENGE_PATH)
            .query(&[("clusterId", self.cluster_id.as_str())])
            .send()
            .await
            .map_err(|e| NodeError::Auth(format!("Challenge request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(NodeError::Auth(format!(
                "Challenge rejected: HTTP {}",
                response.status()
            )));
        }

        let challenge: ChallengeResponse = response
            .json()
            .await
            .map_err(|e| NodeError::Auth(format!("Invalid challenge response: {}", e)))?;

        let request = TokenRequest {
            cluster_id: &self.cluster_id,
            challenge: &challenge.challenge,
            signature: sign_challenge(&self.secret, &challenge.challenge),
        };

        let response = self
            .client
            .post(TOKEN_PATH)
            .json(&request)
            .send()
            .await
            .map_err(|e| NodeError::Auth(format!("Token request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(NodeError::Auth(format!(
                "Signature rejected: HTTP {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| NodeError::Auth(format!("Invalid token response: {}", e)))?;

        let ttl_ms = body.ttl.max(0.0) as u64;
        let now = Instant::now();
        let token = Token {
            value: body.token,
            expires_at: now + Duration::from_millis(ttl_ms),
        };
        let delay = refresh_delay(ttl_ms);

        {
            let mut state = self.state.write().await;
            state.token = Some(token.clone());
            state.refresh_at = Some(now + delay);
        }

        info!(ttl_ms, refresh_in_secs = delay.as_secs(), "Cluster token obtained");
        Ok(token)
    }

    /// Keep the token fresh until shutdown.
    ///
    /// Failures are logged and retried after the configured delay; they never
    /// end the loop.
    pub async fn run_refresh_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let delay = self.next_refresh_in().await.unwrap_or(self.retry_delay);
            debug!(delay_secs = delay.as_secs(), "Next token refresh scheduled");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = crate::shutdown::wait_for(&mut shutdown) => {
                    debug!("Token refresh loop stopped");
                    return;
                }
            }

            if let Err(e) = self.fetch_token().await {
                warn!(error = %e, "Scheduled token refresh failed");
                let mut state = self.state.write().await;
                state.refresh_at = Some(Instant::now() + self.retry_delay);
            }
        }
    }
}
