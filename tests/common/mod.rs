//! Shared fixtures: a mock coordinator and manifest encoding

#![allow(dead_code)]

use std::sync::Arc;

use async_compression::tokio::bufread::ZstdEncoder;
use serde_json::json;
use tokio::io::AsyncReadExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mirror_node::config::{ClusterConfig, Config, CoordinatorConfig};
use mirror_node::coordinator::{CoordinatorClient, CHALLENGE_PATH, FILES_PATH, TOKEN_PATH};
use mirror_node::credentials::CredentialManager;
use mirror_node::manifest::ManifestEntry;

pub const TOKEN: &str = "test-token";
pub const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";
pub const ABC_MD5: &str = "900150983cd24fb0d6963f7d28e17f72";
pub const ABC_SHA1: &str = "a9993e364706816aba3e25717850c26c9cd0d89d";

pub fn config_for(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.cluster = ClusterConfig {
        id: "cluster-1".into(),
        secret: "secret".into(),
        auth_retries: 1,
        auth_retry_delay_secs: 0,
    };
    config.coordinator = CoordinatorConfig {
        base_url: server.uri(),
        request_timeout_secs: 5,
    };
    config.download.max_parallel = 4;
    config.download.retry_delay_ms = 10;
    config
}

pub fn credentials_for(config: &Config) -> (CoordinatorClient, Arc<CredentialManager>) {
    let client = CoordinatorClient::new(&config.coordinator).unwrap();
    let credentials = Arc::new(CredentialManager::new(client.clone(), &config.cluster));
    (client, credentials)
}

/// Challenge and token endpoints issuing `TOKEN` for an hour
pub async fn mount_auth(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(CHALLENGE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "challenge": "c-123" })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "token": TOKEN, "ttl": 3_600_000.0 })),
        )
        .mount(server)
        .await;
}

/// Serve `entries` at the manifest endpoint
pub async fn mount_manifest(server: &MockServer, entries: &[ManifestEntry]) {
    let body = zstd(&encode_manifest(entries)).await;
    Mock::given(method("GET"))
        .and(path(FILES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

pub fn entry(path: &str, hash: &str, size: u64) -> ManifestEntry {
    ManifestEntry {
        path: path.to_string(),
        hash: hash.to_string(),
        size,
    }
}

fn long(v: i64) -> Vec<u8> {
    let mut n = ((v << 1) ^ (v >> 63)) as u64;
    let mut out = Vec::new();
    loop {
        if n & !0x7f == 0 {
            out.push(n as u8);
            return out;
        }
        out.push((n as u8 & 0x7f) | 0x80);
        n >>= 7;
    }
}

fn string(s: &str) -> Vec<u8> {
    let mut out = long(s.len() as i64);
    out.extend_from_slice(s.as_bytes());
    out
}

/// Binary-encode entries as a single block
pub fn encode_manifest(entries: &[ManifestEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    if !entries.is_empty() {
        out.extend(long(entries.len() as i64));
        for e in entries {
            out.extend(string(&e.path));
            out.extend(string(&e.hash));
            out.extend(long(e.size as i64));
        }
    }
    out.extend(long(0));
    out
}

pub async fn zstd(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZstdEncoder::new(data);
    let mut out = Vec::new();
    encoder.read_to_end(&mut out).await.unwrap();
    out
}
