//! Authoritative object list
//!
//! The coordinator serves the manifest at `/openbmclapi/files` as a
//! zstd-compressed, schema-encoded array of `{path, hash, size}` records.

pub mod avro;

use std::sync::Arc;

use async_compression::tokio::bufread::ZstdDecoder;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::coordinator::{CoordinatorClient, FILES_PATH};
use crate::credentials::CredentialManager;
use crate::error::NodeError;

/// One object the node should hold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Object path on the coordinator
    pub path: String,
    /// Content hash, also the storage key
    pub hash: String,
    /// Size in bytes
    pub size: u64,
}

/// Total declared bytes of a set of entries
pub fn total_size(entries: &[ManifestEntry]) -> u64 {
    entries.iter().map(|e| e.size).sum()
}

/// Decompress a zstd frame
pub async fn decompress(data: &[u8]) -> Result<Vec<u8>, NodeError> {
    let mut decoder = ZstdDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .await
        .map_err(|e| NodeError::Manifest(format!("Decompression failed: {}", e)))?;
    Ok(out)
}

/// Fetches and decodes the manifest
pub struct ManifestClient {
    client: CoordinatorClient,
    credentials: Arc<CredentialManager>,
}

impl ManifestClient {
    pub fn new(client: CoordinatorClient, credentials: Arc<CredentialManager>) -> Self {
        Self { client, credentials }
    }

    pub async fn fetch_manifest(&self) -> Result<Vec<ManifestEntry>, NodeError> {
        info!("Requesting manifest");

        let token = self.credentials.get_token().await?;
        let response = self
            .client
            .get_authed(FILES_PATH, &token.value)
            .send()
            .await
            .map_err(|e| NodeError::Manifest(format!("Manifest request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(NodeError::Manifest(format!(
                "Manifest request rejected: HTTP {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| NodeError::Manifest(format!("Manifest body read failed: {}", e)))?;
        debug!(compressed_bytes = body.len(), "Manifest received");

        let raw = decompress(&body).await?;
        let entries = avro::decode_manifest(&raw)?;

        info!(
            entries = entries.len(),
            total_bytes = total_size(&entries),
            "Manifest decoded"
        );
        Ok(entries)
    }
}
