//! TLS material provisioned by the coordinator

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::info;

use crate::error::NodeError;

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

/// Persists certificate material handed over by the coordinator
#[async_trait]
pub trait CertInstaller: Send + Sync {
    /// Whether usable material is already present
    async fn has_material(&self) -> bool;

    async fn install(&self, cert_pem: &str, key_pem: &str) -> Result<(), NodeError>;
}

/// Writes `cert.pem` and `key.pem` into a directory
#[derive(Debug, Clone)]
pub struct CertDir {
    dir: PathBuf,
}

impl CertDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }
}

async fn non_empty(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

#[async_trait]
impl CertInstaller for CertDir {
    async fn has_material(&self) -> bool {
        non_empty(&self.cert_path()).await && non_empty(&self.key_path()).await
    }

    async fn install(&self, cert_pem: &str, key_pem: &str) -> Result<(), NodeError> {
        if cert_pem.trim().is_empty() || key_pem.trim().is_empty() {
            return Err(NodeError::Session("Empty certificate material".into()));
        }
        fs::create_dir_all(&self.dir).await?;
        fs::write(self.cert_path(), cert_pem).await?;
        fs::write(self.key_path(), key_pem).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(self.key_path(), std::fs::Permissions::from_mode(0o600)).await?;
        }

        info!(dir = %self.dir.display(), "Installed coordinator-issued certificate");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_install_writes_material() {
        let dir = TempDir::new().unwrap();
        let certs = CertDir::new(dir.path().join("ssl"));
        assert!(!certs.has_material().await);

        certs.install("CERT", "KEY").await.unwrap();
        assert!(certs.has_material().await);
        assert_eq!(std::fs::read_to_string(certs.key_path()).unwrap(), "KEY");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(certs.key_path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_install_rejects_empty() {
        let dir = TempDir::new().unwrap();
        let certs = CertDir::new(dir.path());
        assert!(certs.install("", "KEY").await.is_err());
    }
}
