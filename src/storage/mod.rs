//! Content-addressed object store
//!
//! Objects live at `root/<hash[0..2]>/<hash>`. Writes stream into a
//! `.part` file next to the final path and are renamed into place only after
//! the digest matches, so a partial or corrupt object is never visible at
//! its serving path.

pub mod digest;

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::NodeError;
use digest::ContentHasher;

/// Suffix for in-progress writes
const PARTIAL_SUFFIX: &str = "part";

/// Local object store
#[derive(Debug)]
pub struct ContentStore {
    root_dir: PathBuf,
}

impl ContentStore {
    /// Open (creating if needed) a store rooted at `root_dir`
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self, NodeError> {
        let root_dir = root_dir.as_ref().to_path_buf();

        if fs::metadata(&root_dir).await.map(|m| m.is_file()).unwrap_or(false) {
            return Err(NodeError::Config(format!(
                "Storage path {} is a file",
                root_dir.display()
            )));
        }
        fs::create_dir_all(&root_dir).await?;

        info!(path = %root_dir.display(), "Initialized object store");
        Ok(Self { root_dir })
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// Path of an object, rejecting hashes that could escape the root
    pub fn object_path(&self, hash: &str) -> Result<PathBuf, NodeError> {
        if hash.len() < 2 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(NodeError::NotFound(format!("Invalid object hash: {}", hash)));
        }
        Ok(self.root_dir.join(&hash[..2]).join(hash))
    }

    /// Present only if the file exists with exactly the declared size
    pub async fn exists(&self, hash: &str, expected_size: u64) -> bool {
        let Ok(path) = self.object_path(hash) else {
            return false;
        };
        match fs::metadata(&path).await {
            Ok(meta) => meta.is_file() && meta.len() == expected_size,
            Err(_) => false,
        }
    }

    /// Size on disk
    pub async fn size(&self, hash: &str) -> Result<u64, NodeError> {
        let path = self.object_path(hash)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NodeError::NotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open an object for reading
    pub async fn open(&self, hash: &str) -> Result<fs::File, NodeError> {
        let path = self.object_path(hash)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NodeError::NotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Start a streaming write of `hash`
    pub async fn begin(&self, hash: &str) -> Result<ObjectWriter, NodeError> {
        let final_path = self.object_path(hash)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_path = final_path.with_extension(PARTIAL_SUFFIX);
        let file = fs::File::create(&temp_path).await?;

        Ok(ObjectWriter {
            hash: hash.to_string(),
            final_path,
            temp_path,
            file: Some(file),
            hasher: Some(ContentHasher::for_hash(hash)),
            written: 0,
            finished: false,
        })
    }

    /// Write a complete buffer, verifying its digest
    pub async fn write(&self, hash: &str, data: &[u8]) -> Result<u64, NodeError> {
        let mut writer = self.begin(hash).await?;
        writer.write_chunk(data).await?;
        writer.finish().await
    }

    /// Delete an object. Returns whether it existed.
    pub async fn remove(&self, hash: &str) -> Result<bool, NodeError> {
        let path = self.object_path(hash)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// An in-progress object write.
///
/// Dropping it without `finish` removes the partial file.
pub struct ObjectWriter {
    hash: String,
    final_path: PathBuf,
    temp_path: PathBuf,
    file: Option<fs::File>,
    hasher: Option<ContentHasher>,
    written: u64,
    finished: bool,
}

impl ObjectWriter {
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), NodeError> {
        let (Some(file), Some(hasher)) = (self.file.as_mut(), self.hasher.as_mut()) else {
            return Err(NodeError::Download(format!("Writer for {} already closed", self.hash)));
        };
        file.write_all(data).await?;
        hasher.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Verify the digest and move the object into place.
    ///
    /// On mismatch the partial file is deleted and `Integrity` is returned.
    pub async fn finish(mut self) -> Result<u64, NodeError> {
        let (Some(mut file), Some(hasher)) = (self.file.take(), self.hasher.take()) else {
            return Err(NodeError::Download(format!("Writer for {} already closed", self.hash)));
        };
        file.flush().await?;
        drop(file);

        let actual = hasher.finalize();
        if !digest::matches(&self.hash, &actual) {
            warn!(hash = %self.hash, actual = %actual, "Hash mismatch, discarding object");
            // Drop removes the partial file
            return Err(NodeError::Integrity {
                expected: self.hash.clone(),
                actual,
            });
        }

        fs::rename(&self.temp_path, &self.final_path).await?;
        self.finished = true;

        debug!(hash = %self.hash, size = self.written, "Stored object");
        Ok(self.written)
    }
}

impl Drop for ObjectWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.file.take();
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}
