//! Bringing the local store in line with the manifest
//!
//! `sync` computes which objects are missing, then drains them through a
//! shared `WorkQueue` with `max_parallel` workers. Each transfer streams into
//! an `ObjectWriter`, so nothing becomes visible before its digest checks
//! out. Failed objects go back on the queue until `max_attempts` is reached;
//! faults a retry cannot fix, such as an invalid object hash, fail at once.

pub mod progress;
pub mod queue;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::DownloadConfig;
use crate::coordinator::CoordinatorClient;
use crate::credentials::CredentialManager;
use crate::error::NodeError;
use crate::manifest::{total_size, ManifestEntry};
use crate::shutdown;
use crate::storage::ContentStore;
use progress::{format_bytes, SyncProgress};
use queue::{DownloadTask, WorkQueue};

/// Concurrent stat calls while computing the missing set
const EXISTENCE_CHECK_CONCURRENCY: usize = 64;

/// An object given up on after exhausting its attempts
#[derive(Debug, Clone, Serialize)]
pub struct FailedObject {
    pub entry: ManifestEntry,
    pub attempts: u32,
    pub error: String,
}

/// Outcome of one sync pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Objects that were missing when the pass started
    pub missing: usize,
    pub downloaded: usize,
    pub bytes: u64,
    pub failed: Vec<FailedObject>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Entries unique by hash, in manifest order
pub fn dedup_by_hash(entries: &[ManifestEntry]) -> Vec<ManifestEntry> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .filter(|e| seen.insert(e.hash.as_str()))
        .cloned()
        .collect()
}

struct Worker {
    client: CoordinatorClient,
    credentials: Arc<CredentialManager>,
    store: Arc<ContentStore>,
    progress: Arc<SyncProgress>,
    max_attempts: u32,
    retry_delay: Duration,
    idle_timeout: Duration,
}

/// Drives downloads of missing objects
pub struct DownloadCoordinator {
    worker: Arc<Worker>,
    config: DownloadConfig,
    shutdown: watch::Receiver<bool>,
}

impl DownloadCoordinator {
    pub fn new(
        client: CoordinatorClient,
        credentials: Arc<CredentialManager>,
        store: Arc<ContentStore>,
        progress: Arc<SyncProgress>,
        config: DownloadConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let worker = Worker {
            client,
            credentials,
            store,
            progress,
            max_attempts: config.max_attempts,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs.max(1)),
        };
        Self {
            worker: Arc::new(worker),
            config,
            shutdown,
        }
    }

    pub fn progress(&self) -> Arc<SyncProgress> {
        Arc::clone(&self.worker.progress)
    }

    /// Entries not present locally with their declared size
    pub async fn missing(&self, manifest: &[ManifestEntry]) -> Vec<ManifestEntry> {
        let store = &self.worker.store;
        stream::iter(dedup_by_hash(manifest))
            .map(|entry| async move {
                let present = store.exists(&entry.hash, entry.size).await;
                (!present).then_some(entry)
            })
            .buffered(EXISTENCE_CHECK_CONCURRENCY)
            .filter_map(|e| async move { e })
            .collect()
            .await
    }

    /// Download every missing object of `manifest`.
    ///
    /// Returns once each missing object is either stored or recorded in
    /// `SyncReport::failed`. An interrupted sync returns `Download`.
    pub async fn sync(&self, manifest: &[ManifestEntry]) -> Result<SyncReport, NodeError> {
        let missing = self.missing(manifest).await;
        if missing.is_empty() {
            info!(objects = manifest.len(), "Store already synchronized");
            return Ok(SyncReport::default());
        }

        let missing_bytes = total_size(&missing);
        info!(
            missing = missing.len(),
            bytes = %format_bytes(missing_bytes),
            workers = self.config.max_parallel,
            "Starting sync"
        );

        let progress = &self.worker.progress;
        progress.begin(missing.len() as u64, missing_bytes);

        let report = Arc::new(Mutex::new(SyncReport {
            missing: missing.len(),
            ..Default::default()
        }));
        let queue = Arc::new(WorkQueue::new(missing.into_iter().map(DownloadTask::new)));
        let reporter = self.spawn_reporter();

        let mut workers = JoinSet::new();
        for id in 0..self.config.max_parallel.max(1) {
            let worker = Arc::clone(&self.worker);
            let queue = Arc::clone(&queue);
            let report = Arc::clone(&report);
            let shutdown = self.shutdown.clone();
            workers.spawn(async move { worker.run(id, queue, report, shutdown).await });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Download worker panicked");
            }
        }
        reporter.abort();

        let mut report = report
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|e| e.into_inner().clone());
        for task in queue.take_abandoned() {
            progress.file_failed();
            report.failed.push(FailedObject {
                entry: task.entry,
                attempts: task.attempts + 1,
                error: "Download worker panicked".to_string(),
            });
        }

        if queue.outstanding() > 0 {
            return Err(NodeError::Download(format!(
                "Sync interrupted with {} objects outstanding",
                queue.outstanding()
            )));
        }

        if report.is_complete() {
            info!(
                downloaded = report.downloaded,
                bytes = %format_bytes(report.bytes),
                "Sync complete"
            );
        } else {
            warn!(
                downloaded = report.downloaded,
                failed = report.failed.len(),
                "Sync finished with failures"
            );
        }
        Ok(report)
    }

    fn spawn_reporter(&self) -> tokio::task::JoinHandle<()> {
        let progress = Arc::clone(&self.worker.progress);
        let every = Duration::from_secs(self.config.progress_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                progress.sample();
                let snap = progress.snapshot();
                info!(
                    files = %format!("{}/{}", snap.files_done, snap.files_total),
                    bytes = %format!("{}/{}", format_bytes(snap.bytes_done), format_bytes(snap.bytes_total)),
                    speed = %format!("{}/s", format_bytes(snap.bytes_per_sec)),
                    "Sync progress"
                );
            }
        })
    }
}

impl Worker {
    async fn run(
        &self,
        id: usize,
        queue: Arc<WorkQueue>,
        report: Arc<Mutex<SyncReport>>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let next = tokio::select! {
                task = queue.next() => task,
                _ = shutdown::wait_for(&mut stop) => {
                    debug!(worker = id, "Download worker stopping for shutdown");
                    return;
                }
            };
            let Some(mut claim) = next else {
                debug!(worker = id, "Download worker idle, queue drained");
                return;
            };

            match self.fetch(&claim.task().entry).await {
                Ok(size) => {
                    self.progress.file_done();
                    if let Ok(mut r) = report.lock() {
                        r.downloaded += 1;
                        r.bytes += size;
                    }
                    claim.complete();
                }
                Err(e) => {
                    let task = claim.task_mut();
                    task.attempts += 1;
                    task.last_error = Some(e.to_string());

                    let exhausted = self.max_attempts > 0 && task.attempts >= self.max_attempts;
                    if exhausted || !e.is_transient() {
                        error!(
                            path = %task.entry.path,
                            attempts = task.attempts,
                            error = %e,
                            "Giving up on object"
                        );
                        self.progress.file_failed();
                        if let Ok(mut r) = report.lock() {
                            r.failed.push(FailedObject {
                                entry: task.entry.clone(),
                                attempts: task.attempts,
                                error: e.to_string(),
                            });
                        }
                        claim.complete();
                    } else {
                        warn!(
                            path = %task.entry.path,
                            attempt = task.attempts,
                            error = %e,
                            "Download failed, requeueing"
                        );
                        tokio::time::sleep(self.retry_delay).await;
                        claim.requeue();
                    }
                }
            }
        }
    }

    /// One transfer attempt. Bytes counted toward progress are taken back on
    /// failure.
    async fn fetch(&self, entry: &ManifestEntry) -> Result<u64, NodeError> {
        let mut received = 0;
        let result = self.transfer(entry, &mut received).await;
        if result.is_err() {
            self.progress.revert_bytes(received);
        }
        result
    }

    async fn transfer(&self, entry: &ManifestEntry, received: &mut u64) -> Result<u64, NodeError> {
        let token = self.credentials.get_token().await?;
        let request = self.client.get_object(&entry.path, &token.value).send();
        let response = self.idle_bounded(entry, request).await??;

        if !response.status().is_success() {
            return Err(NodeError::Download(format!(
                "{}: HTTP {}",
                entry.path,
                response.status()
            )));
        }

        let mut writer = self.store.begin(&entry.hash).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = self.idle_bounded(entry, body.next()).await? {
            let chunk = chunk?;
            writer.write_chunk(&chunk).await?;
            *received += chunk.len() as u64;
            self.progress.add_bytes(chunk.len() as u64);
        }

        if writer.written() != entry.size {
            return Err(NodeError::Download(format!(
                "{}: expected {} bytes, received {}",
                entry.path,
                entry.size,
                writer.written()
            )));
        }

        let size = writer.finish().await?;
        debug!(path = %entry.path, hash = %entry.hash, size, "Object downloaded");
        Ok(size)
    }

    /// Fail the transfer when the coordinator goes quiet for too long
    async fn idle_bounded<F: std::future::Future>(
        &self,
        entry: &ManifestEntry,
        step: F,
    ) -> Result<F::Output, NodeError> {
        tokio::time::timeout(self.idle_timeout, step)
            .await
            .map_err(|_| {
                NodeError::Timeout(format!(
                    "{}: no data for {}s",
                    entry.path,
                    self.idle_timeout.as_secs()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, hash: &str) -> ManifestEntry {
        ManifestEntry {
            path: path.to_string(),
            hash: hash.to_string(),
            size: 0,
        }
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let entries = vec![entry("/a", "aa"), entry("/b", "bb"), entry("/a2", "aa")];
        let unique = dedup_by_hash(&entries);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].path, "/a");
        assert_eq!(unique[1].path, "/b");
    }

    #[test]
    fn test_report_completeness() {
        let mut report = SyncReport::default();
        assert!(report.is_complete());
        report.failed.push(FailedObject {
            entry: entry("/a", "aa"),
            attempts: 3,
            error: "HTTP 404".into(),
        });
        assert!(!report.is_complete());
    }
}
