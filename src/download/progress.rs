//! Sync progress telemetry
//!
//! Counts completed files and bytes, and keeps a short rolling window of
//! per-second byte samples for throughput. Purely advisory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

/// Point-in-time view of a sync
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ProgressSnapshot {
    pub files_done: u64,
    pub files_total: u64,
    pub files_failed: u64,
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Mean over the rolling window
    pub bytes_per_sec: u64,
}

#[derive(Debug)]
struct Window {
    samples: VecDeque<u64>,
    capacity: usize,
    last_total: u64,
    last_at: Instant,
}

#[derive(Debug)]
pub struct SyncProgress {
    files_done: AtomicU64,
    files_total: AtomicU64,
    files_failed: AtomicU64,
    bytes_done: AtomicU64,
    bytes_total: AtomicU64,
    window: Mutex<Window>,
}

impl SyncProgress {
    pub fn new(window_size: usize) -> Self {
        Self {
            files_done: AtomicU64::new(0),
            files_total: AtomicU64::new(0),
            files_failed: AtomicU64::new(0),
            bytes_done: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            window: Mutex::new(Window {
                samples: VecDeque::with_capacity(window_size.max(1)),
                capacity: window_size.max(1),
                last_total: 0,
                last_at: Instant::now(),
            }),
        }
    }

    /// Reset for a new sync of `files` objects totalling `bytes`
    pub fn begin(&self, files: u64, bytes: u64) {
        self.files_done.store(0, Ordering::Relaxed);
        self.files_failed.store(0, Ordering::Relaxed);
        self.bytes_done.store(0, Ordering::Relaxed);
        self.files_total.store(files, Ordering::Relaxed);
        self.bytes_total.store(bytes, Ordering::Relaxed);

        let mut window = self.lock_window();
        window.samples.clear();
        window.last_total = 0;
        window.last_at = Instant::now();
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_done.fetch_add(n, Ordering::Relaxed);
    }

    /// Take back bytes of a transfer that has to be redone
    pub fn revert_bytes(&self, n: u64) {
        let _ = self
            .bytes_done
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(n)));
    }

    pub fn file_done(&self) {
        self.files_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one throughput sample. Call at >=1s spacing.
    pub fn sample(&self) {
        let total = self.bytes_done.load(Ordering::Relaxed);
        let mut window = self.lock_window();
        let elapsed = window.last_at.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let delta = total.saturating_sub(window.last_total);
        let rate = (delta as f64 / elapsed) as u64;

        if window.samples.len() == window.capacity {
            window.samples.pop_front();
        }
        window.samples.push_back(rate);
        window.last_total = total;
        window.last_at = Instant::now();
    }

    pub fn bytes_per_sec(&self) -> u64 {
        let window = self.lock_window();
        if window.samples.is_empty() {
            return 0;
        }
        window.samples.iter().sum::<u64>() / window.samples.len() as u64
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            files_done: self.files_done.load(Ordering::Relaxed),
            files_total: self.files_total.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            bytes_done: self.bytes_done.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
            bytes_per_sec: self.bytes_per_sec(),
        }
    }

    fn lock_window(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Human-readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
