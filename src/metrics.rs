//! Lightweight global metrics for the volume manager.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - Volumes (create/destroy/snapshot/receive/reattach)
//! - Store commits
//! - Diff streams (send/receive bytes, entries skipped thanks to haves)

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Volumes -----
static VOLUMES_CREATED: AtomicU64 = AtomicU64::new(0);
static VOLUMES_DESTROYED: AtomicU64 = AtomicU64::new(0);
static SNAPSHOTS_CREATED: AtomicU64 = AtomicU64::new(0);
static SNAPSHOTS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static VOLUMES_REATTACHED: AtomicU64 = AtomicU64::new(0);

// ----- Store -----
static STORE_COMMITS: AtomicU64 = AtomicU64::new(0);
static STORE_COMMIT_BYTES: AtomicU64 = AtomicU64::new(0);

// ----- Diff streams -----
static DIFF_BYTES_SENT: AtomicU64 = AtomicU64::new(0);
static DIFF_BYTES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static DIFF_ENTRIES_KEPT: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub volumes_created: u64,
    pub volumes_destroyed: u64,
    pub snapshots_created: u64,
    pub snapshots_received: u64,
    pub volumes_reattached: u64,

    pub store_commits: u64,
    pub store_commit_bytes: u64,

    pub diff_bytes_sent: u64,
    pub diff_bytes_received: u64,
    pub diff_entries_kept: u64,
}

impl MetricsSnapshot {
    pub fn avg_commit_bytes(&self) -> f64 {
        if self.store_commits == 0 {
            0.0
        } else {
            self.store_commit_bytes as f64 / self.store_commits as f64
        }
    }
}

// ----- Recorders (Volumes) -----
pub fn record_volume_created() {
    VOLUMES_CREATED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_volume_destroyed() {
    VOLUMES_DESTROYED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_snapshot_created() {
    SNAPSHOTS_CREATED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_snapshot_received() {
    SNAPSHOTS_RECEIVED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_volume_reattached() {
    VOLUMES_REATTACHED.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Store) -----
pub fn record_store_commit(bytes: usize) {
    STORE_COMMITS.fetch_add(1, Ordering::Relaxed);
    STORE_COMMIT_BYTES.fetch_add(bytes as u64, Ordering::Relaxed);
}

// ----- Recorders (Diff streams) -----
pub fn record_diff_sent(bytes: u64) {
    DIFF_BYTES_SENT.fetch_add(bytes, Ordering::Relaxed);
}

pub fn record_diff_received(bytes: u64) {
    DIFF_BYTES_RECEIVED.fetch_add(bytes, Ordering::Relaxed);
}

pub fn record_diff_entry_kept() {
    DIFF_ENTRIES_KEPT.fetch_add(1, Ordering::Relaxed);
}

// ----- Snapshot / Reset -----
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        volumes_created: VOLUMES_CREATED.load(Ordering::Relaxed),
        volumes_destroyed: VOLUMES_DESTROYED.load(Ordering::Relaxed),
        snapshots_created: SNAPSHOTS_CREATED.load(Ordering::Relaxed),
        snapshots_received: SNAPSHOTS_RECEIVED.load(Ordering::Relaxed),
        volumes_reattached: VOLUMES_REATTACHED.load(Ordering::Relaxed),

        store_commits: STORE_COMMITS.load(Ordering::Relaxed),
        store_commit_bytes: STORE_COMMIT_BYTES.load(Ordering::Relaxed),

        diff_bytes_sent: DIFF_BYTES_SENT.load(Ordering::Relaxed),
        diff_bytes_received: DIFF_BYTES_RECEIVED.load(Ordering::Relaxed),
        diff_entries_kept: DIFF_ENTRIES_KEPT.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    VOLUMES_CREATED.store(0, Ordering::Relaxed);
    VOLUMES_DESTROYED.store(0, Ordering::Relaxed);
    SNAPSHOTS_CREATED.store(0, Ordering::Relaxed);
    SNAPSHOTS_RECEIVED.store(0, Ordering::Relaxed);
    VOLUMES_REATTACHED.store(0, Ordering::Relaxed);

    STORE_COMMITS.store(0, Ordering::Relaxed);
    STORE_COMMIT_BYTES.store(0, Ordering::Relaxed);

    DIFF_BYTES_SENT.store(0, Ordering::Relaxed);
    DIFF_BYTES_RECEIVED.store(0, Ordering::Relaxed);
    DIFF_ENTRIES_KEPT.store(0, Ordering::Relaxed);
}
