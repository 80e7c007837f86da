//! Lightweight global metrics for QuiverPM.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - persistence (range flush)
//! - append-only log
//! - array store
//! - mapped file channel
//! - heap allocator
//! - transactions / recovery

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// ----- Persistence -----
static PERSIST_CALLS: AtomicU64 = AtomicU64::new(0);
static PERSIST_BYTES: AtomicU64 = AtomicU64::new(0);

// ----- Log -----
static LOG_APPENDS: AtomicU64 = AtomicU64::new(0);
static LOG_BYTES: AtomicU64 = AtomicU64::new(0);
static LOG_OVERFLOWS: AtomicU64 = AtomicU64::new(0);
static LOG_CLEARS: AtomicU64 = AtomicU64::new(0);
static LOG_DEFERRED_FLUSHES: AtomicU64 = AtomicU64::new(0);

// ----- Array store -----
static ARRAY_WRITES: AtomicU64 = AtomicU64::new(0);
static ARRAY_CORRUPT_READS: AtomicU64 = AtomicU64::new(0);

// ----- Channel -----
static CHANNEL_WRITES: AtomicU64 = AtomicU64::new(0);
static CHANNEL_BYTES: AtomicU64 = AtomicU64::new(0);

// ----- Heap -----
static HEAP_ALLOCS: AtomicU64 = AtomicU64::new(0);
static HEAP_FREES: AtomicU64 = AtomicU64::new(0);

// ----- Transactions -----
static TX_COMMITS: AtomicU64 = AtomicU64::new(0);
static TX_ROLLBACKS: AtomicU64 = AtomicU64::new(0);
static TX_RECOVERED_REDO: AtomicU64 = AtomicU64::new(0);
static TX_RECOVERED_UNDO: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    // Persistence
    pub persist_calls: u64,
    pub persist_bytes: u64,

    // Log
    pub log_appends: u64,
    pub log_bytes: u64,
    pub log_overflows: u64,
    pub log_clears: u64,
    pub log_deferred_flushes: u64,

    // Array store
    pub array_writes: u64,
    pub array_corrupt_reads: u64,

    // Channel
    pub channel_writes: u64,
    pub channel_bytes: u64,

    // Heap
    pub heap_allocs: u64,
    pub heap_frees: u64,

    // Transactions
    pub tx_commits: u64,
    pub tx_rollbacks: u64,
    pub tx_recovered_redo: u64,
    pub tx_recovered_undo: u64,
}

impl MetricsSnapshot {
    pub fn avg_persist_bytes(&self) -> f64 {
        if self.persist_calls == 0 {
            0.0
        } else {
            self.persist_bytes as f64 / self.persist_calls as f64
        }
    }

    /// Share of log appends that took the two-phase (deferred) flush path.
    pub fn deferred_flush_ratio(&self) -> f64 {
        if self.log_appends == 0 {
            0.0
        } else {
            self.log_deferred_flushes as f64 / self.log_appends as f64
        }
    }
}

// ----- Recorders (Persistence) -----
pub fn record_persist(bytes: usize) {
    PERSIST_CALLS.fetch_add(1, Ordering::Relaxed);
    PERSIST_BYTES.fetch_add(bytes as u64, Ordering::Relaxed);
}

// ----- Recorders (Log) -----
pub fn record_log_append(record_len: usize, deferred: bool) {
    LOG_APPENDS.fetch_add(1, Ordering::Relaxed);
    LOG_BYTES.fetch_add(record_len as u64, Ordering::Relaxed);
    if deferred {
        LOG_DEFERRED_FLUSHES.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_log_overflow() {
    LOG_OVERFLOWS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_log_clear() {
    LOG_CLEARS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Array store) -----
pub fn record_array_write() {
    ARRAY_WRITES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_array_corrupt_read() {
    ARRAY_CORRUPT_READS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Channel) -----
pub fn record_channel_write(bytes: usize) {
    CHANNEL_WRITES.fetch_add(1, Ordering::Relaxed);
    CHANNEL_BYTES.fetch_add(bytes as u64, Ordering::Relaxed);
}

// ----- Recorders (Heap) -----
pub fn record_heap_alloc() {
    HEAP_ALLOCS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_heap_free() {
    HEAP_FREES.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Transactions) -----
pub fn record_tx_commit() {
    TX_COMMITS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_tx_rollback() {
    TX_ROLLBACKS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_tx_recovered(redo: bool) {
    if redo {
        TX_RECOVERED_REDO.fetch_add(1, Ordering::Relaxed);
    } else {
        TX_RECOVERED_UNDO.fetch_add(1, Ordering::Relaxed);
    }
}

// ----- Snapshot / reset -----
pub fn metrics_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        persist_calls: PERSIST_CALLS.load(Ordering::Relaxed),
        persist_bytes: PERSIST_BYTES.load(Ordering::Relaxed),

        log_appends: LOG_APPENDS.load(Ordering::Relaxed),
        log_bytes: LOG_BYTES.load(Ordering::Relaxed),
        log_overflows: LOG_OVERFLOWS.load(Ordering::Relaxed),
        log_clears: LOG_CLEARS.load(Ordering::Relaxed),
        log_deferred_flushes: LOG_DEFERRED_FLUSHES.load(Ordering::Relaxed),

        array_writes: ARRAY_WRITES.load(Ordering::Relaxed),
        array_corrupt_reads: ARRAY_CORRUPT_READS.load(Ordering::Relaxed),

        channel_writes: CHANNEL_WRITES.load(Ordering::Relaxed),
        channel_bytes: CHANNEL_BYTES.load(Ordering::Relaxed),

        heap_allocs: HEAP_ALLOCS.load(Ordering::Relaxed),
        heap_frees: HEAP_FREES.load(Ordering::Relaxed),

        tx_commits: TX_COMMITS.load(Ordering::Relaxed),
        tx_rollbacks: TX_ROLLBACKS.load(Ordering::Relaxed),
        tx_recovered_redo: TX_RECOVERED_REDO.load(Ordering::Relaxed),
        tx_recovered_undo: TX_RECOVERED_UNDO.load(Ordering::Relaxed),
    }
}

pub fn metrics_reset() {
    for c in [
        &PERSIST_CALLS,
        &PERSIST_BYTES,
        &LOG_APPENDS,
        &LOG_BYTES,
        &LOG_OVERFLOWS,
        &LOG_CLEARS,
        &LOG_DEFERRED_FLUSHES,
        &ARRAY_WRITES,
        &ARRAY_CORRUPT_READS,
        &CHANNEL_WRITES,
        &CHANNEL_BYTES,
        &HEAP_ALLOCS,
        &HEAP_FREES,
        &TX_COMMITS,
        &TX_ROLLBACKS,
        &TX_RECOVERED_REDO,
        &TX_RECOVERED_UNDO,
    ] {
        c.store(0, Ordering::Relaxed);
    }
}
