//! Process-wide request metrics.
//!
//! Every worker and the sampler touch the same [`Metrics`] value, so all
//! counters are plain atomics and the hot path never takes a lock. Counters
//! are monotonic for the lifetime of a run; nothing resets them between
//! phases. A [`Snapshot`] is a relaxed read of every counter — each counter
//! is individually monotonic across snapshots, but one snapshot is not a
//! globally consistent instant.
//!
//! Latencies land in a fixed exponential histogram: bucket `i` covers
//! durations up to `0.001 * 2^i` seconds, from 1 ms up to roughly 131 s,
//! with the last bucket absorbing anything slower.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use serde::Serialize;

/// Number of latency histogram buckets.
pub const DURATION_BUCKETS: usize = 18;

/// Upper bound in seconds of histogram bucket `i`.
pub fn bucket_bound(i: usize) -> f64 {
    0.001 * (1u64 << i) as f64
}

/// Index of the bucket a duration in seconds falls into.
pub fn bucket_index(seconds: f64) -> usize {
    (0..DURATION_BUCKETS)
        .find(|&i| seconds <= bucket_bound(i))
        .unwrap_or(DURATION_BUCKETS - 1)
}

/// Classification of a failed request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection or protocol failure before a response arrived.
    Transport,
    /// The per-request deadline fired.
    Timeout,
    /// A response arrived but its status is outside the success range.
    Status,
}

/// Shared counter registry. Lives behind an `Arc`; mutators never fail and
/// never block.
#[derive(Debug)]
pub struct Metrics {
    request_sum: AtomicU64,
    request_success: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    conn_open: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    duration_buckets: [AtomicU64; DURATION_BUCKETS],
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            request_sum: AtomicU64::new(0),
            request_success: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            conn_open: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            duration_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Record one attempted request. Bumped before the request is sent, so
    /// `request_sum - (request_success + errors)` equals the in-flight count.
    pub fn inc_request(&self) {
        self.request_sum.fetch_add(1, Relaxed);
    }

    pub fn inc_success(&self) {
        self.request_success.fetch_add(1, Relaxed);
    }

    pub fn inc_error(&self, kind: ErrorKind) {
        self.errors.fetch_add(1, Relaxed);
        if kind == ErrorKind::Timeout {
            self.timeouts.fetch_add(1, Relaxed);
        }
    }

    pub fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Relaxed);
    }

    pub fn add_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Relaxed);
    }

    pub fn observe_duration(&self, seconds: f64) {
        self.duration_buckets[bucket_index(seconds)].fetch_add(1, Relaxed);
    }

    /// Callers must pair every `conn_opened` with exactly one `conn_closed`.
    pub fn conn_opened(&self) {
        self.conn_open.fetch_add(1, Relaxed);
    }

    pub fn conn_closed(&self) {
        self.conn_open.fetch_sub(1, Relaxed);
    }

    pub fn request_sum(&self) -> u64 {
        self.request_sum.load(Relaxed)
    }

    pub fn request_success(&self) -> u64 {
        self.request_success.load(Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Relaxed)
    }

    pub fn conn_open(&self) -> u64 {
        self.conn_open.load(Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Relaxed)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            request_sum: self.request_sum(),
            request_success: self.request_success(),
            errors: self.errors(),
            timeouts: self.timeouts(),
            conn_open: self.conn_open(),
            bytes_written: self.bytes_written(),
            bytes_read: self.bytes_read(),
            duration_buckets: self
                .duration_buckets
                .iter()
                .map(|b| b.load(Relaxed))
                .collect(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time read of every counter, including the cumulative per-bucket
/// latency counts.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Snapshot {
    pub request_sum: u64,
    pub request_success: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub conn_open: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub duration_buckets: Vec<u64>,
}
