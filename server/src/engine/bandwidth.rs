use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A bucket accumulates all traffic arriving within this long of its start.
const BUCKET_SECONDS: i64 = 60;
/// Buckets older than this are discarded.
const RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub bytes: u64,
}

/// Rolling list of per-minute byte counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BandwidthWindow {
    buckets: Vec<Bucket>,
}

impl BandwidthWindow {
    pub fn record(&mut self, bytes: u64, now: DateTime<Utc>) {
        match self.buckets.last_mut() {
            Some(current) if now - current.start < Duration::seconds(BUCKET_SECONDS) => {
                current.bytes += bytes;
            }
            _ => {
                self.buckets.push(Bucket { start: now, bytes });
                let horizon = now - Duration::days(RETENTION_DAYS);
                self.buckets.retain(|b| b.start >= horizon);
            }
        }
    }

    /// Sum of every bucket that started at or after `start`.
    pub fn total_since(&self, start: DateTime<Utc>) -> u64 {
        self.buckets
            .iter()
            .filter(|b| b.start >= start)
            .map(|b| b.bytes)
            .sum()
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }
}

/// Snapshot of both directions, as persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BandwidthSnapshot {
    pub incoming: BandwidthWindow,
    pub outgoing: BandwidthWindow,
}

/// Inbound and outbound traffic counters.
///
/// Updated on every frame, so it has its own lock and never touches the
/// registry lock.
#[derive(Debug, Default)]
pub struct BandwidthLedger {
    inner: Mutex<BandwidthSnapshot>,
}

impl BandwidthLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(&self, snapshot: BandwidthSnapshot) {
        *self.lock() = snapshot;
    }

    pub fn record_in(&self, bytes: usize) {
        self.record_in_at(bytes, Utc::now());
    }

    pub fn record_out(&self, bytes: usize) {
        self.record_out_at(bytes, Utc::now());
    }

    pub fn record_in_at(&self, bytes: usize, now: DateTime<Utc>) {
        self.lock().incoming.record(bytes as u64, now);
    }

    pub fn record_out_at(&self, bytes: usize, now: DateTime<Utc>) {
        self.lock().outgoing.record(bytes as u64, now);
    }

    pub fn total_in_since(&self, start: DateTime<Utc>) -> u64 {
        self.lock().incoming.total_since(start)
    }

    pub fn total_out_since(&self, start: DateTime<Utc>) -> u64 {
        self.lock().outgoing.total_since(start)
    }

    pub fn snapshot(&self) -> BandwidthSnapshot {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BandwidthSnapshot> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
