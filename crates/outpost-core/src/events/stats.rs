//! Send statistics - per-kind event counters since process start

use chrono::{DateTime, Utc};
use outpost_common::types::EventKind;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct SendStatistics {
    since: DateTime<Utc>,
    delivery_attempts: AtomicU64,
    deliveries: AtomicU64,
    bounces: AtomicU64,
    complaints: AtomicU64,
    rejects: AtomicU64,
    rendering_failures: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendStatisticsSnapshot {
    pub since: DateTime<Utc>,
    pub delivery_attempts: u64,
    pub deliveries: u64,
    pub bounces: u64,
    pub complaints: u64,
    pub rejects: u64,
    pub rendering_failures: u64,
}

impl SendStatistics {
    pub fn new() -> Self {
        Self {
            since: Utc::now(),
            delivery_attempts: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            bounces: AtomicU64::new(0),
            complaints: AtomicU64::new(0),
            rejects: AtomicU64::new(0),
            rendering_failures: AtomicU64::new(0),
        }
    }

    pub fn record(&self, kind: EventKind) {
        let counter = match kind {
            EventKind::Send => &self.delivery_attempts,
            EventKind::Delivery => &self.deliveries,
            EventKind::Bounce => &self.bounces,
            EventKind::Complaint => &self.complaints,
            EventKind::Reject => &self.rejects,
            EventKind::RenderingFailure => &self.rendering_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SendStatisticsSnapshot {
        SendStatisticsSnapshot {
            since: self.since,
            delivery_attempts: self.delivery_attempts.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            bounces: self.bounces.load(Ordering::Relaxed),
            complaints: self.complaints.load(Ordering::Relaxed),
            rejects: self.rejects.load(Ordering::Relaxed),
            rendering_failures: self.rendering_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for SendStatistics {
    fn default() -> Self {
        Self::new()
    }
}
