//! Process identity and worker counters.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Build and process identity, logged once at startup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl SystemInfo {
    pub fn current(started_at: DateTime<Utc>) -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            pid: std::process::id(),
            started_at,
        }
    }

    pub fn log(&self) {
        tracing::info!(
            name = self.name,
            version = self.version,
            pid = self.pid,
            started_at = %self.started_at,
            "system info"
        );
    }
}

/// Dispatch counters shared by every worker in the process.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    started: AtomicU64,
    completed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    continuations: AtomicU64,
    continuation_failures: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub started: u64,
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub continuations: u64,
    pub continuation_failures: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl WorkerMetrics {
    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_continuation(&self) {
        self.continuations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_continuation_failure(&self) {
        self.continuation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            continuations: self.continuations.load(Ordering::Relaxed),
            continuation_failures: self.continuation_failures.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_info_carries_the_crate_version() {
        let info = SystemInfo::current(Utc::now());
        assert_eq!(info.name, "conveyor-core");
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn snapshot_reflects_recorded_events() {
        let metrics = WorkerMetrics::default();
        metrics.record_started();
        metrics.record_started();
        metrics.record_completed();
        metrics.record_failed();
        metrics.record_continuation();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.started, 2);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.continuations, 1);
        assert_eq!(snapshot.skipped, 0);
    }
}
