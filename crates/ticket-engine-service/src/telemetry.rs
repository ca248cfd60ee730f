//! Logging bootstrap and delivery counters
//!
//! Counters are plain atomics; `append_stats` writes one JSONL line per
//! snapshot so runs can be compared after the fact.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use ticket_engine::SweepReport;
use tracing::{info, warn};

/// Initialise the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_target(false)
        .try_init();
}

/// Delivery and sweep counters for one service instance
#[derive(Debug, Default)]
pub struct ServiceStats {
    applied: AtomicU64,
    dropped: AtomicU64,
    redelivered: AtomicU64,
    dead_lettered: AtomicU64,
    sweeps: AtomicU64,
    warnings: AtomicU64,
    breaches: AtomicU64,
    auto_assigned_on_retry: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatsSnapshot {
    pub applied: u64,
    pub dropped: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
    pub sweeps: u64,
    pub warnings: u64,
    pub breaches: u64,
    pub auto_assigned_on_retry: u64,
}

impl ServiceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_redelivered(&self) {
        self.redelivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sweep(&self, report: &SweepReport) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.warnings
            .fetch_add(report.warnings as u64, Ordering::Relaxed);
        self.breaches
            .fetch_add(report.breaches as u64, Ordering::Relaxed);
    }

    pub fn record_retry_assignments(&self, assigned: usize) {
        self.auto_assigned_on_retry
            .fetch_add(assigned as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServiceStatsSnapshot {
        ServiceStatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
            breaches: self.breaches.load(Ordering::Relaxed),
            auto_assigned_on_retry: self.auto_assigned_on_retry.load(Ordering::Relaxed),
        }
    }
}

/// Append a snapshot to a JSONL file. Failures are logged, never fatal.
pub fn append_stats(snapshot: &ServiceStatsSnapshot, path: &Path) {
    match serde_json::to_string(snapshot) {
        Ok(json) => {
            use std::io::Write;
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{json}") {
                        warn!("Failed to append stats: {e}");
                    } else {
                        info!(path = %path.display(), "Appended service stats");
                    }
                }
                Err(e) => warn!("Failed to open stats file: {e}"),
            }
        }
        Err(e) => warn!("Failed to serialize stats: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let stats = ServiceStats::new();
        stats.record_applied();
        stats.record_applied();
        stats.record_dropped();
        stats.record_sweep(&SweepReport {
            scanned: 4,
            warnings: 1,
            breaches: 2,
            publish_failures: 0,
        });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.applied, 2);
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.sweeps, 1);
        assert_eq!(snapshot.breaches, 2);
    }

    #[test]
    fn test_append_stats_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.jsonl");
        let stats = ServiceStats::new();
        stats.record_applied();
        append_stats(&stats.snapshot(), &path);
        stats.record_dead_lettered();
        append_stats(&stats.snapshot(), &path);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<ServiceStatsSnapshot> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].dead_lettered, 0);
        assert_eq!(lines[1].dead_lettered, 1);
        assert_eq!(lines[1].applied, 1);
    }
}
