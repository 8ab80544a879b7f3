//! Scan monitor
//!
//! Counts responses per module and status, invokes a callback once per
//! finished target, and snapshots the counters into the summary record
//! written at shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::grab::ScanStatus;

type StatusCounts = HashMap<String, HashMap<String, u64>>;

/// Invoked once per finished target with the target's host string.
pub type TargetCallback = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
pub struct Monitor {
    statuses: RwLock<StatusCounts>,
    targets_finished: AtomicU64,
    callback: Option<TargetCallback>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: TargetCallback) -> Self {
        Self {
            callback: Some(callback),
            ..Default::default()
        }
    }

    /// Record one module response.
    pub async fn record(&self, module: &str, status: ScanStatus) {
        let mut statuses = self.statuses.write().await;
        *statuses
            .entry(module.to_string())
            .or_default()
            .entry(status.as_str().to_string())
            .or_default() += 1;

        counter!(
            "scan_responses_total",
            1,
            "module" => module.to_string(),
            "status" => status.as_str()
        );
    }

    /// Mark one target as fully processed.
    pub fn target_finished(&self, host: &str) {
        self.targets_finished.fetch_add(1, Ordering::Relaxed);
        counter!("targets_finished_total", 1);
        if let Some(callback) = &self.callback {
            callback(host);
        }
    }

    pub fn targets_finished(&self) -> u64 {
        self.targets_finished.load(Ordering::Relaxed)
    }

    /// Snapshot of the per-module status counters.
    pub async fn snapshot(&self) -> StatusCounts {
        self.statuses.read().await.clone()
    }

    /// Build the shutdown summary record.
    pub async fn summary(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Summary {
        Summary {
            statuses_per_module: self.snapshot().await,
            start_time: start.to_rfc3339(),
            end_time: end.to_rfc3339(),
            duration: format_duration(end - start),
        }
    }
}

/// The metadata record written at shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub statuses_per_module: StatusCounts,
    pub start_time: String,
    pub end_time: String,
    pub duration: String,
}

fn format_duration(d: chrono::Duration) -> String {
    let std = d.to_std().unwrap_or_default();
    format!("{:.3}s", std.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_record_and_snapshot() {
        let monitor = Monitor::new();
        monitor.record("banner", ScanStatus::Success).await;
        monitor.record("banner", ScanStatus::Success).await;
        monitor.record("banner", ScanStatus::ConnectionTimeout).await;
        monitor.record("telnet", ScanStatus::ProtocolError).await;

        let snapshot = monitor.snapshot().await;
        assert_eq!(snapshot["banner"]["success"], 2);
        assert_eq!(snapshot["banner"]["connection-timeout"], 1);
        assert_eq!(snapshot["telnet"]["protocol-error"], 1);
    }

    #[tokio::test]
    async fn test_callback_per_finished_target() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let monitor = Monitor::with_callback(Box::new(move |_| {
            counted.fetch_add(1, Ordering::Relaxed);
        }));

        monitor.target_finished("10.0.0.1");
        monitor.target_finished("10.0.0.2");
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(monitor.targets_finished(), 2);
    }

    #[tokio::test]
    async fn test_summary_shape() {
        let monitor = Monitor::new();
        monitor.record("banner", ScanStatus::Success).await;
        let start = Utc::now();
        let summary = monitor.summary(start, start).await;
        assert_eq!(summary.statuses_per_module["banner"]["success"], 1);
        assert!(summary.duration.ends_with('s'));

        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("statuses_per_module").is_some());
        assert!(json.get("start_time").is_some());
    }
}
