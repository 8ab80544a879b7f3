//! Diagnostic snapshot hooks
//!
//! `HEAP_SNAPSHOT_FILE` and `CPU_PROFILE_FILE` name output paths for
//! optional process snapshots. Both accept `{TIMESTAMP}` (formatted
//! `YYYYMMDDhhmmss`) and `{NANOS}` (decimal nanosecond-of-second)
//! substitution tokens. Snapshots run every five minutes, on each
//! monitor callback, and at exit; they never touch pipeline state.

use std::env;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use sysinfo::{PidExt, ProcessExt, System, SystemExt};
use tracing::{debug, warn};

use crate::error::{GrabError, Result};

pub const HEAP_SNAPSHOT_ENV: &str = "HEAP_SNAPSHOT_FILE";
pub const CPU_PROFILE_ENV: &str = "CPU_PROFILE_FILE";

/// Expand the `{TIMESTAMP}` and `{NANOS}` tokens of a snapshot path.
pub fn formatted_snapshot_path(template: &str, when: DateTime<Utc>) -> String {
    let timestamp = when.format("%Y%m%d%H%M%S").to_string();
    let nanos = when.timestamp_subsec_nanos().to_string();
    template
        .replace("{TIMESTAMP}", &timestamp)
        .replace("{NANOS}", &nanos)
}

/// Write a heap snapshot if `HEAP_SNAPSHOT_FILE` is configured.
pub fn dump_heap_snapshot() {
    let Ok(template) = env::var(HEAP_SNAPSHOT_ENV) else {
        return;
    };
    if template.is_empty() {
        return;
    }
    let path = formatted_snapshot_path(&template, Utc::now());
    match write_memory_snapshot(&path) {
        Ok(()) => debug!(path, "heap snapshot written"),
        Err(e) => warn!(path, error = %e, "could not write heap snapshot"),
    }
}

/// Write a CPU usage snapshot if `CPU_PROFILE_FILE` is configured.
/// Invoked once at shutdown.
pub fn dump_cpu_profile() {
    let Ok(template) = env::var(CPU_PROFILE_ENV) else {
        return;
    };
    if template.is_empty() {
        return;
    }
    let path = formatted_snapshot_path(&template, Utc::now());
    match write_cpu_snapshot(&path) {
        Ok(()) => debug!(path, "cpu profile written"),
        Err(e) => warn!(path, error = %e, "could not write cpu profile"),
    }
}

pub fn write_memory_snapshot(path: &str) -> Result<()> {
    let (system, pid) = current_process()?;
    let process = system
        .process(pid)
        .ok_or_else(|| GrabError::config("cannot inspect own process"))?;

    let snapshot = json!({
        "timestamp": Utc::now().to_rfc3339(),
        "pid": pid.as_u32(),
        "memory_bytes": process.memory(),
        "virtual_memory_bytes": process.virtual_memory(),
    });
    std::fs::write(path, serde_json::to_vec_pretty(&snapshot).unwrap_or_default())?;
    Ok(())
}

pub fn write_cpu_snapshot(path: &str) -> Result<()> {
    let (system, pid) = current_process()?;
    let process = system
        .process(pid)
        .ok_or_else(|| GrabError::config("cannot inspect own process"))?;

    let snapshot = json!({
        "timestamp": Utc::now().to_rfc3339(),
        "pid": pid.as_u32(),
        "cpu_usage_percent": process.cpu_usage(),
        "run_time_secs": process.run_time(),
    });
    std::fs::write(path, serde_json::to_vec_pretty(&snapshot).unwrap_or_default())?;
    Ok(())
}

fn current_process() -> Result<(System, sysinfo::Pid)> {
    let pid = sysinfo::get_current_pid()
        .map_err(|e| GrabError::config(format!("cannot determine own pid: {}", e)))?;
    let mut system = System::new();
    system.refresh_process(pid);
    Ok((system, pid))
}

/// Fire the heap-snapshot hook on a fixed period until aborted.
pub fn spawn_snapshot_ticker(period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // the immediate first tick
        loop {
            interval.tick().await;
            dump_heap_snapshot();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_formatted_snapshot_path() {
        let when = Utc.with_ymd_and_hms(2026, 3, 9, 14, 5, 7).unwrap()
            + chrono::Duration::nanoseconds(12345);
        assert_eq!(
            formatted_snapshot_path("/tmp/heap.{TIMESTAMP}.{NANOS}.json", when),
            "/tmp/heap.20260309140507.12345.json"
        );
        // Tokens may repeat, or be absent entirely.
        assert_eq!(
            formatted_snapshot_path("{TIMESTAMP}-{TIMESTAMP}", when),
            "20260309140507-20260309140507"
        );
        assert_eq!(formatted_snapshot_path("plain.json", when), "plain.json");
    }

    #[test]
    fn test_write_memory_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heap.json");
        write_memory_snapshot(path.to_str().unwrap()).unwrap();

        let raw = std::fs::read(&path).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert!(value["memory_bytes"].is_number());
        assert!(value["pid"].is_number());
    }
}
