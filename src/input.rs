//! Input feeder
//!
//! Reads one target per line: `IP`, `IP,domain`, `IP,domain,tag` or
//! `IP,domain,tag,port`, with empty fields allowed (a domain-only
//! target leads with a comma). Comments and blank lines are skipped;
//! malformed lines are rejected with a warning and counted.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{GrabError, Result};
use crate::grab::ScanTarget;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub accepted: u64,
    pub rejected: u64,
}

/// Parse one input line into a target.
pub fn parse_target_line(line: &str) -> Result<ScanTarget> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() > 4 {
        return Err(GrabError::invalid_target(line, "too many fields"));
    }

    let ip = match fields.first().copied().unwrap_or("") {
        "" => None,
        raw => Some(
            raw.parse()
                .map_err(|_| GrabError::invalid_target(line, format!("bad IP: {:?}", raw)))?,
        ),
    };
    let domain = match fields.get(1).copied().unwrap_or("") {
        "" => None,
        raw => Some(raw.to_string()),
    };
    let tag = match fields.get(2).copied().unwrap_or("") {
        "" => None,
        raw => Some(raw.to_string()),
    };
    let port = match fields.get(3).copied().unwrap_or("") {
        "" => None,
        raw => Some(
            raw.parse()
                .map_err(|_| GrabError::invalid_target(line, format!("bad port: {:?}", raw)))?,
        ),
    };

    if ip.is_none() && domain.is_none() {
        return Err(GrabError::invalid_target(line, "neither IP nor domain"));
    }

    Ok(ScanTarget {
        ip,
        domain,
        tag,
        port,
    })
}

/// Read targets from the reader and push them onto the process queue.
/// Returns when the reader is exhausted or every consumer is gone.
pub async fn feed_targets<R: AsyncBufRead + Unpin>(
    reader: R,
    tx: &mpsc::Sender<ScanTarget>,
) -> Result<FeedStats> {
    let mut stats = FeedStats::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match parse_target_line(trimmed) {
            Ok(target) => {
                if tx.send(target).await.is_err() {
                    // Every scan worker is gone; nothing left to feed.
                    break;
                }
                stats.accepted += 1;
            }
            Err(e) => {
                warn!(error = %e, "rejecting input line");
                stats.rejected += 1;
            }
        }
    }
    Ok(stats)
}
