use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use fairy_core::now_timestamp;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::writer::WriterReport;

/// Session-level bookkeeping, written once as `overview.json` at shutdown.
pub struct Overview {
    started_at: String,
    targets_seen: AtomicU64,
    peak_sessions: AtomicU64,
    limiter_drops: Mutex<BTreeMap<String, u64>>,
    degraded_domains: Mutex<Vec<DegradedDomain>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DegradedDomain {
    pub target_id: String,
    pub domain: String,
}

impl Overview {
    pub fn new() -> Self {
        Self {
            started_at: now_timestamp(),
            targets_seen: AtomicU64::new(0),
            peak_sessions: AtomicU64::new(0),
            limiter_drops: Mutex::new(BTreeMap::new()),
            degraded_domains: Mutex::new(Vec::new()),
        }
    }

    pub fn note_target(&self) {
        self.targets_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_session_count(&self, active: usize) {
        self.peak_sessions
            .fetch_max(active as u64, Ordering::Relaxed);
    }

    /// Accumulate rate-limiter drops reported by a collector at teardown.
    pub fn add_limiter_drops(&self, kind: &str, dropped: u64) {
        if dropped == 0 {
            return;
        }
        let mut drops = self.limiter_drops.lock().expect("limiter drop lock");
        *drops.entry(kind.to_string()).or_default() += dropped;
    }

    pub fn note_degraded_domain(&self, target_id: &str, domain: &str) {
        self.degraded_domains
            .lock()
            .expect("degraded domain lock")
            .push(DegradedDomain {
                target_id: target_id.to_string(),
                domain: domain.to_string(),
            });
    }

    pub fn limiter_drops_total(&self, kind: &str) -> u64 {
        self.limiter_drops
            .lock()
            .expect("limiter drop lock")
            .get(kind)
            .copied()
            .unwrap_or(0)
    }

    /// Serialize and write the overview; called exactly once, at shutdown.
    pub async fn write(
        &self,
        path: &Path,
        writers: &WriterReport,
        subscriber_drops: u64,
    ) -> std::io::Result<()> {
        let limiter_drops = self.limiter_drops.lock().expect("limiter drop lock").clone();
        let degraded = self
            .degraded_domains
            .lock()
            .expect("degraded domain lock")
            .clone();

        let overview = json!({
            "startTime": self.started_at,
            "endTime": now_timestamp(),
            "targetsSeen": self.targets_seen.load(Ordering::Relaxed),
            "peakSessions": self.peak_sessions.load(Ordering::Relaxed),
            "recordsWritten": writers.records,
            "totalRecords": writers.total_written(),
            "queueDrops": writers.queue_drops,
            "rateLimiterDrops": limiter_drops,
            "subscriberDrops": subscriber_drops,
            "degradedDomains": degraded,
        });

        let body = serde_json::to_vec_pretty(&overview)?;
        tokio::fs::write(path, body).await?;
        info!(path = %path.display(), "session overview written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn overview_round_trips_counts() {
        let overview = Overview::new();
        overview.note_target();
        overview.note_target();
        overview.note_session_count(3);
        overview.note_session_count(1);
        overview.add_limiter_drops("console", 190);
        overview.add_limiter_drops("console", 5);
        overview.add_limiter_drops("network", 0);
        overview.note_degraded_domain("T1", "HeapProfiler");

        let mut report = WriterReport::default();
        report
            .records
            .entry("example.com".into())
            .or_insert_with(HashMap::new)
            .insert("memory".into(), 12);
        report.queue_drops.insert("example.com/network".into(), 4);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overview.json");
        overview.write(&path, &report, 7).await.unwrap();

        let body: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(body["targetsSeen"], 2);
        assert_eq!(body["peakSessions"], 3);
        assert_eq!(body["rateLimiterDrops"]["console"], 195);
        assert!(body["rateLimiterDrops"].get("network").is_none());
        assert_eq!(body["recordsWritten"]["example.com"]["memory"], 12);
        assert_eq!(body["queueDrops"]["example.com/network"], 4);
        assert_eq!(body["subscriberDrops"], 7);
        assert_eq!(body["degradedDomains"][0]["domain"], "HeapProfiler");
        assert_eq!(body["totalRecords"], 12);
    }
}
