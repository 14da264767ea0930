//! Storage quota polling and DOM-storage observation.

use std::sync::Arc;
use std::time::Duration;

use fairy_core::{host::origin_of, now_timestamp, Stream};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use fairy_protocol::CallError;

use super::{truncate, RecordSink};
use crate::session::Session;

const QUOTA_JITTER_MAX: Duration = Duration::from_secs(2);
const SNAPSHOT_MAX_KEYS: usize = 200;

/// Poll the storage quota/usage estimate for the session's origin.
pub fn spawn_quota(session: Arc<Session>, sink: RecordSink, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let closing = session.closing();
        let jitter = Duration::from_millis(
            (rand::random::<f64>() * QUOTA_JITTER_MAX.as_millis() as f64) as u64,
        );
        tokio::select! {
            _ = closing.cancelled() => return,
            _ = sleep(jitter) => {}
        }

        loop {
            match collect_quota(&session).await {
                Ok(Some(record)) => sink.emit(Stream::Storage, record),
                Ok(None) => {}
                Err(err) => {
                    debug!(target_id = %session.target_id(), error = %err, "quota poll skipped")
                }
            }
            tokio::select! {
                _ = closing.cancelled() => break,
                _ = sleep(interval) => {}
            }
        }
        debug!(target_id = %session.target_id(), "storage quota poll stopped");
    })
}

/// Browser-level quota read, falling back to an in-page estimate when the
/// browser API is unavailable for the origin.
async fn collect_quota(session: &Session) -> Result<Option<Value>, CallError> {
    let Some(origin) = origin_of(&session.url()) else {
        return Ok(None);
    };

    let (usage, quota, breakdown, source) = match session
        .browser_call("Storage.getUsageAndQuota", Some(json!({"origin": origin})))
        .await
    {
        Ok(result) => (
            result.get("usage").and_then(Value::as_f64).unwrap_or(0.0),
            result.get("quota").and_then(Value::as_f64).unwrap_or(0.0),
            result.get("usageBreakdown").cloned().unwrap_or(Value::Null),
            "browser",
        ),
        Err(_) => {
            let evaluated = session
                .call(
                    "Runtime.evaluate",
                    Some(json!({
                        "expression":
                            "navigator.storage && navigator.storage.estimate \
                             ? navigator.storage.estimate() : null",
                        "awaitPromise": true,
                        "returnByValue": true,
                    })),
                )
                .await?;
            let value = evaluated.pointer("/result/value").cloned().unwrap_or(Value::Null);
            if value.is_null() {
                return Ok(None);
            }
            (
                value.get("usage").and_then(Value::as_f64).unwrap_or(0.0),
                value.get("quota").and_then(Value::as_f64).unwrap_or(0.0),
                Value::Null,
                "page",
            )
        }
    };

    Ok(Some(quota_record(
        &session.host(),
        &origin,
        usage,
        quota,
        breakdown,
        source,
    )))
}

fn quota_record(
    host: &str,
    origin: &str,
    usage: f64,
    quota: f64,
    breakdown: Value,
    source: &str,
) -> Value {
    json!({
        "type": "storage_quota",
        "timestamp": now_timestamp(),
        "hostname": host,
        "origin": origin,
        "usage": usage,
        "quota": quota,
        "usageRatio": if quota > 0.0 { usage / quota } else { 0.0 },
        "usageBreakdown": breakdown,
        "source": source,
    })
}

/// Relay localStorage/sessionStorage mutations.
pub fn spawn_domstorage(
    session: Arc<Session>,
    sink: RecordSink,
    value_limit: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let closing = session.closing();
        let mut added = session.subscribe("DOMStorage.domStorageItemAdded");
        let mut removed = session.subscribe("DOMStorage.domStorageItemRemoved");
        let mut updated = session.subscribe("DOMStorage.domStorageItemUpdated");
        let mut cleared = session.subscribe("DOMStorage.domStorageItemsCleared");

        loop {
            let (action, params) = tokio::select! {
                _ = closing.cancelled() => break,
                event = added.next() => match event {
                    Some(event) => ("added", event),
                    None => break,
                },
                event = removed.next() => match event {
                    Some(event) => ("removed", event),
                    None => break,
                },
                event = updated.next() => match event {
                    Some(event) => ("updated", event),
                    None => break,
                },
                event = cleared.next() => match event {
                    Some(event) => ("cleared", event),
                    None => break,
                },
            };
            let host = session.host();
            let record = domstorage_record(action, &params.params, &host, value_limit);
            sink.emit(Stream::Storage, record);
        }
        debug!(target_id = %session.target_id(), "domstorage observer stopped");
    })
}

fn domstorage_record(action: &str, params: &Value, host: &str, value_limit: usize) -> Value {
    let mut record = json!({
        "type": "domstorage_event",
        "timestamp": now_timestamp(),
        "hostname": host,
        "action": action,
        "storage": storage_id_summary(params.get("storageId")),
    });
    if let Some(key) = params.get("key").and_then(Value::as_str) {
        record["key"] = json!(truncate(key, value_limit));
    }
    if let Some(new_value) = params.get("newValue").and_then(Value::as_str) {
        record["newValue"] = json!(truncate(new_value, value_limit));
    }
    if let Some(old_value) = params.get("oldValue").and_then(Value::as_str) {
        record["oldValue"] = json!(truncate(old_value, value_limit));
    }
    record
}

fn storage_id_summary(storage_id: Option<&Value>) -> Value {
    let origin = storage_id
        .and_then(|id| id.get("securityOrigin"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let is_local = storage_id
        .and_then(|id| id.get("isLocalStorage"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    json!({"origin": origin, "isLocalStorage": is_local})
}

/// On-demand enumeration of both storage areas for a target. Driven by the
/// external front-end, not the continuous engine, over the same session.
pub async fn snapshot_dom_storage(
    session: &Session,
    sink: &RecordSink,
    value_limit: usize,
) -> Result<(), CallError> {
    let Some(origin) = origin_of(&session.url()) else {
        return Ok(());
    };

    let mut areas = Map::new();
    for (label, is_local) in [("localStorage", true), ("sessionStorage", false)] {
        let response = session
            .call(
                "DOMStorage.getDOMStorageItems",
                Some(json!({
                    "storageId": {"securityOrigin": origin, "isLocalStorage": is_local},
                })),
            )
            .await;
        areas.insert(
            label.to_string(),
            match response {
                Ok(result) => storage_area_summary(result.get("entries"), value_limit),
                Err(err) => json!({"error": err.to_string()}),
            },
        );
    }

    let host = session.host();
    let record = json!({
        "type": "domstorage_snapshot",
        "timestamp": now_timestamp(),
        "hostname": host,
        "origin": origin,
        "localStorage": areas["localStorage"],
        "sessionStorage": areas["sessionStorage"],
    });
    sink.emit(Stream::Storage, record);
    Ok(())
}

fn storage_area_summary(entries: Option<&Value>, value_limit: usize) -> Value {
    let Some(entries) = entries.and_then(Value::as_array) else {
        return json!({"count": 0, "items": {}});
    };
    let mut items = Map::new();
    for entry in entries.iter().take(SNAPSHOT_MAX_KEYS) {
        let Some(pair) = entry.as_array() else {
            continue;
        };
        let key = pair.first().and_then(Value::as_str).unwrap_or("");
        let value = pair.get(1).and_then(Value::as_str).unwrap_or("");
        items.insert(
            truncate(key, value_limit),
            json!(truncate(value, value_limit)),
        );
    }
    json!({"count": entries.len(), "items": items})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_record_ratio() {
        let record = quota_record(
            "example.com",
            "https://example.com",
            250.0,
            1000.0,
            Value::Null,
            "browser",
        );
        assert_eq!(record["type"], "storage_quota");
        assert_eq!(record["usageRatio"], 0.25);
        assert_eq!(record["source"], "browser");

        let empty = quota_record("example.com", "https://example.com", 10.0, 0.0, Value::Null, "page");
        assert_eq!(empty["usageRatio"], 0.0);
    }

    #[test]
    fn domstorage_event_truncates_values() {
        let params = json!({
            "storageId": {"securityOrigin": "https://example.com", "isLocalStorage": true},
            "key": "cart",
            "newValue": "x".repeat(5000),
        });
        let record = domstorage_record("added", &params, "example.com", 2048);
        assert_eq!(record["action"], "added");
        assert_eq!(record["storage"]["isLocalStorage"], true);
        assert_eq!(record["newValue"].as_str().unwrap().len(), 2048);
        assert!(record.get("oldValue").is_none());
    }

    #[test]
    fn cleared_event_has_no_key() {
        let params = json!({
            "storageId": {"securityOrigin": "https://example.com", "isLocalStorage": false},
        });
        let record = domstorage_record("cleared", &params, "example.com", 2048);
        assert_eq!(record["action"], "cleared");
        assert!(record.get("key").is_none());
        assert_eq!(record["storage"]["isLocalStorage"], false);
    }

    #[test]
    fn snapshot_area_summary_counts_and_truncates() {
        let entries = json!([["user", "alice"], ["session", "s".repeat(3000)]]);
        let summary = storage_area_summary(Some(&entries), 2048);
        assert_eq!(summary["count"], 2);
        assert_eq!(summary["items"]["user"], "alice");
        assert_eq!(summary["items"]["session"].as_str().unwrap().len(), 2048);
    }
}
