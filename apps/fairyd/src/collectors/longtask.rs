//! Long-task observation. The 50 ms threshold is the browser's own; the
//! collector only relays timeline entries.

use std::sync::Arc;

use fairy_core::{now_timestamp, Stream};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::RecordSink;
use crate::session::Session;

pub fn spawn(session: Arc<Session>, sink: RecordSink) -> JoinHandle<()> {
    tokio::spawn(run(session, sink))
}

async fn run(session: Arc<Session>, sink: RecordSink) {
    if let Err(err) = session
        .call(
            "PerformanceTimeline.enable",
            Some(json!({"eventTypes": ["longtask"]})),
        )
        .await
    {
        warn!(target_id = %session.target_id(), error = %err, "long-task observation unavailable");
        return;
    }

    let closing = session.closing();
    let mut timeline = session.subscribe("PerformanceTimeline.timelineEventAdded");

    loop {
        let event = tokio::select! {
            _ = closing.cancelled() => break,
            event = timeline.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let Some(record) = longtask_record(event.params.get("event"), &session.host(), session.target_id())
        else {
            continue;
        };
        sink.emit(Stream::Longtask, record);
    }
    debug!(target_id = %session.target_id(), "long-task observer stopped");
}

fn longtask_record(entry: Option<&Value>, host: &str, target_id: &str) -> Option<Value> {
    let entry = entry?;
    // Only long-task entries carry a duration on this subscription.
    let duration = entry.get("duration").and_then(Value::as_f64)?;
    Some(json!({
        "type": "longtask",
        "timestamp": now_timestamp(),
        "hostname": host,
        "targetId": target_id,
        "startTime": entry.get("time").and_then(Value::as_f64).unwrap_or(0.0),
        "duration": duration,
        "attribution": {
            "name": entry.get("name").and_then(Value::as_str).unwrap_or("unknown"),
            "frameId": entry.get("frameId").and_then(Value::as_str),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_with_duration_becomes_record() {
        let entry = json!({
            "frameId": "F1",
            "type": "longtask",
            "name": "self",
            "time": 1234.5,
            "duration": 87.0,
        });
        let record = longtask_record(Some(&entry), "example.com", "T1").unwrap();
        assert_eq!(record["type"], "longtask");
        assert_eq!(record["duration"], 87.0);
        assert_eq!(record["startTime"], 1234.5);
        assert_eq!(record["attribution"]["name"], "self");
        assert_eq!(record["attribution"]["frameId"], "F1");
    }

    #[test]
    fn entry_without_duration_is_skipped() {
        let entry = json!({"frameId": "F1", "name": "mark"});
        assert!(longtask_record(Some(&entry), "example.com", "T1").is_none());
        assert!(longtask_record(None, "example.com", "T1").is_none());
    }
}
