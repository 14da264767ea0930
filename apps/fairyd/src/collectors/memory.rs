//! Periodic memory sampling, one round trip per sample.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fairy_core::{now_timestamp, Stream};
use fairy_protocol::CallError;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use super::gc::GcTracker;
use super::listeners::ListenerAnalyzer;
use super::RecordSink;
use crate::session::Session;
use crate::util::now_millis;

const SAMPLE_JITTER: Duration = Duration::from_millis(100);

pub fn spawn(
    session: Arc<Session>,
    sink: RecordSink,
    permits: Arc<Semaphore>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(run(session, sink, permits, interval))
}

async fn run(session: Arc<Session>, sink: RecordSink, permits: Arc<Semaphore>, interval: Duration) {
    let closing = session.closing();
    let analyzer = ListenerAnalyzer::new(Arc::clone(&session));
    let script_watch = analyzer.spawn_script_watch();
    let mut gc = GcTracker::new();

    // Spread sampling phases across sessions.
    let initial_jitter = Duration::from_millis((rand::random::<f64>() * 1000.0) as u64);
    tokio::select! {
        _ = closing.cancelled() => {}
        _ = sleep(initial_jitter) => {}
    }

    while !closing.is_cancelled() {
        let wait = jittered(interval);
        tokio::select! {
            _ = closing.cancelled() => break,
            _ = sleep(wait) => {}
        }

        // The global semaphore caps concurrent samples across all sessions.
        let Ok(_permit) = permits.acquire().await else {
            break;
        };
        if closing.is_cancelled() {
            break;
        }

        match collect_snapshot(&session, &analyzer).await {
            Ok((record, heap_used)) => {
                session.touch_sampled(now_millis());
                if let Some(heap_used) = heap_used {
                    if let Some(gc_record) = gc.observe_heap(&session, heap_used) {
                        sink.emit(Stream::Gc, gc_record);
                    }
                }
                sink.emit(Stream::Memory, record);
            }
            // Transient failure: skip the tick, never retry within it.
            Err(err) => debug!(target_id = %session.target_id(), error = %err, "memory sample skipped"),
        }
    }

    script_watch.abort();
    debug!(target_id = %session.target_id(), "memory sampler stopped");
}

fn jittered(interval: Duration) -> Duration {
    let jitter = ((rand::random::<f64>() - 0.5) * 2.0 * SAMPLE_JITTER.as_millis() as f64) as i64;
    if jitter >= 0 {
        interval + Duration::from_millis(jitter as u64)
    } else {
        interval.saturating_sub(Duration::from_millis((-jitter) as u64))
    }
}

async fn collect_snapshot(
    session: &Session,
    analyzer: &ListenerAnalyzer,
) -> Result<(Value, Option<f64>), CallError> {
    let response = session.call("Performance.getMetrics", None).await?;
    let metrics = metrics_map(&response);

    // Supplementary and optional; the metric set stays authoritative.
    let heap_limit = session
        .call(
            "Runtime.evaluate",
            Some(json!({
                "expression": "performance.memory?.jsHeapSizeLimit",
                "returnByValue": true,
            })),
        )
        .await
        .ok()
        .and_then(|result| result.pointer("/result/value").cloned())
        .unwrap_or(Value::Null);

    let heap_used = metrics.get("JSHeapUsedSize").copied();
    let mut record = json!({
        "type": "memory",
        "timestamp": now_timestamp(),
        "hostname": session.host(),
        "targetId": session.target_id(),
        "sessionId": session.session_id(),
        "url": session.url(),
        "title": session.title(),
        "memory": {
            "jsHeap": {
                "used": metric(&metrics, "JSHeapUsedSize"),
                "total": metric(&metrics, "JSHeapTotalSize"),
                "limit": heap_limit,
            },
            "domNodes": metric(&metrics, "Nodes"),
            "listeners": metric(&metrics, "JSEventListeners"),
            "documents": metric(&metrics, "Documents"),
            "frames": metric(&metrics, "Frames"),
        },
        "performance": {
            "layoutCount": metric(&metrics, "LayoutCount"),
            "recalcStyleCount": metric(&metrics, "RecalcStyleCount"),
            "layoutDuration": metric(&metrics, "LayoutDuration"),
            "recalcStyleDuration": metric(&metrics, "RecalcStyleDuration"),
            "scriptDuration": metric(&metrics, "ScriptDuration"),
        },
    });

    let listener_count = metrics
        .get("JSEventListeners")
        .copied()
        .unwrap_or(0.0) as i64;
    if let Some(analysis) = analyzer.analyze(listener_count).await {
        record["eventListenersAnalysis"] = analysis;
    }

    Ok((record, heap_used))
}

fn metrics_map(response: &Value) -> HashMap<String, f64> {
    let mut map = HashMap::new();
    if let Some(entries) = response.get("metrics").and_then(Value::as_array) {
        for entry in entries {
            let name = entry.get("name").and_then(Value::as_str);
            let value = entry.get("value").and_then(Value::as_f64);
            if let (Some(name), Some(value)) = (name, value) {
                map.insert(name.to_string(), value);
            }
        }
    }
    map
}

fn metric(metrics: &HashMap<String, f64>, name: &str) -> Value {
    metrics
        .get(name)
        .and_then(|value| serde_json::Number::from_f64(*value))
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
