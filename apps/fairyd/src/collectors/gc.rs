//! Heuristic garbage-collection detection.
//!
//! There is no authoritative GC event on the wire; collections are inferred
//! from heap-usage step changes between memory samples and from GC-shaped
//! console messages. See DESIGN.md for the classification rule.

use std::sync::Arc;

use fairy_core::{now_timestamp, Stream};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{truncate, RecordSink};
use crate::session::Session;

const MAJOR_DROP_BYTES: f64 = 10.0 * 1024.0 * 1024.0;
const MINOR_DROP_BYTES: f64 = 1024.0 * 1024.0;
const MESSAGE_TRUNCATE: usize = 200;

/// Tracks heap readings between memory samples; fed by the memory sampler.
pub struct GcTracker {
    last_heap: Option<f64>,
}

impl GcTracker {
    pub fn new() -> Self {
        Self { last_heap: None }
    }

    /// Observe a heap reading; a large enough drop yields one `gc` record.
    pub fn observe_heap(&mut self, session: &Session, heap_used: f64) -> Option<Value> {
        let previous = self.last_heap.replace(heap_used)?;
        let freed = previous - heap_used;
        let kind = classify_heap_drop(freed)?;
        Some(json!({
            "type": "gc",
            "timestamp": now_timestamp(),
            "hostname": session.host(),
            "targetId": session.target_id(),
            "kind": kind,
            "heapBefore": previous,
            "heapAfter": heap_used,
            "delta": heap_used - previous,
            "detectedVia": "heap_sample",
        }))
    }
}

/// Freed ≥ 10 MiB reads as a major collection, ≥ 1 MiB as minor; anything
/// smaller is indistinguishable from ordinary churn and ignored.
pub fn classify_heap_drop(freed_bytes: f64) -> Option<&'static str> {
    if freed_bytes >= MAJOR_DROP_BYTES {
        Some("major")
    } else if freed_bytes >= MINOR_DROP_BYTES {
        Some("minor")
    } else {
        None
    }
}

/// Classify a console message that looks GC-related.
pub fn classify_console_message(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    if ["major gc", "mark-sweep", "mark-compact", "full gc"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        return Some("major");
    }
    if ["minor gc", "scavenge"].iter().any(|kw| lower.contains(kw)) {
        return Some("minor");
    }
    if lower.contains("garbage collect") || lower.contains("heap collect") || lower.contains("gc") {
        return Some("unknown");
    }
    None
}

/// Watch console output for engine GC log lines.
pub fn spawn_console_watch(session: Arc<Session>, sink: RecordSink) -> JoinHandle<()> {
    tokio::spawn(async move {
        let closing = session.closing();
        let mut messages = session.subscribe("Runtime.consoleAPICalled");
        loop {
            let event = tokio::select! {
                _ = closing.cancelled() => break,
                event = messages.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let Some(args) = event.params.get("args").and_then(Value::as_array) else {
                continue;
            };
            for arg in args {
                if arg.get("type").and_then(Value::as_str) != Some("string") {
                    continue;
                }
                let Some(text) = arg.get("value").and_then(Value::as_str) else {
                    continue;
                };
                let Some(kind) = classify_console_message(text) else {
                    continue;
                };
                let record = json!({
                    "type": "gc",
                    "timestamp": now_timestamp(),
                    "hostname": session.host(),
                    "targetId": session.target_id(),
                    "kind": kind,
                    "message": truncate(text, MESSAGE_TRUNCATE),
                    "detectedVia": "console_log",
                });
                sink.emit(Stream::Gc, record);
                break;
            }
        }
        debug!(target_id = %session.target_id(), "gc console watch stopped");
    })
}
