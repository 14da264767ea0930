//! Console API calls and uncaught exceptions.

use std::sync::Arc;
use std::time::Duration;

use fairy_core::{now_timestamp, Stream};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use super::{truncate, truncate_marked, RecordSink};
use crate::limiter::TokenBucket;
use crate::overview::Overview;
use crate::session::Session;
use crate::sourcemap::SourceMapResolver;

const MESSAGE_TRUNCATE: usize = 500;
const URL_TRUNCATE: usize = 200;
const FUNCTION_TRUNCATE: usize = 100;
const MAX_EXCEPTION_FRAMES: usize = 5;
const SOURCE_MAP_BUDGET: Duration = Duration::from_millis(200);

pub fn spawn(
    session: Arc<Session>,
    sink: RecordSink,
    resolver: Arc<dyn SourceMapResolver>,
    events_per_sec: f64,
    overview: Arc<Overview>,
) -> JoinHandle<()> {
    tokio::spawn(run(session, sink, resolver, events_per_sec, overview))
}

async fn run(
    session: Arc<Session>,
    sink: RecordSink,
    resolver: Arc<dyn SourceMapResolver>,
    events_per_sec: f64,
    overview: Arc<Overview>,
) {
    let closing = session.closing();
    let mut console_calls = session.subscribe("Runtime.consoleAPICalled");
    let mut exceptions = session.subscribe("Runtime.exceptionThrown");
    let mut limiter = TokenBucket::new(events_per_sec);

    loop {
        tokio::select! {
            _ = closing.cancelled() => break,
            event = console_calls.next() => {
                let Some(event) = event else { break };
                if !limiter.try_acquire() {
                    continue;
                }
                let host = session.host();
                let record = console_record(&event.params, &host);
                sink.emit(Stream::Console, record);
            }
            event = exceptions.next() => {
                let Some(event) = event else { break };
                let host = session.host();
                let mut record = exception_record(&event.params, &host);
                resolve_frames(&resolver, &mut record).await;
                sink.emit(Stream::Console, record);
            }
        }
    }

    overview.add_limiter_drops("console", limiter.dropped());
    debug!(target_id = %session.target_id(), "console observer stopped");
}

fn console_record(params: &Value, host: &str) -> Value {
    json!({
        "type": "console",
        "timestamp": now_timestamp(),
        "hostname": host,
        "level": params.get("type").and_then(Value::as_str).unwrap_or("log"),
        "message": extract_message(params.get("args")),
        "source": extract_source(params.get("stackTrace")),
    })
}

fn exception_record(params: &Value, host: &str) -> Value {
    let details = params.get("exceptionDetails").cloned().unwrap_or(Value::Null);
    json!({
        "type": "exception",
        "timestamp": now_timestamp(),
        "hostname": host,
        "message": truncate(
            details.get("text").and_then(Value::as_str).unwrap_or("Uncaught exception"),
            MESSAGE_TRUNCATE,
        ),
        "source": {
            "url": truncate(details.get("url").and_then(Value::as_str).unwrap_or(""), URL_TRUNCATE),
            "line": details.get("lineNumber").and_then(Value::as_u64).unwrap_or(0),
            "column": details.get("columnNumber").and_then(Value::as_u64).unwrap_or(0),
        },
        "stackTrace": format_stack(details.get("stackTrace")),
    })
}

/// Join console arguments into one bounded message string.
fn extract_message(args: Option<&Value>) -> String {
    let Some(args) = args.and_then(Value::as_array) else {
        return String::new();
    };
    let mut parts: Vec<String> = Vec::with_capacity(args.len());
    for arg in args {
        let text = match arg.get("type").and_then(Value::as_str) {
            Some("string") => arg
                .get("value")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            Some("object") => arg
                .get("description")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| arg.get("value").cloned().unwrap_or(Value::Null).to_string()),
            _ => match arg.get("value") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            },
        };
        parts.push(text);
    }
    truncate_marked(&parts.join(" "), MESSAGE_TRUNCATE)
}

fn extract_source(stack: Option<&Value>) -> Value {
    let Some(frame) = stack.and_then(|s| s.pointer("/callFrames/0")) else {
        return json!({"url": "", "line": 0, "column": 0, "function": "unknown"});
    };
    json!({
        "url": truncate(frame.get("url").and_then(Value::as_str).unwrap_or(""), URL_TRUNCATE),
        "line": frame.get("lineNumber").and_then(Value::as_u64).unwrap_or(0),
        "column": frame.get("columnNumber").and_then(Value::as_u64).unwrap_or(0),
        "function": truncate(
            frame.get("functionName").and_then(Value::as_str).unwrap_or("anonymous"),
            FUNCTION_TRUNCATE,
        ),
    })
}

fn format_stack(stack: Option<&Value>) -> Vec<Value> {
    let Some(frames) = stack.and_then(|s| s.get("callFrames")).and_then(Value::as_array) else {
        return Vec::new();
    };
    frames
        .iter()
        .take(MAX_EXCEPTION_FRAMES)
        .map(|frame| {
            json!({
                "function": truncate(
                    frame.get("functionName").and_then(Value::as_str).unwrap_or("anonymous"),
                    FUNCTION_TRUNCATE,
                ),
                "url": truncate(frame.get("url").and_then(Value::as_str).unwrap_or(""), URL_TRUNCATE),
                "line": frame.get("lineNumber").and_then(Value::as_u64).unwrap_or(0),
                "column": frame.get("columnNumber").and_then(Value::as_u64).unwrap_or(0),
            })
        })
        .collect()
}

/// Best-effort source-map resolution for exception frames, bounded so slow
/// resolution never stalls the observer. Failures leave frames unchanged.
async fn resolve_frames(resolver: &Arc<dyn SourceMapResolver>, record: &mut Value) {
    let Some(frames) = record.get_mut("stackTrace").and_then(Value::as_array_mut) else {
        return;
    };
    if frames.is_empty() {
        return;
    }
    let resolution = timeout(SOURCE_MAP_BUDGET, async {
        for frame in frames.iter_mut() {
            let url = frame.get("url").and_then(Value::as_str).unwrap_or("");
            let line = frame.get("line").and_then(Value::as_u64).unwrap_or(0);
            let column = frame.get("column").and_then(Value::as_u64).unwrap_or(0);
            if url.is_empty() {
                continue;
            }
            if let Some(original) = resolver.resolve(url, line, column).await {
                frame["original"] = json!({
                    "file": original.file,
                    "line": original.line,
                    "column": original.column,
                    "name": original.name,
                });
            }
        }
    })
    .await;
    if resolution.is_err() {
        debug!("source map resolution exceeded budget; keeping raw frames");
    }
}
