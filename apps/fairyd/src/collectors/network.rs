//! Request-lifecycle observation with selective call-stack enrichment.
//!
//! Per request the observer keeps one in-memory row keyed by the protocol
//! request id and emits `network_request_start`, then exactly one of
//! `network_request_complete` or `network_request_failed`. Stacks are
//! collected only when a trigger fires, and the reason is recorded on the
//! record. WebSocket lifecycle and frames share the `network` stream.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fairy_core::{now_timestamp, Stream};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{truncate, truncate_marked, RecordSink};
use crate::limiter::TokenBucket;
use crate::overview::Overview;
use crate::session::Session;

const URL_TRUNCATE: usize = 500;
const ERROR_TRUNCATE: usize = 200;
const HEADER_MAX_KEYS: usize = 20;
const HEADER_VALUE_TRUNCATE: usize = 256;
const FRAME_FUNCTION_TRUNCATE: usize = 100;
const FRAME_URL_TRUNCATE: usize = 200;

const STACK_SIZE_TRIGGER: u64 = 100 * 1024;
const LARGE_ALERT_BYTES: f64 = 1024.0 * 1024.0;
const HIGH_FREQUENCY_THRESHOLD: u32 = 10;
const REPEATED_RESOURCE_THRESHOLD: u32 = 3;
const REPEATED_RESOURCE_MIN_BYTES: f64 = 10.0 * 1024.0;

const MAX_SYNC_FRAMES: usize = 30;
const MAX_ASYNC_FRAMES: usize = 15;
const MAX_ASYNC_LOOKUPS: u32 = 3;

const WS_PAYLOAD_TRUNCATE: usize = 1024;
const WS_RATE_WINDOW: Duration = Duration::from_secs(1);

struct PendingRequest {
    url: String,
    full_url: String,
    method: String,
    start_time: f64,
    initiator_stack: Option<Value>,
    status: Option<i64>,
    mime_type: Option<String>,
    response_headers: Option<Value>,
}

struct WsConnection {
    url: String,
    opened: Instant,
    frames_sent: u64,
    frames_received: u64,
    recent_frames: VecDeque<Instant>,
}

impl WsConnection {
    fn new(url: String) -> Self {
        Self {
            url,
            opened: Instant::now(),
            frames_sent: 0,
            frames_received: 0,
            recent_frames: VecDeque::new(),
        }
    }

    fn note_frame(&mut self, now: Instant) -> usize {
        self.recent_frames.push_back(now);
        while let Some(front) = self.recent_frames.front() {
            if now.saturating_duration_since(*front) > WS_RATE_WINDOW {
                self.recent_frames.pop_front();
            } else {
                break;
            }
        }
        self.recent_frames.len()
    }

    fn age_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.opened).as_millis() as u64
    }
}

/// Endpoint- and URL-frequency bookkeeping behind the stack triggers.
#[derive(Default)]
struct TriggerTracker {
    endpoint_counts: HashMap<String, u32>,
    repeated_loads: HashMap<String, u32>,
}

impl TriggerTracker {
    /// Triggers known at request start.
    fn on_start(&mut self, method: &str, url: &str, post_size: u64) -> Option<String> {
        let endpoint = format!("{method} {}", strip_query(url));
        let count = self.endpoint_counts.entry(endpoint).or_insert(0);
        *count += 1;

        if post_size > STACK_SIZE_TRIGGER {
            return Some("large_upload".to_string());
        }
        if *count > HIGH_FREQUENCY_THRESHOLD {
            return Some(format!("high_frequency_api_{count}"));
        }
        None
    }

    /// Triggers known at completion.
    fn on_complete(&mut self, url: &str, encoded_length: f64) -> Option<String> {
        if encoded_length > STACK_SIZE_TRIGGER as f64 {
            return Some("large_download".to_string());
        }
        if encoded_length > REPEATED_RESOURCE_MIN_BYTES {
            let count = self.repeated_loads.entry(url.to_string()).or_insert(0);
            *count += 1;
            if *count > REPEATED_RESOURCE_THRESHOLD {
                return Some(format!("repeated_resource_{count}"));
            }
        }
        None
    }
}

pub fn spawn(
    session: Arc<Session>,
    sink: RecordSink,
    events_per_sec: f64,
    overview: Arc<Overview>,
) -> JoinHandle<()> {
    tokio::spawn(run(session, sink, events_per_sec, overview))
}

async fn run(session: Arc<Session>, sink: RecordSink, events_per_sec: f64, overview: Arc<Overview>) {
    let closing = session.closing();
    let mut request_start = session.subscribe("Network.requestWillBeSent");
    let mut response_received = session.subscribe("Network.responseReceived");
    let mut loading_finished = session.subscribe("Network.loadingFinished");
    let mut loading_failed = session.subscribe("Network.loadingFailed");
    let mut ws_created = session.subscribe("Network.webSocketCreated");
    let mut ws_sent = session.subscribe("Network.webSocketFrameSent");
    let mut ws_received = session.subscribe("Network.webSocketFrameReceived");
    let mut ws_error = session.subscribe("Network.webSocketFrameError");
    let mut ws_closed = session.subscribe("Network.webSocketClosed");

    let mut observer = NetworkObserver {
        session: Arc::clone(&session),
        sink,
        limiter: TokenBucket::new(events_per_sec),
        pending: HashMap::new(),
        triggers: TriggerTracker::default(),
        ws_connections: HashMap::new(),
    };

    loop {
        tokio::select! {
            _ = closing.cancelled() => break,
            event = request_start.next() => {
                let Some(event) = event else { break };
                observer.on_request_start(&event.params).await;
            }
            event = response_received.next() => {
                let Some(event) = event else { break };
                observer.on_response_received(&event.params);
            }
            event = loading_finished.next() => {
                let Some(event) = event else { break };
                observer.on_loading_finished(&event.params).await;
            }
            event = loading_failed.next() => {
                let Some(event) = event else { break };
                observer.on_loading_failed(&event.params);
            }
            event = ws_created.next() => {
                let Some(event) = event else { break };
                observer.on_ws_created(&event.params);
            }
            event = ws_sent.next() => {
                let Some(event) = event else { break };
                observer.on_ws_frame(&event.params, "sent");
            }
            event = ws_received.next() => {
                let Some(event) = event else { break };
                observer.on_ws_frame(&event.params, "received");
            }
            event = ws_error.next() => {
                let Some(event) = event else { break };
                observer.on_ws_error(&event.params);
            }
            event = ws_closed.next() => {
                let Some(event) = event else { break };
                observer.on_ws_closed(&event.params);
            }
        }
    }

    overview.add_limiter_drops("network", observer.limiter.dropped());
    debug!(target_id = %session.target_id(), "network observer stopped");
}

struct NetworkObserver {
    session: Arc<Session>,
    sink: RecordSink,
    limiter: TokenBucket,
    pending: HashMap<String, PendingRequest>,
    triggers: TriggerTracker,
    ws_connections: HashMap<String, WsConnection>,
}

impl NetworkObserver {
    async fn on_request_start(&mut self, params: &Value) {
        // The limiter gates new rows; completions of admitted rows always
        // pass so every complete/failed keeps its preceding start.
        if !self.limiter.try_acquire() {
            return;
        }
        let Some(request_id) = params.get("requestId").and_then(Value::as_str) else {
            return;
        };
        let Some(request) = params.get("request") else {
            return;
        };

        let full_url = request
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_string();
        let post_size = request
            .get("postData")
            .and_then(Value::as_str)
            .map(|data| data.len() as u64)
            .unwrap_or(0);
        let start_time = params.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
        let initiator = params.get("initiator").cloned().unwrap_or(Value::Null);
        let initiator_stack = initiator.get("stack").cloned();

        let host = self.session.host();
        let mut record = json!({
            "type": "network_request_start",
            "timestamp": now_timestamp(),
            "hostname": host,
            "requestId": request_id,
            "url": truncate(&full_url, URL_TRUNCATE),
            "method": method,
            "headers": truncate_headers(request.get("headers")),
            "contentLength": post_size,
            "initiator": initiator_summary(&initiator),
            "startTime": start_time,
        });
        if post_size as f64 > LARGE_ALERT_BYTES {
            record["largeDataAlert"] = json!({"size": post_size});
        }

        if let Some(reason) = self.triggers.on_start(&method, &full_url, post_size) {
            if let Some(stack) =
                collect_stack(&self.session, initiator_stack.as_ref(), &reason).await
            {
                record["detailedStack"] = stack;
            }
        }

        self.pending.insert(
            request_id.to_string(),
            PendingRequest {
                url: truncate(&full_url, URL_TRUNCATE),
                full_url,
                method,
                start_time,
                initiator_stack,
                status: None,
                mime_type: None,
                response_headers: None,
            },
        );
        self.sink.emit(Stream::Network, record);
    }

    fn on_response_received(&mut self, params: &Value) {
        let Some(request_id) = params.get("requestId").and_then(Value::as_str) else {
            return;
        };
        let Some(row) = self.pending.get_mut(request_id) else {
            return;
        };
        if let Some(response) = params.get("response") {
            row.status = response.get("status").and_then(Value::as_i64);
            row.mime_type = response
                .get("mimeType")
                .and_then(Value::as_str)
                .map(|mime| truncate(mime, 100));
            row.response_headers = Some(truncate_headers(response.get("headers")));
        }
    }

    async fn on_loading_finished(&mut self, params: &Value) {
        let Some(request_id) = params.get("requestId").and_then(Value::as_str) else {
            return;
        };
        let Some(row) = self.pending.remove(request_id) else {
            return;
        };
        let end_time = params.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
        let encoded_length = params
            .get("encodedDataLength")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let host = self.session.host();
        let mut record = json!({
            "type": "network_request_complete",
            "timestamp": now_timestamp(),
            "hostname": host,
            "requestId": request_id,
            "url": row.url,
            "method": row.method,
            "status": row.status,
            "mimeType": row.mime_type,
            "responseHeaders": row.response_headers,
            "startTime": row.start_time,
            "endTime": end_time,
            "duration": end_time - row.start_time,
            "encodedDataLength": encoded_length,
        });
        if encoded_length > LARGE_ALERT_BYTES {
            record["largeResponseAlert"] = json!({"size": encoded_length});
        }

        if let Some(reason) = self.triggers.on_complete(&row.full_url, encoded_length) {
            if !self.session.is_closing() {
                if let Some(stack) =
                    collect_stack(&self.session, row.initiator_stack.as_ref(), &reason).await
                {
                    record["detailedStack"] = stack;
                }
            }
        }

        self.sink.emit(Stream::Network, record);
    }

    fn on_loading_failed(&mut self, params: &Value) {
        let Some(request_id) = params.get("requestId").and_then(Value::as_str) else {
            return;
        };
        let Some(row) = self.pending.remove(request_id) else {
            return;
        };
        let host = self.session.host();
        let record = json!({
            "type": "network_request_failed",
            "timestamp": now_timestamp(),
            "hostname": host,
            "requestId": request_id,
            "url": row.url,
            "method": row.method,
            "startTime": row.start_time,
            "endTime": params.get("timestamp").and_then(Value::as_f64),
            "errorText": truncate(
                params.get("errorText").and_then(Value::as_str).unwrap_or("Unknown error"),
                ERROR_TRUNCATE,
            ),
            "canceled": params.get("canceled").and_then(Value::as_bool).unwrap_or(false),
        });
        self.sink.emit(Stream::Network, record);
    }

    fn on_ws_created(&mut self, params: &Value) {
        let Some(request_id) = params.get("requestId").and_then(Value::as_str) else {
            return;
        };
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        self.ws_connections
            .insert(request_id.to_string(), WsConnection::new(url.clone()));

        let host = self.session.host();
        let record = json!({
            "type": "websocket_connected",
            "timestamp": now_timestamp(),
            "hostname": host,
            "requestId": request_id,
            "url": truncate(&url, URL_TRUNCATE),
        });
        self.sink.emit(Stream::Network, record);
    }

    fn on_ws_frame(&mut self, params: &Value, direction: &str) {
        if !self.limiter.try_acquire() {
            return;
        }
        let Some(request_id) = params.get("requestId").and_then(Value::as_str) else {
            return;
        };
        let connection = self
            .ws_connections
            .entry(request_id.to_string())
            .or_insert_with(|| WsConnection::new(String::new()));
        let now = Instant::now();
        let frames_per_second = connection.note_frame(now);
        if direction == "sent" {
            connection.frames_sent += 1;
        } else {
            connection.frames_received += 1;
        }
        let age_ms = connection.age_ms(now);

        let frame = params.get("response").cloned().unwrap_or(Value::Null);
        let opcode = frame.get("opcode").and_then(Value::as_i64).unwrap_or(-1);
        let payload = frame.get("payloadData").and_then(Value::as_str).unwrap_or("");

        let host = self.session.host();
        let mut record = json!({
            "type": format!("websocket_frame_{direction}"),
            "timestamp": now_timestamp(),
            "hostname": host,
            "requestId": request_id,
            "opcode": opcode,
            "payloadSize": payload.len(),
            "framesPerSecond": frames_per_second,
            "connectionAgeMs": age_ms,
        });
        // Text payloads are kept (truncated); binary frames record only
        // length and opcode.
        if opcode == 1 {
            record["payload"] = json!(truncate_marked(payload, WS_PAYLOAD_TRUNCATE));
        }
        self.sink.emit(Stream::Network, record);
    }

    fn on_ws_error(&mut self, params: &Value) {
        let Some(request_id) = params.get("requestId").and_then(Value::as_str) else {
            return;
        };
        let host = self.session.host();
        let record = json!({
            "type": "websocket_frame_error",
            "timestamp": now_timestamp(),
            "hostname": host,
            "requestId": request_id,
            "errorMessage": truncate(
                params.get("errorMessage").and_then(Value::as_str).unwrap_or(""),
                ERROR_TRUNCATE,
            ),
        });
        self.sink.emit(Stream::Network, record);
    }

    fn on_ws_closed(&mut self, params: &Value) {
        let Some(request_id) = params.get("requestId").and_then(Value::as_str) else {
            return;
        };
        let connection = self.ws_connections.remove(request_id);
        let host = self.session.host();
        let now = Instant::now();
        let record = json!({
            "type": "websocket_closed",
            "timestamp": now_timestamp(),
            "hostname": host,
            "requestId": request_id,
            "url": connection.as_ref().map(|c| truncate(&c.url, URL_TRUNCATE)),
            "framesSent": connection.as_ref().map(|c| c.frames_sent),
            "framesReceived": connection.as_ref().map(|c| c.frames_received),
            "connectionAgeMs": connection.as_ref().map(|c| c.age_ms(now)),
        });
        self.sink.emit(Stream::Network, record);
    }
}

/// Method + URL without its query string; the grouping key for the
/// high-frequency trigger.
fn strip_query(url: &str) -> &str {
    match url.split_once('?') {
        Some((base, _)) => base,
        None => url,
    }
}

fn truncate_headers(headers: Option<&Value>) -> Value {
    let Some(Value::Object(headers)) = headers else {
        return json!({});
    };
    let mut out = Map::new();
    for (index, (key, value)) in headers.iter().enumerate() {
        if index >= HEADER_MAX_KEYS {
            out.insert(
                "...[truncated]".to_string(),
                json!(format!("{} more headers", headers.len() - HEADER_MAX_KEYS)),
            );
            break;
        }
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out.insert(
            truncate(key, 100),
            json!(truncate_marked(&text, HEADER_VALUE_TRUNCATE)),
        );
    }
    Value::Object(out)
}

fn initiator_summary(initiator: &Value) -> Value {
    let mut summary = json!({
        "type": initiator.get("type").and_then(Value::as_str).unwrap_or("unknown"),
    });
    if let Some(frame) = initiator
        .pointer("/stack/callFrames/0")
        .filter(|frame| frame.is_object())
    {
        summary["source"] = json!({
            "function": truncate(
                frame.get("functionName").and_then(Value::as_str).unwrap_or("anonymous"),
                FRAME_FUNCTION_TRUNCATE,
            ),
            "url": truncate(frame.get("url").and_then(Value::as_str).unwrap_or(""), FRAME_URL_TRUNCATE),
            "line": frame.get("lineNumber").and_then(Value::as_u64).unwrap_or(0),
        });
    }
    summary
}

fn format_frames(frames: Option<&Value>, limit: usize) -> Vec<Value> {
    let Some(frames) = frames.and_then(Value::as_array) else {
        return Vec::new();
    };
    frames
        .iter()
        .take(limit)
        .map(|frame| {
            json!({
                "function": truncate(
                    frame.get("functionName").and_then(Value::as_str).unwrap_or("anonymous"),
                    FRAME_FUNCTION_TRUNCATE,
                ),
                "url": truncate(frame.get("url").and_then(Value::as_str).unwrap_or(""), FRAME_URL_TRUNCATE),
                "line": frame.get("lineNumber").and_then(Value::as_u64).unwrap_or(0),
                "column": frame.get("columnNumber").and_then(Value::as_u64).unwrap_or(0),
            })
        })
        .collect()
}

/// Build the enrichment: up to 30 synchronous frames from the initiator
/// stack and up to 15 frames across asynchronous boundaries. Unresolved
/// async parents cost a `Debugger.getStackTrace` round trip each and are
/// skipped when the session is closing.
async fn collect_stack(
    session: &Session,
    initiator_stack: Option<&Value>,
    reason: &str,
) -> Option<Value> {
    let stack = initiator_stack?;
    let frames = format_frames(stack.get("callFrames"), MAX_SYNC_FRAMES);

    let mut async_frames: Vec<Value> = Vec::new();
    let mut inline_parent = stack.get("parent").cloned();
    let mut parent_id = stack.get("parentId").cloned();
    let mut lookups = 0;

    while async_frames.len() < MAX_ASYNC_FRAMES {
        if let Some(parent) = inline_parent.take() {
            let remaining = MAX_ASYNC_FRAMES - async_frames.len();
            let description = parent
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("async")
                .to_string();
            for mut frame in format_frames(parent.get("callFrames"), remaining) {
                frame["asyncBoundary"] = json!(description);
                async_frames.push(frame);
            }
            parent_id = parent.get("parentId").cloned();
            inline_parent = parent.get("parent").cloned();
            continue;
        }

        let Some(id) = parent_id.take() else { break };
        if id.is_null() || session.is_closing() || lookups >= MAX_ASYNC_LOOKUPS {
            break;
        }
        lookups += 1;
        match session
            .call("Debugger.getStackTrace", Some(json!({"stackTraceId": id})))
            .await
        {
            Ok(result) => inline_parent = result.get("stackTrace").cloned(),
            Err(err) => {
                debug!(error = %err, "async stack lookup failed");
                break;
            }
        }
    }

    if frames.is_empty() && async_frames.is_empty() {
        return None;
    }
    Some(json!({
        "reason": reason,
        "frames": frames,
        "asyncFrames": async_frames,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_query_removes_only_the_query() {
        assert_eq!(
            strip_query("https://a.test/api/v1?page=2&size=10"),
            "https://a.test/api/v1"
        );
        assert_eq!(strip_query("https://a.test/api"), "https://a.test/api");
    }

    #[test]
    fn large_upload_trigger_fires_above_100k() {
        let mut triggers = TriggerTracker::default();
        assert_eq!(
            triggers.on_start("POST", "https://a.test/upload", 200 * 1024),
            Some("large_upload".to_string())
        );
        assert_eq!(triggers.on_start("POST", "https://a.test/upload", 1024), None);
    }

    #[test]
    fn high_frequency_trigger_counts_endpoint_without_query() {
        let mut triggers = TriggerTracker::default();
        for n in 1..=10 {
            let url = format!("https://a.test/api?cursor={n}");
            assert_eq!(triggers.on_start("GET", &url, 0), None, "call {n}");
        }
        assert_eq!(
            triggers.on_start("GET", "https://a.test/api?cursor=11", 0),
            Some("high_frequency_api_11".to_string())
        );
        // A different method is a different endpoint.
        assert_eq!(triggers.on_start("POST", "https://a.test/api", 0), None);
    }

    #[test]
    fn large_download_trigger() {
        let mut triggers = TriggerTracker::default();
        assert_eq!(
            triggers.on_complete("https://a.test/big.json", 200_000.0),
            Some("large_download".to_string())
        );
        assert_eq!(triggers.on_complete("https://a.test/small.json", 1000.0), None);
    }

    #[test]
    fn repeated_resource_trigger_needs_size_and_count() {
        let mut triggers = TriggerTracker::default();
        let url = "https://a.test/bundle.js";
        for n in 1..=3 {
            assert_eq!(triggers.on_complete(url, 20_000.0), None, "load {n}");
        }
        assert_eq!(
            triggers.on_complete(url, 20_000.0),
            Some("repeated_resource_4".to_string())
        );
        // Small resources never count toward the trigger.
        let mut fresh = TriggerTracker::default();
        for _ in 0..10 {
            assert_eq!(fresh.on_complete("https://a.test/tiny.css", 500.0), None);
        }
    }

    #[test]
    fn headers_truncate_key_count_and_value_length() {
        let mut headers = Map::new();
        for n in 0..25 {
            headers.insert(format!("x-header-{n:02}"), json!("v".repeat(300)));
        }
        let truncated = truncate_headers(Some(&Value::Object(headers)));
        let truncated = truncated.as_object().unwrap();
        assert_eq!(truncated.len(), HEADER_MAX_KEYS + 1);
        assert_eq!(truncated["...[truncated]"], "5 more headers");
        let value = truncated["x-header-00"].as_str().unwrap();
        assert!(value.starts_with("vvv"));
        assert!(value.ends_with("...[truncated]"));
        assert_eq!(value.len(), HEADER_VALUE_TRUNCATE + "...[truncated]".len());
    }

    #[test]
    fn frames_format_caps_and_defaults() {
        let stack = json!({
            "callFrames": (0..40).map(|n| json!({
                "functionName": format!("fn{n}"),
                "url": "https://a.test/app.js",
                "lineNumber": n,
                "columnNumber": 1,
            })).collect::<Vec<_>>(),
        });
        let frames = format_frames(stack.get("callFrames"), MAX_SYNC_FRAMES);
        assert_eq!(frames.len(), 30);
        assert_eq!(frames[0]["function"], "fn0");
        assert_eq!(frames[29]["line"], 29);

        let empty = format_frames(None, MAX_SYNC_FRAMES);
        assert!(empty.is_empty());
    }

    #[test]
    fn initiator_summary_includes_first_frame() {
        let initiator = json!({
            "type": "script",
            "stack": {"callFrames": [{
                "functionName": "fetchData",
                "url": "https://a.test/app.js",
                "lineNumber": 12,
            }]},
        });
        let summary = initiator_summary(&initiator);
        assert_eq!(summary["type"], "script");
        assert_eq!(summary["source"]["function"], "fetchData");
        assert_eq!(summary["source"]["line"], 12);

        let bare = initiator_summary(&json!({"type": "parser"}));
        assert_eq!(bare["type"], "parser");
        assert!(bare.get("source").is_none());
    }

    #[test]
    fn ws_connection_rate_window() {
        let mut connection = WsConnection::new("wss://a.test/socket".into());
        let start = Instant::now();
        for n in 0..5 {
            connection.note_frame(start + Duration::from_millis(n * 100));
        }
        // All five frames fall inside the one-second window.
        assert_eq!(connection.note_frame(start + Duration::from_millis(500)), 6);
        // Two seconds later the window only holds the new frame.
        assert_eq!(connection.note_frame(start + Duration::from_secs(3)), 1);
    }
}
