//! Heap-allocation sampling. The sampler is stopped and restarted every
//! collection cycle so the browser-side sample set stays bounded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fairy_core::{now_timestamp, Stream};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{truncate, RecordSink};
use crate::session::Session;

const PROFILE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);
const MAX_NODES: usize = 1000;
const MAX_DEPTH: usize = 20;
const TOP_ALLOCATORS: usize = 10;
const FUNCTION_TRUNCATE: usize = 100;
const URL_TRUNCATE: usize = 200;

pub fn spawn(
    session: Arc<Session>,
    sink: RecordSink,
    interval: Duration,
    sampling_interval: u64,
) -> JoinHandle<()> {
    tokio::spawn(run(session, sink, interval, sampling_interval))
}

async fn run(session: Arc<Session>, sink: RecordSink, interval: Duration, sampling_interval: u64) {
    let closing = session.closing();

    loop {
        if closing.is_cancelled() {
            break;
        }
        if let Err(err) = session
            .call(
                "HeapProfiler.startSampling",
                Some(json!({"samplingInterval": sampling_interval})),
            )
            .await
        {
            warn!(target_id = %session.target_id(), error = %err, "heap sampling unavailable");
            return;
        }
        let started = Instant::now();

        tokio::select! {
            _ = closing.cancelled() => {
                let _ = session.call("HeapProfiler.stopSampling", None).await;
                break;
            }
            _ = sleep(interval) => {}
        }

        let profile = session
            .call_with_timeout("HeapProfiler.getSamplingProfile", None, PROFILE_FETCH_TIMEOUT)
            .await;
        let _ = session.call("HeapProfiler.stopSampling", None).await;

        match profile {
            Ok(response) => {
                if let Some(aggregate) = aggregate_profile(response.get("profile")) {
                    let record = json!({
                        "type": "heap_sampling",
                        "timestamp": now_timestamp(),
                        "hostname": session.host(),
                        "targetId": session.target_id(),
                        "sessionId": session.session_id(),
                        "durationMs": started.elapsed().as_millis() as u64,
                        "samplingConfig": {
                            "samplingInterval": sampling_interval,
                        },
                        "profileSummary": {
                            "totalSize": aggregate.total_size,
                            "totalSamples": aggregate.total_samples,
                            "nodeCount": aggregate.node_count,
                            "maxAllocationSize": aggregate.max_sample_size,
                        },
                        "topAllocators": aggregate.top_allocators,
                    });
                    sink.emit(Stream::HeapSampling, record);
                }
            }
            Err(err) => {
                debug!(target_id = %session.target_id(), error = %err, "heap profile fetch failed");
                tokio::select! {
                    _ = closing.cancelled() => break,
                    _ = sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }
    debug!(target_id = %session.target_id(), "heap sampler stopped");
}

struct ProfileAggregate {
    total_size: f64,
    total_samples: usize,
    node_count: usize,
    max_sample_size: f64,
    top_allocators: Vec<Value>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct FrameKey {
    function: String,
    url: String,
    line: u64,
    column: u64,
}

/// Aggregate sampled self-size per (function, script, line, column) and
/// keep the heaviest allocators.
fn aggregate_profile(profile: Option<&Value>) -> Option<ProfileAggregate> {
    let profile = profile?;
    let samples = profile.get("samples").and_then(Value::as_array)?;
    let head = profile.get("head")?;
    if samples.is_empty() {
        return None;
    }

    // node id → call frame, walked iteratively with a bounded depth.
    let mut frames_by_node: HashMap<u64, FrameKey> = HashMap::new();
    let mut stack: Vec<(&Value, usize)> = vec![(head, 0)];
    while let Some((node, depth)) = stack.pop() {
        if depth > MAX_DEPTH || frames_by_node.len() >= MAX_NODES {
            continue;
        }
        if let Some(id) = node.get("id").and_then(Value::as_u64) {
            let frame = node.get("callFrame").cloned().unwrap_or(Value::Null);
            frames_by_node.insert(
                id,
                FrameKey {
                    function: frame
                        .get("functionName")
                        .and_then(Value::as_str)
                        .filter(|name| !name.is_empty())
                        .unwrap_or("anonymous")
                        .to_string(),
                    url: frame
                        .get("url")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    line: frame.get("lineNumber").and_then(Value::as_u64).unwrap_or(0),
                    column: frame.get("columnNumber").and_then(Value::as_u64).unwrap_or(0),
                },
            );
        }
        if let Some(children) = node.get("children").and_then(Value::as_array) {
            for child in children {
                stack.push((child, depth + 1));
            }
        }
    }

    let mut by_frame: HashMap<FrameKey, (f64, u64)> = HashMap::new();
    let mut total_size = 0.0;
    let mut max_sample_size: f64 = 0.0;
    let mut counted_samples = 0usize;
    for sample in samples {
        let node_id = sample.get("nodeId").and_then(Value::as_u64);
        let size = sample.get("size").and_then(Value::as_f64).unwrap_or(0.0);
        if size <= 0.0 {
            continue;
        }
        counted_samples += 1;
        total_size += size;
        max_sample_size = max_sample_size.max(size);
        if let Some(frame) = node_id.and_then(|id| frames_by_node.get(&id)) {
            let entry = by_frame.entry(frame.clone()).or_insert((0.0, 0));
            entry.0 += size;
            entry.1 += 1;
        }
    }
    if counted_samples == 0 {
        return None;
    }

    let mut ranked: Vec<(FrameKey, (f64, u64))> = by_frame.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.partial_cmp(&a.1 .0).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(TOP_ALLOCATORS);

    let top_allocators = ranked
        .into_iter()
        .map(|(frame, (self_size, sample_count))| {
            json!({
                "functionName": truncate(&frame.function, FUNCTION_TRUNCATE),
                "scriptUrl": truncate(&frame.url, URL_TRUNCATE),
                "lineNumber": frame.line,
                "columnNumber": frame.column,
                "selfSize": self_size,
                "sampleCount": sample_count,
                "allocationPercentage": if total_size > 0.0 {
                    (self_size / total_size * 10000.0).round() / 100.0
                } else {
                    0.0
                },
            })
        })
        .collect();

    Some(ProfileAggregate {
        total_size,
        total_samples: counted_samples,
        node_count: frames_by_node.len(),
        max_sample_size,
        top_allocators,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_profile() -> Value {
        json!({
            "head": {
                "id": 1,
                "callFrame": {"functionName": "(root)", "url": "", "lineNumber": 0, "columnNumber": 0},
                "children": [
                    {
                        "id": 2,
                        "callFrame": {
                            "functionName": "allocateBuffers",
                            "url": "https://example.com/app.js",
                            "lineNumber": 120,
                            "columnNumber": 4,
                        },
                        "children": [],
                    },
                    {
                        "id": 3,
                        "callFrame": {
                            "functionName": "parseResponse",
                            "url": "https://example.com/api.js",
                            "lineNumber": 33,
                            "columnNumber": 2,
                        },
                        "children": [],
                    },
                ],
            },
            "samples": [
                {"nodeId": 2, "size": 65536.0, "ordinal": 1},
                {"nodeId": 2, "size": 131072.0, "ordinal": 2},
                {"nodeId": 3, "size": 32768.0, "ordinal": 3},
                {"nodeId": 9, "size": 1024.0, "ordinal": 4},
            ],
        })
    }

    #[test]
    fn aggregates_self_size_per_frame() {
        let profile = fixture_profile();
        let aggregate = aggregate_profile(Some(&profile)).unwrap();
        assert_eq!(aggregate.total_samples, 4);
        assert_eq!(aggregate.total_size, 65536.0 + 131072.0 + 32768.0 + 1024.0);
        assert_eq!(aggregate.max_sample_size, 131072.0);

        let top = &aggregate.top_allocators[0];
        assert_eq!(top["functionName"], "allocateBuffers");
        assert_eq!(top["selfSize"], 196608.0);
        assert_eq!(top["sampleCount"], 2);
        let second = &aggregate.top_allocators[1];
        assert_eq!(second["functionName"], "parseResponse");
    }

    #[test]
    fn empty_profile_yields_nothing() {
        assert!(aggregate_profile(None).is_none());
        assert!(aggregate_profile(Some(&json!({"head": {}, "samples": []}))).is_none());
        let zero_sizes = json!({
            "head": {"id": 1, "children": []},
            "samples": [{"nodeId": 1, "size": 0.0}],
        });
        assert!(aggregate_profile(Some(&zero_sizes)).is_none());
    }

    #[test]
    fn allocation_percentage_sums_to_one_hundred() {
        let profile = fixture_profile();
        let aggregate = aggregate_profile(Some(&profile)).unwrap();
        let total: f64 = aggregate
            .top_allocators
            .iter()
            .map(|a| a["allocationPercentage"].as_f64().unwrap())
            .sum();
        // The unattributed nodeId 9 sample keeps this just under 100.
        assert!(total < 100.0);
        assert!(total > 85.0);
    }
}
