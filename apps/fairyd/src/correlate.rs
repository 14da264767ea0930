//! Temporal correlation across the streams of one host.
//!
//! A short bounded window of recent events per host: the last memory sample,
//! network completions, and console errors. When a memory sample shows a
//! large heap jump close to a large download and/or an error burst, one
//! composite record is emitted. Pure observation — this module never calls
//! back into collectors.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fairy_core::{event_id, now_timestamp};
use serde_json::{json, Value};

const RETENTION_WINDOW: Duration = Duration::from_secs(15);
const TRIGGER_WINDOW: Duration = Duration::from_secs(3);
const EMIT_COOLDOWN: Duration = Duration::from_secs(3);
const HEAP_DELTA_TRIGGER: f64 = 10.0 * 1024.0 * 1024.0;
const NETWORK_SIZE_TRIGGER: f64 = 1024.0 * 1024.0;
const MAX_PARTICIPANTS: usize = 3;

struct MemoryPoint {
    heap_used: f64,
}

struct NetworkPoint {
    at: Instant,
    url: String,
    size: f64,
    timestamp: String,
}

struct ErrorPoint {
    at: Instant,
    message: String,
    timestamp: String,
}

#[derive(Default)]
struct HostWindow {
    last_memory: Option<MemoryPoint>,
    completes: VecDeque<NetworkPoint>,
    errors: VecDeque<ErrorPoint>,
    last_emit: Option<Instant>,
}

pub struct Correlator {
    hosts: Mutex<HashMap<String, HostWindow>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Observe a record on its way to disk; possibly yield one correlation
    /// record for the same host.
    pub fn observe(&self, host: &str, record: &Value) -> Option<Value> {
        self.observe_at(host, record, Instant::now())
    }

    fn observe_at(&self, host: &str, record: &Value, now: Instant) -> Option<Value> {
        let mut hosts = self.hosts.lock().expect("correlator lock");
        let window = hosts.entry(host.to_string()).or_default();
        window.prune(now);

        let kind = record.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            "network_request_complete" => {
                let size = record
                    .get("encodedDataLength")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                if size >= NETWORK_SIZE_TRIGGER {
                    window.completes.push_back(NetworkPoint {
                        at: now,
                        url: text_field(record, "url"),
                        size,
                        timestamp: text_field(record, "timestamp"),
                    });
                }
                None
            }
            "exception" => {
                window.errors.push_back(ErrorPoint {
                    at: now,
                    message: text_field(record, "message"),
                    timestamp: text_field(record, "timestamp"),
                });
                None
            }
            "console" => {
                if record.get("level").and_then(Value::as_str) == Some("error") {
                    window.errors.push_back(ErrorPoint {
                        at: now,
                        message: text_field(record, "message"),
                        timestamp: text_field(record, "timestamp"),
                    });
                }
                None
            }
            "memory" => {
                let heap_used = record
                    .pointer("/memory/jsHeap/used")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                let delta = window
                    .last_memory
                    .as_ref()
                    .map(|prev| heap_used - prev.heap_used);
                window.last_memory = Some(MemoryPoint { heap_used });

                let delta = delta?;
                if delta < HEAP_DELTA_TRIGGER {
                    return None;
                }
                window.correlate(host, heap_used, delta, now)
            }
            _ => None,
        }
    }
}

impl HostWindow {
    fn prune(&mut self, now: Instant) {
        while let Some(point) = self.completes.front() {
            if now.saturating_duration_since(point.at) > RETENTION_WINDOW {
                self.completes.pop_front();
            } else {
                break;
            }
        }
        while let Some(point) = self.errors.front() {
            if now.saturating_duration_since(point.at) > RETENTION_WINDOW {
                self.errors.pop_front();
            } else {
                break;
            }
        }
    }

    fn correlate(&mut self, host: &str, heap_used: f64, delta: f64, now: Instant) -> Option<Value> {
        if let Some(last_emit) = self.last_emit {
            if now.saturating_duration_since(last_emit) < EMIT_COOLDOWN {
                return None;
            }
        }

        let network: Vec<Value> = self
            .completes
            .iter()
            .filter(|point| now.saturating_duration_since(point.at) <= TRIGGER_WINDOW)
            .take(MAX_PARTICIPANTS)
            .map(|point| {
                json!({
                    "url": point.url,
                    "encodedDataLength": point.size,
                    "timestamp": point.timestamp,
                })
            })
            .collect();
        let errors: Vec<Value> = self
            .errors
            .iter()
            .filter(|point| now.saturating_duration_since(point.at) <= TRIGGER_WINDOW)
            .take(MAX_PARTICIPANTS)
            .map(|point| {
                json!({
                    "message": point.message,
                    "timestamp": point.timestamp,
                })
            })
            .collect();

        if network.is_empty() && errors.is_empty() {
            return None;
        }

        let tag = if !network.is_empty() && !errors.is_empty() {
            "network_error_correlation"
        } else if !network.is_empty() {
            "large_data_processing_issue"
        } else {
            "error_burst_with_memory_growth"
        };

        self.last_emit = Some(now);

        let mut record = json!({
            "type": "correlation",
            "timestamp": now_timestamp(),
            "hostname": host,
            "tag": tag,
            "jsHeapUsed": heap_used,
            "jsHeapDelta": delta,
            "participants": {
                "networkCompletions": network,
                "consoleErrors": errors,
            },
        });
        event_id::stamp(&mut record);
        Some(record)
    }
}

fn text_field(record: &Value, key: &str) -> String {
    record
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: f64 = 1024.0 * 1024.0;

    fn memory_record(heap_used: f64) -> Value {
        json!({
            "type": "memory",
            "timestamp": "t",
            "hostname": "example.com",
            "memory": {"jsHeap": {"used": heap_used}},
        })
    }

    fn complete_record(size: f64) -> Value {
        json!({
            "type": "network_request_complete",
            "timestamp": "t",
            "hostname": "example.com",
            "url": "https://example.com/api/data",
            "encodedDataLength": size,
        })
    }

    fn error_record() -> Value {
        json!({
            "type": "console",
            "level": "error",
            "timestamp": "t",
            "hostname": "example.com",
            "message": "boom",
        })
    }

    #[test]
    fn heap_jump_near_large_download_correlates() {
        let correlator = Correlator::new();
        let start = Instant::now();

        assert!(correlator
            .observe_at("example.com", &memory_record(20.0 * MIB), start)
            .is_none());
        assert!(correlator
            .observe_at("example.com", &complete_record(2.0 * MIB), start + Duration::from_secs(1))
            .is_none());

        let correlation = correlator
            .observe_at(
                "example.com",
                &memory_record(35.0 * MIB),
                start + Duration::from_secs(2),
            )
            .expect("correlation expected");
        assert_eq!(correlation["tag"], "large_data_processing_issue");
        assert_eq!(correlation["hostname"], "example.com");
        assert!(correlation["event_id"].as_str().unwrap().len() == 20);
        assert_eq!(
            correlation["participants"]["networkCompletions"][0]["url"],
            "https://example.com/api/data"
        );
    }

    #[test]
    fn small_heap_delta_does_not_correlate() {
        let correlator = Correlator::new();
        let start = Instant::now();
        correlator.observe_at("example.com", &memory_record(20.0 * MIB), start);
        correlator.observe_at(
            "example.com",
            &complete_record(2.0 * MIB),
            start + Duration::from_secs(1),
        );
        assert!(correlator
            .observe_at(
                "example.com",
                &memory_record(25.0 * MIB),
                start + Duration::from_secs(2),
            )
            .is_none());
    }

    #[test]
    fn stale_network_completion_is_outside_trigger_window() {
        let correlator = Correlator::new();
        let start = Instant::now();
        correlator.observe_at("example.com", &complete_record(2.0 * MIB), start);
        correlator.observe_at("example.com", &memory_record(20.0 * MIB), start);
        // Ten seconds later the completion is retained but no longer within
        // the 3 s trigger window.
        assert!(correlator
            .observe_at(
                "example.com",
                &memory_record(40.0 * MIB),
                start + Duration::from_secs(10),
            )
            .is_none());
    }

    #[test]
    fn download_plus_error_gets_network_error_tag() {
        let correlator = Correlator::new();
        let start = Instant::now();
        correlator.observe_at("example.com", &memory_record(20.0 * MIB), start);
        correlator.observe_at(
            "example.com",
            &complete_record(2.0 * MIB),
            start + Duration::from_millis(1000),
        );
        correlator.observe_at(
            "example.com",
            &error_record(),
            start + Duration::from_millis(1500),
        );
        let correlation = correlator
            .observe_at(
                "example.com",
                &memory_record(35.0 * MIB),
                start + Duration::from_secs(2),
            )
            .expect("correlation expected");
        assert_eq!(correlation["tag"], "network_error_correlation");
        assert_eq!(
            correlation["participants"]["networkCompletions"]
                .as_array()
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            correlation["participants"]["consoleErrors"]
                .as_array()
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn error_only_correlation_gets_error_tag() {
        let correlator = Correlator::new();
        let start = Instant::now();
        correlator.observe_at("example.com", &memory_record(20.0 * MIB), start);
        correlator.observe_at("example.com", &error_record(), start + Duration::from_secs(1));
        let correlation = correlator
            .observe_at(
                "example.com",
                &memory_record(35.0 * MIB),
                start + Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(correlation["tag"], "error_burst_with_memory_growth");
    }

    #[test]
    fn at_most_one_correlation_per_cooldown_window() {
        let correlator = Correlator::new();
        let start = Instant::now();
        correlator.observe_at("example.com", &memory_record(20.0 * MIB), start);
        correlator.observe_at("example.com", &error_record(), start + Duration::from_millis(1100));
        let first = correlator.observe_at(
            "example.com",
            &memory_record(35.0 * MIB),
            start + Duration::from_millis(1200),
        );
        assert!(first.is_some());

        correlator.observe_at("example.com", &error_record(), start + Duration::from_millis(1800));
        let second = correlator.observe_at(
            "example.com",
            &memory_record(50.0 * MIB),
            start + Duration::from_millis(2000),
        );
        assert!(second.is_none(), "cooldown must suppress the second emit");

        correlator.observe_at("example.com", &error_record(), start + Duration::from_millis(5000));
        let third = correlator.observe_at(
            "example.com",
            &memory_record(65.0 * MIB),
            start + Duration::from_millis(5200),
        );
        assert!(third.is_some(), "cooldown expired");
    }

    #[test]
    fn hosts_do_not_cross_contaminate() {
        let correlator = Correlator::new();
        let start = Instant::now();
        correlator.observe_at("a.test", &complete_record(2.0 * MIB), start);
        correlator.observe_at("b.test", &memory_record(20.0 * MIB), start);
        assert!(correlator
            .observe_at(
                "b.test",
                &memory_record(40.0 * MIB),
                start + Duration::from_secs(1),
            )
            .is_none());
    }
}
