//! Event-listener leak attribution.
//!
//! Every memory sample gets a lightweight listener distribution. When the
//! listener count grows sharply between samples, a deeper pass walks a
//! bounded set of leak-prone DOM subtrees and resolves each captured
//! listener to its defining script location. The deep pass runs as an
//! independent task with its own deadline; its result rides along on the
//! next memory record of the session.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fairy_protocol::CallError;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::truncate;
use crate::session::Session;
use crate::util::now_millis;

const GROWTH_TRIGGER: i64 = 20;
const DEEP_SCAN_DEADLINE: Duration = Duration::from_millis(500);
const SCRIPT_CACHE_CAP: usize = 1000;
const MAX_ELEMENTS_SCANNED: usize = 300;
const MAX_SOURCES_REPORTED: usize = 10;
const FUNCTION_NAME_TRUNCATE: usize = 100;
const MAX_EVENT_TYPES: usize = 5;

/// Leak-prone subtrees worth scanning; a bounded stand-in for a full page
/// walk.
const CANDIDATE_SELECTORS: [&str; 10] = [
    "body",
    "[role=button]",
    "button",
    "a[href]",
    "input",
    "select",
    "textarea",
    ".modal",
    ".dialog",
    ".popup",
];

/// `scriptId` → source URL mapping maintained from `Debugger.scriptParsed`.
pub struct ScriptUrlCache {
    inner: Mutex<ScriptCacheState>,
}

struct ScriptCacheState {
    urls: HashMap<String, String>,
    order: VecDeque<String>,
}

impl ScriptUrlCache {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ScriptCacheState {
                urls: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    fn insert(&self, script_id: String, url: String) {
        let mut state = self.inner.lock().expect("script cache lock");
        if !state.urls.contains_key(&script_id) {
            state.order.push_back(script_id.clone());
            while state.order.len() > SCRIPT_CACHE_CAP {
                if let Some(evicted) = state.order.pop_front() {
                    state.urls.remove(&evicted);
                }
            }
        }
        state.urls.insert(script_id, url);
    }

    fn get(&self, script_id: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("script cache lock")
            .urls
            .get(script_id)
            .cloned()
    }
}

pub struct ListenerAnalyzer {
    session: Arc<Session>,
    scripts: Arc<ScriptUrlCache>,
    last_count: Mutex<Option<i64>>,
    deep_running: Arc<AtomicBool>,
    pending_report: Arc<Mutex<Option<Value>>>,
}

impl ListenerAnalyzer {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            scripts: Arc::new(ScriptUrlCache::new()),
            last_count: Mutex::new(None),
            deep_running: Arc::new(AtomicBool::new(false)),
            pending_report: Arc::new(Mutex::new(None)),
        }
    }

    /// Keep the scriptId → URL map warm; cheap, runs for the session's life.
    pub fn spawn_script_watch(&self) -> JoinHandle<()> {
        let session = Arc::clone(&self.session);
        let scripts = Arc::clone(&self.scripts);
        tokio::spawn(async move {
            let closing = session.closing();
            let mut parsed = session.subscribe("Debugger.scriptParsed");
            loop {
                let event = tokio::select! {
                    _ = closing.cancelled() => break,
                    event = parsed.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let script_id = event.params.get("scriptId").and_then(Value::as_str);
                let url = event.params.get("url").and_then(Value::as_str);
                if let (Some(script_id), Some(url)) = (script_id, url) {
                    if !url.is_empty() {
                        scripts.insert(script_id.to_string(), url.to_string());
                    }
                }
            }
        })
    }

    /// Per-sample analysis. The lightweight distribution is produced every
    /// time; the deep pass is only triggered by sharp growth and never runs
    /// on the sample path.
    pub async fn analyze(&self, current_count: i64) -> Option<Value> {
        let growth_delta = {
            let mut last = self.last_count.lock().expect("listener count lock");
            let delta = last.map(|previous| current_count - previous).unwrap_or(0);
            *last = Some(current_count);
            delta
        };

        let summary = match self.basic_stats(current_count).await {
            Ok(summary) => summary,
            Err(err) => {
                debug!(error = %err, "listener stats unavailable this sample");
                return None;
            }
        };

        let mut analysis = json!({
            "summary": summary,
            "growthDelta": growth_delta,
            "analysisTriggered": false,
        });

        if should_trigger_deep_analysis(growth_delta) {
            analysis["analysisTriggered"] = json!(true);
            if !self.deep_running.swap(true, Ordering::SeqCst) {
                let session = Arc::clone(&self.session);
                let scripts = Arc::clone(&self.scripts);
                let pending = Arc::clone(&self.pending_report);
                let running = Arc::clone(&self.deep_running);
                tokio::spawn(async move {
                    match timeout(DEEP_SCAN_DEADLINE, deep_scan(&session, &scripts)).await {
                        Ok(Some(sources)) => {
                            *pending.lock().expect("pending report lock") = Some(sources);
                        }
                        Ok(None) => {}
                        Err(_) => {
                            warn!(
                                target_id = %session.target_id(),
                                "listener deep analysis exceeded its deadline, aborted"
                            );
                        }
                    }
                    running.store(false, Ordering::SeqCst);
                });
            }
        }

        // A completed deep pass attaches to the next sample.
        if let Some(sources) = self
            .pending_report
            .lock()
            .expect("pending report lock")
            .take()
        {
            analysis["detailedSources"] = sources;
        }

        Some(analysis)
    }

    /// Document/window listener counts grouped by host object and event
    /// kind; element share estimated from the metrics total.
    async fn basic_stats(&self, total_from_metrics: i64) -> Result<Value, CallError> {
        let group = format!("listener_stats_{}", now_millis());
        let stats = self.basic_stats_grouped(&group, total_from_metrics).await;
        let _ = self
            .session
            .call(
                "Runtime.releaseObjectGroup",
                Some(json!({"objectGroup": group})),
            )
            .await;
        stats
    }

    async fn basic_stats_grouped(
        &self,
        group: &str,
        total_from_metrics: i64,
    ) -> Result<Value, CallError> {
        let document = self.evaluate_object("document", group).await?;
        let window = self.evaluate_object("window", group).await?;

        let document_listeners = self.listeners_of(&document).await?;
        let window_listeners = self.listeners_of(&window).await?;

        let on_document = document_listeners.len() as i64;
        let on_window = window_listeners.len() as i64;
        let on_elements = (total_from_metrics - on_document - on_window).max(0);

        let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
        for listener in document_listeners.iter().chain(window_listeners.iter()) {
            let kind = listener
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            *by_type.entry(kind.to_string()).or_default() += 1;
        }

        Ok(json!({
            "total": on_document + on_window + on_elements,
            "byTarget": {
                "document": on_document,
                "window": on_window,
                "elements": on_elements,
            },
            "byType": by_type,
        }))
    }

    async fn evaluate_object(&self, expression: &str, group: &str) -> Result<String, CallError> {
        let result = self
            .session
            .call(
                "Runtime.evaluate",
                Some(json!({"expression": expression, "objectGroup": group})),
            )
            .await?;
        result
            .pointer("/result/objectId")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or(CallError::Protocol {
                code: 0,
                message: format!("{expression} has no objectId"),
            })
    }

    async fn listeners_of(&self, object_id: &str) -> Result<Vec<Value>, CallError> {
        let response = self
            .session
            .call(
                "DOMDebugger.getEventListeners",
                Some(json!({"objectId": object_id})),
            )
            .await?;
        Ok(response
            .get("listeners")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

/// The deep pass trigger: listener count grew by more than 20 since the
/// previous sample.
pub fn should_trigger_deep_analysis(growth_delta: i64) -> bool {
    growth_delta > GROWTH_TRIGGER
}

/// ≥ 10 elements bound to the same source reads as a likely leak; ≥ 3 is
/// worth flagging.
pub fn suspicion_for(element_count: u64) -> Option<&'static str> {
    if element_count >= 10 {
        Some("high")
    } else if element_count >= 3 {
        Some("medium")
    } else {
        None
    }
}

#[derive(Default)]
struct SourceAggregate {
    element_count: u64,
    event_types: BTreeSet<String>,
    function_name: String,
    script_id: String,
    line: u64,
    column: u64,
}

async fn deep_scan(session: &Session, scripts: &ScriptUrlCache) -> Option<Value> {
    let group = format!("listener_deep_{}", now_millis());
    let sources = deep_scan_grouped(session, scripts, &group).await;
    let _ = session
        .call(
            "Runtime.releaseObjectGroup",
            Some(json!({"objectGroup": group})),
        )
        .await;
    sources
}

async fn deep_scan_grouped(
    session: &Session,
    scripts: &ScriptUrlCache,
    group: &str,
) -> Option<Value> {
    let mut sources: HashMap<String, SourceAggregate> = HashMap::new();
    let mut scanned = 0usize;

    for selector in CANDIDATE_SELECTORS {
        if scanned >= MAX_ELEMENTS_SCANNED || session.is_closing() {
            break;
        }
        let expression = format!(
            "Array.from(document.querySelectorAll('{selector}')).slice(0, 100)"
        );
        let Ok(evaluated) = session
            .call(
                "Runtime.evaluate",
                Some(json!({"expression": expression, "objectGroup": group})),
            )
            .await
        else {
            continue;
        };
        let Some(array_id) = evaluated.pointer("/result/objectId").and_then(Value::as_str) else {
            continue;
        };

        let Ok(properties) = session
            .call(
                "Runtime.getProperties",
                Some(json!({"objectId": array_id, "ownProperties": true})),
            )
            .await
        else {
            continue;
        };
        let Some(entries) = properties.get("result").and_then(Value::as_array) else {
            continue;
        };

        for property in entries {
            if scanned >= MAX_ELEMENTS_SCANNED {
                break;
            }
            let is_index = property
                .get("name")
                .and_then(Value::as_str)
                .map(|name| name.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false);
            if !is_index {
                continue;
            }
            let Some(element_id) = property.pointer("/value/objectId").and_then(Value::as_str)
            else {
                continue;
            };
            scanned += 1;

            let Ok(response) = session
                .call(
                    "DOMDebugger.getEventListeners",
                    Some(json!({"objectId": element_id})),
                )
                .await
            else {
                continue;
            };
            let Some(listeners) = response.get("listeners").and_then(Value::as_array) else {
                continue;
            };
            for listener in listeners {
                accumulate_listener(&mut sources, listener);
            }
        }
    }

    build_source_report(sources, scripts)
}

fn accumulate_listener(sources: &mut HashMap<String, SourceAggregate>, listener: &Value) {
    let Some(script_id) = listener.pointer("/location/scriptId").and_then(Value::as_str) else {
        return;
    };
    let line = listener
        .pointer("/location/lineNumber")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let column = listener
        .pointer("/location/columnNumber")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    let key = format!("{script_id}:{line}");
    let aggregate = sources.entry(key).or_default();
    aggregate.element_count += 1;
    aggregate.script_id = script_id.to_string();
    aggregate.line = line;
    aggregate.column = column;
    if let Some(kind) = listener.get("type").and_then(Value::as_str) {
        aggregate.event_types.insert(kind.to_string());
    }
    if aggregate.function_name.is_empty() {
        let description = listener
            .pointer("/handler/description")
            .and_then(Value::as_str)
            .unwrap_or("");
        aggregate.function_name = extract_function_name(description);
    }
}

fn build_source_report(
    sources: HashMap<String, SourceAggregate>,
    scripts: &ScriptUrlCache,
) -> Option<Value> {
    let mut flagged: Vec<SourceAggregate> = sources
        .into_values()
        .filter(|source| suspicion_for(source.element_count).is_some())
        .collect();
    if flagged.is_empty() {
        return None;
    }
    flagged.sort_by(|a, b| b.element_count.cmp(&a.element_count));
    flagged.truncate(MAX_SOURCES_REPORTED);

    let report: Vec<Value> = flagged
        .into_iter()
        .map(|source| {
            let source_file = scripts
                .get(&source.script_id)
                .unwrap_or_else(|| format!("script://{}", source.script_id));
            json!({
                "sourceFile": source_file,
                "lineNumber": source.line,
                "columnNumber": source.column,
                "functionName": truncate(&source.function_name, FUNCTION_NAME_TRUNCATE),
                "elementCount": source.element_count,
                "eventTypes": source.event_types.iter().take(MAX_EVENT_TYPES).collect::<Vec<_>>(),
                "suspicion": suspicion_for(source.element_count),
            })
        })
        .collect();
    Some(Value::Array(report))
}

/// Pull a function name out of a handler description such as
/// `function handleClick() { ... }`.
pub fn extract_function_name(description: &str) -> String {
    let description = description.trim();
    if description.is_empty() {
        return "anonymous".to_string();
    }
    for prefix in ["async function ", "function "] {
        if let Some(rest) = description.strip_prefix(prefix) {
            if let Some(paren) = rest.find('(') {
                let name = rest[..paren].trim();
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
    }
    truncate(description, 50)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_analysis_triggers_strictly_above_threshold() {
        assert!(!should_trigger_deep_analysis(0));
        assert!(!should_trigger_deep_analysis(20));
        assert!(should_trigger_deep_analysis(21));
        assert!(!should_trigger_deep_analysis(-40));
    }

    #[test]
    fn suspicion_thresholds() {
        assert_eq!(suspicion_for(15), Some("high"));
        assert_eq!(suspicion_for(10), Some("high"));
        assert_eq!(suspicion_for(5), Some("medium"));
        assert_eq!(suspicion_for(3), Some("medium"));
        assert_eq!(suspicion_for(2), None);
    }

    #[test]
    fn function_name_extraction() {
        assert_eq!(
            extract_function_name("function handleClick() { [code] }"),
            "handleClick"
        );
        assert_eq!(
            extract_function_name("async function loadData(url) { ... }"),
            "loadData"
        );
        assert_eq!(extract_function_name(""), "anonymous");
        assert_eq!(extract_function_name("() => {}"), "() => {}");
    }

    #[test]
    fn script_cache_evicts_oldest() {
        let cache = ScriptUrlCache::new();
        for n in 0..(SCRIPT_CACHE_CAP + 10) {
            cache.insert(format!("s{n}"), format!("https://example.com/{n}.js"));
        }
        assert!(cache.get("s0").is_none());
        assert!(cache.get(&format!("s{}", SCRIPT_CACHE_CAP + 9)).is_some());
    }

    #[test]
    fn listener_aggregation_groups_by_source_line() {
        let mut sources = HashMap::new();
        let listener = serde_json::json!({
            "type": "click",
            "location": {"scriptId": "42", "lineNumber": 7, "columnNumber": 2},
            "handler": {"description": "function onClick() {}"},
        });
        for _ in 0..4 {
            accumulate_listener(&mut sources, &listener);
        }
        let other = serde_json::json!({
            "type": "scroll",
            "location": {"scriptId": "42", "lineNumber": 9},
        });
        accumulate_listener(&mut sources, &other);

        assert_eq!(sources.len(), 2);
        let hot = sources.get("42:7").unwrap();
        assert_eq!(hot.element_count, 4);
        assert_eq!(hot.function_name, "onClick");
        assert!(hot.event_types.contains("click"));
    }

    #[test]
    fn report_keeps_only_flagged_sources_sorted() {
        let cache = ScriptUrlCache::new();
        cache.insert("1".into(), "https://example.com/app.js".into());
        let mut sources = HashMap::new();
        sources.insert(
            "1:10".to_string(),
            SourceAggregate {
                element_count: 12,
                script_id: "1".into(),
                line: 10,
                ..Default::default()
            },
        );
        sources.insert(
            "1:20".to_string(),
            SourceAggregate {
                element_count: 4,
                script_id: "1".into(),
                line: 20,
                ..Default::default()
            },
        );
        sources.insert(
            "1:30".to_string(),
            SourceAggregate {
                element_count: 1,
                script_id: "1".into(),
                line: 30,
                ..Default::default()
            },
        );

        let report = build_source_report(sources, &cache).unwrap();
        let report = report.as_array().unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0]["suspicion"], "high");
        assert_eq!(report[0]["elementCount"], 12);
        assert_eq!(report[0]["sourceFile"], "https://example.com/app.js");
        assert_eq!(report[1]["suspicion"], "medium");
    }

    #[test]
    fn unflagged_sources_produce_no_report() {
        let cache = ScriptUrlCache::new();
        let mut sources = HashMap::new();
        sources.insert(
            "1:10".to_string(),
            SourceAggregate {
                element_count: 2,
                script_id: "1".into(),
                line: 10,
                ..Default::default()
            },
        );
        assert!(build_source_report(sources, &cache).is_none());
    }
}
