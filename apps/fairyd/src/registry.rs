//! Page-target discovery and lifecycle tracking.
//!
//! Event-driven (`targetCreated` / `targetInfoChanged` / `targetDestroyed`)
//! with a slow polling reconciliation as the fallback for missed events.
//! Both paths run under one mutex so they never race each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fairy_core::derive_host;
use fairy_protocol::{CallError, CdpClient, SessionFilter};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub target_id: String,
    pub url: String,
    pub host: String,
    pub title: String,
}

#[derive(Debug, Clone)]
pub enum TargetEvent {
    Appeared(TargetInfo),
    Navigated {
        target: TargetInfo,
        old_host: String,
        new_host: String,
    },
    Disappeared {
        target_id: String,
    },
}

pub struct TargetRegistry {
    client: CdpClient,
    state: Arc<Mutex<RegistryState>>,
    stop: CancellationToken,
}

struct RegistryState {
    targets: HashMap<String, TargetInfo>,
    events: mpsc::Sender<TargetEvent>,
}

impl TargetRegistry {
    pub fn new(client: CdpClient, events: mpsc::Sender<TargetEvent>) -> Self {
        Self {
            client,
            state: Arc::new(Mutex::new(RegistryState {
                targets: HashMap::new(),
                events,
            })),
            stop: CancellationToken::new(),
        }
    }

    /// Enable discovery, subscribe to lifecycle events, take the initial
    /// snapshot, and start the polling fallback.
    pub async fn start(&self) -> Result<(), CallError> {
        // Subscribe before enabling discovery so nothing slips between.
        let mut created = self
            .client
            .subscribe("Target.targetCreated", SessionFilter::Browser);
        let mut changed = self
            .client
            .subscribe("Target.targetInfoChanged", SessionFilter::Browser);
        let mut destroyed = self
            .client
            .subscribe("Target.targetDestroyed", SessionFilter::Browser);

        self.client
            .call(
                "Target.setDiscoverTargets",
                Some(json!({"discover": true})),
                None,
            )
            .await?;

        self.sync_targets().await?;

        let state = Arc::clone(&self.state);
        let stop = self.stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = created.next() => {
                        let Some(event) = event else { break };
                        if let Some(info) = page_target(event.params.get("targetInfo")) {
                            upsert_target(&state, info).await;
                        }
                    }
                    event = changed.next() => {
                        let Some(event) = event else { break };
                        on_info_changed(&state, event.params.get("targetInfo")).await;
                    }
                    event = destroyed.next() => {
                        let Some(event) = event else { break };
                        if let Some(target_id) = event.params.get("targetId").and_then(Value::as_str) {
                            remove_target(&state, target_id).await;
                        }
                    }
                }
            }
            debug!("target event loop ended");
        });

        let client = self.client.clone();
        let state = Arc::clone(&self.state);
        let stop = self.stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = sleep(POLL_INTERVAL) => {}
                }
                if let Err(err) = sync_targets_inner(&client, &state).await {
                    warn!(error = %err, "target poll failed");
                    if matches!(err, CallError::Disconnected) {
                        break;
                    }
                }
            }
            debug!("target poll loop ended");
        });

        Ok(())
    }

    async fn sync_targets(&self) -> Result<(), CallError> {
        sync_targets_inner(&self.client, &self.state).await
    }

    /// Current set of monitored targets.
    pub async fn snapshot(&self) -> Vec<TargetInfo> {
        self.state.lock().await.targets.values().cloned().collect()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

/// Keep only `page` targets whose URL derives a monitorable host.
pub(crate) fn page_target(target_info: Option<&Value>) -> Option<TargetInfo> {
    let info = target_info?;
    if info.get("type").and_then(Value::as_str) != Some("page") {
        return None;
    }
    let target_id = info.get("targetId").and_then(Value::as_str)?;
    let url = info.get("url").and_then(Value::as_str).unwrap_or("");
    let host = derive_host(url)?;
    Some(TargetInfo {
        target_id: target_id.to_string(),
        url: url.to_string(),
        host,
        title: info
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
    })
}

async fn upsert_target(state: &Mutex<RegistryState>, info: TargetInfo) {
    // The state mutex serializes event-driven and polling reconciliation,
    // including emission order.
    let mut guard = state.lock().await;
    apply_upsert(&mut guard, info).await;
}

async fn apply_upsert(guard: &mut RegistryState, info: TargetInfo) {
    match guard.targets.get(&info.target_id) {
        None => {
            guard.targets.insert(info.target_id.clone(), info.clone());
            let _ = guard.events.send(TargetEvent::Appeared(info)).await;
        }
        Some(existing) if existing.url != info.url || existing.title != info.title => {
            let old_host = existing.host.clone();
            let new_host = info.host.clone();
            let url_changed = existing.url != info.url;
            guard.targets.insert(info.target_id.clone(), info.clone());
            if url_changed {
                let _ = guard
                    .events
                    .send(TargetEvent::Navigated {
                        target: info,
                        old_host,
                        new_host,
                    })
                    .await;
            }
        }
        Some(_) => {}
    }
}

async fn on_info_changed(state: &Mutex<RegistryState>, target_info: Option<&Value>) {
    // Navigation into an internal page drops the target from monitoring.
    if let Some(info) = target_info {
        if info.get("type").and_then(Value::as_str) == Some("page") {
            if let Some(target_id) = info.get("targetId").and_then(Value::as_str) {
                let url = info.get("url").and_then(Value::as_str).unwrap_or("");
                if derive_host(url).is_none() {
                    remove_target(state, target_id).await;
                    return;
                }
            }
        }
    }
    if let Some(info) = page_target(target_info) {
        upsert_target(state, info).await;
    }
}

async fn remove_target(state: &Mutex<RegistryState>, target_id: &str) {
    let mut guard = state.lock().await;
    if guard.targets.remove(target_id).is_some() {
        let _ = guard
            .events
            .send(TargetEvent::Disappeared {
                target_id: target_id.to_string(),
            })
            .await;
    }
}

/// Polling reconciliation: the target list is the source of truth.
async fn sync_targets_inner(
    client: &CdpClient,
    state: &Mutex<RegistryState>,
) -> Result<(), CallError> {
    let response = client.call("Target.getTargets", None, None).await?;
    let mut guard = state.lock().await;

    let mut seen: HashMap<String, TargetInfo> = HashMap::new();
    if let Some(infos) = response.get("targetInfos").and_then(Value::as_array) {
        for info in infos {
            if let Some(target) = page_target(Some(info)) {
                seen.insert(target.target_id.clone(), target);
            }
        }
    }

    let stale: Vec<String> = guard
        .targets
        .keys()
        .filter(|id| !seen.contains_key(*id))
        .cloned()
        .collect();
    for target_id in stale {
        guard.targets.remove(&target_id);
        let _ = guard
            .events
            .send(TargetEvent::Disappeared { target_id })
            .await;
    }

    for (_, info) in seen {
        apply_upsert(&mut guard, info).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(target_id: &str, url: &str) -> Value {
        json!({
            "targetId": target_id,
            "type": "page",
            "url": url,
            "title": "Page",
        })
    }

    fn registry_state() -> (Arc<Mutex<RegistryState>>, mpsc::Receiver<TargetEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Mutex::new(RegistryState {
                targets: HashMap::new(),
                events: tx,
            })),
            rx,
        )
    }

    #[test]
    fn page_target_filters_type_and_scheme() {
        assert!(page_target(Some(&info("T1", "https://example.com/"))).is_some());
        assert!(page_target(Some(&info("T1", "chrome://settings"))).is_none());
        assert!(page_target(Some(&json!({
            "targetId": "T2",
            "type": "service_worker",
            "url": "https://example.com/sw.js",
        })))
        .is_none());
    }

    #[test]
    fn page_target_derives_normalized_host() {
        let target = page_target(Some(&info("T1", "https://www.Example.com/x"))).unwrap();
        assert_eq!(target.host, "example.com");
    }

    #[tokio::test]
    async fn appear_then_navigate_emits_both_hosts() {
        let (state, mut rx) = registry_state();

        upsert_target(&state, page_target(Some(&info("T1", "https://www.a.test/x"))).unwrap()).await;
        match rx.recv().await.unwrap() {
            TargetEvent::Appeared(target) => assert_eq!(target.host, "a.test"),
            other => panic!("unexpected event: {other:?}"),
        }

        upsert_target(&state, page_target(Some(&info("T1", "https://m.b.test/y"))).unwrap()).await;
        match rx.recv().await.unwrap() {
            TargetEvent::Navigated {
                old_host, new_host, ..
            } => {
                assert_eq!(old_host, "a.test");
                assert_eq!(new_host, "b.test");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn navigation_to_internal_page_drops_target() {
        let (state, mut rx) = registry_state();
        upsert_target(&state, page_target(Some(&info("T1", "https://a.test/"))).unwrap()).await;
        let _ = rx.recv().await;

        on_info_changed(&state, Some(&info("T1", "chrome://newtab"))).await;
        match rx.recv().await.unwrap() {
            TargetEvent::Disappeared { target_id } => assert_eq!(target_id, "T1"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(state.lock().await.targets.is_empty());
    }

    #[tokio::test]
    async fn duplicate_upsert_is_silent() {
        let (state, mut rx) = registry_state();
        let target = page_target(Some(&info("T1", "https://a.test/"))).unwrap();
        upsert_target(&state, target.clone()).await;
        let _ = rx.recv().await;
        upsert_target(&state, target).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn destroyed_unknown_target_is_silent() {
        let (state, mut rx) = registry_state();
        remove_target(&state, "nope").await;
        assert!(rx.try_recv().is_err());
    }
}
