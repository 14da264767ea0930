use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use fairy_protocol::{CallError, CdpClient, EventStream, SessionFilter};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const ATTACH_ATTEMPTS: u32 = 3;
const ATTACH_TIMEOUT: Duration = Duration::from_secs(20);

/// Protocol domains a session enables for its collectors. None is critical:
/// an unavailable domain degrades the affected collector, not the session.
const SESSION_DOMAINS: [&str; 8] = [
    "Performance.enable",
    "Runtime.enable",
    "Network.enable",
    "Log.enable",
    "Page.enable",
    "DOMStorage.enable",
    "HeapProfiler.enable",
    "Debugger.enable",
];

#[derive(Debug, Error)]
pub enum AttachError {
    /// The target vanished between discovery and attach; abort silently.
    #[error("target gone before attach")]
    TargetGone,
    #[error(transparent)]
    Call(#[from] CallError),
}

/// One attached page target: the substrate every collector on that target
/// runs on. Calls are routed through the shared client with this session's
/// tag; `close` is idempotent and cancels outstanding collector work.
pub struct Session {
    client: CdpClient,
    target_id: String,
    session_id: String,
    location: RwLock<Location>,
    closing: CancellationToken,
    closed: AtomicBool,
    degraded: Mutex<Vec<String>>,
    last_sampled_ms: AtomicU64,
}

#[derive(Debug, Clone)]
struct Location {
    host: String,
    url: String,
    title: String,
}

impl Session {
    /// Attach to a target, retrying a few times for heavy pages.
    pub async fn attach(
        client: &CdpClient,
        target_id: &str,
        host: &str,
        url: &str,
        title: &str,
    ) -> Result<Self, AttachError> {
        let mut last_error = None;
        for attempt in 1..=ATTACH_ATTEMPTS {
            match client
                .call_with_timeout(
                    "Target.attachToTarget",
                    Some(json!({"targetId": target_id, "flatten": true})),
                    None,
                    ATTACH_TIMEOUT,
                )
                .await
            {
                Ok(result) => {
                    let session_id = result
                        .get("sessionId")
                        .and_then(Value::as_str)
                        .ok_or(AttachError::TargetGone)?
                        .to_string();
                    debug!(target_id, session_id, "attached to target");
                    return Ok(Self {
                        client: client.clone(),
                        target_id: target_id.to_string(),
                        session_id,
                        location: RwLock::new(Location {
                            host: host.to_string(),
                            url: url.to_string(),
                            title: title.to_string(),
                        }),
                        closing: CancellationToken::new(),
                        closed: AtomicBool::new(false),
                        degraded: Mutex::new(Vec::new()),
                        last_sampled_ms: AtomicU64::new(0),
                    });
                }
                Err(CallError::Protocol { .. }) => return Err(AttachError::TargetGone),
                Err(err) => {
                    last_error = Some(err);
                    sleep(Duration::from_millis(300 * attempt as u64)).await;
                }
            }
        }
        Err(AttachError::Call(
            last_error.unwrap_or(CallError::Disconnected),
        ))
    }

    /// Enable the protocol domains collectors rely on. Failures degrade,
    /// they do not abort.
    pub async fn enable_domains(&self) {
        for method in SESSION_DOMAINS {
            if let Err(err) = self.call(method, None).await {
                let domain = method.split('.').next().unwrap_or(method);
                warn!(target_id = %self.target_id, domain, error = %err, "domain unavailable");
                self.degraded
                    .lock()
                    .expect("degraded list lock")
                    .push(domain.to_string());
            }
        }
    }

    /// Call routed to this session. Fails fast once close began, and
    /// in-flight calls are cancelled by close.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, CallError> {
        self.guarded(self.client.call(method, params, Some(&self.session_id)))
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        self.guarded(self.client.call_with_timeout(
            method,
            params,
            Some(&self.session_id),
            timeout,
        ))
        .await
    }

    /// Browser-level call (no session routing), e.g. storage quota reads.
    pub async fn browser_call(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, CallError> {
        self.guarded(self.client.call(method, params, None)).await
    }

    async fn guarded(
        &self,
        call: impl std::future::Future<Output = Result<Value, CallError>>,
    ) -> Result<Value, CallError> {
        if self.is_closing() {
            return Err(CallError::Disconnected);
        }
        tokio::select! {
            _ = self.closing.cancelled() => Err(CallError::Disconnected),
            outcome = call => outcome,
        }
    }

    /// Events annotated with this session's tag.
    pub fn subscribe(&self, method: &str) -> EventStream {
        self.client
            .subscribe(method, SessionFilter::Tag(self.session_id.clone()))
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn host(&self) -> String {
        self.location.read().expect("location lock").host.clone()
    }

    pub fn url(&self) -> String {
        self.location.read().expect("location lock").url.clone()
    }

    pub fn title(&self) -> String {
        self.location.read().expect("location lock").title.clone()
    }

    /// Navigation: subsequent records are tagged with the new host.
    pub fn set_location(&self, host: &str, url: &str, title: &str) {
        let mut location = self.location.write().expect("location lock");
        location.host = host.to_string();
        location.url = url.to_string();
        location.title = title.to_string();
    }

    pub fn degraded_domains(&self) -> Vec<String> {
        self.degraded.lock().expect("degraded list lock").clone()
    }

    /// Cancellation token observed by every collector on this session.
    pub fn closing(&self) -> CancellationToken {
        self.closing.clone()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    pub fn touch_sampled(&self, now_ms: u64) {
        self.last_sampled_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_sampled_ms(&self) -> u64 {
        self.last_sampled_ms.load(Ordering::Relaxed)
    }

    /// Idempotent: cancels collectors, then best-effort detach.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closing.cancel();
        let detach = self
            .client
            .call(
                "Target.detachFromTarget",
                Some(json!({"sessionId": self.session_id})),
                None,
            )
            .await;
        if let Err(err) = detach {
            debug!(target_id = %self.target_id, error = %err, "detach failed (ignored)");
        }
    }
}
