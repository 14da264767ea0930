//! Owns the set of attached sessions: admission under the global cap with
//! LRU eviction, navigation re-tagging, and orderly teardown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fairy_core::MonitorConfig;
use fairy_protocol::CdpClient;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collectors::{self, RecordSink};
use crate::overview::Overview;
use crate::registry::{TargetEvent, TargetInfo};
use crate::session::{AttachError, Session};
use crate::sourcemap::SourceMapResolver;

const COLLECTOR_STOP_GRACE: Duration = Duration::from_secs(1);

enum SessionEntry {
    /// Slot reserved while the attach round trips are in flight.
    Pending,
    Active {
        session: Arc<Session>,
        collectors: Vec<JoinHandle<()>>,
    },
}

pub struct Supervisor {
    client: CdpClient,
    config: MonitorConfig,
    sink: RecordSink,
    overview: Arc<Overview>,
    sampling_permits: Arc<Semaphore>,
    resolver: Arc<dyn SourceMapResolver>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    // Serializes cap checks and slot reservation; never held across attach.
    admission: tokio::sync::Mutex<()>,
    // Serializes create/destroy per target id so attach never races close.
    target_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        client: CdpClient,
        config: MonitorConfig,
        sink: RecordSink,
        overview: Arc<Overview>,
        resolver: Arc<dyn SourceMapResolver>,
    ) -> Self {
        let permits = config.sampling_permits;
        Self {
            client,
            config,
            sink,
            overview,
            sampling_permits: Arc::new(Semaphore::new(permits)),
            resolver,
            sessions: Mutex::new(HashMap::new()),
            admission: tokio::sync::Mutex::new(()),
            target_locks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Consume registry events until shutdown.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<TargetEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                TargetEvent::Appeared(target) => {
                    self.overview.note_target();
                    let supervisor = Arc::clone(&self);
                    tokio::spawn(async move {
                        supervisor.attach_target(target).await;
                    });
                }
                TargetEvent::Navigated {
                    target,
                    old_host,
                    new_host,
                } => {
                    self.on_navigated(&target, &old_host, &new_host);
                }
                TargetEvent::Disappeared { target_id } => {
                    let supervisor = Arc::clone(&self);
                    tokio::spawn(async move {
                        supervisor.detach_target(&target_id).await;
                    });
                }
            }
        }
        debug!("supervisor event loop ended");
    }

    fn target_lock(&self, target_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.target_locks.lock().expect("target lock map");
        Arc::clone(
            locks
                .entry(target_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Reserve a slot under the cap, evicting the least-recently-sampled
    /// session when full. Returns false when the target is already present
    /// or no slot can be freed.
    async fn reserve_slot(&self, target_id: &str) -> bool {
        let _admission = self.admission.lock().await;
        {
            let sessions = self.sessions.lock().expect("session map lock");
            if sessions.contains_key(target_id) {
                return false;
            }
        }

        let mut waits = 0u32;
        while self.session_count() >= self.config.max_sessions {
            if self.shutdown.is_cancelled() {
                return false;
            }
            match self.least_recently_sampled() {
                Some(victim) => {
                    info!(target_id = %victim, "session cap reached, evicting least-recently-sampled");
                    self.detach_target(&victim).await;
                }
                None => {
                    // Every slot is a reservation still attaching; give them
                    // a moment to become evictable.
                    waits += 1;
                    if waits > 50 {
                        return false;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        self.sessions
            .lock()
            .expect("session map lock")
            .insert(target_id.to_string(), SessionEntry::Pending);
        true
    }

    fn release_slot(&self, target_id: &str) {
        let mut sessions = self.sessions.lock().expect("session map lock");
        if matches!(sessions.get(target_id), Some(SessionEntry::Pending)) {
            sessions.remove(target_id);
        }
    }

    async fn attach_target(self: &Arc<Self>, target: TargetInfo) {
        let lock = self.target_lock(&target.target_id);
        let _guard = lock.lock().await;

        if self.shutdown.is_cancelled() {
            return;
        }
        if !self.reserve_slot(&target.target_id).await {
            return;
        }

        let session = match Session::attach(
            &self.client,
            &target.target_id,
            &target.host,
            &target.url,
            &target.title,
        )
        .await
        {
            Ok(session) => Arc::new(session),
            Err(AttachError::TargetGone) => {
                debug!(target_id = %target.target_id, "target gone before attach");
                self.release_slot(&target.target_id);
                return;
            }
            Err(err) => {
                warn!(target_id = %target.target_id, error = %err, "attach failed");
                self.release_slot(&target.target_id);
                return;
            }
        };

        session.enable_domains().await;
        for domain in session.degraded_domains() {
            self.overview
                .note_degraded_domain(&target.target_id, &domain);
        }

        let collectors = self.spawn_collectors(&session);
        let active = {
            let mut sessions = self.sessions.lock().expect("session map lock");
            sessions.insert(
                target.target_id.clone(),
                SessionEntry::Active {
                    session,
                    collectors,
                },
            );
            sessions.len()
        };
        self.overview.note_session_count(active);
        info!(target_id = %target.target_id, host = %target.host, active, "session started");
    }

    fn spawn_collectors(&self, session: &Arc<Session>) -> Vec<JoinHandle<()>> {
        vec![
            collectors::memory::spawn(
                Arc::clone(session),
                self.sink.clone(),
                Arc::clone(&self.sampling_permits),
                self.config.memory_interval,
            ),
            collectors::network::spawn(
                Arc::clone(session),
                self.sink.clone(),
                self.config.network_events_per_sec,
                Arc::clone(&self.overview),
            ),
            collectors::console::spawn(
                Arc::clone(session),
                self.sink.clone(),
                Arc::clone(&self.resolver),
                self.config.console_events_per_sec,
                Arc::clone(&self.overview),
            ),
            collectors::gc::spawn_console_watch(Arc::clone(session), self.sink.clone()),
            collectors::longtask::spawn(Arc::clone(session), self.sink.clone()),
            collectors::heap::spawn(
                Arc::clone(session),
                self.sink.clone(),
                self.config.heap_profile_interval,
                self.config.heap_sampling_interval,
            ),
            collectors::storage::spawn_quota(
                Arc::clone(session),
                self.sink.clone(),
                self.config.storage_quota_interval,
            ),
            collectors::storage::spawn_domstorage(
                Arc::clone(session),
                self.sink.clone(),
                self.config.domstorage_value_limit,
            ),
        ]
    }

    fn on_navigated(&self, target: &TargetInfo, old_host: &str, new_host: &str) {
        let session = {
            let sessions = self.sessions.lock().expect("session map lock");
            match sessions.get(&target.target_id) {
                Some(SessionEntry::Active { session, .. }) => Some(Arc::clone(session)),
                _ => None,
            }
        };
        let Some(session) = session else {
            return;
        };
        // The session survives navigation; subsequent records carry the new
        // host tag.
        session.set_location(new_host, &target.url, &target.title);
        if old_host != new_host {
            info!(target_id = %target.target_id, old_host, new_host, "target navigated across hosts");
        }
    }

    async fn detach_target(&self, target_id: &str) {
        let lock = self.target_lock(target_id);
        let _guard = lock.lock().await;

        let entry = self
            .sessions
            .lock()
            .expect("session map lock")
            .remove(target_id);
        let Some(SessionEntry::Active {
            session,
            collectors,
        }) = entry
        else {
            return;
        };

        session.close().await;
        for mut task in collectors {
            if timeout(COLLECTOR_STOP_GRACE, &mut task).await.is_err() {
                // Collector did not observe the close token in time.
                task.abort();
            }
        }
        debug!(target_id, "session stopped");
    }

    fn least_recently_sampled(&self) -> Option<String> {
        let sessions = self.sessions.lock().expect("session map lock");
        sessions
            .iter()
            .filter_map(|(target_id, entry)| match entry {
                SessionEntry::Active { session, .. } => {
                    Some((target_id.clone(), session.last_sampled_ms()))
                }
                SessionEntry::Pending => None,
            })
            .min_by_key(|(_, sampled)| *sampled)
            .map(|(target_id, _)| target_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("session map lock").len()
    }

    /// Tear down every session concurrently; used on disconnect and exit.
    pub async fn shutdown_all(self: &Arc<Self>) {
        self.shutdown.cancel();
        let target_ids: Vec<String> = {
            let sessions = self.sessions.lock().expect("session map lock");
            sessions.keys().cloned().collect()
        };

        let mut teardown = JoinSet::new();
        for target_id in target_ids {
            let supervisor = Arc::clone(self);
            teardown.spawn(async move {
                supervisor.detach_target(&target_id).await;
            });
        }
        while teardown.join_next().await.is_some() {}
        info!("all sessions stopped");
    }
}
