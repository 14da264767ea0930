//! Wires the engine together and runs one monitoring session end to end.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fairy_core::{session_dir_name, MonitorConfig};
use fairy_protocol::CdpClient;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::collectors::{storage, RecordSink};
use crate::correlate::Correlator;
use crate::launcher::BrowserLauncher;
use crate::overview::Overview;
use crate::registry::{self, TargetRegistry};
use crate::session::Session;
use crate::sourcemap::SourceMapResolver;
use crate::supervisor::Supervisor;
use crate::writer::{WriterConfig, WriterHub};

const TARGET_EVENT_QUEUE: usize = 256;

pub struct EngineOptions {
    pub endpoint: String,
    pub duration: Option<Duration>,
    pub launcher: Option<Arc<dyn BrowserLauncher>>,
    pub resolver: Arc<dyn SourceMapResolver>,
}

/// Run one monitoring session: connect, discover targets, collect until a
/// stop condition, then drain and write the overview.
pub async fn run(config: MonitorConfig, options: EngineOptions) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("cannot create data directory {}", config.data_dir.display()))?;
    let session_dir = config.data_dir.join(session_dir_name());
    tokio::fs::create_dir_all(&session_dir)
        .await
        .with_context(|| format!("cannot create session directory {}", session_dir.display()))?;
    info!(dir = %session_dir.display(), "session directory created");

    let endpoint = options
        .launcher
        .as_ref()
        .map(|launcher| launcher.debug_endpoint())
        .unwrap_or_else(|| options.endpoint.clone());
    let client = CdpClient::connect_with_timeout(&endpoint, config.call_timeout)
        .await
        .with_context(|| format!("cannot connect to browser at {endpoint}"))?;
    info!(endpoint, "connected to browser");

    let hub = Arc::new(WriterHub::new(
        session_dir.clone(),
        WriterConfig::from(&config),
    ));
    let overview = Arc::new(Overview::new());
    let correlator = Arc::new(Correlator::new());
    let sink = RecordSink::new(Arc::clone(&hub), correlator);

    let (target_events_tx, target_events_rx) = mpsc::channel(TARGET_EVENT_QUEUE);
    let registry = TargetRegistry::new(client.clone(), target_events_tx);
    registry
        .start()
        .await
        .context("target discovery failed")?;

    let supervisor = Arc::new(Supervisor::new(
        client.clone(),
        config.clone(),
        sink,
        Arc::clone(&overview),
        Arc::clone(&options.resolver),
    ));
    let supervisor_task = tokio::spawn(Arc::clone(&supervisor).run(target_events_rx));

    let disconnected = client.disconnected();
    tokio::select! {
        _ = disconnected.cancelled() => warn!("browser channel lost, shutting down"),
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = sleep_opt(options.duration) => info!("configured duration elapsed, shutting down"),
        _ = wait_exit_opt(options.launcher.as_deref()) => info!("browser exited, shutting down"),
    }

    registry.stop();
    if timeout(config.shutdown_grace, supervisor.shutdown_all())
        .await
        .is_err()
    {
        warn!("session teardown exceeded the grace period");
    }
    supervisor_task.abort();

    let report = hub.shutdown(config.shutdown_grace).await;
    overview
        .write(
            &session_dir.join("overview.json"),
            &report,
            client.subscriber_drops(),
        )
        .await
        .context("failed to write session overview")?;

    info!(records = report.total_written(), "monitoring session complete");
    Ok(())
}

/// One-shot DOM-storage snapshot: enumerate both storage areas of every
/// current page target (optionally restricted to one host) and exit. This
/// is the on-demand operation the front-end drives over the same session
/// machinery as the continuous engine.
pub async fn snapshot_storage(
    config: MonitorConfig,
    endpoint: &str,
    host_filter: Option<&str>,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("cannot create data directory {}", config.data_dir.display()))?;
    let session_dir = config.data_dir.join(session_dir_name());
    tokio::fs::create_dir_all(&session_dir)
        .await
        .with_context(|| format!("cannot create session directory {}", session_dir.display()))?;

    let client = CdpClient::connect_with_timeout(endpoint, config.call_timeout)
        .await
        .with_context(|| format!("cannot connect to browser at {endpoint}"))?;

    let hub = Arc::new(WriterHub::new(
        session_dir.clone(),
        WriterConfig::from(&config),
    ));
    let sink = RecordSink::new(Arc::clone(&hub), Arc::new(Correlator::new()));

    let response = client
        .call("Target.getTargets", None, None)
        .await
        .context("target listing failed")?;
    let mut snapshots = 0usize;
    if let Some(infos) = response.get("targetInfos").and_then(Value::as_array) {
        for info in infos {
            let Some(target) = registry::page_target(Some(info)) else {
                continue;
            };
            if host_filter.is_some_and(|filter| filter != target.host) {
                continue;
            }
            let session = match Session::attach(
                &client,
                &target.target_id,
                &target.host,
                &target.url,
                &target.title,
            )
            .await
            {
                Ok(session) => session,
                Err(err) => {
                    warn!(target_id = %target.target_id, error = %err, "snapshot attach failed");
                    continue;
                }
            };
            if let Err(err) = session.call("DOMStorage.enable", None).await {
                warn!(target_id = %target.target_id, error = %err, "DOMStorage unavailable");
            }
            match storage::snapshot_dom_storage(&session, &sink, config.domstorage_value_limit)
                .await
            {
                Ok(()) => snapshots += 1,
                Err(err) => {
                    warn!(target_id = %target.target_id, error = %err, "storage snapshot failed")
                }
            }
            session.close().await;
        }
    }

    hub.shutdown(config.shutdown_grace).await;
    info!(snapshots, dir = %session_dir.display(), "storage snapshot complete");
    Ok(())
}

async fn sleep_opt(duration: Option<Duration>) {
    match duration {
        Some(duration) => sleep(duration).await,
        None => pending().await,
    }
}

async fn wait_exit_opt(launcher: Option<&dyn BrowserLauncher>) {
    match launcher {
        Some(launcher) => launcher.wait_exit().await,
        None => pending().await,
    }
}
