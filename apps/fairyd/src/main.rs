use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fairy_core::MonitorConfig;
use tracing::error;
use tracing_subscriber::EnvFilter;

use fairyd::engine::{self, EngineOptions};
use fairyd::sourcemap::NoopSourceMapResolver;

/// Passive performance observer for a Chromium-family browser.
#[derive(Debug, Parser)]
#[command(name = "fairyd", version, about)]
struct Args {
    /// Browser debug endpoint (host:port or URL).
    #[arg(long, default_value = "127.0.0.1:9222")]
    endpoint: String,

    /// Data root; defaults to BROWSERFAIRY_DATA_DIR or ~/BrowserFairyData.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Stop after this many seconds instead of running until disconnect.
    #[arg(long)]
    duration: Option<u64>,

    /// Coalesce writer flushes on a timer instead of per record.
    #[arg(long)]
    batched_flush: bool,

    /// Cap on concurrently monitored tabs.
    #[arg(long)]
    max_tabs: Option<usize>,

    /// Take one DOM-storage snapshot per page target and exit.
    #[arg(long)]
    snapshot_storage: bool,

    /// Restrict the storage snapshot to targets on this host.
    #[arg(long, requires = "snapshot_storage")]
    snapshot_hostname: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = MonitorConfig::default().with_data_dir(args.data_dir);
    config.batched_flush = args.batched_flush;
    if let Some(max_tabs) = args.max_tabs {
        config.max_sessions = max_tabs.max(1);
    }

    let outcome = if args.snapshot_storage {
        engine::snapshot_storage(config, &args.endpoint, args.snapshot_hostname.as_deref()).await
    } else {
        let options = EngineOptions {
            endpoint: args.endpoint,
            duration: args.duration.map(Duration::from_secs),
            launcher: None,
            resolver: Arc::new(NoopSourceMapResolver),
        };
        engine::run(config, options).await
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "monitoring failed");
            ExitCode::FAILURE
        }
    }
}
