//! Per-(host, stream) append-only NDJSON sinks.
//!
//! Each open stream file is owned by a single consumer task fed through a
//! bounded drop-oldest queue; producers only enqueue. Rotation and shutdown
//! always flush and sync before renaming or exiting.

mod queue;

pub use queue::RecordQueue;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Local;
use fairy_core::{MonitorConfig, Stream};
use serde_json::Value;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, warn};

const BATCH_FLUSH_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub queue_depth: usize,
    pub rotate_max_bytes: u64,
    pub rotate_max_age: Duration,
    pub batched_flush: bool,
}

impl From<&MonitorConfig> for WriterConfig {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            queue_depth: config.writer_queue_depth,
            rotate_max_bytes: config.rotate_max_bytes,
            rotate_max_age: config.rotate_max_age,
            batched_flush: config.batched_flush,
        }
    }
}

/// What one run wrote and shed, per host and stream; lands in the overview.
#[derive(Debug, Default)]
pub struct WriterReport {
    /// host → stream name → records written.
    pub records: HashMap<String, HashMap<String, u64>>,
    /// "host/stream" → records shed by queue back-pressure.
    pub queue_drops: HashMap<String, u64>,
}

impl WriterReport {
    pub fn total_written(&self) -> u64 {
        self.records
            .values()
            .flat_map(|streams| streams.values())
            .sum()
    }
}

struct WriterHandle {
    queue: Arc<RecordQueue<Value>>,
    task: JoinHandle<u64>,
}

/// Routes records to their (host, stream) writer, spawning writers lazily.
pub struct WriterHub {
    session_dir: PathBuf,
    config: WriterConfig,
    writers: Mutex<HashMap<(String, Stream), WriterHandle>>,
}

impl WriterHub {
    pub fn new(session_dir: PathBuf, config: WriterConfig) -> Self {
        Self {
            session_dir,
            config,
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Enqueue a record; never blocks the producer.
    pub fn submit(&self, host: &str, stream: Stream, record: Value) {
        let mut writers = self.writers.lock().expect("writer map lock");
        let handle = writers
            .entry((host.to_string(), stream))
            .or_insert_with(|| {
                let dir = self.session_dir.join(host);
                let queue = Arc::new(RecordQueue::new(self.config.queue_depth));
                let task = tokio::spawn(run_writer(
                    dir,
                    stream.file_name().to_string(),
                    Arc::clone(&queue),
                    self.config.clone(),
                ));
                WriterHandle { queue, task }
            });
        handle.queue.push(record);
    }

    /// Close all queues, drain within the grace period, and report counts.
    /// Queues still holding records when the grace expires are discarded
    /// with their losses counted.
    pub async fn shutdown(&self, grace: Duration) -> WriterReport {
        let handles: Vec<((String, Stream), WriterHandle)> = {
            let mut writers = self.writers.lock().expect("writer map lock");
            writers.drain().collect()
        };

        for (_, handle) in &handles {
            handle.queue.close();
        }

        let deadline = Instant::now() + grace;
        let mut report = WriterReport::default();
        for ((host, stream), handle) in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let written = match timeout(remaining, handle.task).await {
                Ok(joined) => joined.unwrap_or_default(),
                Err(_) => {
                    warn!(host, stream = stream.name(), "writer missed shutdown grace, discarding queue");
                    handle.queue.discard_remaining();
                    0
                }
            };

            if written > 0 {
                *report
                    .records
                    .entry(host.clone())
                    .or_default()
                    .entry(stream.name().to_string())
                    .or_default() += written;
            }
            let dropped = handle.queue.dropped();
            if dropped > 0 {
                report
                    .queue_drops
                    .insert(format!("{host}/{}", stream.name()), dropped);
            }
        }
        report
    }
}

async fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

async fn run_writer(
    dir: PathBuf,
    file_name: String,
    queue: Arc<RecordQueue<Value>>,
    config: WriterConfig,
) -> u64 {
    if let Err(err) = fs::create_dir_all(&dir).await {
        warn!(dir = %dir.display(), error = %err, "cannot create host directory, discarding stream");
        while queue.pop().await.is_some() {}
        return 0;
    }

    let path = dir.join(&file_name);
    let mut file = match open_append(&path).await {
        Ok(file) => file,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot open stream file, discarding stream");
            while queue.pop().await.is_some() {}
            return 0;
        }
    };

    let mut bytes = fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
    let mut opened_at = Instant::now();
    let mut written: u64 = 0;
    let mut dirty = false;
    let mut flush_tick = interval(BATCH_FLUSH_INTERVAL);

    loop {
        tokio::select! {
            item = queue.pop() => {
                let Some(record) = item else { break };

                if bytes > config.rotate_max_bytes || opened_at.elapsed() > config.rotate_max_age {
                    match rotate(&mut file, &path).await {
                        Ok(()) => {
                            bytes = 0;
                            opened_at = Instant::now();
                            dirty = false;
                        }
                        Err(err) => warn!(path = %path.display(), error = %err, "rotation failed"),
                    }
                }

                let mut line = match serde_json::to_vec(&record) {
                    Ok(line) => line,
                    Err(err) => {
                        debug!(error = %err, "unserializable record skipped");
                        continue;
                    }
                };
                line.push(b'\n');

                match file.write_all(&line).await {
                    Ok(()) => {
                        bytes += line.len() as u64;
                        written += 1;
                        if config.batched_flush {
                            dirty = true;
                        } else {
                            let _ = file.flush().await;
                            let _ = file.sync_data().await;
                        }
                    }
                    Err(err) => warn!(path = %path.display(), error = %err, "append failed"),
                }
            }
            _ = flush_tick.tick(), if config.batched_flush => {
                if dirty {
                    let _ = file.flush().await;
                    let _ = file.sync_data().await;
                    dirty = false;
                }
            }
        }
    }

    let _ = file.flush().await;
    let _ = file.sync_all().await;
    written
}

/// Sync the current file, move it aside under a timestamp suffix, and open
/// a fresh one. The rename happens only after a full sync, so queued records
/// are never lost to rotation.
async fn rotate(file: &mut File, path: &Path) -> io::Result<()> {
    file.flush().await?;
    file.sync_all().await?;

    let stamp = Local::now().format("%Y%m%d%H%M%S");
    let base = path.to_string_lossy();
    let mut rotated = PathBuf::from(format!("{base}.{stamp}"));
    let mut counter = 0;
    while fs::try_exists(&rotated).await.unwrap_or(false) {
        counter += 1;
        rotated = PathBuf::from(format!("{base}.{stamp}.{counter}"));
    }

    fs::rename(path, &rotated).await?;
    *file = open_append(path).await?;
    Ok(())
}
