use chrono::{Local, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// The per-host append-only streams the engine writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Memory,
    Console,
    Network,
    Gc,
    Longtask,
    HeapSampling,
    Storage,
    Correlations,
}

impl Stream {
    pub const ALL: [Stream; 8] = [
        Stream::Memory,
        Stream::Console,
        Stream::Network,
        Stream::Gc,
        Stream::Longtask,
        Stream::HeapSampling,
        Stream::Storage,
        Stream::Correlations,
    ];

    /// File name under the host directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Stream::Memory => "memory.jsonl",
            Stream::Console => "console.jsonl",
            Stream::Network => "network.jsonl",
            Stream::Gc => "gc.jsonl",
            Stream::Longtask => "longtask.jsonl",
            Stream::HeapSampling => "heap_sampling.jsonl",
            Stream::Storage => "storage.jsonl",
            Stream::Correlations => "correlations.jsonl",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stream::Memory => "memory",
            Stream::Console => "console",
            Stream::Network => "network",
            Stream::Gc => "gc",
            Stream::Longtask => "longtask",
            Stream::HeapSampling => "heap_sampling",
            Stream::Storage => "storage",
            Stream::Correlations => "correlations",
        }
    }
}

/// UTC timestamp with millisecond resolution, e.g. `2026-08-02T09:15:03.417Z`.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Session directory name for this run, local time: `session_2026-08-02_091503`.
pub fn session_dir_name() -> String {
    Local::now().format("session_%Y-%m-%d_%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_file_names_match_stream_names() {
        for stream in Stream::ALL {
            assert_eq!(stream.file_name(), format!("{}.jsonl", stream.name()));
        }
    }

    #[test]
    fn timestamp_is_utc_millis() {
        let ts = now_timestamp();
        assert!(ts.ends_with('Z'));
        // 2026-08-02T09:15:03.417Z
        assert_eq!(ts.len(), 24);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "T");
        assert_eq!(&ts[19..20], ".");
    }

    #[test]
    fn session_dir_name_shape() {
        let name = session_dir_name();
        assert!(name.starts_with("session_"));
        assert_eq!(name.len(), "session_2026-08-02_091503".len());
    }
}
