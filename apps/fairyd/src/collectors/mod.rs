//! Per-session collectors. Each one registers its event subscriptions on
//! start, releases them on stop, and submits records through the shared
//! sink. A failing collector degrades only itself.

pub mod console;
pub mod gc;
pub mod heap;
pub mod listeners;
pub mod longtask;
pub mod memory;
pub mod network;
pub mod storage;

use std::sync::Arc;

use fairy_core::{event_id, Stream};
use serde_json::Value;

use crate::correlate::Correlator;
use crate::writer::WriterHub;

/// Where collector records go: stamped with their `event_id`, offered to the
/// correlator, then queued for the (host, stream) writer.
#[derive(Clone)]
pub struct RecordSink {
    hub: Arc<WriterHub>,
    correlator: Arc<Correlator>,
}

impl RecordSink {
    pub fn new(hub: Arc<WriterHub>, correlator: Arc<Correlator>) -> Self {
        Self { hub, correlator }
    }

    /// The destination directory is derived from the record's own
    /// `hostname`, so a record can never land under a different host than
    /// it carries.
    pub fn emit(&self, stream: Stream, mut record: Value) {
        let host = record
            .get("hostname")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        if record.get("event_id").is_none() {
            event_id::stamp(&mut record);
        }
        if let Some(correlation) = self.correlator.observe(&host, &record) {
            self.hub.submit(&host, Stream::Correlations, correlation);
        }
        self.hub.submit(&host, stream, record);
    }
}

/// Truncate on a character boundary.
pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

/// Truncate and mark, for human-facing values.
pub(crate) fn truncate_marked(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...[truncated]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 5), "héllo");
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn truncate_marked_appends_marker_only_when_cut() {
        assert_eq!(truncate_marked("abc", 5), "abc");
        assert_eq!(truncate_marked("abcdefgh", 5), "abcde...[truncated]");
    }
}
