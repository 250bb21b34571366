//! Recent request/response capture.
//!
//! A FIFO ring bounded both by record count and by total byte footprint.
//! The HTTP layer feeds it completed records (it wraps the response writer
//! to count bytes without breaking streaming); this module only owns the
//! ring.  Reads copy.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Capture bounds.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub max_records: usize,
    /// Cap on the summed body-excerpt footprint across all records.
    pub max_bytes: usize,
    /// Per-record cap on each captured body excerpt.
    pub max_body_excerpt: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_records: 64,
            max_bytes: 4 << 20,
            max_body_excerpt: 64 << 10,
        }
    }
}

/// One captured request/response pair.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub method: String,
    pub path: String,
    /// Model reference extracted from the body, when parseable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Allow-listed request headers only.
    pub headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Leading excerpt of the request body.
    pub request_body: String,
    /// Leading excerpt of the response body.
    pub response_body: String,
}

impl RequestRecord {
    fn footprint(&self) -> usize {
        self.request_body.len() + self.response_body.len() + self.path.len()
    }
}

/// Bounded FIFO of recent [`RequestRecord`]s.
#[derive(Debug)]
pub struct Recorder {
    config: RecorderConfig,
    ring: Mutex<Ring>,
}

#[derive(Debug, Default)]
struct Ring {
    records: VecDeque<RequestRecord>,
    total_bytes: usize,
}

impl Recorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            ring: Mutex::new(Ring::default()),
        }
    }

    /// Cap applied to each captured body excerpt.
    pub fn body_excerpt_cap(&self) -> usize {
        self.config.max_body_excerpt
    }

    /// Append a completed record, evicting oldest entries while either
    /// bound is exceeded.
    pub fn record(&self, mut record: RequestRecord) {
        record.request_body.truncate(self.config.max_body_excerpt);
        record.response_body.truncate(self.config.max_body_excerpt);

        let mut ring = self.ring.lock().expect("recorder poisoned");
        ring.total_bytes += record.footprint();
        ring.records.push_back(record);
        while ring.records.len() > self.config.max_records
            || (ring.total_bytes > self.config.max_bytes && ring.records.len() > 1)
        {
            if let Some(evicted) = ring.records.pop_front() {
                ring.total_bytes -= evicted.footprint();
            } else {
                break;
            }
        }
    }

    /// Copied snapshot, oldest first.
    pub fn dump(&self) -> Vec<RequestRecord> {
        let ring = self.ring.lock().expect("recorder poisoned");
        ring.records.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, body: &str) -> RequestRecord {
        RequestRecord {
            id: Uuid::new_v4(),
            at: Utc::now(),
            method: "POST".into(),
            path: path.into(),
            model: None,
            headers: Vec::new(),
            status: Some(200),
            bytes_in: body.len() as u64,
            bytes_out: 0,
            latency_ms: Some(1),
            request_body: body.into(),
            response_body: String::new(),
        }
    }

    #[test]
    fn keeps_records_fifo() {
        let recorder = Recorder::new(RecorderConfig::default());
        recorder.record(record("/a", "1"));
        recorder.record(record("/b", "2"));
        let dump = recorder.dump();
        assert_eq!(dump.len(), 2);
        assert_eq!(dump[0].path, "/a");
        assert_eq!(dump[1].path, "/b");
    }

    #[test]
    fn count_bound_evicts_oldest() {
        let recorder = Recorder::new(RecorderConfig {
            max_records: 2,
            ..RecorderConfig::default()
        });
        recorder.record(record("/a", ""));
        recorder.record(record("/b", ""));
        recorder.record(record("/c", ""));
        let paths: Vec<_> = recorder.dump().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/b", "/c"]);
    }

    #[test]
    fn byte_bound_evicts_oldest() {
        let recorder = Recorder::new(RecorderConfig {
            max_records: 100,
            max_bytes: 100,
            max_body_excerpt: 64 << 10,
        });
        recorder.record(record("/a", &"x".repeat(60)));
        recorder.record(record("/b", &"y".repeat(60)));
        let paths: Vec<_> = recorder.dump().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/b"], "oldest evicted once bytes exceed the cap");
    }

    #[test]
    fn body_excerpts_are_truncated() {
        let recorder = Recorder::new(RecorderConfig {
            max_records: 4,
            max_bytes: 1 << 20,
            max_body_excerpt: 8,
        });
        recorder.record(record("/a", "0123456789abcdef"));
        assert_eq!(recorder.dump()[0].request_body, "01234567");
    }
}
