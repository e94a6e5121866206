//! Immutable I/O records and their query filter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// What a record observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Request,
    Response,
    Transformation,
    Error,
}

/// One observation at one step of one session. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoRecord {
    pub id: Uuid,
    /// Wall-clock stamp, for humans and cross-process correlation.
    pub timestamp: DateTime<Utc>,
    /// Monotonic stamp relative to the tracker epoch; non-decreasing within
    /// a session.
    pub monotonic_ms: u64,
    pub session_id: String,
    pub request_id: String,
    pub module_id: String,
    pub step: String,
    pub kind: RecordKind,
    pub payload_bytes: usize,
    pub processing_time_ms: u64,
    /// Opaque payload; `None` when absent or redacted by the size cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A record before the tracker assigns identity and stamps.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub session_id: String,
    pub request_id: String,
    pub module_id: String,
    pub step: String,
    pub kind: RecordKind,
    pub payload_bytes: usize,
    pub processing_time: Duration,
    pub data: Option<serde_json::Value>,
}

impl RecordDraft {
    pub fn new(
        session_id: impl Into<String>,
        request_id: impl Into<String>,
        module_id: impl Into<String>,
        step: impl Into<String>,
        kind: RecordKind,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            request_id: request_id.into(),
            module_id: module_id.into(),
            step: step.into(),
            kind,
            payload_bytes: 0,
            processing_time: Duration::ZERO,
            data: None,
        }
    }

    pub fn with_payload_bytes(mut self, bytes: usize) -> Self {
        self.payload_bytes = bytes;
        self
    }

    pub fn with_processing_time(mut self, elapsed: Duration) -> Self {
        self.processing_time = elapsed;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Conjunctive record filter; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub session_id: Option<String>,
    pub request_id: Option<String>,
    pub module_id: Option<String>,
    pub kind: Option<RecordKind>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub min_bytes: Option<usize>,
    pub max_bytes: Option<usize>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn module(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    pub fn kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn size_range(mut self, min: usize, max: usize) -> Self {
        self.min_bytes = Some(min);
        self.max_bytes = Some(max);
        self
    }

    pub fn matches(&self, record: &IoRecord) -> bool {
        if let Some(ref s) = self.session_id {
            if &record.session_id != s {
                return false;
            }
        }
        if let Some(ref r) = self.request_id {
            if &record.request_id != r {
                return false;
            }
        }
        if let Some(ref m) = self.module_id {
            if &record.module_id != m {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if record.kind != kind {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.timestamp > until {
                return false;
            }
        }
        if let Some(min) = self.min_bytes {
            if record.payload_bytes < min {
                return false;
            }
        }
        if let Some(max) = self.max_bytes {
            if record.payload_bytes > max {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: RecordKind, bytes: usize) -> IoRecord {
        IoRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            monotonic_ms: 0,
            session_id: "s1".into(),
            request_id: "r1".into(),
            module_id: "provider.p1".into(),
            step: "provider_call".into(),
            kind,
            payload_bytes: bytes,
            processing_time_ms: 5,
            data: None,
        }
    }

    #[test]
    fn filter_conjunction() {
        let rec = sample(RecordKind::Request, 100);
        assert!(RecordFilter::new().session("s1").matches(&rec));
        assert!(!RecordFilter::new().session("s2").matches(&rec));
        assert!(RecordFilter::new()
            .session("s1")
            .kind(RecordKind::Request)
            .size_range(50, 150)
            .matches(&rec));
        assert!(!RecordFilter::new()
            .session("s1")
            .kind(RecordKind::Error)
            .matches(&rec));
        assert!(!RecordFilter::new().size_range(200, 400).matches(&rec));
    }
}
