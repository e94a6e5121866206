//! The I/O tracker: session lifecycle, record append, queries, sweeper.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use relay_types::Result;

use crate::analysis::PerformanceAnalysis;
use crate::record::{IoRecord, RecordDraft, RecordFilter, RecordKind};
use crate::{TrackerConfig, PIPELINE_MODULE_ID};

struct SessionState {
    request_id: String,
    records: Vec<Arc<IoRecord>>,
    debug: HashMap<String, serde_json::Value>,
    ended_at: Option<Instant>,
    last_monotonic_ms: u64,
}

/// Session-scoped I/O tracker with a bounded global ring.
///
/// Every operation is best-effort: append failures bump the dropped counter
/// and nothing propagates to callers. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct IoTracker {
    config: TrackerConfig,
    epoch: Instant,
    sessions: Arc<DashMap<String, SessionState>>,
    ring: Arc<Mutex<VecDeque<Arc<IoRecord>>>>,
    dropped: Arc<AtomicU64>,
    tracked: Arc<AtomicU64>,
    started: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl IoTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            sessions: Arc::new(DashMap::new()),
            ring: Arc::new(Mutex::new(VecDeque::new())),
            dropped: Arc::new(AtomicU64::new(0)),
            tracked: Arc::new(AtomicU64::new(0)),
            started: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start the retention sweeper. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tracker.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tracker.shutdown.cancelled() => break,
                    _ = interval.tick() => tracker.sweep_once(),
                }
            }
            debug!("tracker sweeper stopped");
        });
    }

    /// Stop the sweeper; records already stored remain queryable.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Create a session, or return the existing request id when the session
    /// is already known.
    pub fn start_session(&self, session_id: &str, request_id: Option<String>) -> String {
        use dashmap::mapref::entry::Entry;

        match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(entry) => entry.get().request_id.clone(),
            Entry::Vacant(entry) => {
                let request_id = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
                entry.insert(SessionState {
                    request_id: request_id.clone(),
                    records: Vec::new(),
                    debug: HashMap::new(),
                    ended_at: None,
                    last_monotonic_ms: 0,
                });
                self.record(RecordDraft::new(
                    session_id,
                    &request_id,
                    PIPELINE_MODULE_ID,
                    "session_start",
                    RecordKind::Transformation,
                ));
                request_id
            }
        }
    }

    /// Append a record to its session and the global ring.
    ///
    /// Returns `None` when tracking is disabled, the call is sampled out, or
    /// the session cannot accept appends. Sampling is decided independently
    /// per call with probability `sample_rate`.
    pub fn record(&self, draft: RecordDraft) -> Option<Uuid> {
        if !self.config.enabled {
            return None;
        }
        if self.config.enable_sampling && rand::random::<f64>() >= self.config.sample_rate {
            return None;
        }

        let data = if self.config.enable_detailed_logging {
            draft.data.filter(|d| {
                serde_json::to_vec(d)
                    .map(|bytes| bytes.len() <= self.config.max_payload_bytes)
                    .unwrap_or(false)
            })
        } else {
            None
        };

        let record = {
            let mut session = match self.sessions.get_mut(&draft.session_id) {
                Some(session) => session,
                None => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            };
            if session.ended_at.is_some() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            // Monotonic per session: never step backwards, whatever the
            // scheduler interleaving.
            let now_ms = self.epoch.elapsed().as_millis() as u64;
            let monotonic_ms = now_ms.max(session.last_monotonic_ms);
            session.last_monotonic_ms = monotonic_ms;

            let record = Arc::new(IoRecord {
                id: Uuid::new_v4(),
                timestamp: Utc::now(),
                monotonic_ms,
                session_id: draft.session_id,
                request_id: draft.request_id,
                module_id: draft.module_id,
                step: draft.step,
                kind: draft.kind,
                payload_bytes: draft.payload_bytes,
                processing_time_ms: draft.processing_time.as_millis() as u64,
                data,
            });
            session.records.push(Arc::clone(&record));
            record
        };

        {
            let mut ring = self.ring.lock();
            if ring.len() >= self.config.max_records {
                ring.pop_front();
            }
            ring.push_back(Arc::clone(&record));
        }

        self.tracked.fetch_add(1, Ordering::Relaxed);
        self.write_sink(&record);
        Some(record.id)
    }

    /// Record an outbound request observation at pipeline scope.
    pub fn track_request(
        &self,
        session_id: &str,
        request_id: &str,
        module_id: &str,
        payload: &serde_json::Value,
    ) -> Option<Uuid> {
        let bytes = serde_json::to_vec(payload).map(|b| b.len()).unwrap_or(0);
        self.record(
            RecordDraft::new(session_id, request_id, module_id, "request", RecordKind::Request)
                .with_payload_bytes(bytes)
                .with_data(payload.clone()),
        )
    }

    /// Record an inbound response observation at pipeline scope.
    pub fn track_response(
        &self,
        session_id: &str,
        request_id: &str,
        module_id: &str,
        payload: &serde_json::Value,
        elapsed: std::time::Duration,
    ) -> Option<Uuid> {
        let bytes = serde_json::to_vec(payload).map(|b| b.len()).unwrap_or(0);
        self.record(
            RecordDraft::new(session_id, request_id, module_id, "response", RecordKind::Response)
                .with_payload_bytes(bytes)
                .with_processing_time(elapsed)
                .with_data(payload.clone()),
        )
    }

    /// Time `op`, emit a transformation record on success or an error record
    /// on failure, and surface the original outcome either way.
    pub async fn track_step<T, F, Fut>(
        &self,
        session_id: &str,
        request_id: &str,
        module_id: &str,
        step: &str,
        op: F,
    ) -> Result<T>
    where
        T: serde::Serialize,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let start = Instant::now();
        match op().await {
            Ok(value) => {
                let bytes = serde_json::to_vec(&value).map(|b| b.len()).unwrap_or(0);
                self.record(
                    RecordDraft::new(
                        session_id,
                        request_id,
                        module_id,
                        step,
                        RecordKind::Transformation,
                    )
                    .with_payload_bytes(bytes)
                    .with_processing_time(start.elapsed()),
                );
                Ok(value)
            }
            Err(err) => {
                self.record(
                    RecordDraft::new(session_id, request_id, module_id, step, RecordKind::Error)
                        .with_processing_time(start.elapsed())
                        .with_data(serde_json::json!({
                            "error": err.to_string(),
                            "kind": err.kind(),
                        })),
                );
                Err(err)
            }
        }
    }

    /// Records matching the filter, newest first.
    ///
    /// Session-scoped filters read the session's own list (which outlives
    /// ring eviction); everything else reads the global ring.
    pub fn records(&self, filter: &RecordFilter) -> Vec<Arc<IoRecord>> {
        let mut matched: Vec<Arc<IoRecord>> = match filter.session_id {
            Some(ref session_id) => self
                .sessions
                .get(session_id)
                .map(|session| {
                    session
                        .records
                        .iter()
                        .filter(|r| filter.matches(r))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            None => self
                .ring
                .lock()
                .iter()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect(),
        };
        matched.sort_by(|a, b| b.monotonic_ms.cmp(&a.monotonic_ms));
        matched
    }

    /// Roll-up over one session, or over the whole ring when `session_id`
    /// is `None`.
    pub fn performance_analysis(&self, session_id: Option<&str>) -> PerformanceAnalysis {
        if !self.config.enable_performance_monitoring {
            return PerformanceAnalysis::default();
        }
        let records: Vec<Arc<IoRecord>> = match session_id {
            Some(id) => self
                .sessions
                .get(id)
                .map(|s| s.records.clone())
                .unwrap_or_default(),
            None => self.ring.lock().iter().cloned().collect(),
        };
        PerformanceAnalysis::from_records(&records)
    }

    /// Close a session. Its records keep serving lookups until the grace
    /// period expires; new appends are rejected immediately.
    pub fn end_session(&self, session_id: &str) {
        let request_id = match self.sessions.get(session_id) {
            Some(session) => session.request_id.clone(),
            None => return,
        };
        self.record(RecordDraft::new(
            session_id,
            &request_id,
            PIPELINE_MODULE_ID,
            "session_end",
            RecordKind::Transformation,
        ));
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.ended_at = Some(Instant::now());
        }
    }

    /// Attach a debug key/value to a live session.
    pub fn set_session_debug(&self, session_id: &str, key: &str, value: serde_json::Value) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.debug.insert(key.to_string(), value);
        }
    }

    pub fn session_debug(&self, session_id: &str) -> Option<HashMap<String, serde_json::Value>> {
        self.sessions.get(session_id).map(|s| s.debug.clone())
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn tracked_records(&self) -> u64 {
        self.tracked.load(Ordering::Relaxed)
    }

    pub fn ring_len(&self) -> usize {
        self.ring.lock().len()
    }

    /// Drop ring records past the retention horizon and sessions past grace.
    pub fn sweep_once(&self) {
        let horizon = Utc::now()
            - chrono::Duration::from_std(self.config.retention).unwrap_or(chrono::Duration::zero());
        {
            let mut ring = self.ring.lock();
            while ring.front().is_some_and(|r| r.timestamp < horizon) {
                ring.pop_front();
            }
        }
        let grace = self.config.session_grace;
        self.sessions.retain(|_, session| match session.ended_at {
            Some(ended) => ended.elapsed() < grace,
            None => true,
        });
    }

    /// Forget all counters and records. Sessions survive.
    pub fn reset_statistics(&self) {
        self.ring.lock().clear();
        self.dropped.store(0, Ordering::Relaxed);
        self.tracked.store(0, Ordering::Relaxed);
    }

    fn write_sink(&self, record: &IoRecord) {
        let Some(ref dir) = self.config.log_dir else {
            return;
        };
        let path = dir.join(format!("{}.log", record.session_id));
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                let line = serde_json::to_string(record).unwrap_or_default();
                writeln!(file, "{}", line)
            });
        if let Err(err) = result {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(path = %path.display(), error = %err, "record sink write failed");
        }
    }
}
