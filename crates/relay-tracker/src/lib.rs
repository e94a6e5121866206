//! Relay Tracker - session-scoped I/O records and performance analysis
//!
//! The tracker is observational: every operation is best-effort and no
//! failure here ever propagates into the pipeline. Records are appended to
//! exactly one session and, by reference, to a bounded global ring used for
//! cross-session analysis. A single sweeper prunes the ring past the
//! retention horizon and drops ended sessions once their grace expires.

use std::path::PathBuf;
use std::time::Duration;

pub mod analysis;
pub mod record;
mod tracker;

pub use analysis::{BottleneckStep, LatencyStats, PerformanceAnalysis};
pub use record::{IoRecord, RecordDraft, RecordFilter, RecordKind};
pub use tracker::IoTracker;

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Master switch; when off, `record` silently drops everything.
    pub enabled: bool,
    /// When set, each `record` call is admitted independently with
    /// probability `sample_rate`.
    pub enable_sampling: bool,
    /// Admission probability in [0, 1]; only read when sampling is enabled.
    pub sample_rate: f64,
    /// Capacity of the global ring.
    pub max_records: usize,
    /// Ring records older than this are pruned by the sweeper.
    pub retention: Duration,
    /// How long an ended session keeps serving lookups.
    pub session_grace: Duration,
    /// Sweeper wake-up interval.
    pub sweep_interval: Duration,
    /// Record payloads serialized above this size are redacted.
    pub max_payload_bytes: usize,
    /// When off, record payloads are dropped entirely; sizes and timings
    /// are still kept.
    pub enable_detailed_logging: bool,
    /// When off, `performance_analysis` returns an empty roll-up.
    pub enable_performance_monitoring: bool,
    /// Optional NDJSON sink; one `<session>.log` file per session.
    pub log_dir: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_sampling: false,
            sample_rate: 1.0,
            max_records: 10_000,
            retention: Duration::from_secs(3600),
            session_grace: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            max_payload_bytes: 8192,
            enable_detailed_logging: true,
            enable_performance_monitoring: true,
            log_dir: None,
        }
    }
}

impl TrackerConfig {
    /// Disabled tracker; `record` becomes a no-op.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Module id used for records emitted at pipeline scope rather than by a
/// specific module.
pub const PIPELINE_MODULE_ID: &str = "pipeline";
