//! Performance roll-ups over tracked records.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::record::{IoRecord, RecordKind};

/// Latency aggregate over a record subset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    pub samples: usize,
    pub average_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl LatencyStats {
    fn from_times(times: &[u64]) -> Self {
        if times.is_empty() {
            return Self::default();
        }
        let total: u64 = times.iter().sum();
        Self {
            samples: times.len(),
            average_ms: total as f64 / times.len() as f64,
            min_ms: *times.iter().min().unwrap(),
            max_ms: *times.iter().max().unwrap(),
        }
    }
}

/// The (module, step) pair with the highest mean processing time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BottleneckStep {
    pub module_id: String,
    pub step: String,
    pub average_ms: f64,
    pub samples: usize,
}

/// Roll-up over a session's records, or over the global ring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceAnalysis {
    pub record_count: usize,
    pub total_processing_time_ms: u64,
    pub average_step_time_ms: f64,
    pub bottleneck: Option<BottleneckStep>,
    /// Records per second across the observed span; 0 when the span is empty.
    pub throughput_rps: f64,
    /// Latency stats over request/response records only.
    pub network: LatencyStats,
}

impl PerformanceAnalysis {
    pub fn from_records(records: &[Arc<IoRecord>]) -> Self {
        if records.is_empty() {
            return Self::default();
        }

        let total: u64 = records.iter().map(|r| r.processing_time_ms).sum();
        let average = total as f64 / records.len() as f64;

        // Mean per (module, step); the argmax is the bottleneck.
        let mut grouped: HashMap<(&str, &str), (u64, usize)> = HashMap::new();
        for r in records {
            let entry = grouped
                .entry((r.module_id.as_str(), r.step.as_str()))
                .or_insert((0, 0));
            entry.0 += r.processing_time_ms;
            entry.1 += 1;
        }
        let bottleneck = grouped
            .into_iter()
            .map(|((module, step), (sum, n))| BottleneckStep {
                module_id: module.to_string(),
                step: step.to_string(),
                average_ms: sum as f64 / n as f64,
                samples: n,
            })
            .max_by(|a, b| {
                a.average_ms
                    .partial_cmp(&b.average_ms)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.module_id.cmp(&a.module_id))
            });

        let first = records.iter().map(|r| r.monotonic_ms).min().unwrap_or(0);
        let last = records.iter().map(|r| r.monotonic_ms).max().unwrap_or(0);
        let span_ms = last.saturating_sub(first);
        let throughput_rps = if span_ms > 0 {
            records.len() as f64 / (span_ms as f64 / 1000.0)
        } else {
            0.0
        };

        let network_times: Vec<u64> = records
            .iter()
            .filter(|r| matches!(r.kind, RecordKind::Request | RecordKind::Response))
            .map(|r| r.processing_time_ms)
            .collect();

        Self {
            record_count: records.len(),
            total_processing_time_ms: total,
            average_step_time_ms: average,
            bottleneck,
            throughput_rps,
            network: LatencyStats::from_times(&network_times),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn record(module: &str, step: &str, kind: RecordKind, ms: u64, mono: u64) -> Arc<IoRecord> {
        Arc::new(IoRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            monotonic_ms: mono,
            session_id: "s".into(),
            request_id: "r".into(),
            module_id: module.into(),
            step: step.into(),
            kind,
            payload_bytes: 0,
            processing_time_ms: ms,
            data: None,
        })
    }

    #[test]
    fn empty_analysis_is_zeroed() {
        let analysis = PerformanceAnalysis::from_records(&[]);
        assert_eq!(analysis.record_count, 0);
        assert_eq!(analysis.throughput_rps, 0.0);
        assert!(analysis.bottleneck.is_none());
    }

    #[test]
    fn bottleneck_is_slowest_step_on_average() {
        let records = vec![
            record("switch", "switch_request", RecordKind::Transformation, 2, 0),
            record("provider.p1", "provider_call", RecordKind::Request, 80, 10),
            record("provider.p1", "provider_call", RecordKind::Request, 120, 20),
            record("compat", "compat_response", RecordKind::Transformation, 4, 30),
        ];
        let analysis = PerformanceAnalysis::from_records(&records);
        let bottleneck = analysis.bottleneck.unwrap();
        assert_eq!(bottleneck.module_id, "provider.p1");
        assert_eq!(bottleneck.step, "provider_call");
        assert_eq!(bottleneck.samples, 2);
        assert!((bottleneck.average_ms - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn throughput_uses_monotonic_span() {
        let records = vec![
            record("a", "s", RecordKind::Transformation, 1, 0),
            record("a", "s", RecordKind::Transformation, 1, 500),
            record("a", "s", RecordKind::Transformation, 1, 1000),
        ];
        let analysis = PerformanceAnalysis::from_records(&records);
        assert!((analysis.throughput_rps - 3.0).abs() < 1e-9);
    }

    #[test]
    fn network_stats_cover_request_and_response_kinds_only() {
        let records = vec![
            record("p", "provider_call", RecordKind::Request, 50, 0),
            record("p", "provider_call", RecordKind::Response, 150, 10),
            record("w", "workflow_request", RecordKind::Transformation, 999, 20),
        ];
        let analysis = PerformanceAnalysis::from_records(&records);
        assert_eq!(analysis.network.samples, 2);
        assert_eq!(analysis.network.min_ms, 50);
        assert_eq!(analysis.network.max_ms, 150);
        assert!((analysis.network.average_ms - 100.0).abs() < f64::EPSILON);
    }
}
