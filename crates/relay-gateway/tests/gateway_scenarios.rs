//! End-to-end scenarios for the gateway: happy path, failover, circuit
//! tripping, backpressure, cache idempotence, and cancellation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use relay_gateway::{ExecuteOptions, ExecutionConfig, Gateway, GatewayConfig};
use relay_health::{CircuitState, HealthConfig};
use relay_routing::{RouterConfig, Strategy};
use relay_tracker::{RecordFilter, RecordKind, PIPELINE_MODULE_ID};
use relay_types::{MockProvider, StepName, Target, VirtualModel};

use relay_pipeline::StepMarker;

fn payload(content: &str) -> serde_json::Value {
    serde_json::json!({
        "model": "m",
        "messages": [{"role": "user", "content": content}],
    })
}

fn fast_retry_config() -> GatewayConfig {
    GatewayConfig {
        execution: ExecutionConfig {
            retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(200),
            ..ExecutionConfig::default()
        },
        ..GatewayConfig::default()
    }
}

#[tokio::test]
async fn s1_happy_path() {
    let provider = Arc::new(MockProvider::new("p1").with_delay(5));
    let gateway = Gateway::builder()
        .with_provider(provider.clone())
        .with_virtual_model(VirtualModel::new("vm-a").with_target(Target::new("p1")))
        .build()
        .unwrap();

    let report = gateway
        .execute(
            payload("hi"),
            "vm-a",
            Some(ExecuteOptions::new().session("s1")),
        )
        .await;

    assert!(report.success, "error: {:?}", report.error);
    assert!(report.execution_time_ms > 0);
    assert_eq!(report.attempts, 1);

    let response = report.response.unwrap();
    let content = response["choices"][0]["message"]["content"].as_str().unwrap();
    assert!(content.contains("echo: hi"));

    assert_eq!(report.steps.len(), 7);
    for (record, expected) in report.steps.iter().zip(StepName::ALL) {
        assert_eq!(record.step, expected);
    }
    let offsets: Vec<u64> = report.steps.iter().map(|s| s.start_offset_ms).collect();
    assert!(offsets.windows(2).all(|w| w[0] <= w[1]));

    let requests = gateway.io_records(
        &RecordFilter::new()
            .session("s1")
            .module(PIPELINE_MODULE_ID)
            .kind(RecordKind::Request),
    );
    let responses = gateway.io_records(
        &RecordFilter::new()
            .session("s1")
            .module(PIPELINE_MODULE_ID)
            .kind(RecordKind::Response),
    );
    assert_eq!(requests.len(), 1);
    assert_eq!(responses.len(), 1);
}

#[tokio::test]
async fn s2_provider_failure_then_retry_on_fallback() {
    // p1 wins the first (tied) health-aware pick, fails once with a 503,
    // and the re-routed second attempt lands on p2
    let p1 = Arc::new(MockProvider::new("p1").fail_first(1).with_delay(5));
    let p2 = Arc::new(MockProvider::new("p2"));

    let config = GatewayConfig {
        router: RouterConfig {
            enable_load_balancing: true,
            strategy_override: Some(Strategy::HealthAware),
        },
        ..fast_retry_config()
    };
    let gateway = Gateway::builder()
        .with_config(config)
        .with_provider(p1.clone())
        .with_provider(p2.clone())
        .with_virtual_model(
            VirtualModel::new("vm-a")
                .with_target(Target::new("p1"))
                .with_target(Target::new("p2")),
        )
        .build()
        .unwrap();

    let report = gateway.execute(payload("failover"), "vm-a", None).await;

    assert!(report.success, "error: {:?}", report.error);
    assert_eq!(report.attempts, 2);
    assert_eq!(p1.request_count(), 1);
    assert_eq!(p2.request_count(), 1);
    assert_eq!(
        report.context.as_ref().unwrap().provider_id.as_deref(),
        Some("p2")
    );

    // both attempts left step trails; the failed provider step is recorded
    assert!(report.steps.len() > 7);
    assert!(report
        .steps
        .iter()
        .any(|s| s.step == StepName::ProviderCall && s.error.is_some() && s.module_id == "p1"));
}

#[tokio::test]
async fn s3_circuit_trips_and_recovers() {
    let provider = Arc::new(MockProvider::new("p1").fail_first(5));
    let config = GatewayConfig {
        health: HealthConfig {
            circuit_breaker_threshold: 5,
            recovery_timeout: Duration::from_millis(200),
            ..HealthConfig::default()
        },
        execution: ExecutionConfig {
            enable_retry: false,
            ..ExecutionConfig::default()
        },
        ..GatewayConfig::default()
    };
    let gateway = Gateway::builder()
        .with_config(config)
        .with_provider(provider.clone())
        .with_virtual_model(VirtualModel::new("vm-single").with_target(Target::new("p1")))
        .build()
        .unwrap();

    for i in 0..5 {
        let report = gateway.execute(payload("trip"), "vm-single", None).await;
        assert!(!report.success, "call {i} unexpectedly succeeded");
    }
    assert_eq!(provider.request_count(), 5);
    assert_eq!(gateway.health().circuit_state("p1"), CircuitState::Open);

    // sixth call is rejected without touching the upstream
    let report = gateway.execute(payload("trip"), "vm-single", None).await;
    assert!(!report.success);
    assert_eq!(report.error.unwrap().kind, "no_healthy_provider");
    assert_eq!(provider.request_count(), 5);

    // after the recovery timeout a single trial is admitted and closes the
    // circuit on success
    tokio::time::sleep(Duration::from_millis(250)).await;
    let report = gateway.execute(payload("trip"), "vm-single", None).await;
    assert!(report.success, "error: {:?}", report.error);
    assert_eq!(provider.request_count(), 6);
    assert_eq!(gateway.health().circuit_state("p1"), CircuitState::Closed);
}

#[tokio::test]
async fn s4_backpressure_rejects_over_capacity() {
    let provider = Arc::new(MockProvider::new("p1").with_delay(200));
    let config = GatewayConfig {
        execution: ExecutionConfig {
            max_concurrency: 2,
            admission_wait: Duration::from_millis(50),
            enable_caching: false,
            ..ExecutionConfig::default()
        },
        ..GatewayConfig::default()
    };
    let gateway = Arc::new(
        Gateway::builder()
            .with_config(config)
            .with_provider(provider)
            .with_virtual_model(VirtualModel::new("vm-a").with_target(Target::new("p1")))
            .build()
            .unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..5 {
        let gateway = gateway.clone();
        handles.push(tokio::spawn(async move {
            let started = Instant::now();
            let report = gateway
                .execute(payload(&format!("req-{i}")), "vm-a", None)
                .await;
            (report, started.elapsed())
        }));
    }

    let mut successes = 0;
    let mut rejections = 0;
    for handle in handles {
        let (report, elapsed) = handle.await.unwrap();
        if report.success {
            successes += 1;
        } else {
            let error = report.error.unwrap();
            assert_eq!(error.kind, "backpressure_rejected");
            rejections += 1;
            assert!(
                elapsed < Duration::from_millis(150),
                "rejection took {elapsed:?}"
            );
        }
    }
    assert_eq!(successes, 2);
    assert_eq!(rejections, 3);
    assert_eq!(gateway.status().optimization.backpressure_rejections, 3);
}

#[tokio::test]
async fn s5_cache_hit_skips_the_provider() {
    let provider = Arc::new(MockProvider::new("p1").with_delay(100));
    let config = GatewayConfig {
        execution: ExecutionConfig {
            cache_ttl: Duration::from_secs(60),
            ..ExecutionConfig::default()
        },
        ..GatewayConfig::default()
    };
    let gateway = Gateway::builder()
        .with_config(config)
        .with_provider(provider.clone())
        .with_virtual_model(VirtualModel::new("vm-a").with_target(Target::new("p1")))
        .build()
        .unwrap();

    let first = gateway.execute(payload("cached"), "vm-a", None).await;
    assert!(first.success);
    assert!(!first.from_cache);

    let started = Instant::now();
    let second = gateway.execute(payload("cached"), "vm-a", None).await;
    let elapsed = started.elapsed();

    assert!(second.success);
    assert!(second.from_cache);
    assert!(elapsed < Duration::from_millis(50), "cache hit took {elapsed:?}");
    assert_eq!(provider.request_count(), 1);
    assert_eq!(gateway.status().optimization.cache.hits, 1);

    // cache idempotence: deep-equal responses
    assert_eq!(first.response.unwrap(), second.response.unwrap());
}

#[tokio::test]
async fn s6_cancellation_mid_stream_releases_resources() {
    let provider = Arc::new(MockProvider::new("p1").with_chunk_delay(50));
    let gateway = Gateway::builder()
        .with_provider(provider)
        .with_virtual_model(VirtualModel::new("vm-a").with_target(Target::new("p1")))
        .build()
        .unwrap();

    let token = CancellationToken::new();
    let mut stream = gateway
        .execute_streaming(
            serde_json::json!({
                "model": "m",
                "stream": true,
                "messages": [{"role": "user", "content": "alpha beta gamma"}],
            }),
            "vm-a",
            Some(
                ExecuteOptions::new()
                    .session("s-stream")
                    .cancellation(token.clone()),
            ),
        )
        .await
        .unwrap();

    let mut saw_chunk = false;
    while let Some(marker) = stream.next().await {
        if matches!(marker, StepMarker::Chunk { .. }) {
            saw_chunk = true;
            token.cancel();
            break;
        }
    }
    assert!(saw_chunk);

    let rest: Vec<StepMarker> = stream.collect().await;
    assert!(
        rest.iter().all(|m| !matches!(
            m,
            StepMarker::StepStarted { step: StepName::CompatResponse, .. }
                | StepMarker::Completed { .. }
        )),
        "chain continued past the cancelled provider step"
    );

    tokio::time::sleep(Duration::from_millis(100)).await;

    // admission slot and in-flight gauge released
    let status = gateway.status();
    assert_eq!(status.optimization.available_permits, status.optimization.max_permits);
    assert_eq!(gateway.health().snapshot("p1").unwrap().in_flight, 0);

    // final error record carries the cancellation
    let errors = gateway.io_records(
        &RecordFilter::new()
            .session("s-stream")
            .kind(RecordKind::Error),
    );
    assert!(errors.iter().any(|r| r
        .data
        .as_ref()
        .is_some_and(|d| d["kind"] == "cancelled")));
}

#[tokio::test]
async fn retry_envelope_respects_attempts_and_backoff() {
    let provider = Arc::new(MockProvider::new("p1").always_fail());
    let config = GatewayConfig {
        execution: ExecutionConfig {
            max_retries: 2,
            retry_delay: Duration::from_millis(50),
            retry_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(1),
            ..ExecutionConfig::default()
        },
        ..GatewayConfig::default()
    };
    let gateway = Gateway::builder()
        .with_config(config)
        .with_provider(provider.clone())
        .with_virtual_model(VirtualModel::new("vm-a").with_target(Target::new("p1")))
        .build()
        .unwrap();

    let started = Instant::now();
    let report = gateway.execute(payload("doomed"), "vm-a", None).await;
    let elapsed = started.elapsed();

    assert!(!report.success);
    // total attempts bounded by max_retries + 1
    assert_eq!(report.attempts, 3);
    assert_eq!(provider.request_count(), 3);
    assert!(report.error.unwrap().retryable);

    // two sleeps: 50ms and 100ms nominal, each jittered within +-20%
    assert!(elapsed >= Duration::from_millis(120), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(600), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn terminal_errors_do_not_retry() {
    let provider = Arc::new(MockProvider::new("p1").always_fail().fail_with_status(401));
    let gateway = Gateway::builder()
        .with_config(fast_retry_config())
        .with_provider(provider.clone())
        .with_virtual_model(VirtualModel::new("vm-a").with_target(Target::new("p1")))
        .build()
        .unwrap();

    let report = gateway.execute(payload("denied"), "vm-a", None).await;
    assert!(!report.success);
    assert_eq!(report.attempts, 1);
    assert_eq!(provider.request_count(), 1);
    let error = report.error.unwrap();
    assert!(!error.retryable);
    assert_eq!(error.step.as_deref(), Some("provider_call"));
}

#[tokio::test]
async fn record_session_purity_holds_across_sessions() {
    let provider = Arc::new(MockProvider::new("p1"));
    let gateway = Gateway::builder()
        .with_provider(provider)
        .with_virtual_model(VirtualModel::new("vm-a").with_target(Target::new("p1")))
        .build()
        .unwrap();

    gateway
        .execute(
            payload("one"),
            "vm-a",
            Some(ExecuteOptions::new().session("sess-one")),
        )
        .await;
    gateway
        .execute(
            payload("two"),
            "vm-a",
            Some(ExecuteOptions::new().session("sess-two")),
        )
        .await;

    let one = gateway.io_records(&RecordFilter::new().session("sess-one"));
    let two = gateway.io_records(&RecordFilter::new().session("sess-two"));
    assert!(!one.is_empty());
    assert!(!two.is_empty());
    assert!(one.iter().all(|r| r.session_id == "sess-one"));
    assert!(two.iter().all(|r| r.session_id == "sess-two"));

    let ids_one: std::collections::HashSet<_> = one.iter().map(|r| r.id).collect();
    assert!(two.iter().all(|r| !ids_one.contains(&r.id)));
}

#[tokio::test]
async fn performance_report_finds_the_slow_step() {
    let provider = Arc::new(MockProvider::new("p1").with_delay(80));
    let gateway = Gateway::builder()
        .with_provider(provider)
        .with_virtual_model(VirtualModel::new("vm-a").with_target(Target::new("p1")))
        .build()
        .unwrap();

    for i in 0..3 {
        gateway
            .execute(
                payload(&format!("n-{i}")),
                "vm-a",
                Some(ExecuteOptions::new().session("s-perf")),
            )
            .await;
    }

    let analysis = gateway.session_performance("s-perf");
    assert!(analysis.record_count > 0);
    let bottleneck = analysis.bottleneck.unwrap();
    assert_eq!(bottleneck.step, "provider_call");
    assert!(bottleneck.average_ms >= 80.0);
}

#[tokio::test]
async fn health_scores_stay_in_bounds_under_mixed_traffic() {
    let good = Arc::new(MockProvider::new("good"));
    let bad = Arc::new(MockProvider::new("bad").always_fail());
    let gateway = Gateway::builder()
        .with_config(fast_retry_config())
        .with_provider(good)
        .with_provider(bad)
        .with_virtual_model(
            VirtualModel::new("vm-a")
                .with_target(Target::new("good"))
                .with_target(Target::new("bad")),
        )
        .build()
        .unwrap();

    for i in 0..10 {
        gateway.execute(payload(&format!("x-{i}")), "vm-a", None).await;
    }

    for snapshot in gateway.health().snapshots() {
        assert!(
            (0.0..=1.0).contains(&snapshot.health_score),
            "score out of bounds: {snapshot:?}"
        );
    }
}
