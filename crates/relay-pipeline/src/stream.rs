//! Streaming execution: a lazy, finite, non-restartable sequence of step
//! markers.
//!
//! The chain runs on a spawned task feeding a bounded channel. Dropping the
//! returned stream cancels the execution context, which aborts the upstream
//! call; cancellation mid-stream stops the chain at the provider step and no
//! further step records are emitted.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use relay_routing::RoutingDecision;
use relay_tracker::{RecordDraft, RecordKind, PIPELINE_MODULE_ID};
use relay_types::{
    ExecutionContext, ExecutionStage, Protocol, ProviderResponse, RelayError, Result, StepName,
    StreamChunk,
};

use crate::executor::{failing_step_of, PipelineExecutor, StepMeta};

/// Markers yielded by a streaming execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepMarker {
    StepStarted {
        step: StepName,
        module_id: String,
    },
    StepCompleted {
        step: StepName,
        module_id: String,
        duration_ms: u64,
        output_bytes: usize,
    },
    StepFailed {
        step: StepName,
        module_id: String,
        error: String,
        kind: String,
    },
    Chunk {
        chunk: StreamChunk,
    },
    Completed {
        response: serde_json::Value,
    },
}

impl PipelineExecutor {
    /// Run the chain as a stream of step markers. The provider step streams
    /// its chunks through; everything else mirrors the non-streaming chain.
    pub fn execute_streaming(
        &self,
        payload: serde_json::Value,
        protocol: Protocol,
        decision: RoutingDecision,
        ctx: ExecutionContext,
    ) -> ReceiverStream<StepMarker> {
        let (tx, rx) = mpsc::channel(32);
        let executor = self.clone();
        tokio::spawn(async move {
            executor
                .run_streaming(payload, protocol, decision, ctx, tx)
                .await;
        });
        ReceiverStream::new(rx)
    }

    async fn run_streaming(
        &self,
        payload: serde_json::Value,
        protocol: Protocol,
        decision: RoutingDecision,
        mut ctx: ExecutionContext,
        tx: mpsc::Sender<StepMarker>,
    ) {
        let epoch = Instant::now();
        self.tracker()
            .track_request(&ctx.session_id, &ctx.request_id, PIPELINE_MODULE_ID, &payload);

        let result = self
            .run_streaming_chain(payload, protocol, &decision, &mut ctx, epoch, &tx)
            .await;

        match result {
            Ok(value) => {
                let _ = ctx.advance(ExecutionStage::Completed);
                self.tracker().track_response(
                    &ctx.session_id,
                    &ctx.request_id,
                    PIPELINE_MODULE_ID,
                    &value,
                    epoch.elapsed(),
                );
                let _ = tx.send(StepMarker::Completed { response: value }).await;
            }
            Err(err) => {
                let failing_step = failing_step_of(&err, ctx.stage());
                let _ = ctx.advance(ExecutionStage::ErrorHandling);
                self.tracker().record(
                    RecordDraft::new(
                        &ctx.session_id,
                        &ctx.request_id,
                        PIPELINE_MODULE_ID,
                        "pipeline_error",
                        RecordKind::Error,
                    )
                    .with_data(serde_json::json!({
                        "failing_step": failing_step.as_str(),
                        "error": err.to_string(),
                        "kind": err.kind(),
                    })),
                );
                debug!(error = %err, "streaming execution failed");
            }
        }
    }

    async fn run_streaming_chain(
        &self,
        payload: serde_json::Value,
        protocol: Protocol,
        decision: &RoutingDecision,
        ctx: &mut ExecutionContext,
        epoch: Instant,
        tx: &mpsc::Sender<StepMarker>,
    ) -> Result<serde_json::Value> {
        let provider = self.resolve_provider(&decision.provider_id)?;
        ctx.provider_id = Some(decision.provider_id.clone());

        // 1. Switch-Request
        ctx.advance(StepName::SwitchRequest.stage())?;
        let switch_id = self.pipeline().switch.id().to_string();
        self.send_started(tx, ctx, StepName::SwitchRequest, &switch_id)
            .await?;
        let meta = StepMeta::begin(epoch, ctx);
        let result = meta
            .bound(
                StepName::SwitchRequest,
                self.config().step_timeout,
                self.pipeline()
                    .switch
                    .convert_request(payload, protocol, Protocol::Canonical, ctx),
            )
            .await;
        let chat_request = self
            .close_streaming_step(ctx, StepName::SwitchRequest, switch_id, meta, result, tx)
            .await?;
        let wanted_streaming = chat_request.stream;

        // 2. Workflow-Request
        ctx.advance(StepName::WorkflowRequest.stage())?;
        let workflow_id = self.pipeline().workflow.id().to_string();
        self.send_started(tx, ctx, StepName::WorkflowRequest, &workflow_id)
            .await?;
        let meta = StepMeta::begin(epoch, ctx);
        let result = meta
            .bound(
                StepName::WorkflowRequest,
                self.config().step_timeout,
                self.pipeline().workflow.collapse_streaming(chat_request, ctx),
            )
            .await;
        let chat_request = self
            .close_streaming_step(ctx, StepName::WorkflowRequest, workflow_id, meta, result, tx)
            .await?;

        // 3. Compatibility-Request
        ctx.advance(StepName::CompatRequest.stage())?;
        let compat_id = self.pipeline().compat.id().to_string();
        self.send_started(tx, ctx, StepName::CompatRequest, &compat_id)
            .await?;
        let meta = StepMeta::begin(epoch, ctx);
        let result = meta
            .bound(
                StepName::CompatRequest,
                self.config().step_timeout,
                self.pipeline()
                    .compat
                    .map_request(chat_request, &decision.provider_id, ctx),
            )
            .await;
        let mut provider_request = self
            .close_streaming_step(ctx, StepName::CompatRequest, compat_id, meta, result, tx)
            .await?;
        provider_request.stream = true;
        let provider_model = provider_request.model.clone();

        // 4. Provider-Call, streaming.
        ctx.advance(StepName::ProviderCall.stage())?;
        let provider_id = decision.provider_id.clone();
        self.send_started(tx, ctx, StepName::ProviderCall, &provider_id)
            .await?;
        self.health().begin_request(&provider_id);
        let meta = StepMeta::begin(epoch, ctx);
        let stream_result = meta
            .bound(
                StepName::ProviderCall,
                self.config().provider_timeout,
                provider.execute_streaming(provider_request, ctx),
            )
            .await;

        let mut chunk_stream = match stream_result {
            Ok(stream) => stream,
            Err(err) => {
                let latency = meta.started.elapsed();
                if matches!(err, RelayError::Cancelled) {
                    self.health().release_in_flight(&provider_id);
                } else {
                    self.health()
                        .record_request_result(&provider_id, false, latency);
                }
                return Err(self
                    .fail_streaming_step(ctx, StepName::ProviderCall, provider_id, meta, err, tx)
                    .await);
            }
        };

        let cancel = ctx.cancellation().clone();
        let mut content = String::new();
        let mut stream_failure: Option<RelayError> = None;
        let mut cancelled = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = chunk_stream.next() => match next {
                    None => break,
                    Some(Ok(chunk)) => {
                        content.push_str(&chunk.delta);
                        let is_final = chunk.is_final();
                        if tx.send(StepMarker::Chunk { chunk }).await.is_err() {
                            cancel.cancel();
                            cancelled = true;
                            break;
                        }
                        if is_final {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        stream_failure = Some(err);
                        break;
                    }
                },
            }
        }
        // Dropping the chunk stream aborts the upstream call.
        drop(chunk_stream);

        let latency = meta.started.elapsed();
        if cancelled {
            self.health().release_in_flight(&provider_id);
            ctx.record_stage_timing(StepName::ProviderCall, latency);
            self.tracker().record(
                RecordDraft::new(
                    &ctx.session_id,
                    &ctx.request_id,
                    &provider_id,
                    StepName::ProviderCall.as_str(),
                    RecordKind::Error,
                )
                .with_processing_time(latency)
                .with_data(serde_json::json!({
                    "error": RelayError::Cancelled.to_string(),
                    "kind": RelayError::Cancelled.kind(),
                })),
            );
            return Err(RelayError::Cancelled);
        }
        if let Some(err) = stream_failure {
            self.health()
                .record_request_result(&provider_id, false, latency);
            return Err(self
                .fail_streaming_step(ctx, StepName::ProviderCall, provider_id, meta, err, tx)
                .await);
        }
        self.health()
            .record_request_result(&provider_id, true, latency);
        let provider_response = ProviderResponse {
            payload: serde_json::json!({
                "content": content.trim_end(),
                "model": provider_model,
                "finish_reason": "stop",
                "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0},
            }),
        };
        let provider_response = self
            .close_streaming_step(
                ctx,
                StepName::ProviderCall,
                provider_id.clone(),
                meta,
                Ok(provider_response),
                tx,
            )
            .await?;

        // 5. Compatibility-Response
        ctx.advance(StepName::CompatResponse.stage())?;
        let compat_id = self.pipeline().compat.id().to_string();
        self.send_started(tx, ctx, StepName::CompatResponse, &compat_id)
            .await?;
        let meta = StepMeta::begin(epoch, ctx);
        let result = meta
            .bound(
                StepName::CompatResponse,
                self.config().step_timeout,
                self.pipeline()
                    .compat
                    .map_response(provider_response, &provider_id, ctx),
            )
            .await;
        let chat_response = self
            .close_streaming_step(ctx, StepName::CompatResponse, compat_id, meta, result, tx)
            .await?;

        // 6. Workflow-Response
        ctx.advance(StepName::WorkflowResponse.stage())?;
        let workflow_id = self.pipeline().workflow.id().to_string();
        self.send_started(tx, ctx, StepName::WorkflowResponse, &workflow_id)
            .await?;
        let meta = StepMeta::begin(epoch, ctx);
        let result = meta
            .bound(
                StepName::WorkflowResponse,
                self.config().step_timeout,
                self.pipeline()
                    .workflow
                    .reassemble_streaming(chat_response, wanted_streaming, ctx),
            )
            .await;
        let chat_response = self
            .close_streaming_step(ctx, StepName::WorkflowResponse, workflow_id, meta, result, tx)
            .await?;

        // 7. Switch-Response
        ctx.advance(StepName::SwitchResponse.stage())?;
        let switch_id = self.pipeline().switch.id().to_string();
        self.send_started(tx, ctx, StepName::SwitchResponse, &switch_id)
            .await?;
        let meta = StepMeta::begin(epoch, ctx);
        let result = meta
            .bound(
                StepName::SwitchResponse,
                self.config().step_timeout,
                self.pipeline()
                    .switch
                    .convert_response(chat_response, Protocol::Canonical, protocol, ctx),
            )
            .await;
        self.close_streaming_step(ctx, StepName::SwitchResponse, switch_id, meta, result, tx)
            .await
    }

    async fn send_started(
        &self,
        tx: &mpsc::Sender<StepMarker>,
        ctx: &ExecutionContext,
        step: StepName,
        module_id: &str,
    ) -> Result<()> {
        let marker = StepMarker::StepStarted {
            step,
            module_id: module_id.to_string(),
        };
        if tx.send(marker).await.is_err() {
            ctx.cancellation().cancel();
            return Err(RelayError::Cancelled);
        }
        Ok(())
    }

    /// Close a successful or failed step: tracker records, stage timing, and
    /// the matching marker. Error wrapping is shared with the non-streaming
    /// chain through `finish_step`.
    async fn close_streaming_step<T: serde::Serialize>(
        &self,
        ctx: &mut ExecutionContext,
        step: StepName,
        module_id: String,
        meta: StepMeta,
        result: Result<T>,
        tx: &mpsc::Sender<StepMarker>,
    ) -> Result<T> {
        match result {
            Ok(value) => {
                let mut scratch = Vec::new();
                let value =
                    self.finish_step(ctx, &mut scratch, step, module_id.clone(), meta, Ok(value))?;
                let (duration_ms, output_bytes) = scratch
                    .pop()
                    .map(|record| (record.duration_ms, record.output_bytes))
                    .unwrap_or((0, 0));
                let marker = StepMarker::StepCompleted {
                    step,
                    module_id,
                    duration_ms,
                    output_bytes,
                };
                if tx.send(marker).await.is_err() {
                    ctx.cancellation().cancel();
                    return Err(RelayError::Cancelled);
                }
                Ok(value)
            }
            Err(err) => Err(self
                .fail_streaming_step(ctx, step, module_id, meta, err, tx)
                .await),
        }
    }

    async fn fail_streaming_step(
        &self,
        ctx: &mut ExecutionContext,
        step: StepName,
        module_id: String,
        meta: StepMeta,
        err: RelayError,
        tx: &mpsc::Sender<StepMarker>,
    ) -> RelayError {
        let mut scratch = Vec::new();
        let wrapped = self
            .finish_step::<()>(ctx, &mut scratch, step, module_id.clone(), meta, Err(err))
            .unwrap_err();
        let marker = StepMarker::StepFailed {
            step,
            module_id,
            error: wrapped.to_string(),
            kind: wrapped.kind().to_string(),
        };
        let _ = tx.send(marker).await;
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::PipelineAssembly;
    use crate::modules::{BufferingWorkflow, FieldMapCompatibility, StandardSwitch};
    use crate::registry::ModuleRegistry;
    use crate::ExecutorConfig;
    use relay_health::{HealthConfig, HealthStore};
    use relay_routing::{Router, RouterConfig};
    use relay_tracker::{IoTracker, RecordFilter, TrackerConfig};
    use relay_types::{MockProvider, ModuleKind, Provider, Target, VirtualModel};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn build(provider: Arc<MockProvider>) -> (PipelineExecutor, Router, IoTracker, Arc<HealthStore>) {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register_switch(Arc::new(StandardSwitch::new("switch.main")));
        registry.register_workflow(Arc::new(BufferingWorkflow::new("workflow.main")));
        registry.register_compatibility(Arc::new(FieldMapCompatibility::new(
            "compat.main",
            HashMap::new(),
        )));
        registry.register_provider(provider.clone());
        registry
            .register_virtual_model(
                VirtualModel::new("vm-a").with_target(Target::new(provider.id())),
            )
            .unwrap();

        let wired = PipelineAssembly::new("asm", "default", "1")
            .with_module("switch.main", ModuleKind::ProtocolSwitch)
            .with_module("workflow.main", ModuleKind::Workflow)
            .with_module("compat.main", ModuleKind::Compatibility)
            .wire(&registry)
            .unwrap();

        let tracker = IoTracker::new(TrackerConfig::default());
        let health = Arc::new(HealthStore::new(HealthConfig::default()));
        let router = Router::new(RouterConfig::default(), health.clone());
        let executor = PipelineExecutor::new(
            wired,
            registry,
            tracker.clone(),
            health.clone(),
            ExecutorConfig::default(),
        );
        (executor, router, tracker, health)
    }

    fn streaming_payload() -> serde_json::Value {
        serde_json::json!({
            "model": "m",
            "stream": true,
            "messages": [{"role": "user", "content": "one two three"}],
        })
    }

    #[tokio::test]
    async fn streaming_yields_chunks_and_completion() {
        let provider = Arc::new(MockProvider::new("p1"));
        let (executor, router, tracker, _) = build(provider);
        let vm = executor.registry().virtual_model("vm-a").unwrap();
        let decision = router.decide(&vm).unwrap();
        tracker.start_session("s1", Some("r1".into()));
        let ctx = ExecutionContext::new("s1", "r1", "vm-a");

        let markers: Vec<StepMarker> = executor
            .execute_streaming(streaming_payload(), Protocol::OpenAi, decision, ctx)
            .collect()
            .await;

        let chunk_count = markers
            .iter()
            .filter(|m| matches!(m, StepMarker::Chunk { .. }))
            .count();
        assert!(chunk_count >= 3, "expected word chunks, got {chunk_count}");

        match markers.last().unwrap() {
            StepMarker::Completed { response } => {
                let content = response["choices"][0]["message"]["content"].as_str().unwrap();
                assert!(content.contains("echo: one two three"));
            }
            other => panic!("expected completion marker, got {other:?}"),
        }

        let started: Vec<_> = markers
            .iter()
            .filter_map(|m| match m {
                StepMarker::StepStarted { step, .. } => Some(*step),
                _ => None,
            })
            .collect();
        assert_eq!(started, StepName::ALL.to_vec());
    }

    #[tokio::test]
    async fn cancellation_mid_stream_stops_the_chain() {
        let provider = Arc::new(MockProvider::new("p1").with_chunk_delay(50));
        let (executor, router, tracker, health) = build(provider);
        let vm = executor.registry().virtual_model("vm-a").unwrap();
        let decision = router.decide(&vm).unwrap();
        tracker.start_session("s1", Some("r1".into()));

        let token = CancellationToken::new();
        let ctx = ExecutionContext::new("s1", "r1", "vm-a").with_cancellation(token.clone());

        let mut stream =
            executor.execute_streaming(streaming_payload(), Protocol::OpenAi, decision, ctx);

        // wait for the first chunk, then cancel
        let mut saw_chunk = false;
        while let Some(marker) = stream.next().await {
            if matches!(marker, StepMarker::Chunk { .. }) {
                saw_chunk = true;
                token.cancel();
                break;
            }
        }
        assert!(saw_chunk);

        // drain whatever is left; no post-provider steps may appear
        let rest: Vec<StepMarker> = stream.collect().await;
        assert!(rest.iter().all(|m| !matches!(
            m,
            StepMarker::StepStarted { step: StepName::CompatResponse, .. }
                | StepMarker::Completed { .. }
        )));

        // give the task a beat to clean up
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(health.snapshot("p1").unwrap().in_flight, 0);

        let errors = tracker.records(&RecordFilter::new().session("s1").kind(RecordKind::Error));
        assert!(errors.iter().any(|r| r
            .data
            .as_ref()
            .is_some_and(|d| d["kind"] == "cancelled")));
    }

    #[tokio::test]
    async fn provider_stream_failure_reports_to_health() {
        let provider = Arc::new(MockProvider::new("p1").always_fail());
        let (executor, router, tracker, health) = build(provider);
        let vm = executor.registry().virtual_model("vm-a").unwrap();
        let decision = router.decide(&vm).unwrap();
        tracker.start_session("s1", Some("r1".into()));
        let ctx = ExecutionContext::new("s1", "r1", "vm-a");

        let markers: Vec<StepMarker> = executor
            .execute_streaming(streaming_payload(), Protocol::OpenAi, decision, ctx)
            .collect()
            .await;

        assert!(markers.iter().any(|m| matches!(
            m,
            StepMarker::StepFailed { step: StepName::ProviderCall, .. }
        )));
        assert!(!markers
            .iter()
            .any(|m| matches!(m, StepMarker::Completed { .. })));

        let snapshot = health.snapshot("p1").unwrap();
        assert_eq!(snapshot.total_failures, 1);
        assert_eq!(snapshot.in_flight, 0);
    }
}
