//! The seven-step pipeline executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use relay_health::HealthStore;
use relay_routing::RoutingDecision;
use relay_tracker::{IoTracker, RecordDraft, RecordKind, PIPELINE_MODULE_ID};
use relay_types::{
    ExecutionContext, ExecutionStage, Protocol, Provider, RelayError, Result, StepName,
};

use crate::assembly::WiredPipeline;
use crate::registry::ModuleRegistry;
use crate::ExecutorConfig;

/// One executed (or failed) step, as surfaced in execution reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: StepName,
    pub module_id: String,
    pub started_at: DateTime<Utc>,
    /// Offset from execution start, monotonic across the chain.
    pub start_offset_ms: u64,
    pub duration_ms: u64,
    pub output_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The executor's verdict: the step trail plus the final payload or error.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub steps: Vec<StepRecord>,
    pub result: Result<serde_json::Value>,
}

/// Runs the fixed transformation chain against one provider per invocation.
#[derive(Clone)]
pub struct PipelineExecutor {
    pipeline: WiredPipeline,
    registry: Arc<ModuleRegistry>,
    tracker: IoTracker,
    health: Arc<HealthStore>,
    config: ExecutorConfig,
}

impl PipelineExecutor {
    pub fn new(
        pipeline: WiredPipeline,
        registry: Arc<ModuleRegistry>,
        tracker: IoTracker,
        health: Arc<HealthStore>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            pipeline,
            registry,
            tracker,
            health,
            config,
        }
    }

    pub fn pipeline(&self) -> &WiredPipeline {
        &self.pipeline
    }

    pub(crate) fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub(crate) fn tracker(&self) -> &IoTracker {
        &self.tracker
    }

    pub(crate) fn health(&self) -> &Arc<HealthStore> {
        &self.health
    }

    pub(crate) fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run the seven-step chain. The context must be freshly initialized;
    /// the chosen provider comes from the routing decision.
    pub async fn execute(
        &self,
        payload: serde_json::Value,
        protocol: Protocol,
        decision: &RoutingDecision,
        ctx: &mut ExecutionContext,
    ) -> PipelineOutcome {
        let epoch = Instant::now();
        let mut steps: Vec<StepRecord> = Vec::with_capacity(StepName::ALL.len());

        self.tracker
            .track_request(&ctx.session_id, &ctx.request_id, PIPELINE_MODULE_ID, &payload);

        let result = self
            .run_chain(payload, protocol, decision, ctx, epoch, &mut steps)
            .await;

        match result {
            Ok(value) => {
                let _ = ctx.advance(ExecutionStage::Completed);
                self.tracker.track_response(
                    &ctx.session_id,
                    &ctx.request_id,
                    PIPELINE_MODULE_ID,
                    &value,
                    epoch.elapsed(),
                );
                PipelineOutcome {
                    steps,
                    result: Ok(value),
                }
            }
            Err(err) => {
                let failing_step = failing_step_of(&err, ctx.stage());
                let _ = ctx.advance(ExecutionStage::ErrorHandling);
                self.append_composite_error(&mut steps, epoch, ctx, failing_step, &err);
                PipelineOutcome {
                    steps,
                    result: Err(err),
                }
            }
        }
    }

    async fn run_chain(
        &self,
        payload: serde_json::Value,
        protocol: Protocol,
        decision: &RoutingDecision,
        ctx: &mut ExecutionContext,
        epoch: Instant,
        steps: &mut Vec<StepRecord>,
    ) -> Result<serde_json::Value> {
        let provider = self.resolve_provider(&decision.provider_id)?;
        ctx.provider_id = Some(decision.provider_id.clone());

        // 1. Switch-Request: inbound dialect -> canonical.
        ctx.advance(StepName::SwitchRequest.stage())?;
        let meta = StepMeta::begin(epoch, ctx);
        let result = meta
            .bound(
                StepName::SwitchRequest,
                self.config.step_timeout,
                self.pipeline
                    .switch
                    .convert_request(payload, protocol, Protocol::Canonical, ctx),
            )
            .await;
        let chat_request = self.finish_step(
            ctx,
            steps,
            StepName::SwitchRequest,
            self.pipeline.switch.id().to_string(),
            meta,
            result,
        )?;
        let wanted_streaming = chat_request.stream;

        // 2. Workflow-Request: collapse streaming intent.
        ctx.advance(StepName::WorkflowRequest.stage())?;
        let meta = StepMeta::begin(epoch, ctx);
        let result = meta
            .bound(
                StepName::WorkflowRequest,
                self.config.step_timeout,
                self.pipeline.workflow.collapse_streaming(chat_request, ctx),
            )
            .await;
        let chat_request = self.finish_step(
            ctx,
            steps,
            StepName::WorkflowRequest,
            self.pipeline.workflow.id().to_string(),
            meta,
            result,
        )?;

        // 3. Compatibility-Request: canonical -> provider shape.
        ctx.advance(StepName::CompatRequest.stage())?;
        let meta = StepMeta::begin(epoch, ctx);
        let result = meta
            .bound(
                StepName::CompatRequest,
                self.config.step_timeout,
                self.pipeline
                    .compat
                    .map_request(chat_request, &decision.provider_id, ctx),
            )
            .await;
        let provider_request = self.finish_step(
            ctx,
            steps,
            StepName::CompatRequest,
            self.pipeline.compat.id().to_string(),
            meta,
            result,
        )?;

        // 4. Provider-Call: the only step that feeds the health store.
        ctx.advance(StepName::ProviderCall.stage())?;
        self.health.begin_request(&decision.provider_id);
        let meta = StepMeta::begin(epoch, ctx);
        let result = meta
            .bound(
                StepName::ProviderCall,
                self.config.provider_timeout,
                provider.execute(provider_request, ctx),
            )
            .await;
        let latency = meta.started.elapsed();
        match &result {
            Ok(_) => self
                .health
                .record_request_result(&decision.provider_id, true, latency),
            Err(RelayError::Cancelled) => self.health.release_in_flight(&decision.provider_id),
            Err(_) => self
                .health
                .record_request_result(&decision.provider_id, false, latency),
        }
        let provider_response = self.finish_step(
            ctx,
            steps,
            StepName::ProviderCall,
            decision.provider_id.clone(),
            meta,
            result,
        )?;

        // 5. Compatibility-Response: provider shape -> canonical.
        ctx.advance(StepName::CompatResponse.stage())?;
        let meta = StepMeta::begin(epoch, ctx);
        let result = meta
            .bound(
                StepName::CompatResponse,
                self.config.step_timeout,
                self.pipeline
                    .compat
                    .map_response(provider_response, &decision.provider_id, ctx),
            )
            .await;
        let chat_response = self.finish_step(
            ctx,
            steps,
            StepName::CompatResponse,
            self.pipeline.compat.id().to_string(),
            meta,
            result,
        )?;

        // 6. Workflow-Response: restore the requested shape.
        ctx.advance(StepName::WorkflowResponse.stage())?;
        let meta = StepMeta::begin(epoch, ctx);
        let result = meta
            .bound(
                StepName::WorkflowResponse,
                self.config.step_timeout,
                self.pipeline
                    .workflow
                    .reassemble_streaming(chat_response, wanted_streaming, ctx),
            )
            .await;
        let chat_response = self.finish_step(
            ctx,
            steps,
            StepName::WorkflowResponse,
            self.pipeline.workflow.id().to_string(),
            meta,
            result,
        )?;

        // 7. Switch-Response: canonical -> caller dialect.
        ctx.advance(StepName::SwitchResponse.stage())?;
        let meta = StepMeta::begin(epoch, ctx);
        let result = meta
            .bound(
                StepName::SwitchResponse,
                self.config.step_timeout,
                self.pipeline
                    .switch
                    .convert_response(chat_response, Protocol::Canonical, protocol, ctx),
            )
            .await;
        self.finish_step(
            ctx,
            steps,
            StepName::SwitchResponse,
            self.pipeline.switch.id().to_string(),
            meta,
            result,
        )
    }

    pub(crate) fn resolve_provider(&self, provider_id: &str) -> Result<Arc<dyn Provider>> {
        self.registry.provider(provider_id).ok_or_else(|| {
            RelayError::Configuration(format!("provider '{provider_id}' is not registered"))
        })
    }

    /// Close out a step: stamp timings, append the step record, emit the
    /// tracker record, and wrap failures with the module and step.
    pub(crate) fn finish_step<T: serde::Serialize>(
        &self,
        ctx: &mut ExecutionContext,
        steps: &mut Vec<StepRecord>,
        step: StepName,
        module_id: String,
        meta: StepMeta,
        result: Result<T>,
    ) -> Result<T> {
        let duration = meta.started.elapsed();
        ctx.record_stage_timing(step, duration);

        match result {
            Ok(value) => {
                let bytes = serde_json::to_vec(&value).map(|b| b.len()).unwrap_or(0);
                steps.push(StepRecord {
                    step,
                    module_id: module_id.clone(),
                    started_at: meta.started_at,
                    start_offset_ms: meta.start_offset.as_millis() as u64,
                    duration_ms: duration.as_millis() as u64,
                    output_bytes: bytes,
                    error: None,
                });
                self.tracker.record(
                    RecordDraft::new(
                        &ctx.session_id,
                        &ctx.request_id,
                        &module_id,
                        step.as_str(),
                        RecordKind::Transformation,
                    )
                    .with_payload_bytes(bytes)
                    .with_processing_time(duration),
                );
                Ok(value)
            }
            Err(err) => {
                let wrapped = wrap_step_error(err, &module_id, step);
                steps.push(StepRecord {
                    step,
                    module_id: module_id.clone(),
                    started_at: meta.started_at,
                    start_offset_ms: meta.start_offset.as_millis() as u64,
                    duration_ms: duration.as_millis() as u64,
                    output_bytes: 0,
                    error: Some(wrapped.to_string()),
                });
                self.tracker.record(
                    RecordDraft::new(
                        &ctx.session_id,
                        &ctx.request_id,
                        &module_id,
                        step.as_str(),
                        RecordKind::Error,
                    )
                    .with_processing_time(duration)
                    .with_data(serde_json::json!({
                        "error": wrapped.to_string(),
                        "kind": wrapped.kind(),
                    })),
                );
                debug!(step = step.as_str(), module_id = %module_id, error = %wrapped, "step failed");
                Err(wrapped)
            }
        }
    }

    /// The remaining steps are skipped after a failure; one composite error
    /// step carries the failing step and the original error.
    fn append_composite_error(
        &self,
        steps: &mut Vec<StepRecord>,
        epoch: Instant,
        ctx: &ExecutionContext,
        failing_step: StepName,
        err: &RelayError,
    ) {
        steps.push(StepRecord {
            step: failing_step,
            module_id: PIPELINE_MODULE_ID.to_string(),
            started_at: Utc::now(),
            start_offset_ms: epoch.elapsed().as_millis() as u64,
            duration_ms: 0,
            output_bytes: 0,
            error: Some(err.to_string()),
        });
        self.tracker.record(
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
    }
}

/// Per-step bookkeeping captured before the step future runs.
pub(crate) struct StepMeta {
    pub started: Instant,
    pub started_at: DateTime<Utc>,
    pub start_offset: Duration,
    cancel: CancellationToken,
}

impl StepMeta {
    pub fn begin(epoch: Instant, ctx: &ExecutionContext) -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            start_offset: epoch.elapsed(),
            cancel: ctx.cancellation().clone(),
        }
    }

    /// Run the step future under the step timeout and the context's
    /// cancellation token.
    pub async fn bound<T>(
        &self,
        step: StepName,
        timeout: Duration,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RelayError::Cancelled),
            outcome = tokio::time::timeout(timeout, fut) => match outcome {
                Ok(inner) => inner,
                Err(_) => Err(RelayError::StepTimeout {
                    step,
                    timeout_ms: timeout.as_millis() as u64,
                }),
            },
        }
    }
}

fn wrap_step_error(err: RelayError, module_id: &str, step: StepName) -> RelayError {
    match err {
        // Already carries its classification and origin.
        RelayError::Cancelled | RelayError::StepTimeout { .. } | RelayError::Step { .. } => err,
        cause => RelayError::Step {
            module_id: module_id.to_string(),
            step,
            cause: Box::new(cause),
        },
    }
}

/// Best-effort mapping from an error (or the stage reached) to the step
/// where the chain stopped.
pub(crate) fn failing_step_of(err: &RelayError, stage: ExecutionStage) -> StepName {
    if let Some((_, step)) = err.step_origin() {
        return step;
    }
    if let RelayError::StepTimeout { step, .. } = err {
        return *step;
    }
    StepName::ALL
        .iter()
        .copied()
        .find(|s| s.stage() == stage)
        .unwrap_or(StepName::SwitchRequest)
}
