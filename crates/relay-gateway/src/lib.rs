//! Relay Gateway - the public entry surface of the data plane
//!
//! The gateway wraps the pipeline executor with the execution optimizer:
//! admission through a bounded semaphore, an idempotent response cache,
//! classified retries with jittered exponential backoff, and an overall
//! request timeout. Construction is strictly layered - tracker, health
//! store, router, executor, gateway - with every back-reference passed in
//! as a narrow interface at build time.

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use relay_health::{AggregateSnapshot, HealthConfig, HealthSnapshot, HealthStore};
use relay_pipeline::{
    register_builtin_factories, BufferingWorkflow, ExecutorConfig, FieldMapCompatibility,
    ModuleRegistry, PipelineExecutor, StandardSwitch,
};
use relay_routing::{Router, RouterConfig, RoutingStats};
use relay_tracker::{IoRecord, IoTracker, PerformanceAnalysis, RecordFilter, TrackerConfig};
use relay_types::{
    ContextSummary, ExecutionContext, ModuleKind, ModuleStatus, Provider, Result,
};

mod cache;
mod retry;

pub use cache::{CacheStats, ResponseCache};
pub use retry::RetryPolicy;

// The surface a caller needs, re-exported from the layers underneath.
pub use relay_pipeline::{PipelineAssembly, StepMarker, StepRecord};
pub use relay_types::{Protocol, RelayError, VirtualModel};

/// Execution-optimizer configuration.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Gate requests through the admission semaphore.
    pub enable_concurrency: bool,
    /// Admission semaphore size.
    pub max_concurrency: usize,
    /// How long a request may wait for admission before being rejected.
    pub admission_wait: Duration,
    pub enable_retry: bool,
    /// Maximum retries after the first attempt.
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub retry_delay: Duration,
    pub retry_multiplier: f64,
    pub max_retry_delay: Duration,
    pub enable_caching: bool,
    pub cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    /// Overall budget for one `execute` call including retries.
    pub request_timeout: Duration,
    /// How long `shutdown` waits for in-flight requests to drain.
    pub shutdown_grace: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            enable_concurrency: true,
            max_concurrency: 10,
            admission_wait: Duration::from_secs(1),
            enable_retry: true,
            max_retries: 2,
            retry_delay: Duration::from_millis(100),
            retry_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(30),
            enable_caching: true,
            cache_ttl: Duration::from_secs(300),
            cache_sweep_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Top-level configuration, one section per layer.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub tracker: TrackerConfig,
    pub health: HealthConfig,
    pub router: RouterConfig,
    pub executor: ExecutorConfig,
    pub execution: ExecutionConfig,
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Session to record under; generated when absent.
    pub session_id: Option<String>,
    /// Caller's wire dialect; OpenAI when absent.
    pub protocol: Option<Protocol>,
    /// External cancellation handle.
    pub cancellation: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// User-visible failure object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub retryable: bool,
}

impl ErrorBody {
    fn from_error(err: &RelayError) -> Self {
        let (module_id, step) = match err.step_origin() {
            Some((module, step)) => (Some(module.to_string()), Some(step.as_str().to_string())),
            None => (None, None),
        };
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            module_id,
            step,
            retryable: err.retryable(),
        }
    }
}

/// What a caller gets back from `execute`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub execution_time_ms: u64,
    pub steps: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextSummary>,
    pub from_cache: bool,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default)]
struct OptimizerCounters {
    executions: u64,
    successes: u64,
    failures: u64,
    retries: u64,
    backpressure_rejections: u64,
}

/// Optimizer counters plus cache and admission state.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizerSnapshot {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub backpressure_rejections: u64,
    pub cache: CacheStats,
    pub available_permits: usize,
    pub max_permits: usize,
}

/// Aggregated view returned by `Gateway::status`.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub initialized: bool,
    pub module_statuses: Vec<ModuleStatus>,
    pub routing: RoutingStats,
    pub performance: PerformanceAnalysis,
    pub optimization: OptimizerSnapshot,
    pub providers: Vec<HealthSnapshot>,
}

struct AttemptsOutcome {
    steps: Vec<StepRecord>,
    attempts: u32,
    context: Option<ContextSummary>,
    from_cache: bool,
    result: Result<serde_json::Value>,
}

/// The gateway: admission, cache, retries, and the layered core underneath.
pub struct Gateway {
    registry: Arc<ModuleRegistry>,
    tracker: IoTracker,
    health: Arc<HealthStore>,
    router: Router,
    executor: PipelineExecutor,
    cache: Arc<ResponseCache>,
    semaphore: Arc<Semaphore>,
    policy: RetryPolicy,
    execution: ExecutionConfig,
    counters: Arc<Mutex<OptimizerCounters>>,
    requests_token: CancellationToken,
    loops_token: CancellationToken,
    initialized: AtomicBool,
    started: AtomicBool,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Execute one request against a virtual model.
    ///
    /// Never returns `Err`; failures come back inside the report with the
    /// taxonomy's kind and retryability attached.
    pub async fn execute(
        &self,
        payload: serde_json::Value,
        virtual_model_id: &str,
        opts: Option<ExecuteOptions>,
    ) -> ExecutionReport {
        let opts = opts.unwrap_or_default();
        let started = Instant::now();
        let session_id = opts
            .session_id
            .unwrap_or_else(|| format!("sess-{}", Uuid::new_v4()));
        let request_id = self.tracker.start_session(&session_id, None);
        let protocol = opts.protocol.unwrap_or(Protocol::OpenAi);
        let cancel = opts
            .cancellation
            .unwrap_or_else(|| self.requests_token.child_token());

        self.counters.lock().executions += 1;

        let vm = match self.lookup_model(virtual_model_id) {
            Ok(vm) => vm,
            Err(err) => {
                self.tracker.end_session(&session_id);
                self.counters.lock().failures += 1;
                return self.failure_report(err, started, Vec::new(), None, 0, false);
            }
        };

        // The overall timeout cancels cooperatively so permits and in-flight
        // gauges unwind before the report is returned.
        let attempts_fut = self.run_attempts(&payload, protocol, &vm, &session_id, &request_id, &cancel);
        tokio::pin!(attempts_fut);
        let (outcome, timed_out) = tokio::select! {
            outcome = &mut attempts_fut => (outcome, false),
            _ = tokio::time::sleep(self.execution.request_timeout) => {
                cancel.cancel();
                ((&mut attempts_fut).await, true)
            }
        };

        self.tracker.end_session(&session_id);

        let AttemptsOutcome {
            steps,
            attempts,
            context,
            from_cache,
            result,
        } = outcome;
        let result = if timed_out {
            Err(RelayError::RequestTimeout {
                timeout_ms: self.execution.request_timeout.as_millis() as u64,
            })
        } else {
            result
        };

        match result {
            Ok(response) => {
                self.counters.lock().successes += 1;
                ExecutionReport {
                    success: true,
                    response: Some(response),
                    error: None,
                    execution_time_ms: started.elapsed().as_millis() as u64,
                    steps,
                    context,
                    from_cache,
                    attempts,
                }
            }
            Err(err) => {
                self.counters.lock().failures += 1;
                self.failure_report(err, started, steps, context, attempts, from_cache)
            }
        }
    }

    /// Execute one request as a stream of step markers.
    ///
    /// Admission and routing failures surface as `Err`; everything after
    /// that arrives in-band as `StepFailed` markers. Dropping the stream
    /// cancels the execution and aborts the upstream call.
    pub async fn execute_streaming(
        &self,
        payload: serde_json::Value,
        virtual_model_id: &str,
        opts: Option<ExecuteOptions>,
    ) -> Result<ReceiverStream<StepMarker>> {
        let opts = opts.unwrap_or_default();
        let session_id = opts
            .session_id
            .unwrap_or_else(|| format!("sess-{}", Uuid::new_v4()));
        let request_id = self.tracker.start_session(&session_id, None);
        let protocol = opts.protocol.unwrap_or(Protocol::OpenAi);
        let cancel = opts
            .cancellation
            .unwrap_or_else(|| self.requests_token.child_token());

        self.counters.lock().executions += 1;

        let setup = async {
            let vm = self.lookup_model(virtual_model_id)?;
            let permit = self.admit().await?;
            let decision = self.router.decide(&vm)?;
            Ok::<_, RelayError>((vm, permit, decision))
        };
        let (vm, permit, decision) = match setup.await {
            Ok(parts) => parts,
            Err(err) => {
                self.tracker.end_session(&session_id);
                self.counters.lock().failures += 1;
                return Err(err);
            }
        };

        let ctx = ExecutionContext::new(&session_id, &request_id, &vm.id)
            .with_cancellation(cancel);
        let mut inner = self
            .executor
            .execute_streaming(payload, protocol, decision, ctx);

        let (tx, rx) = mpsc::channel(32);
        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            let _permit = permit;
            while let Some(marker) = inner.next().await {
                if tx.send(marker).await.is_err() {
                    // receiver dropped; dropping `inner` propagates the
                    // cancellation into the executor task
                    break;
                }
            }
            tracker.end_session(&session_id);
        });
        Ok(ReceiverStream::new(rx))
    }

    /// Start the background loops (tracker pruner, health probes, cache
    /// sweeper). Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tracker.start();
        self.health.start();

        let cache = Arc::clone(&self.cache);
        let token = self.loops_token.clone();
        let sweep_interval = self.execution.cache_sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => cache.sweep(),
                }
            }
        });
        info!("gateway started");
    }

    /// Stop background loops and drain in-flight requests within the grace
    /// window; whatever is still running afterwards is cancelled.
    pub async fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("gateway shutting down");
        self.loops_token.cancel();
        self.tracker.shutdown();
        self.health.shutdown();

        let deadline = Instant::now() + self.execution.shutdown_grace;
        while self.semaphore.available_permits() < self.execution.max_concurrency
            && Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        if self.semaphore.available_permits() < self.execution.max_concurrency {
            warn!("drain grace expired, cancelling in-flight requests");
            self.requests_token.cancel();
        }
        self.registry.shutdown_all().await;
    }

    pub fn status(&self) -> GatewayStatus {
        let counters = self.counters.lock().clone();
        GatewayStatus {
            initialized: self.initialized.load(Ordering::SeqCst),
            module_statuses: self.registry.module_statuses(),
            routing: self.router.stats(),
            performance: self.tracker.performance_analysis(None),
            optimization: OptimizerSnapshot {
                executions: counters.executions,
                successes: counters.successes,
                failures: counters.failures,
                retries: counters.retries,
                backpressure_rejections: counters.backpressure_rejections,
                cache: self.cache.stats(),
                available_permits: self.semaphore.available_permits(),
                max_permits: self.execution.max_concurrency,
            },
            providers: self.health.snapshots(),
        }
    }

    pub fn performance_report(&self) -> PerformanceAnalysis {
        self.tracker.performance_analysis(None)
    }

    pub fn session_performance(&self, session_id: &str) -> PerformanceAnalysis {
        self.tracker.performance_analysis(Some(session_id))
    }

    pub fn routing_stats(&self) -> RoutingStats {
        self.router.stats()
    }

    pub fn io_records(&self, filter: &RecordFilter) -> Vec<Arc<IoRecord>> {
        self.tracker.records(filter)
    }

    pub fn aggregate_metrics(&self) -> AggregateSnapshot {
        self.health.aggregate()
    }

    pub fn reset_statistics(&self) {
        self.tracker.reset_statistics();
        self.health.reset_statistics();
        self.router.reset_statistics();
        self.cache.clear();
        *self.counters.lock() = OptimizerCounters::default();
    }

    pub fn tracker(&self) -> &IoTracker {
        &self.tracker
    }

    pub fn health(&self) -> &Arc<HealthStore> {
        &self.health
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    fn lookup_model(&self, virtual_model_id: &str) -> Result<VirtualModel> {
        let vm = self.registry.virtual_model(virtual_model_id).ok_or_else(|| {
            RelayError::Configuration(format!("unknown virtual model '{virtual_model_id}'"))
        })?;
        vm.validate()?;
        Ok(vm)
    }

    async fn admit(&self) -> Result<Option<tokio::sync::OwnedSemaphorePermit>> {
        if !self.execution.enable_concurrency {
            return Ok(None);
        }
        let waited = Instant::now();
        match tokio::time::timeout(
            self.execution.admission_wait,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(Some(permit)),
            Ok(Err(_)) | Err(_) => {
                self.counters.lock().backpressure_rejections += 1;
                Err(RelayError::BackpressureRejected {
                    capacity: self.execution.max_concurrency,
                    waited_ms: waited.elapsed().as_millis() as u64,
                })
            }
        }
    }

    async fn run_attempts(
        &self,
        payload: &serde_json::Value,
        protocol: Protocol,
        vm: &VirtualModel,
        session_id: &str,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> AttemptsOutcome {
        let mut outcome = AttemptsOutcome {
            steps: Vec::new(),
            attempts: 0,
            context: None,
            from_cache: false,
            result: Err(RelayError::Internal("no attempt executed".to_string())),
        };

        let _permit = match self.admit().await {
            Ok(permit) => permit,
            Err(err) => {
                outcome.result = Err(err);
                return outcome;
            }
        };

        let digest = self
            .execution
            .enable_caching
            .then(|| ResponseCache::digest(&vm.id, payload));
        if let Some(ref key) = digest {
            if let Some(hit) = self.cache.get(key) {
                debug!(virtual_model = %vm.id, "cache hit");
                outcome.from_cache = true;
                outcome.result = Ok(hit);
                return outcome;
            }
        }

        let mut no_healthy_retried = false;
        let mut attempt: u32 = 1;
        loop {
            outcome.attempts = attempt;

            // fresh routing decision every attempt, so health updates from
            // the previous failure are exploited
            let decision = match self.router.decide(vm) {
                Ok(decision) => decision,
                Err(err) => {
                    let may_retry = matches!(err, RelayError::NoHealthyProvider { .. })
                        && !no_healthy_retried
                        && self.policy.enabled
                        && attempt <= self.policy.max_retries;
                    if may_retry {
                        no_healthy_retried = true;
                        self.counters.lock().retries += 1;
                        let delay = self.policy.delay_for(attempt, None);
                        if !self.sleep_or_cancelled(delay, cancel).await {
                            outcome.result = Err(RelayError::Cancelled);
                            return outcome;
                        }
                        attempt += 1;
                        continue;
                    }
                    outcome.result = Err(err);
                    return outcome;
                }
            };

            let mut ctx = ExecutionContext::new(session_id, request_id, &vm.id)
                .with_cancellation(cancel.clone());
            let pipeline_outcome = self
                .executor
                .execute(payload.clone(), protocol, &decision, &mut ctx)
                .await;
            outcome.steps.extend(pipeline_outcome.steps);
            outcome.context = Some(ctx.summary());

            match pipeline_outcome.result {
                Ok(response) => {
                    if let Some(key) = digest.clone() {
                        self.cache.put(key, response.clone());
                    }
                    outcome.result = Ok(response);
                    return outcome;
                }
                Err(err) => {
                    if self.policy.should_retry(&err, attempt) {
                        self.counters.lock().retries += 1;
                        let delay = self.policy.delay_for(attempt, err.retry_after_hint());
                        debug!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "retrying after failure"
                        );
                        if !self.sleep_or_cancelled(delay, cancel).await {
                            outcome.result = Err(RelayError::Cancelled);
                            return outcome;
                        }
                        attempt += 1;
                        continue;
                    }
                    outcome.result = Err(err);
                    return outcome;
                }
            }
        }
    }

    async fn sleep_or_cancelled(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn failure_report(
        &self,
        err: RelayError,
        started: Instant,
        steps: Vec<StepRecord>,
        context: Option<ContextSummary>,
        attempts: u32,
        from_cache: bool,
    ) -> ExecutionReport {
        ExecutionReport {
            success: false,
            response: None,
            error: Some(ErrorBody::from_error(&err)),
            execution_time_ms: started.elapsed().as_millis() as u64,
            steps,
            context,
            from_cache,
            attempts,
        }
    }
}

/// Builder wiring the layered construction.
pub struct GatewayBuilder {
    config: GatewayConfig,
    registry: Arc<ModuleRegistry>,
    assembly: Option<PipelineAssembly>,
    virtual_models: Vec<VirtualModel>,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        let registry = Arc::new(ModuleRegistry::new());
        register_builtin_factories(&registry);
        Self {
            config: GatewayConfig::default(),
            registry,
            assembly: None,
            virtual_models: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_provider(self, provider: Arc<dyn Provider>) -> Self {
        self.registry.register_provider(provider);
        self
    }

    pub fn with_virtual_model(mut self, model: VirtualModel) -> Self {
        self.virtual_models.push(model);
        self
    }

    pub fn with_assembly(mut self, assembly: PipelineAssembly) -> Self {
        self.assembly = Some(assembly);
        self
    }

    /// The registry, for registering custom modules before `build`.
    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn build(self) -> Result<Gateway> {
        let GatewayBuilder {
            config,
            registry,
            assembly,
            virtual_models,
        } = self;

        for model in virtual_models {
            registry.register_virtual_model(model)?;
        }

        // built-in transforms unless the embedder registered its own
        if registry.switch_ids().is_empty() {
            registry.register_switch(Arc::new(StandardSwitch::new("switch.default")));
        }
        if registry.workflow_ids().is_empty() {
            registry.register_workflow(Arc::new(BufferingWorkflow::new("workflow.default")));
        }
        if registry.compatibility_ids().is_empty() {
            registry.register_compatibility(Arc::new(FieldMapCompatibility::new(
                "compat.default",
                Default::default(),
            )));
        }

        let assembly = match assembly {
            Some(assembly) => assembly,
            None => {
                let switch_id = single(registry.switch_ids(), ModuleKind::ProtocolSwitch)?;
                let workflow_id = single(registry.workflow_ids(), ModuleKind::Workflow)?;
                let compat_id = single(registry.compatibility_ids(), ModuleKind::Compatibility)?;
                PipelineAssembly::new("assembly.default", "default", env!("CARGO_PKG_VERSION"))
                    .with_module(switch_id.clone(), ModuleKind::ProtocolSwitch)
                    .with_module(workflow_id.clone(), ModuleKind::Workflow)
                    .with_module(compat_id.clone(), ModuleKind::Compatibility)
                    .with_connection(switch_id.clone(), workflow_id.clone())
                    .with_connection(workflow_id, compat_id)
            }
        };
        let wired = assembly.wire(&registry)?;

        // leaves first: tracker, health, router, executor, gateway
        let tracker = IoTracker::new(config.tracker.clone());
        let health = Arc::new(HealthStore::new(config.health.clone()));
        for provider in registry.providers() {
            health.register_probe_target(provider);
        }
        let router = Router::new(config.router.clone(), health.clone());
        let executor = PipelineExecutor::new(
            wired,
            registry.clone(),
            tracker.clone(),
            health.clone(),
            config.executor.clone(),
        );

        let execution = config.execution;
        Ok(Gateway {
            registry,
            tracker,
            health,
            router,
            executor,
            cache: Arc::new(ResponseCache::new(execution.cache_ttl)),
            semaphore: Arc::new(Semaphore::new(execution.max_concurrency)),
            policy: RetryPolicy::from_config(&execution),
            execution,
            counters: Arc::new(Mutex::new(OptimizerCounters::default())),
            requests_token: CancellationToken::new(),
            loops_token: CancellationToken::new(),
            initialized: AtomicBool::new(true),
            started: AtomicBool::new(false),
        })
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn single(mut ids: Vec<String>, kind: ModuleKind) -> Result<String> {
    match ids.len() {
        1 => Ok(ids.remove(0)),
        0 => Err(RelayError::Configuration(format!(
            "no {kind} module registered"
        ))),
        _ => Err(RelayError::Configuration(format!(
            "multiple {kind} modules registered; provide an explicit assembly"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::{MockProvider, Target};

    fn gateway_with(provider: Arc<MockProvider>) -> Gateway {
        Gateway::builder()
            .with_provider(provider.clone())
            .with_virtual_model(
                VirtualModel::new("vm-a").with_target(Target::new(provider.id())),
            )
            .build()
            .unwrap()
    }

    fn payload() -> serde_json::Value {
        serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
        })
    }

    #[tokio::test]
    async fn unknown_virtual_model_fails_with_configuration() {
        let gateway = gateway_with(Arc::new(MockProvider::new("p1")));
        let report = gateway.execute(payload(), "vm-missing", None).await;
        assert!(!report.success);
        let error = report.error.unwrap();
        assert_eq!(error.kind, "configuration");
        assert!(!error.retryable);
    }

    #[tokio::test]
    async fn happy_path_reports_seven_steps() {
        let gateway = gateway_with(Arc::new(MockProvider::new("p1")));
        let report = gateway.execute(payload(), "vm-a", None).await;
        assert!(report.success, "error: {:?}", report.error);
        assert_eq!(report.steps.len(), 7);
        assert_eq!(report.attempts, 1);
        assert!(!report.from_cache);
        assert!(report.response.is_some());
    }

    #[tokio::test]
    async fn status_surfaces_all_sections() {
        let gateway = gateway_with(Arc::new(MockProvider::new("p1")));
        gateway.execute(payload(), "vm-a", None).await;
        let status = gateway.status();
        assert!(status.initialized);
        assert!(!status.module_statuses.is_empty());
        assert_eq!(status.optimization.executions, 1);
        assert_eq!(status.optimization.successes, 1);
        assert_eq!(status.providers.len(), 1);
    }

    #[tokio::test]
    async fn reset_statistics_zeroes_counters() {
        let gateway = gateway_with(Arc::new(MockProvider::new("p1")));
        gateway.execute(payload(), "vm-a", None).await;
        gateway.reset_statistics();
        let status = gateway.status();
        assert_eq!(status.optimization.executions, 0);
        assert_eq!(status.routing.decisions, 0);
        assert_eq!(status.optimization.cache.stores, 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_marks_uninitialized() {
        let gateway = gateway_with(Arc::new(MockProvider::new("p1")));
        gateway.start();
        gateway.shutdown().await;
        gateway.shutdown().await;
        assert!(!gateway.status().initialized);
    }
}
