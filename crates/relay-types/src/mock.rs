//! Mock provider for testing the pipeline, routing, and optimizer layers.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::sleep;

use crate::module::{
    AuthDescriptor, ChunkStream, ModuleKind, ModuleStatus, Provider, ProviderCaps, ProviderInfo,
    ProviderRequest, ProviderResponse,
};
use crate::{RelayError, Result, StreamChunk};

/// Scriptable in-memory provider.
///
/// Failure modes compose: `fail_first(n)` makes the first n calls fail,
/// `fail_after(n)` makes every call after the first n fail, `always_fail`
/// fails unconditionally. Failures surface as upstream 503s unless a custom
/// status is configured.
pub struct MockProvider {
    id: String,
    request_count: AtomicU32,
    fail_first: Option<u32>,
    fail_after: Option<u32>,
    always_fail: bool,
    fail_status: u16,
    delay_ms: Option<u64>,
    chunk_delay_ms: u64,
    healthy: AtomicBool,
}

impl MockProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            request_count: AtomicU32::new(0),
            fail_first: None,
            fail_after: None,
            always_fail: false,
            fail_status: 503,
            delay_ms: None,
            chunk_delay_ms: 0,
            healthy: AtomicBool::new(true),
        }
    }

    /// Fail the first `count` requests, succeed thereafter.
    pub fn fail_first(mut self, count: u32) -> Self {
        self.fail_first = Some(count);
        self
    }

    /// Succeed for the first `count` requests, fail thereafter.
    pub fn fail_after(mut self, count: u32) -> Self {
        self.fail_after = Some(count);
        self
    }

    pub fn always_fail(mut self) -> Self {
        self.always_fail = true;
        self
    }

    /// Status carried by simulated failures (default 503).
    pub fn fail_with_status(mut self, status: u16) -> Self {
        self.fail_status = status;
        self
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    /// Delay between streamed chunks, for cancellation tests.
    pub fn with_chunk_delay(mut self, delay_ms: u64) -> Self {
        self.chunk_delay_ms = delay_ms;
        self
    }

    pub fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn check_failure(&self, count: u32) -> Result<()> {
        let fail = self.always_fail
            || self.fail_first.is_some_and(|n| count < n)
            || self.fail_after.is_some_and(|n| count >= n);
        if fail {
            return Err(RelayError::Upstream {
                status: self.fail_status,
                message: format!("mock provider '{}' simulated failure", self.id),
                retry_after_ms: None,
            });
        }
        Ok(())
    }

    fn echo_content(request: &ProviderRequest) -> String {
        let last_user = request
            .payload
            .get("messages")
            .and_then(|m| m.as_array())
            .and_then(|msgs| {
                msgs.iter()
                    .rev()
                    .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))
            })
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("");
        format!("echo: {}", last_user)
    }

    fn success_payload(&self, request: &ProviderRequest) -> serde_json::Value {
        let content = Self::echo_content(request);
        let completion_tokens = (content.len() / 4).max(1) as u64;
        serde_json::json!({
            "content": content,
            "model": request.model,
            "finish_reason": "stop",
            "usage": {
                "prompt_tokens": 8,
                "completion_tokens": completion_tokens,
                "total_tokens": 8 + completion_tokens,
            },
        })
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            endpoint: format!("mock://{}", self.id),
            models: vec!["mock-small".to_string(), "mock-large".to_string()],
            auth: AuthDescriptor::none(),
            caps: ProviderCaps::default(),
        }
    }

    async fn execute(
        &self,
        request: ProviderRequest,
        _ctx: &crate::ExecutionContext,
    ) -> Result<ProviderResponse> {
        let count = self.request_count.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay_ms {
            sleep(Duration::from_millis(delay)).await;
        }
        self.check_failure(count)?;
        Ok(ProviderResponse {
            payload: self.success_payload(&request),
        })
    }

    async fn execute_streaming(
        &self,
        request: ProviderRequest,
        _ctx: &crate::ExecutionContext,
    ) -> Result<ChunkStream> {
        let count = self.request_count.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay_ms {
            sleep(Duration::from_millis(delay)).await;
        }
        self.check_failure(count)?;

        let content = Self::echo_content(&request);
        let chunk_delay = self.chunk_delay_ms;
        let mut chunks: Vec<StreamChunk> = content
            .split_whitespace()
            .map(|word| StreamChunk::delta(format!("{} ", word)))
            .collect();
        chunks.push(StreamChunk::done());

        let stream = futures::stream::iter(chunks.into_iter().map(Ok)).then(move |chunk| {
            async move {
                if chunk_delay > 0 {
                    sleep(Duration::from_millis(chunk_delay)).await;
                }
                chunk
            }
        });
        Ok(stream.boxed())
    }

    async fn check_health(&self) -> Result<()> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(RelayError::Network(format!(
                "mock provider '{}' is unhealthy",
                self.id
            )));
        }
        Ok(())
    }

    fn status(&self) -> ModuleStatus {
        ModuleStatus {
            module_id: self.id.clone(),
            kind: ModuleKind::Provider,
            healthy: self.healthy.load(Ordering::SeqCst),
            detail: None,
        }
    }
}
