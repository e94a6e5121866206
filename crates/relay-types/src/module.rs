//! Module contracts consumed by the pipeline executor.
//!
//! Four module kinds participate in the seven-step chain: a protocol switch
//! converts between wire dialects and the canonical form, a workflow adapts
//! streaming intent, a compatibility module maps canonical fields onto a
//! provider's shapes, and a provider performs the upstream call. All four are
//! object-safe async traits so the registry can hold them behind `Arc<dyn _>`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::chat::{ChatRequest, ChatResponse, Protocol, StreamChunk};
use crate::context::ExecutionContext;
use crate::Result;

/// Closed set of module kinds; the factory table is keyed by this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    ProtocolSwitch,
    Workflow,
    Compatibility,
    Provider,
}

impl ModuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::ProtocolSwitch => "protocol_switch",
            ModuleKind::Workflow => "workflow",
            ModuleKind::Compatibility => "compatibility",
            ModuleKind::Provider => "provider",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time status a module reports about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub module_id: String,
    pub kind: ModuleKind,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ModuleStatus {
    pub fn healthy(module_id: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            module_id: module_id.into(),
            kind,
            healthy: true,
            detail: None,
        }
    }
}

/// How a provider authenticates against its upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    None,
    ApiKey,
    Bearer,
}

/// Auth descriptor carrying a secret *handle* (e.g. an env-var name), never
/// the secret itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthDescriptor {
    pub kind: AuthKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

impl AuthDescriptor {
    pub fn none() -> Self {
        Self {
            kind: AuthKind::None,
            secret_ref: None,
        }
    }

    pub fn api_key(secret_ref: impl Into<String>) -> Self {
        Self {
            kind: AuthKind::ApiKey,
            secret_ref: Some(secret_ref.into()),
        }
    }
}

/// Capability flags a provider advertises.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProviderCaps {
    pub streaming: bool,
    pub functions: bool,
    pub vision: bool,
    pub max_tokens: u32,
}

impl Default for ProviderCaps {
    fn default() -> Self {
        Self {
            streaming: true,
            functions: false,
            vision: false,
            max_tokens: 4096,
        }
    }
}

/// Static description of an addressable upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub endpoint: String,
    pub models: Vec<String>,
    pub auth: AuthDescriptor,
    pub caps: ProviderCaps,
}

/// Provider-shaped request, output of the compat-request step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub model: String,
    pub payload: serde_json::Value,
    pub stream: bool,
}

/// Raw provider response, input of the compat-response step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub payload: serde_json::Value,
}

/// Finite, non-restartable stream of response increments from an upstream.
pub type ChunkStream = BoxStream<'static, Result<StreamChunk>>;

/// Converts between a wire dialect and the canonical chat form.
#[async_trait]
pub trait ProtocolSwitch: Send + Sync {
    fn id(&self) -> &str;

    /// Convert an inbound payload in dialect `from` to the canonical request.
    async fn convert_request(
        &self,
        payload: serde_json::Value,
        from: Protocol,
        to: Protocol,
        ctx: &ExecutionContext,
    ) -> Result<ChatRequest>;

    /// Convert a canonical response back into dialect `to`.
    async fn convert_response(
        &self,
        response: ChatResponse,
        from: Protocol,
        to: Protocol,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value>;

    fn status(&self) -> ModuleStatus;

    async fn shutdown(&self) {}
}

/// Adapts streaming intent across the provider call.
#[async_trait]
pub trait Workflow: Send + Sync {
    fn id(&self) -> &str;

    /// Collapse a streaming-intent request to a non-streaming one when the
    /// chosen path requires buffering.
    async fn collapse_streaming(
        &self,
        request: ChatRequest,
        ctx: &ExecutionContext,
    ) -> Result<ChatRequest>;

    /// Restore the response shape the caller asked for.
    async fn reassemble_streaming(
        &self,
        response: ChatResponse,
        wanted_streaming: bool,
        ctx: &ExecutionContext,
    ) -> Result<ChatResponse>;

    fn status(&self) -> ModuleStatus;

    async fn shutdown(&self) {}
}

/// Maps canonical fields to a specific provider's field names and shapes.
#[async_trait]
pub trait Compatibility: Send + Sync {
    fn id(&self) -> &str;

    async fn map_request(
        &self,
        request: ChatRequest,
        provider_id: &str,
        ctx: &ExecutionContext,
    ) -> Result<ProviderRequest>;

    async fn map_response(
        &self,
        response: ProviderResponse,
        provider_id: &str,
        ctx: &ExecutionContext,
    ) -> Result<ChatResponse>;

    fn status(&self) -> ModuleStatus;

    async fn shutdown(&self) {}
}

/// An addressable upstream capable of executing requests.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    fn info(&self) -> ProviderInfo;

    async fn execute(
        &self,
        request: ProviderRequest,
        ctx: &ExecutionContext,
    ) -> Result<ProviderResponse>;

    async fn execute_streaming(
        &self,
        request: ProviderRequest,
        ctx: &ExecutionContext,
    ) -> Result<ChunkStream>;

    /// Liveness probe. Implementations should answer quickly; the probe loop
    /// applies its own timeout.
    async fn check_health(&self) -> Result<()> {
        Ok(())
    }

    fn status(&self) -> ModuleStatus;

    async fn shutdown(&self) {}
}
