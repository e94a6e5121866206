//! Built-in module implementations.
//!
//! These cover the common case: an OpenAI-dialect front door, buffering of
//! streaming intent across non-streaming upstreams, and a rename-table
//! compatibility layer. Anything fancier is supplied by the embedder through
//! the registry's factory table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use relay_types::{
    ChatRequest, ChatResponse, Compatibility, ExecutionContext, Message, ModuleKind, ModuleStatus,
    Protocol, ProtocolSwitch, ProviderRequest, ProviderResponse, RelayError, Result, Usage,
    Workflow,
};

/// Protocol switch translating OpenAI and Anthropic dialects to and from the
/// canonical form. The canonical form is wire-compatible with the OpenAI
/// request shape, so that direction is a plain deserialization.
pub struct StandardSwitch {
    id: String,
}

impl StandardSwitch {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    fn anthropic_request(payload: serde_json::Value) -> Result<ChatRequest> {
        let model = payload
            .get("model")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayError::InvalidRequest("missing 'model'".to_string()))?
            .to_string();

        let mut messages = Vec::new();
        if let Some(system) = payload.get("system").and_then(|v| v.as_str()) {
            messages.push(Message::system(system));
        }
        let raw_messages = payload
            .get("messages")
            .and_then(|v| v.as_array())
            .ok_or_else(|| RelayError::InvalidRequest("missing 'messages'".to_string()))?;
        for raw in raw_messages {
            let role = raw.get("role").and_then(|v| v.as_str()).unwrap_or("user");
            let content = match raw.get("content") {
                Some(serde_json::Value::String(text)) => text.clone(),
                // content blocks: concatenate the text parts
                Some(serde_json::Value::Array(blocks)) => blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join(""),
                _ => {
                    return Err(RelayError::InvalidRequest(
                        "message without content".to_string(),
                    ))
                }
            };
            messages.push(match role {
                "assistant" => Message::assistant(content),
                _ => Message::user(content),
            });
        }

        let mut request = ChatRequest::new(model, messages);
        request.max_tokens = payload
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        request.temperature = payload
            .get("temperature")
            .and_then(|v| v.as_f64())
            .map(|v| v as f32);
        request.stream = payload
            .get("stream")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(request)
    }

    fn openai_response(response: &ChatResponse) -> serde_json::Value {
        serde_json::json!({
            "id": response.id,
            "object": "chat.completion",
            "created": response.created_at.timestamp(),
            "model": response.model,
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": response.content,
                },
                "finish_reason": response.finish_reason,
            }],
            "usage": {
                "prompt_tokens": response.usage.prompt_tokens,
                "completion_tokens": response.usage.completion_tokens,
                "total_tokens": response.usage.total_tokens,
            },
        })
    }

    fn anthropic_response(response: &ChatResponse) -> serde_json::Value {
        serde_json::json!({
            "id": response.id,
            "type": "message",
            "role": "assistant",
            "model": response.model,
            "content": [{ "type": "text", "text": response.content }],
            "stop_reason": response.finish_reason,
            "usage": {
                "input_tokens": response.usage.prompt_tokens,
                "output_tokens": response.usage.completion_tokens,
            },
        })
    }
}

#[async_trait]
impl ProtocolSwitch for StandardSwitch {
    fn id(&self) -> &str {
        &self.id
    }

    async fn convert_request(
        &self,
        payload: serde_json::Value,
        from: Protocol,
        _to: Protocol,
        _ctx: &ExecutionContext,
    ) -> Result<ChatRequest> {
        match from {
            Protocol::OpenAi | Protocol::Canonical => serde_json::from_value(payload)
                .map_err(|err| RelayError::InvalidRequest(format!("malformed request: {err}"))),
            Protocol::Anthropic => Self::anthropic_request(payload),
        }
    }

    async fn convert_response(
        &self,
        response: ChatResponse,
        _from: Protocol,
        to: Protocol,
        _ctx: &ExecutionContext,
    ) -> Result<serde_json::Value> {
        match to {
            Protocol::OpenAi => Ok(Self::openai_response(&response)),
            Protocol::Anthropic => Ok(Self::anthropic_response(&response)),
            Protocol::Canonical => serde_json::to_value(&response)
                .map_err(|err| RelayError::Internal(err.to_string())),
        }
    }

    fn status(&self) -> ModuleStatus {
        ModuleStatus::healthy(&self.id, ModuleKind::ProtocolSwitch)
    }
}

/// Workflow that buffers streaming intent: streaming requests run
/// non-streaming against the upstream and are marked for reassembly on the
/// way out.
pub struct BufferingWorkflow {
    id: String,
}

impl BufferingWorkflow {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Workflow for BufferingWorkflow {
    fn id(&self) -> &str {
        &self.id
    }

    async fn collapse_streaming(
        &self,
        mut request: ChatRequest,
        _ctx: &ExecutionContext,
    ) -> Result<ChatRequest> {
        if request.stream {
            request.stream = false;
            request
                .metadata
                .insert("buffered".to_string(), serde_json::Value::Bool(true));
        }
        Ok(request)
    }

    async fn reassemble_streaming(
        &self,
        mut response: ChatResponse,
        wanted_streaming: bool,
        _ctx: &ExecutionContext,
    ) -> Result<ChatResponse> {
        if wanted_streaming {
            response
                .metadata
                .insert("reassembled_stream".to_string(), serde_json::Value::Bool(true));
        }
        Ok(response)
    }

    fn status(&self) -> ModuleStatus {
        ModuleStatus::healthy(&self.id, ModuleKind::Workflow)
    }
}

/// Per-provider field renames and model aliases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldMap {
    /// Canonical key -> provider key, applied to outbound payloads.
    #[serde(default)]
    pub request_renames: HashMap<String, String>,
    /// Provider key -> canonical key, applied to inbound payloads.
    #[serde(default)]
    pub response_renames: HashMap<String, String>,
    /// Canonical model name -> provider model name.
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,
}

/// Compatibility module driven by per-provider rename tables. Providers
/// without a table get the canonical shape untouched.
pub struct FieldMapCompatibility {
    id: String,
    maps: HashMap<String, FieldMap>,
}

impl FieldMapCompatibility {
    pub fn new(id: impl Into<String>, maps: HashMap<String, FieldMap>) -> Self {
        Self {
            id: id.into(),
            maps,
        }
    }

    fn map_for(&self, provider_id: &str) -> FieldMap {
        self.maps.get(provider_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Compatibility for FieldMapCompatibility {
    fn id(&self) -> &str {
        &self.id
    }

    async fn map_request(
        &self,
        request: ChatRequest,
        provider_id: &str,
        _ctx: &ExecutionContext,
    ) -> Result<ProviderRequest> {
        let map = self.map_for(provider_id);
        let model = map
            .model_aliases
            .get(&request.model)
            .cloned()
            .unwrap_or_else(|| request.model.clone());
        let stream = request.stream;

        let mut payload =
            serde_json::to_value(&request).map_err(|err| RelayError::Internal(err.to_string()))?;
        if let serde_json::Value::Object(ref mut fields) = payload {
            fields.insert("model".to_string(), serde_json::Value::String(model.clone()));
            for (canonical, provider_key) in &map.request_renames {
                if let Some(value) = fields.remove(canonical) {
                    fields.insert(provider_key.clone(), value);
                }
            }
        }

        Ok(ProviderRequest {
            model,
            payload,
            stream,
        })
    }

    async fn map_response(
        &self,
        response: ProviderResponse,
        provider_id: &str,
        _ctx: &ExecutionContext,
    ) -> Result<ChatResponse> {
        let map = self.map_for(provider_id);
        let mut payload = response.payload;
        if let serde_json::Value::Object(ref mut fields) = payload {
            for (provider_key, canonical) in &map.response_renames {
                if let Some(value) = fields.remove(provider_key) {
                    fields.insert(canonical.clone(), value);
                }
            }
        }

        let content = payload
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayError::Upstream {
                status: 502,
                message: format!("provider '{provider_id}' response missing content"),
                retry_after_ms: None,
            })?
            .to_string();
        let model = payload
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let finish_reason = payload
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .unwrap_or("stop")
            .to_string();
        let usage: Usage = payload
            .get("usage")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .unwrap_or_default()
            .unwrap_or_default();

        let mut chat_response = ChatResponse::new(model, content, usage);
        chat_response.finish_reason = finish_reason;
        Ok(chat_response)
    }

    fn status(&self) -> ModuleStatus {
        ModuleStatus::healthy(&self.id, ModuleKind::Compatibility)
    }
}
