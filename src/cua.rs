//! HTTP inference service.
//!
//! Text-grammar models are reached through an OpenAI-compatible
//! `/chat/completions` endpoint. Structured-object models use the Responses
//! API with the hosted `computer_use_preview` tool: the initial turn sends
//! the prompt and screenshot, continuation turns send a
//! `computer_call_output` against `previous_response_id`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::config::ModelDescriptor;
use crate::decode::ProtocolKind;
use crate::gateway::{InferenceService, InvocationMode, ModelRequest, ModelResponse, ServiceError};

#[derive(Clone)]
pub struct HttpInferenceService {
    http: Client,
    /// Display size advertised to the computer-use tool.
    display: (u32, u32),
    environment: String,
}

impl HttpInferenceService {
    pub fn new(display: (u32, u32)) -> Result<Self, ServiceError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        Ok(Self { http, display, environment: "browser".into() })
    }

    fn tools(&self) -> Value {
        json!([{
            "type": "computer_use_preview",
            "display_width": self.display.0,
            "display_height": self.display.1,
            "environment": self.environment
        }])
    }

    async fn post(&self, model: &ModelDescriptor, path: &str, body: &Value) -> Result<Value, ServiceError> {
        let url = format!("{}/{}", model.base_url.trim_end_matches('/'), path);
        let mut req = self.http.post(url).json(body);
        if !model.api_key.is_empty() {
            req = req.bearer_auth(&model.api_key);
        }
        let resp = req.send().await.map_err(|e| ServiceError::Transport(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| ServiceError::Transport(e.to_string()))?;
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ServiceError::RateLimited(text));
        }
        if !status.is_success() {
            return Err(ServiceError::Status { status: status.as_u16(), body: text });
        }
        serde_json::from_str(&text).map_err(|e| ServiceError::Malformed(e.to_string()))
    }

    pub fn chat_body(model: &ModelDescriptor, request: &ModelRequest) -> Value {
        let mut content = vec![json!({ "type": "text", "text": request.prompt })];
        content.extend(request.images.iter().map(|img| {
            json!({ "type": "image_url", "image_url": { "url": data_url(img) } })
        }));
        json!({
            "model": model.model,
            "messages": [{ "role": "user", "content": content }],
            "max_tokens": model.max_tokens,
            "temperature": model.temperature
        })
    }

    pub fn responses_body(&self, model: &ModelDescriptor, request: &ModelRequest) -> Value {
        let screenshot = request.images.first().map(|img| data_url(img));
        match &request.mode {
            InvocationMode::Initial => {
                let mut content = vec![json!({ "type": "input_text", "text": request.prompt })];
                if let Some(url) = screenshot {
                    content.push(json!({ "type": "input_image", "image_url": url }));
                }
                json!({
                    "model": model.model,
                    "tools": self.tools(),
                    "input": [{ "role": "user", "content": content }],
                    "reasoning": { "summary": "concise" },
                    "truncation": "auto"
                })
            }
            InvocationMode::Continuation(state) => json!({
                "model": model.model,
                "previous_response_id": state.last_turn_id,
                "tools": self.tools(),
                "input": [{
                    "type": "computer_call_output",
                    "call_id": state.last_pending_call_id,
                    "output": { "type": "input_image", "image_url": screenshot.unwrap_or_default() },
                    "acknowledged_safety_checks": state.pending_safety_checks
                }],
                "truncation": "auto"
            }),
        }
    }
}

fn data_url(b64: &str) -> String {
    if b64.starts_with("data:") {
        b64.to_string()
    } else {
        format!("data:image/png;base64,{b64}")
    }
}

#[async_trait]
impl InferenceService for HttpInferenceService {
    async fn complete(
        &self,
        model: &ModelDescriptor,
        request: &ModelRequest,
    ) -> Result<ModelResponse, ServiceError> {
        match model.protocol {
            ProtocolKind::TextGrammar => {
                let v = self.post(model, "chat/completions", &Self::chat_body(model, request)).await?;
                let text = v
                    .pointer("/choices/0/message/content")
                    .and_then(|x| x.as_str())
                    .ok_or_else(|| ServiceError::Malformed("no choices[0].message.content".into()))?;
                Ok(ModelResponse::Text(text.to_string()))
            }
            ProtocolKind::StructuredObject => {
                debug!(model = %model.id, continuation = request.mode.is_continuation(), "responses call");
                let v = self.post(model, "responses", &self.responses_body(model, request)).await?;
                Ok(ModelResponse::Object(v))
            }
        }
    }
}
