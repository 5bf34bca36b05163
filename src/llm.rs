use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::generate::{EventStream, Generate, GenerationError, GenerationRequest, PromptMessage};
use crate::message::Role;
use crate::update::UpdateEvent;

/// Text generator backed by an Anthropic-compatible messages API.
///
/// The endpoint answers in one piece; the reply is surfaced as a single stream token
/// followed by the final answer.
pub struct LLMClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    content: Vec<ContentBlock>,
    model: Option<String>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
    thinking: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorDetail>,
    msg: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

impl LLMClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self, GenerationError> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(120)).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens: 1024,
        })
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Create client from `LLM_BASE_URL`, `LLM_API_KEY` and `LLM_MODEL`. Returns `None`
    /// when the endpoint or key is unset.
    pub fn from_env() -> Option<Result<Self, GenerationError>> {
        let base_url = std::env::var("LLM_BASE_URL").ok()?;
        let api_key = std::env::var("LLM_API_KEY").ok()?;
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "glm-4.7".to_string());
        Some(Self::new(&base_url, &api_key, &model))
    }

    fn build_request(&self, request: &GenerationRequest) -> ChatRequest {
        let mut system: Vec<&str> = request.system_prompt.iter().map(String::as_str).collect();
        let mut messages = Vec::with_capacity(request.messages.len());
        for PromptMessage { role, content, .. } in request.messages.iter() {
            match role {
                Role::System => system.push(content),
                Role::User | Role::Assistant => messages.push(ChatMessage {
                    role: if *role == Role::User { "user" } else { "assistant" }.to_string(),
                    content: content.clone(),
                }),
            }
        }
        ChatRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: if system.is_empty() {
                None
            } else {
                Some(system.join("\n\n"))
            },
            messages,
        }
    }
}

fn api_error(status: reqwest::StatusCode, body: &str) -> GenerationError {
    let detail = serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|err| err.msg.or_else(|| err.error.and_then(|e| e.message)))
        .unwrap_or_else(|| body.to_string());
    GenerationError::Upstream(format!("LLM API error {}: {}", status, detail))
}

/// Events for one completed reply: reasoning, the text as a single token, then the final
/// answer. A reply cut off by the token limit is marked interrupted.
fn reply_events(response: ChatResponse) -> Vec<UpdateEvent> {
    let mut events = Vec::new();
    let mut text = String::new();
    for block in response.content {
        match block.content_type.as_str() {
            "text" => text.push_str(block.text.as_deref().unwrap_or_default()),
            "thinking" => {
                if let Some(thinking) = block.thinking {
                    events.push(UpdateEvent::reasoning_token(thinking));
                }
            }
            _ => {}
        }
    }
    let interrupted = response.stop_reason.as_deref() == Some("max_tokens");
    if !text.is_empty() {
        events.push(UpdateEvent::stream(text.clone()));
    }
    events.push(UpdateEvent::final_answer(text, interrupted));
    events
}

#[async_trait]
impl Generate for LLMClient {
    async fn generate(&self, request: GenerationRequest) -> Result<EventStream, GenerationError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request(&request);

        info!(
            model = %self.model,
            conversation_id = %request.conversation_id,
            messages = body.messages.len(),
            "sending LLM request"
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(api_error(status, &text));
        }

        let reply: ChatResponse = serde_json::from_str(&text)?;
        if let Some(usage) = &reply.usage {
            info!(
                model = %reply.model.as_deref().unwrap_or(&self.model),
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "LLM response received"
            );
        }

        let events = reply_events(reply).into_iter().map(Ok);
        Ok(futures::stream::iter(events).boxed())
    }
}
