//! Collaborators used by the orchestrator: the black-box text generator and the one-shot
//! message preprocessor.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::message::{Message, MessageFile, Role};
use crate::update::UpdateEvent;

/// Mime type of text pasted from the clipboard and sent as an attachment.
pub const CLIPBOARD_MIME: &str = "application/vnd.chatui.clipboard";

pub const TRANSCRIPT_HEADER: &str = "--- Transcript of responses from participating personas ---";

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("preprocessing failed: {0}")]
    Preprocess(String),
}

pub type EventStream = BoxStream<'static, Result<UpdateEvent, GenerationError>>;

/// A message as handed to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
    pub files: Vec<MessageFile>,
}

/// Input for one generation task. The message list is shared read-only by every persona.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub conversation_id: String,
    pub messages: Arc<Vec<PromptMessage>>,
    pub system_prompt: Option<String>,
}

/// Produces an ordered sequence of update events for one prompt.
#[async_trait]
pub trait Generate: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<EventStream, GenerationError>;
}

/// Prepares conversation history for the model, once per user turn.
#[async_trait]
pub trait Preprocess: Send + Sync {
    async fn preprocess(
        &self,
        messages: &[Message],
        conversation_id: &str,
    ) -> Result<Vec<PromptMessage>, GenerationError>;
}

/// Inlines clipboard attachments and flattens multi-persona replies into a transcript so
/// every persona sees what the others said.
#[derive(Debug, Default, Clone)]
pub struct TranscriptPreprocessor;

impl TranscriptPreprocessor {
    fn inline_clipboard(
        content: String,
        files: &[MessageFile],
    ) -> Result<(String, Vec<MessageFile>), GenerationError> {
        let mut pasted = Vec::new();
        let mut kept = Vec::new();
        for file in files {
            if file.mime == CLIPBOARD_MIME {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(file.value.as_bytes())
                    .map_err(|e| GenerationError::Preprocess(format!("{}: {}", file.name, e)))?;
                pasted.push(String::from_utf8_lossy(&bytes).into_owned());
            } else {
                kept.push(file.clone());
            }
        }
        if pasted.is_empty() {
            return Ok((content, kept));
        }
        Ok((format!("{}\n\n{}", pasted.join("\n\n"), content), kept))
    }

    fn transcript(message: &Message) -> Option<String> {
        if message.persona_responses.is_empty() {
            return None;
        }
        let body = message
            .persona_responses
            .iter()
            .map(|pr| {
                let name = if pr.persona_name.is_empty() {
                    &pr.persona_id
                } else {
                    &pr.persona_name
                };
                format!("[{}]: {}", name, pr.content)
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        Some(format!("{}\n{}", TRANSCRIPT_HEADER, body))
    }
}

#[async_trait]
impl Preprocess for TranscriptPreprocessor {
    async fn preprocess(
        &self,
        messages: &[Message],
        _conversation_id: &str,
    ) -> Result<Vec<PromptMessage>, GenerationError> {
        messages
            .iter()
            .map(|m| -> Result<PromptMessage, GenerationError> {
                let (content, files) = Self::inline_clipboard(m.content.clone(), &m.files)?;
                let content = Self::transcript(m).unwrap_or(content);
                Ok(PromptMessage {
                    role: m.role,
                    content,
                    files,
                })
            })
            .collect()
    }
}

/// Offline generator that answers with the last prompt message. Useful for dry runs.
#[derive(Debug, Default, Clone)]
pub struct EchoGenerator;

#[async_trait]
impl Generate for EchoGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<EventStream, GenerationError> {
        let text = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let mut events: Vec<Result<UpdateEvent, GenerationError>> = text
            .split_inclusive(' ')
            .map(|w| Ok(UpdateEvent::stream(w)))
            .collect();
        events.push(Ok(UpdateEvent::final_answer(text, false)));
        Ok(futures::stream::iter(events).boxed())
    }
}
