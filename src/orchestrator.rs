//! Multi-persona generation.
//!
//! One user turn fans out to one generation task per persona. Every task writes tagged
//! events into a shared channel and the consumer forwards them as they arrive, so a slow
//! persona never holds back the others. The merged sequence is
//! `started, personaInit, <persona events...>, finished`.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::generate::{Generate, GenerationError, GenerationRequest, Preprocess};
use crate::message::Message;
use crate::persona::Persona;
use crate::update::{PersonaUpdate, PersonaUpdateType, ReasoningSubtype, Status, UpdateEvent};

pub const NO_PERSONAS: &str = "No personas provided";

enum Relay {
    Event(UpdateEvent),
    Done,
}

/// Identity stamped onto every event a persona task produces.
#[derive(Debug, Clone)]
struct PersonaTag {
    id: String,
    name: String,
    occupation: Option<String>,
    stance: Option<String>,
}

impl PersonaTag {
    fn new(persona: &Persona) -> Self {
        Self {
            id: persona.id.clone(),
            name: persona.name.clone(),
            occupation: persona.job_sector.clone(),
            stance: persona.stance.clone(),
        }
    }

    fn update(&self, update_type: PersonaUpdateType) -> PersonaUpdate {
        PersonaUpdate {
            persona_id: self.id.clone(),
            persona_name: self.name.clone(),
            persona_occupation: self.occupation.clone(),
            persona_stance: self.stance.clone(),
            update_type,
            token: None,
            text: None,
            interrupted: None,
            status: None,
            route: None,
            model: None,
            error: None,
        }
    }

    fn error(&self, message: impl Into<String>) -> UpdateEvent {
        UpdateEvent::Persona(PersonaUpdate {
            error: Some(message.into()),
            ..self.update(PersonaUpdateType::Status)
        })
    }

    /// Tag one event from this persona's generator. Non-error status events return `None`;
    /// conversation-level events (title, file) pass through untouched.
    fn wrap(&self, event: UpdateEvent) -> Option<UpdateEvent> {
        let wrapped = match event {
            UpdateEvent::Stream { token } => PersonaUpdate {
                token: Some(token),
                ..self.update(PersonaUpdateType::Stream)
            },
            UpdateEvent::FinalAnswer { text, interrupted } => PersonaUpdate {
                text: Some(text),
                interrupted: Some(interrupted),
                ..self.update(PersonaUpdateType::FinalAnswer)
            },
            UpdateEvent::Reasoning(r) => PersonaUpdate {
                token: if r.subtype == ReasoningSubtype::Stream {
                    r.token
                } else {
                    None
                },
                status: if r.subtype == ReasoningSubtype::Status {
                    r.status
                } else {
                    None
                },
                ..self.update(PersonaUpdateType::Reasoning)
            },
            UpdateEvent::RouterMetadata { route, model } => PersonaUpdate {
                route: Some(route),
                model: Some(model),
                ..self.update(PersonaUpdateType::RouterMetadata)
            },
            UpdateEvent::Status(s) if s.status == Status::Error => {
                return Some(
                    self.error(s.message.unwrap_or_else(|| "Unknown error".to_string())),
                )
            }
            UpdateEvent::Status(_) => return None,
            other => return Some(other),
        };
        Some(UpdateEvent::Persona(wrapped))
    }
}

pub struct Orchestrator {
    generator: Arc<dyn Generate>,
    preprocessor: Arc<dyn Preprocess>,
    channel_capacity: usize,
}

impl Orchestrator {
    pub fn new(generator: Arc<dyn Generate>, preprocessor: Arc<dyn Preprocess>) -> Self {
        Self {
            generator,
            preprocessor,
            channel_capacity: 64,
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Run one turn for `personas` over `messages`.
    ///
    /// Cancelling `cancel` stops every persona task; the stream then ends without a
    /// `finished` event. Dropping the stream aborts the tasks as well.
    pub fn run(
        &self,
        conversation_id: String,
        messages: Vec<Message>,
        personas: Vec<Persona>,
        cancel: CancellationToken,
    ) -> BoxStream<'static, UpdateEvent> {
        let generator = Arc::clone(&self.generator);
        let preprocessor = Arc::clone(&self.preprocessor);
        let capacity = self.channel_capacity;

        let stream = async_stream::stream! {
            if personas.is_empty() {
                error!(conversation_id = %conversation_id, "multi-persona generation called with no personas");
                yield UpdateEvent::error(NO_PERSONAS);
                return;
            }

            yield UpdateEvent::started(None);
            yield UpdateEvent::PersonaInit {
                personas: personas.iter().map(Persona::summary).collect(),
            };

            let prompt = match preprocessor.preprocess(&messages, &conversation_id).await {
                Ok(prompt) => Arc::new(prompt),
                Err(e) => {
                    error!(conversation_id = %conversation_id, error = %e, "preprocessing failed");
                    yield UpdateEvent::error(e.to_string());
                    return;
                }
            };

            let total = personas.len();
            let (tx, mut rx) = mpsc::channel::<Relay>(capacity);
            let mut tasks = JoinSet::new();
            for persona in personas {
                let request = GenerationRequest {
                    conversation_id: conversation_id.clone(),
                    messages: Arc::clone(&prompt),
                    system_prompt: Some(persona.system_prompt()),
                };
                tasks.spawn(run_persona(
                    Arc::clone(&generator),
                    PersonaTag::new(&persona),
                    request,
                    tx.clone(),
                    cancel.child_token(),
                ));
            }
            drop(tx);
            debug!(conversation_id = %conversation_id, personas = total, "persona tasks started");

            let mut completed = 0;
            while completed < total {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    relay = rx.recv() => relay,
                };
                match next {
                    Some(Relay::Event(event)) => yield event,
                    Some(Relay::Done) => completed += 1,
                    None => break,
                }
            }

            drop(rx);
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "persona task did not complete");
                }
            }

            if cancel.is_cancelled() {
                info!(conversation_id = %conversation_id, completed, total, "multi-persona generation cancelled");
                return;
            }
            yield UpdateEvent::finished();
        };
        stream.boxed()
    }
}

async fn run_persona(
    generator: Arc<dyn Generate>,
    tag: PersonaTag,
    request: GenerationRequest,
    tx: mpsc::Sender<Relay>,
    cancel: CancellationToken,
) {
    if let Err(e) = stream_persona(generator.as_ref(), &tag, request, &tx, &cancel).await {
        warn!(persona_id = %tag.id, error = %e, "persona generation failed");
        let _ = tx.send(Relay::Event(tag.error(e.to_string()))).await;
    }
    let _ = tx.send(Relay::Done).await;
}

async fn stream_persona(
    generator: &dyn Generate,
    tag: &PersonaTag,
    request: GenerationRequest,
    tx: &mpsc::Sender<Relay>,
    cancel: &CancellationToken,
) -> Result<(), GenerationError> {
    let mut events = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        started = generator.generate(request) => started?,
    };
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            item = events.next() => item,
        };
        let event = match item {
            Some(item) => item?,
            None => return Ok(()),
        };
        if let Some(wrapped) = tag.wrap(event) {
            if tx.send(Relay::Event(wrapped)).await.is_err() {
                return Ok(());
            }
        }
    }
}
