//! One user turn on the serving side: choose the node to write into, run every persona,
//! apply and forward each event, persist.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::applier::StreamApplier;
use crate::message::{BranchedFrom, Message, MessageFile, NewMessage, PersonaResponse, Role};
use crate::orchestrator::Orchestrator;
use crate::persona::Persona;
use crate::store::{Persist, StoreError};
use crate::tree::{Conversation, ConversationTree, TreeError};
use crate::update::UpdateEvent;
use crate::wire::{encode_line, WireError};

pub const NO_OUTPUT: &str = "No output was generated from any persona. Something went wrong.";

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("can only continue the last message")]
    NotLastMessage,
    #[error("parent message id is required")]
    ParentRequired,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// What the client asked for.
#[derive(Debug, Clone)]
pub enum WriteRequest {
    /// A new user message under `parent_id` followed by an empty reply.
    New {
        parent_id: Option<String>,
        prompt: String,
        files: Vec<MessageFile>,
    },
    /// Keep writing into an existing leaf.
    Continue { message_id: String },
    /// Regenerate. With a prompt on a user message this edits the input; with `persona_id`
    /// on an assistant message only that persona is regenerated.
    Retry {
        message_id: String,
        prompt: Option<String>,
        files: Vec<MessageFile>,
        persona_id: Option<String>,
    },
}

/// Where a turn writes and what it is prompted with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePlan {
    pub target_id: String,
    /// Root-to-leaf ids that make up the prompt history.
    pub prompt_ids: Vec<String>,
    /// Persona to regenerate, and the message its previous answers come from.
    pub persona_retry: Option<(String, String)>,
    /// Branch to switch back to when an edited message belonged to one.
    pub restored_branch: Option<BranchedFrom>,
    /// Node the view should move to, when different from the target.
    pub navigate_to: Option<String>,
}

impl WritePlan {
    fn new(target_id: String, prompt_leaf: &str, tree: &ConversationTree) -> Result<Self, TreeError> {
        let prompt_ids = tree
            .build_subtree(prompt_leaf)?
            .iter()
            .map(|m| m.id.clone())
            .collect();
        Ok(Self {
            target_id,
            prompt_ids,
            persona_retry: None,
            restored_branch: None,
            navigate_to: None,
        })
    }
}

/// Create the nodes a turn needs and decide its write target.
///
/// `branch` is the branch the user is currently in; new nodes are tagged with it, and
/// retries fall back to the retried message's own tag.
pub fn prepare_write(
    tree: &mut ConversationTree,
    request: WriteRequest,
    branch: Option<BranchedFrom>,
) -> Result<WritePlan, TurnError> {
    match request {
        WriteRequest::New {
            parent_id,
            prompt,
            files,
        } => {
            if parent_id.is_none() && !tree.is_empty() {
                return Err(TurnError::ParentRequired);
            }
            let user_id = tree.add_child(
                NewMessage::user(prompt)
                    .files(files)
                    .branched_from(branch.clone()),
                parent_id.as_deref(),
            )?;
            let target = tree.add_child(NewMessage::assistant().branched_from(branch), Some(&user_id))?;
            Ok(WritePlan::new(target, &user_id, tree)?)
        }
        WriteRequest::Continue { message_id } => {
            if !tree.require(&message_id)?.children.is_empty() {
                return Err(TurnError::NotLastMessage);
            }
            Ok(WritePlan::new(message_id.clone(), &message_id, tree)?)
        }
        WriteRequest::Retry {
            message_id,
            prompt,
            files,
            persona_id,
        } => {
            let original = tree.require(&message_id)?;
            let role = original.role;
            let inherited = branch.clone().or_else(|| original.branched_from.clone());

            match (role, prompt) {
                (Role::User, Some(prompt)) => {
                    let restored = match (&branch, &original.branched_from) {
                        (None, Some(b)) => Some(b.clone()),
                        _ => None,
                    };
                    let user_id = tree.add_sibling(
                        NewMessage::user(prompt)
                            .files(files)
                            .branched_from(inherited.clone()),
                        &message_id,
                    )?;
                    let seed = inherited
                        .as_ref()
                        .map(|b| vec![PersonaResponse::empty(b.persona_id.clone(), "")])
                        .unwrap_or_default();
                    let target = tree.add_child(
                        NewMessage::assistant()
                            .branched_from(inherited)
                            .persona_responses(seed),
                        Some(&user_id),
                    )?;
                    let mut plan = WritePlan::new(target, &user_id, tree)?;
                    if restored.is_some() {
                        plan.navigate_to = Some(user_id);
                    }
                    plan.restored_branch = restored;
                    Ok(plan)
                }
                (Role::User, None) => {
                    let target = tree.add_child(
                        NewMessage::assistant().branched_from(inherited),
                        Some(&message_id),
                    )?;
                    Ok(WritePlan::new(target, &message_id, tree)?)
                }
                _ => {
                    let target = tree.add_sibling(
                        NewMessage::assistant().branched_from(inherited),
                        &message_id,
                    )?;
                    let mut plan = WritePlan::new(target, &message_id, tree)?;
                    // The answer being replaced is not part of the prompt.
                    plan.prompt_ids.pop();
                    plan.persona_retry = persona_id.map(|p| (p, message_id));
                    Ok(plan)
                }
            }
        }
    }
}

/// Strip `<think>` markers from a generated title.
pub fn sanitize_title(title: &str) -> String {
    const MARKERS: [&str; 2] = ["<think>", "</think>"];
    // ASCII lowercasing keeps byte offsets aligned with `title`.
    let lower = title.to_ascii_lowercase();
    let mut out = String::with_capacity(title.len());
    let mut i = 0;
    while let Some(ch) = title[i..].chars().next() {
        match MARKERS.iter().find(|m| lower[i..].starts_with(*m)) {
            Some(marker) => i += marker.len(),
            None => {
                out.push(ch);
                i += ch.len_utf8();
            }
        }
    }
    out.trim().to_string()
}

/// How a turn ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnSummary {
    pub message_id: String,
    pub title: String,
    pub error: Option<String>,
    /// The client went away before the turn finished.
    pub detached: bool,
}

pub struct TurnRunner {
    orchestrator: Orchestrator,
    persist: Arc<dyn Persist>,
}

impl TurnRunner {
    pub fn new(orchestrator: Orchestrator, persist: Arc<dyn Persist>) -> Self {
        Self {
            orchestrator,
            persist,
        }
    }

    /// Run the turn described by `plan`, writing NDJSON lines to `sink`.
    ///
    /// `active` are the personas answering a normal turn; a persona retry looks its persona
    /// up in `all_personas`. The conversation is persisted once at the end, or as soon as
    /// the sink closes.
    pub async fn run(
        &self,
        conversation: &mut Conversation,
        plan: &WritePlan,
        active: &[Persona],
        all_personas: &[Persona],
        sink: mpsc::Sender<String>,
    ) -> Result<TurnSummary, TurnError> {
        let mut summary = TurnSummary {
            message_id: plan.target_id.clone(),
            ..Default::default()
        };

        let started = encode_line(&UpdateEvent::started(Some(plan.target_id.clone())))?;
        if sink.send(started).await.is_err() {
            return self.detach(conversation, summary).await;
        }

        let personas = self.seed_responses(conversation, plan, active, all_personas)?;

        let history: Vec<Message> = plan
            .prompt_ids
            .iter()
            .map(|id| conversation.tree.require(id).cloned())
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|m| m.role != Role::System)
            .collect();

        let cancel = CancellationToken::new();
        let mut events =
            self.orchestrator
                .run(conversation.id.clone(), history, personas, cancel.clone());
        let mut applier = StreamApplier::immediate(plan.target_id.clone()).without_error_fallback();

        while let Some(event) = events.next().await {
            let event = match event {
                UpdateEvent::Title { title } => {
                    let title = sanitize_title(&title);
                    conversation.title = title.clone();
                    UpdateEvent::Title { title }
                }
                other => other,
            };
            applier.apply(&mut conversation.tree, event.clone())?;
            if sink.send(encode_line(&event)?).await.is_err() {
                cancel.cancel();
                drop(events);
                summary.error = applier.outcome().error.clone();
                return self.detach(conversation, summary).await;
            }
        }
        applier.finish(&mut conversation.tree)?;
        summary.error = applier.outcome().error.clone();

        let has_output = conversation
            .tree
            .require(&plan.target_id)?
            .persona_responses
            .iter()
            .any(|r| !r.content.is_empty());
        if summary.error.is_none() && !has_output {
            warn!(conversation_id = %conversation.id, message_id = %plan.target_id, "no persona produced output");
            let event = UpdateEvent::error(NO_OUTPUT);
            applier.apply(&mut conversation.tree, event.clone())?;
            summary.error = Some(NO_OUTPUT.to_string());
            if sink.send(encode_line(&event)?).await.is_err() {
                info!(conversation_id = %conversation.id, "client detached during message streaming");
                summary.detached = true;
            }
        }

        self.save(conversation).await?;
        summary.title = conversation.title.clone();
        Ok(summary)
    }

    /// Initialize the target's persona slots and pick who answers.
    fn seed_responses(
        &self,
        conversation: &mut Conversation,
        plan: &WritePlan,
        active: &[Persona],
        all_personas: &[Persona],
    ) -> Result<Vec<Persona>, TurnError> {
        if let Some((persona_id, previous_id)) = &plan.persona_retry {
            let previous = conversation.tree.require(previous_id)?.persona_responses.clone();
            let seeded = previous
                .into_iter()
                .map(|pr| {
                    if &pr.persona_id == persona_id {
                        PersonaResponse {
                            persona_occupation: pr.persona_occupation,
                            persona_stance: pr.persona_stance,
                            ..PersonaResponse::empty(pr.persona_id, pr.persona_name)
                        }
                    } else {
                        pr
                    }
                })
                .collect();
            conversation.tree.require_mut(&plan.target_id)?.persona_responses = seeded;
            // A retry may pick any persona, including one outside the current branch.
            return Ok(all_personas
                .iter()
                .filter(|p| &p.id == persona_id)
                .cloned()
                .collect());
        }

        let target = conversation.tree.require_mut(&plan.target_id)?;
        if target.persona_responses.is_empty() {
            target.persona_responses = active
                .iter()
                .map(|p| {
                    let s = p.summary();
                    PersonaResponse {
                        persona_occupation: s.persona_occupation,
                        persona_stance: s.persona_stance,
                        ..PersonaResponse::empty(s.persona_id, s.persona_name)
                    }
                })
                .collect();
        }
        Ok(active.to_vec())
    }

    async fn detach(
        &self,
        conversation: &Conversation,
        mut summary: TurnSummary,
    ) -> Result<TurnSummary, TurnError> {
        info!(conversation_id = %conversation.id, "client detached during message streaming");
        self.save(conversation).await?;
        summary.detached = true;
        summary.title = conversation.title.clone();
        Ok(summary)
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), TurnError> {
        self.persist
            .persist(&conversation.id, conversation.tree.messages(), &conversation.title)
            .await
            .map_err(|e| {
                error!(conversation_id = %conversation.id, error = %e, "failed to persist conversation");
                TurnError::from(e)
            })
    }
}
