//! Decides whether a reflective prompt should be offered on the latest assistant message.
//!
//! [`decide`] is pure apart from the injected random source; caching and scheduling live in
//! [`crate::engine`].

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::MetacognitiveConfig;
use crate::message::{Message, MetacognitiveEvent, MetacognitiveKind, Role};
use crate::persona::PersonaRef;
use crate::tree::{ConversationTree, TreeError};

pub const PERSONA_PLACEHOLDER: &str = "{{personaName}}";

/// Per-conversation gate state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateState {
    /// Assistant messages required since the last reset point.
    pub target_frequency: Option<u32>,
    /// The user dismissed the prompt on this message.
    pub dismissed_for_message_id: Option<String>,
    /// Message that most recently showed a prompt, possibly on another branch.
    pub last_prompted_at_message_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersonaContext {
    pub active_personas: Vec<String>,
    pub personas: Vec<PersonaRef>,
}

/// A prompt to show on `message_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    #[serde(rename = "type")]
    pub kind: MetacognitiveKind,
    pub prompt_text: String,
    pub trigger_frequency: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_persona_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_persona_name: Option<String>,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_message_id: Option<String>,
}

impl Decision {
    /// Rebuild the decision a persisted event stands for.
    pub fn from_event(message_id: &str, event: &MetacognitiveEvent) -> Self {
        Self {
            kind: event.kind,
            prompt_text: event.prompt_text.clone(),
            trigger_frequency: event.trigger_frequency,
            suggested_persona_id: event.suggested_persona_id.clone(),
            suggested_persona_name: event.suggested_persona_name.clone(),
            message_id: message_id.to_string(),
            linked_message_id: event.linked_message_id.clone(),
        }
    }

    /// The not-yet-accepted event recorded when this decision is shown.
    pub fn to_event(&self, timestamp: DateTime<Utc>) -> MetacognitiveEvent {
        MetacognitiveEvent {
            kind: self.kind,
            prompt_text: self.prompt_text.clone(),
            trigger_frequency: self.trigger_frequency,
            suggested_persona_id: self.suggested_persona_id.clone(),
            suggested_persona_name: self.suggested_persona_name.clone(),
            accepted: false,
            timestamp,
            linked_message_id: None,
        }
    }
}

/// Index of the most recent message after which the assistant counter restarts.
fn reset_point(messages: &[&Message], last_prompted: Option<&str>) -> Option<usize> {
    messages.iter().rposition(|m| {
        !m.metacognitive_events.is_empty()
            || m.persona_responses.len() > 1
            || last_prompted.is_some_and(|id| m.id == id || m.children.iter().any(|c| c == id))
    })
}

/// Whether another child of `message`'s parent already had a perspective prompt accepted.
/// Only siblings present in `messages` are considered.
fn sibling_accepted_perspective(messages: &[&Message], message: &Message) -> bool {
    let parent = match message
        .parent_id()
        .and_then(|pid| messages.iter().find(|m| m.id == pid))
    {
        Some(p) => p,
        None => return false,
    };
    parent
        .children
        .iter()
        .filter(|id| **id != message.id)
        .filter_map(|id| messages.iter().find(|m| &m.id == id))
        .any(|sibling| {
            sibling
                .metacognitive_events
                .iter()
                .any(|e| e.kind == MetacognitiveKind::Perspective && e.accepted)
        })
}

fn suggest_persona<'a, R: Rng + ?Sized>(
    current: Option<&str>,
    ctx: &'a PersonaContext,
    rng: &mut R,
) -> Option<&'a PersonaRef> {
    let candidates: Vec<&PersonaRef> = ctx
        .personas
        .iter()
        .filter(|p| !p.id.is_empty())
        .filter(|p| !ctx.active_personas.contains(&p.id))
        .filter(|p| current != Some(p.id.as_str()))
        .collect();
    candidates.choose(rng).copied()
}

/// Substitute `name` for every placeholder. The name is inserted literally.
pub fn render_perspective(template: &str, name: &str) -> String {
    template.replace(PERSONA_PLACEHOLDER, name)
}

/// Decide whether the last of `messages` gets a prompt, and which one.
pub fn decide<R: Rng + ?Sized>(
    messages: &[&Message],
    config: &MetacognitiveConfig,
    state: &GateState,
    ctx: &PersonaContext,
    rng: &mut R,
) -> Option<Decision> {
    if !config.enabled() {
        return None;
    }
    let target = state.target_frequency.filter(|&f| f > 0)?;

    let last = *messages.last()?;
    if last.role != Role::Assistant
        || !last.metacognitive_events.is_empty()
        || state.dismissed_for_message_id.as_deref() == Some(last.id.as_str())
    {
        return None;
    }
    if sibling_accepted_perspective(messages, last) {
        return None;
    }

    let start = reset_point(messages, state.last_prompted_at_message_id.as_deref())
        .map_or(0, |i| i + 1);
    let since_reset = messages[start..]
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .count();
    if since_reset < target as usize {
        return None;
    }

    let current_speaker = match last.persona_responses.as_slice() {
        [only] => Some(only.persona_id.as_str()),
        _ => None,
    };
    let suggested = suggest_persona(current_speaker, ctx, rng);

    let mut options = Vec::with_capacity(2);
    if suggested.is_some() && !config.perspective_prompts.is_empty() {
        options.push(MetacognitiveKind::Perspective);
    }
    if !config.comprehension_prompts.is_empty() {
        options.push(MetacognitiveKind::Comprehension);
    }

    let decision = match options.choose(rng)? {
        MetacognitiveKind::Perspective => {
            let persona = suggested?;
            let name = persona.name.clone().unwrap_or_else(|| persona.id.clone());
            let template = config.perspective_prompts.choose(rng)?;
            Decision {
                kind: MetacognitiveKind::Perspective,
                prompt_text: render_perspective(template, &name),
                trigger_frequency: target,
                suggested_persona_id: Some(persona.id.clone()),
                suggested_persona_name: Some(name),
                message_id: last.id.clone(),
                linked_message_id: None,
            }
        }
        MetacognitiveKind::Comprehension => Decision {
            kind: MetacognitiveKind::Comprehension,
            prompt_text: config.comprehension_prompts.choose(rng)?.clone(),
            trigger_frequency: target,
            suggested_persona_id: None,
            suggested_persona_name: None,
            message_id: last.id.clone(),
            linked_message_id: None,
        },
    };
    Some(decision)
}

/// Pick the next target frequency uniformly from the configured list.
pub fn select_frequency<R: Rng + ?Sized>(config: &MetacognitiveConfig, rng: &mut R) -> Option<u32> {
    config.frequencies.choose(rng).copied()
}

/// Record that `decision` was shown on `message`. Events are append-only, so a message that
/// already has one is left untouched and `false` is returned.
pub fn mark_shown(message: &mut Message, decision: &Decision, timestamp: DateTime<Utc>) -> bool {
    if message.role != Role::Assistant || !message.metacognitive_events.is_empty() {
        return false;
    }
    message.metacognitive_events.push(decision.to_event(timestamp));
    true
}

/// [`mark_shown`] on the decision's message inside `tree`.
pub fn record_shown(
    tree: &mut ConversationTree,
    decision: &Decision,
    timestamp: DateTime<Utc>,
) -> Result<bool, TreeError> {
    let message = tree.require_mut(&decision.message_id)?;
    Ok(mark_shown(message, decision, timestamp))
}
