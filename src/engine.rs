//! Stateful layer around [`gate::decide`]: settle delay, per-message memo, and the
//! dismiss/accept actions on a shown prompt.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::config::MetacognitiveConfig;
use crate::gate::{self, Decision, GateState, PersonaContext};
use crate::message::{Message, MetacognitiveKind, Role};

/// Request to open a persona-branch from a user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRequest {
    pub user_message_id: String,
    pub persona_id: String,
    pub decision: Decision,
}

/// What accepting a perspective prompt leads to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptAction {
    Branch(BranchRequest),
    /// The branch already exists; show this message.
    Navigate { message_id: String },
}

struct EngineState {
    gate: GateState,
    personas: PersonaContext,
    /// Latest visible message path.
    messages: Vec<Message>,
    busy: bool,
    memo: HashMap<String, Option<Decision>>,
    last_count: usize,
    last_processed: Option<String>,
    active: Option<Decision>,
    rng: StdRng,
}

struct Shared {
    config: MetacognitiveConfig,
    state: Mutex<EngineState>,
    shown: mpsc::UnboundedSender<Decision>,
}

pub struct MetacognitiveEngine {
    shared: Arc<Shared>,
    settle: crate::timer::SlotTimer,
}

impl MetacognitiveEngine {
    /// Create an engine. Every prompt it shows is also sent on the returned receiver so the
    /// caller can persist it.
    pub fn new(
        config: MetacognitiveConfig,
        gate: GateState,
    ) -> (Self, mpsc::UnboundedReceiver<Decision>) {
        Self::with_rng(config, gate, StdRng::from_entropy())
    }

    pub fn with_rng(
        config: MetacognitiveConfig,
        gate: GateState,
        rng: StdRng,
    ) -> (Self, mpsc::UnboundedReceiver<Decision>) {
        let (shown, rx) = mpsc::unbounded_channel();
        let state = EngineState {
            gate,
            personas: PersonaContext::default(),
            messages: Vec::new(),
            busy: false,
            memo: HashMap::new(),
            last_count: 0,
            last_processed: None,
            active: None,
            rng,
        };
        let engine = Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(state),
                shown,
            }),
            settle: crate::timer::SlotTimer::new(),
        };
        (engine, rx)
    }

    pub async fn set_personas(&self, personas: PersonaContext) {
        self.shared.state.lock().await.personas = personas;
    }

    pub async fn set_target_frequency(&self, frequency: u32) {
        self.shared.state.lock().await.gate.target_frequency = Some(frequency);
    }

    pub async fn gate_state(&self) -> GateState {
        self.shared.state.lock().await.gate.clone()
    }

    /// Prompt currently on screen, if any.
    pub async fn active(&self) -> Option<Decision> {
        self.shared.state.lock().await.active.clone()
    }

    /// Feed the latest visible path. `busy` is true while a response is loading or pending.
    ///
    /// When the last message is an idle assistant reply without a prompt, evaluation is
    /// scheduled after the settle delay. Any earlier pending evaluation is cancelled.
    pub async fn observe(&mut self, messages: Vec<Message>, busy: bool) {
        if !self.shared.config.enabled() {
            self.settle.cancel();
            self.shared.state.lock().await.active = None;
            return;
        }

        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;

        if messages.len() < state.last_count {
            debug!(previous = state.last_count, current = messages.len(), "message list shrank, clearing prompt memo");
            state.memo.clear();
        }
        state.last_count = messages.len();
        for m in messages.iter().filter(|m| m.role == Role::Assistant) {
            if let Some(event) = m.metacognitive_events.last() {
                state
                    .memo
                    .entry(m.id.clone())
                    .or_insert_with(|| Some(Decision::from_event(&m.id, event)));
            }
        }
        state.busy = busy;
        state.messages = messages;

        let last = match state.messages.last() {
            Some(m) if m.role == Role::Assistant => m,
            _ => {
                state.active = None;
                self.settle.cancel();
                return;
            }
        };
        let last_id = last.id.clone();
        let has_events = !last.metacognitive_events.is_empty();

        if state.active.as_ref().is_some_and(|d| d.message_id != last_id) {
            state.active = None;
        }
        if busy {
            self.settle.cancel();
            return;
        }
        if has_events {
            state.last_processed = Some(last_id);
            return;
        }
        if state.last_processed.as_deref() == Some(last_id.as_str()) {
            return;
        }
        drop(guard);

        let shared = Arc::clone(&self.shared);
        self.settle.schedule(self.shared.config.settle_delay(), async move {
            if let Some(decision) = evaluate_settled(&shared, &last_id).await {
                let _ = shared.shown.send(decision);
            }
        });
    }

    /// Evaluate the current last message right away, skipping the settle delay.
    pub async fn evaluate(&mut self) -> Option<Decision> {
        self.settle.cancel();
        let mut guard = self.shared.state.lock().await;
        let decision = evaluate_locked(&self.shared.config, &mut guard)?;
        let _ = self.shared.shown.send(decision.clone());
        Some(decision)
    }

    /// Hide the prompt on `message_id` and never show one there again.
    pub async fn dismiss(&self, message_id: &str) {
        let mut state = self.shared.state.lock().await;
        state.gate.dismissed_for_message_id = Some(message_id.to_string());
        if state.active.as_ref().is_some_and(|d| d.message_id == message_id) {
            state.active = None;
        }
    }

    /// Accept the perspective prompt on `message_id` (the last message when `None`).
    ///
    /// The persisted event is marked accepted. Returns `None` for comprehension prompts or
    /// when no preceding user message exists.
    pub async fn accept(&self, message_id: Option<&str>) -> Option<AcceptAction> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;

        let target_idx = message_id
            .and_then(|id| state.messages.iter().position(|m| m.id == id))
            .or_else(|| state.messages.len().checked_sub(1))?;

        let target = &mut state.messages[target_idx];
        let mut decision = match target
            .metacognitive_events
            .iter_mut()
            .find(|e| e.kind == MetacognitiveKind::Perspective)
        {
            Some(event) => {
                event.accepted = true;
                Some(Decision::from_event(&target.id, event))
            }
            None => None,
        };
        if decision.is_none() {
            decision = state
                .active
                .clone()
                .filter(|d| message_id.map_or(true, |id| d.message_id == id));
        }
        let decision = decision.filter(|d| d.kind == MetacognitiveKind::Perspective)?;

        if let Some(linked) = &decision.linked_message_id {
            return Some(AcceptAction::Navigate {
                message_id: linked.clone(),
            });
        }

        let user_message_id = state.messages[..=target_idx]
            .iter()
            .rev()
            .find(|m| m.role == Role::User)?
            .id
            .clone();
        let persona_id = decision.suggested_persona_id.clone()?;

        if target_idx + 1 == state.messages.len() {
            state.gate.dismissed_for_message_id = Some(state.messages[target_idx].id.clone());
        }
        info!(user_message_id = %user_message_id, persona_id = %persona_id, "perspective prompt accepted");
        Some(AcceptAction::Branch(BranchRequest {
            user_message_id,
            persona_id,
            decision,
        }))
    }
}

async fn evaluate_settled(shared: &Shared, expected_id: &str) -> Option<Decision> {
    let mut guard = shared.state.lock().await;
    if guard.busy || guard.messages.last().map(|m| m.id.as_str()) != Some(expected_id) {
        return None;
    }
    evaluate_locked(&shared.config, &mut guard)
}

/// Run the gate on the last message, reusing the memoized outcome when there is one, and
/// record the prompt as shown.
fn evaluate_locked(config: &MetacognitiveConfig, state: &mut EngineState) -> Option<Decision> {
    let last = state.messages.last()?;
    let last_id = last.id.clone();
    state.last_processed = Some(last_id.clone());
    if !last.metacognitive_events.is_empty() {
        return None;
    }

    let decision = match state.memo.get(&last_id) {
        Some(memoized) => memoized.clone(),
        None => {
            let refs: Vec<&Message> = state.messages.iter().collect();
            let decided = gate::decide(&refs, config, &state.gate, &state.personas, &mut state.rng);
            state.memo.insert(last_id.clone(), decided.clone());
            decided
        }
    };

    let decision = match decision {
        Some(d) if d.message_id == last_id => d,
        _ => {
            state.active = None;
            return None;
        }
    };

    if let Some(last) = state.messages.last_mut() {
        gate::mark_shown(last, &decision, Utc::now());
    }
    state.gate.last_prompted_at_message_id = Some(last_id);
    if let Some(next) = gate::select_frequency(config, &mut state.rng) {
        state.gate.target_frequency = Some(next);
    }
    info!(
        message_id = %decision.message_id,
        kind = ?decision.kind,
        next_target = ?state.gate.target_frequency,
        "metacognitive prompt shown"
    );
    state.active = Some(decision.clone());
    Some(decision)
}
