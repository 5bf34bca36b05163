//! Applies an update-event sequence to one assistant node.
//!
//! Text arrives on independent channels (the global stream, the global reasoning stream and
//! one per persona). Each channel buffers tokens and commits them to the node when its
//! debounce window has passed since its previous commit. Terminal events commit whatever is
//! buffered regardless of timing.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::message::{FileRef, Message, MessageFile, PersonaResponse, RouterMetadata};
use crate::tree::{ConversationTree, TreeError};
use crate::update::{
    PersonaSummary, PersonaUpdate, PersonaUpdateType, ReasoningSubtype, Status, StatusUpdate,
    UpdateEvent,
};
use crate::wire::strip_nul;

#[derive(Debug, Default)]
struct Channel {
    buffer: String,
    last_flush: Option<Instant>,
}

impl Channel {
    fn push(&mut self, token: &str) {
        self.buffer.push_str(&strip_nul(token));
    }

    /// A channel with no clock yet is always due. The window is inclusive: a commit is due
    /// once `debounce` has fully elapsed.
    fn is_due(&self, now: Instant, debounce: Option<Duration>) -> bool {
        match (debounce, self.last_flush) {
            (Some(window), Some(last)) => now.duration_since(last) >= window,
            _ => true,
        }
    }

    fn take(&mut self, now: Instant) -> String {
        self.last_flush = Some(now);
        std::mem::take(&mut self.buffer)
    }
}

/// What a consumed sequence amounted to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutcome {
    /// Id of the target node after any reconciliation.
    pub message_id: String,
    pub title: Option<String>,
    /// Message of the last top-level error status.
    pub error: Option<String>,
    pub finished: bool,
    pub cancelled: bool,
}

#[derive(Debug)]
pub struct StreamApplier {
    target_id: String,
    debounce: Option<Duration>,
    global: Channel,
    reasoning: Channel,
    personas: HashMap<String, Channel>,
    outcome: StreamOutcome,
    error_fallback: bool,
}

enum Next {
    Event(UpdateEvent),
    Flush,
    End,
    Abort,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl StreamApplier {
    pub fn new(target_id: impl Into<String>, debounce: Duration) -> Self {
        Self::build(target_id.into(), Some(debounce))
    }

    /// An applier that commits every token as it arrives.
    pub fn immediate(target_id: impl Into<String>) -> Self {
        Self::build(target_id.into(), None)
    }

    /// Leave failed persona slots empty instead of filling them with `Error: <msg>`.
    ///
    /// Used where the stored content must only hold generated text, so an all-failed turn
    /// still reads as having no output.
    pub fn without_error_fallback(mut self) -> Self {
        self.error_fallback = false;
        self
    }

    fn build(target_id: String, debounce: Option<Duration>) -> Self {
        Self {
            outcome: StreamOutcome {
                message_id: target_id.clone(),
                ..Default::default()
            },
            target_id,
            debounce,
            // The global clock starts with the applier; the first token waits one window.
            global: Channel {
                last_flush: debounce.map(|_| Instant::now()),
                ..Default::default()
            },
            reasoning: Channel::default(),
            personas: HashMap::new(),
            error_fallback: true,
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn outcome(&self) -> &StreamOutcome {
        &self.outcome
    }

    /// Apply one event to the target node.
    pub fn apply(&mut self, tree: &mut ConversationTree, event: UpdateEvent) -> Result<(), TreeError> {
        let now = Instant::now();

        if let UpdateEvent::Status(StatusUpdate {
            status: Status::Started,
            message_id: Some(confirmed),
            ..
        }) = &event
        {
            if *confirmed != self.target_id {
                tree.reconcile_id(&self.target_id, confirmed)?;
                info!(old_id = %self.target_id, new_id = %confirmed, "adopted server message id");
                self.target_id = confirmed.clone();
                self.outcome.message_id = confirmed.clone();
            }
        }

        let message = tree.require_mut(&self.target_id)?;
        if !event.is_high_frequency() {
            message.updates.push(event.clone());
        }

        match event {
            UpdateEvent::Stream { token } => {
                self.global.push(&token);
                if self.global.is_due(now, self.debounce) {
                    message.content.push_str(&self.global.take(now));
                }
            }
            UpdateEvent::Reasoning(r) => {
                if r.subtype == ReasoningSubtype::Stream {
                    self.reasoning.push(r.token.as_deref().unwrap_or_default());
                    if self.reasoning.is_due(now, self.debounce) {
                        append_reasoning(&mut message.reasoning, &self.reasoning.take(now));
                    }
                }
            }
            UpdateEvent::FinalAnswer { text, interrupted } => {
                let pending = self.global.take(now);
                if text.is_empty() {
                    message.content.push_str(&pending);
                } else {
                    message.content = text;
                }
                append_reasoning(&mut message.reasoning, &self.reasoning.take(now));
                message.interrupted = Some(interrupted);
            }
            UpdateEvent::RouterMetadata { route, model } => {
                message.router_metadata = Some(RouterMetadata { route, model });
            }
            UpdateEvent::Title { title } => {
                self.outcome.title = Some(title);
            }
            UpdateEvent::File { name, sha, mime } => {
                if !message.files.iter().any(|f| f.value == sha) {
                    message.files.push(MessageFile {
                        kind: FileRef::Hash,
                        name,
                        value: sha,
                        mime,
                    });
                }
            }
            UpdateEvent::PersonaInit { personas } => merge_persona_init(message, personas),
            UpdateEvent::Persona(update) => self.apply_persona(message, update, now),
            UpdateEvent::Status(s) => match s.status {
                Status::Error => {
                    message.content.push_str(&self.global.take(now));
                    append_reasoning(&mut message.reasoning, &self.reasoning.take(now));
                    let reason = s.message.unwrap_or_else(|| "Unknown error".to_string());
                    warn!(message_id = %self.target_id, error = %reason, "generation reported an error");
                    self.outcome.error = Some(reason);
                }
                Status::Finished => {
                    self.flush_all(message, now);
                    self.outcome.finished = true;
                }
                Status::Started | Status::KeepAlive => {}
            },
        }

        message.updated_at = Some(Utc::now());
        Ok(())
    }

    fn apply_persona(&mut self, message: &mut Message, update: PersonaUpdate, now: Instant) {
        let channel = self.personas.entry(update.persona_id.clone()).or_default();
        let slot = persona_slot(message, &update);

        match update.update_type {
            PersonaUpdateType::Stream => {
                channel.push(update.token.as_deref().unwrap_or_default());
                if channel.is_due(now, self.debounce) {
                    slot.content.push_str(&channel.take(now));
                }
            }
            PersonaUpdateType::Reasoning => {
                if let Some(token) = update.token {
                    append_reasoning(&mut slot.reasoning, &strip_nul(&token));
                }
            }
            PersonaUpdateType::RouterMetadata => {
                slot.router_metadata = Some(RouterMetadata {
                    route: update.route.unwrap_or_default(),
                    model: update.model.unwrap_or_default(),
                });
            }
            PersonaUpdateType::FinalAnswer => {
                let pending = channel.take(now);
                match update.text.filter(|t| !t.is_empty()) {
                    Some(text) => slot.content = text,
                    None => slot.content.push_str(&pending),
                }
                slot.interrupted = update.interrupted;
            }
            PersonaUpdateType::Status => {
                if let Some(error) = update.error {
                    slot.content.push_str(&channel.take(now));
                    slot.interrupted = Some(true);
                    if self.error_fallback && slot.content.is_empty() {
                        slot.content = format!("Error: {}", error);
                    }
                    debug!(persona_id = %update.persona_id, error = %error, "persona reported an error");
                }
            }
        }
    }

    fn flush_all(&mut self, message: &mut Message, now: Instant) {
        message.content.push_str(&self.global.take(now));
        append_reasoning(&mut message.reasoning, &self.reasoning.take(now));
        for (persona_id, channel) in self.personas.iter_mut() {
            if channel.buffer.is_empty() {
                continue;
            }
            let pending = channel.take(now);
            if let Some(slot) = message.persona_response_mut(persona_id) {
                slot.content.push_str(&pending);
            }
        }
    }

    /// When the earliest buffered channel becomes due, if any channel holds text.
    fn next_flush_at(&self) -> Option<Instant> {
        let window = self.debounce?;
        [&self.global, &self.reasoning]
            .into_iter()
            .chain(self.personas.values())
            .filter(|c| !c.buffer.is_empty())
            .filter_map(|c| c.last_flush.map(|at| at + window))
            .min()
    }

    /// Commit the buffered channels whose debounce window has passed.
    pub fn flush_due(&mut self, tree: &mut ConversationTree) -> Result<(), TreeError> {
        let now = Instant::now();
        let debounce = self.debounce;
        let message = tree.require_mut(&self.target_id)?;
        if !self.global.buffer.is_empty() && self.global.is_due(now, debounce) {
            message.content.push_str(&self.global.take(now));
        }
        if !self.reasoning.buffer.is_empty() && self.reasoning.is_due(now, debounce) {
            append_reasoning(&mut message.reasoning, &self.reasoning.take(now));
        }
        for (persona_id, channel) in self.personas.iter_mut() {
            if channel.buffer.is_empty() || !channel.is_due(now, debounce) {
                continue;
            }
            let pending = channel.take(now);
            if let Some(slot) = message.persona_response_mut(persona_id) {
                slot.content.push_str(&pending);
            }
        }
        Ok(())
    }

    /// Commit every buffered channel. Called when the sequence ends.
    pub fn finish(&mut self, tree: &mut ConversationTree) -> Result<(), TreeError> {
        let message = tree.require_mut(&self.target_id)?;
        self.flush_all(message, Instant::now());
        Ok(())
    }

    /// Apply `events` until the sequence ends or `abort` fires.
    ///
    /// Buffered text is also committed once its window closes while the sequence is idle.
    /// On abort, `upstream` is cancelled and no further events are applied; text already
    /// received is committed and nothing is rolled back.
    pub async fn consume<S>(
        &mut self,
        tree: &mut ConversationTree,
        mut events: S,
        abort: &CancellationToken,
        upstream: &CancellationToken,
    ) -> Result<StreamOutcome, TreeError>
    where
        S: Stream<Item = UpdateEvent> + Unpin,
    {
        loop {
            let flush_at = self.next_flush_at();
            let next = tokio::select! {
                biased;
                _ = abort.cancelled() => Next::Abort,
                _ = sleep_until(flush_at) => Next::Flush,
                event = events.next() => match event {
                    Some(event) => Next::Event(event),
                    None => Next::End,
                },
            };
            match next {
                Next::Event(event) => self.apply(tree, event)?,
                Next::Flush => self.flush_due(tree)?,
                Next::End => break,
                Next::Abort => {
                    info!(message_id = %self.target_id, "stream aborted by consumer");
                    upstream.cancel();
                    self.outcome.cancelled = true;
                    break;
                }
            }
        }
        self.finish(tree)?;
        Ok(self.outcome.clone())
    }
}

fn append_reasoning(reasoning: &mut Option<String>, text: &str) {
    if !text.is_empty() {
        reasoning.get_or_insert_with(String::new).push_str(text);
    }
}

fn persona_slot<'m>(message: &'m mut Message, update: &PersonaUpdate) -> &'m mut PersonaResponse {
    let idx = match message
        .persona_responses
        .iter()
        .position(|r| r.persona_id == update.persona_id)
    {
        Some(idx) => idx,
        None => {
            message.persona_responses.push(PersonaResponse {
                persona_occupation: update.persona_occupation.clone(),
                persona_stance: update.persona_stance.clone(),
                ..PersonaResponse::empty(update.persona_id.clone(), update.persona_name.clone())
            });
            message.persona_responses.len() - 1
        }
    };
    &mut message.persona_responses[idx]
}

/// Refresh persona metadata from `personaInit`, keeping any content already received and
/// appending slots for personas not seen yet.
fn merge_persona_init(message: &mut Message, personas: Vec<PersonaSummary>) {
    for summary in personas {
        match message.persona_response_mut(&summary.persona_id) {
            Some(existing) => {
                existing.persona_name = summary.persona_name;
                existing.persona_occupation = summary.persona_occupation;
                existing.persona_stance = summary.persona_stance;
            }
            None => message.persona_responses.push(PersonaResponse {
                persona_occupation: summary.persona_occupation,
                persona_stance: summary.persona_stance,
                ..PersonaResponse::empty(summary.persona_id, summary.persona_name)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NewMessage;

    const DEBOUNCE: Duration = Duration::from_millis(50);

    fn setup() -> (ConversationTree, String, String) {
        let mut tree = ConversationTree::new();
        let user = tree.add_child(NewMessage::user("q"), None).unwrap();
        let target = tree.add_child(NewMessage::assistant(), Some(&user)).unwrap();
        (tree, user, target)
    }

    fn persona(id: &str, update_type: PersonaUpdateType) -> PersonaUpdate {
        PersonaUpdate {
            persona_id: id.to_string(),
            persona_name: id.to_uppercase(),
            persona_occupation: None,
            persona_stance: None,
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

    fn persona_token(id: &str, token: &str) -> UpdateEvent {
        UpdateEvent::Persona(PersonaUpdate {
            token: Some(token.to_string()),
            ..persona(id, PersonaUpdateType::Stream)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_nul_bytes_stripped() {
        let (mut tree, _, target) = setup();
        let mut applier = StreamApplier::new(&target, DEBOUNCE);
        applier
            .apply(&mut tree, UpdateEvent::stream("he\0\0llo\0\0\0"))
            .unwrap();
        applier.apply(&mut tree, persona_token("p1", "wor\0ld")).unwrap();
        applier.finish(&mut tree).unwrap();

        let node = tree.get(&target).unwrap();
        assert_eq!(node.content, "hello");
        assert!(!node.content.contains('\0'));
        assert_eq!(node.persona_responses[0].content, "world");
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_per_channel() {
        let (mut tree, _, target) = setup();
        let mut applier = StreamApplier::new(&target, DEBOUNCE);

        applier.apply(&mut tree, UpdateEvent::stream("a")).unwrap();
        applier.apply(&mut tree, persona_token("p1", "x")).unwrap();
        // Global text waits a window from construction; a persona's first token does not.
        assert_eq!(tree.get(&target).unwrap().content, "");

        tokio::time::advance(Duration::from_millis(10)).await;
        applier.apply(&mut tree, UpdateEvent::stream("b")).unwrap();
        applier.apply(&mut tree, persona_token("p1", "y")).unwrap();
        let node = tree.get(&target).unwrap();
        assert_eq!(node.content, "");
        assert_eq!(node.persona_responses[0].content, "x");

        tokio::time::advance(Duration::from_millis(60)).await;
        applier.apply(&mut tree, UpdateEvent::stream("c")).unwrap();
        let node = tree.get(&target).unwrap();
        assert_eq!(node.content, "abc");
        // The persona channel has not seen an event since and stays buffered.
        assert_eq!(node.persona_responses[0].content, "x");

        applier.finish(&mut tree).unwrap();
        assert_eq!(tree.get(&target).unwrap().persona_responses[0].content, "xy");
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_answer_overrides_buffer() {
        let (mut tree, _, target) = setup();
        let mut applier = StreamApplier::new(&target, DEBOUNCE);
        applier.apply(&mut tree, UpdateEvent::stream("draft")).unwrap();
        applier.apply(&mut tree, UpdateEvent::stream(" more")).unwrap();
        applier
            .apply(&mut tree, UpdateEvent::final_answer("Final.", true))
            .unwrap();

        let node = tree.get(&target).unwrap();
        assert_eq!(node.content, "Final.");
        assert_eq!(node.interrupted, Some(true));

        applier
            .apply(
                &mut tree,
                UpdateEvent::Persona(PersonaUpdate {
                    text: Some(String::new()),
                    interrupted: Some(false),
                    ..persona("p2", PersonaUpdateType::FinalAnswer)
                }),
            )
            .unwrap();
        assert_eq!(tree.get(&target).unwrap().persona_responses[0].content, "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_durable_updates_log() {
        let (mut tree, _, target) = setup();
        let mut applier = StreamApplier::new(&target, DEBOUNCE);
        let events = vec![
            UpdateEvent::started(None),
            UpdateEvent::stream("t"),
            UpdateEvent::reasoning_token("r"),
            UpdateEvent::reasoning_status("searching"),
            UpdateEvent::status(Status::KeepAlive),
            UpdateEvent::Title { title: "T".into() },
            UpdateEvent::RouterMetadata { route: "fast".into(), model: "m1".into() },
            UpdateEvent::File { name: "a.png".into(), sha: "abc".into(), mime: "image/png".into() },
            persona_token("p1", "tok"),
            UpdateEvent::Persona(PersonaUpdate {
                error: Some("boom".into()),
                ..persona("p1", PersonaUpdateType::Status)
            }),
            UpdateEvent::finished(),
        ];
        for event in events {
            applier.apply(&mut tree, event).unwrap();
        }

        let node = tree.get(&target).unwrap();
        let kinds: Vec<&str> = node.updates.iter().map(UpdateEvent::kind).collect();
        assert_eq!(
            kinds,
            vec!["status", "reasoning", "title", "routerMetadata", "file", "persona", "status"]
        );
        assert_eq!(node.reasoning.as_deref(), Some("r"));
        assert_eq!(node.router_metadata.as_ref().unwrap().model, "m1");
        assert_eq!(node.files[0].value, "abc");
        assert_eq!(applier.outcome().title.as_deref(), Some("T"));
        assert!(applier.outcome().finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persona_error_fallback() {
        let (mut tree, _, target) = setup();
        let mut applier = StreamApplier::immediate(&target);
        let error = |id: &str| {
            UpdateEvent::Persona(PersonaUpdate {
                error: Some("quota exceeded".into()),
                ..persona(id, PersonaUpdateType::Status)
            })
        };
        applier.apply(&mut tree, persona_token("p1", "partial")).unwrap();
        applier.apply(&mut tree, error("p1")).unwrap();
        applier.apply(&mut tree, error("p2")).unwrap();

        let node = tree.get(&target).unwrap();
        assert_eq!(node.persona_response("p1").unwrap().content, "partial");
        assert_eq!(node.persona_response("p1").unwrap().interrupted, Some(true));
        assert_eq!(node.persona_response("p2").unwrap().content, "Error: quota exceeded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_persona_error_without_fallback() {
        let (mut tree, _, target) = setup();
        let mut applier = StreamApplier::immediate(&target).without_error_fallback();
        applier
            .apply(
                &mut tree,
                UpdateEvent::Persona(PersonaUpdate {
                    error: Some("down".into()),
                    ..persona("p1", PersonaUpdateType::Status)
                }),
            )
            .unwrap();

        let slot = tree.get(&target).unwrap().persona_response("p1").cloned().unwrap();
        assert_eq!(slot.content, "");
        assert_eq!(slot.interrupted, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_debounce_window_from_construction() {
        let (mut tree, _, target) = setup();
        let mut applier = StreamApplier::new(&target, DEBOUNCE);

        tokio::time::advance(Duration::from_millis(49)).await;
        applier.apply(&mut tree, UpdateEvent::stream("early")).unwrap();
        assert_eq!(tree.get(&target).unwrap().content, "");

        tokio::time::advance(Duration::from_millis(1)).await;
        applier.apply(&mut tree, UpdateEvent::stream(" due")).unwrap();
        assert_eq!(tree.get(&target).unwrap().content, "early due");
    }

    #[tokio::test(start_paused = true)]
    async fn test_persona_init_keeps_partial_content() {
        let (mut tree, _, target) = setup();
        tree.get_mut(&target).unwrap().persona_responses = vec![PersonaResponse {
            content: "half an answer".into(),
            ..PersonaResponse::empty("p1", "old name")
        }];
        let mut applier = StreamApplier::new(&target, DEBOUNCE);
        applier
            .apply(
                &mut tree,
                UpdateEvent::PersonaInit {
                    personas: vec![
                        PersonaSummary {
                            persona_id: "p1".into(),
                            persona_name: "Ada".into(),
                            persona_occupation: Some("Nurse".into()),
                            persona_stance: None,
                        },
                        PersonaSummary {
                            persona_id: "p2".into(),
                            persona_name: "Bea".into(),
                            persona_occupation: None,
                            persona_stance: Some("against".into()),
                        },
                    ],
                },
            )
            .unwrap();

        let responses = &tree.get(&target).unwrap().persona_responses;
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].content, "half an answer");
        assert_eq!(responses[0].persona_name, "Ada");
        assert_eq!(responses[0].persona_occupation.as_deref(), Some("Nurse"));
        assert_eq!(responses[1].content, "");
        assert_eq!(responses[1].persona_stance.as_deref(), Some("against"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_reconciles_id() {
        let (mut tree, user, target) = setup();
        let mut applier = StreamApplier::new(&target, DEBOUNCE);
        applier
            .apply(&mut tree, UpdateEvent::started(Some("srv-1".into())))
            .unwrap();
        applier.apply(&mut tree, UpdateEvent::stream("hi")).unwrap();
        applier.finish(&mut tree).unwrap();

        assert_eq!(applier.target_id(), "srv-1");
        assert!(tree.get(&target).is_none());
        assert_eq!(tree.get(&user).unwrap().children, vec!["srv-1".to_string()]);
        assert_eq!(tree.get("srv-1").unwrap().content, "hi");
        assert_eq!(tree.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_target() {
        let (mut tree, _, _) = setup();
        let mut applier = StreamApplier::new("ghost", DEBOUNCE);
        assert_eq!(
            applier.apply(&mut tree, UpdateEvent::stream("x")),
            Err(TreeError::NotFound("ghost".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_flushes_at_end() {
        let (mut tree, _, target) = setup();
        let mut applier = StreamApplier::new(&target, DEBOUNCE);
        let events = futures::stream::iter(vec![
            UpdateEvent::stream("one "),
            UpdateEvent::stream("two "),
            UpdateEvent::stream("three"),
            UpdateEvent::error("upstream closed"),
        ]);
        let outcome = applier
            .consume(&mut tree, events, &CancellationToken::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tree.get(&target).unwrap().content, "one two three");
        assert_eq!(outcome.error.as_deref(), Some("upstream closed"));
        assert!(!outcome.finished);
        assert!(!outcome.cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_abort_signals_upstream() {
        let (mut tree, _, target) = setup();
        let mut applier = StreamApplier::new(&target, DEBOUNCE);
        let events = futures::stream::iter(vec![UpdateEvent::stream("partial")])
            .chain(futures::stream::pending());
        let abort = CancellationToken::new();
        let upstream = CancellationToken::new();

        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = applier
            .consume(&mut tree, Box::pin(events), &abort, &upstream)
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert!(upstream.is_cancelled());
        assert_eq!(tree.get(&target).unwrap().content, "partial");
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_flushes_idle_buffer() {
        let (mut tree, _, target) = setup();
        let mut applier = StreamApplier::new(&target, DEBOUNCE);
        let events = futures::stream::iter(vec![
            UpdateEvent::stream("a"),
            UpdateEvent::stream("b"),
            persona_token("p1", "x"),
            persona_token("p1", "y"),
        ])
        .chain(futures::stream::pending());

        let idle = tokio::time::timeout(
            Duration::from_millis(200),
            applier.consume(
                &mut tree,
                Box::pin(events),
                &CancellationToken::new(),
                &CancellationToken::new(),
            ),
        )
        .await;
        assert!(idle.is_err());

        let message = tree.get(&target).unwrap();
        assert_eq!(message.content, "ab");
        assert_eq!(message.persona_response("p1").unwrap().content, "xy");
    }
}
