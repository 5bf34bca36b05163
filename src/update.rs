//! Update events exchanged between the generation side and the stream consumer.
//!
//! The JSON shape is a wire contract: one object per line, discriminated by `type`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    Started,
    Error,
    Finished,
    KeepAlive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Server-confirmed id of the node being written, sent with `started`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReasoningSubtype {
    Stream,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningUpdate {
    pub subtype: ReasoningSubtype,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PersonaUpdateType {
    Stream,
    Reasoning,
    RouterMetadata,
    FinalAnswer,
    Status,
}

/// An event produced by one persona's generation task, tagged with that persona.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaUpdate {
    pub persona_id: String,
    pub persona_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_occupation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_stance: Option<String>,
    pub update_type: PersonaUpdateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PersonaUpdate {
    pub fn is_error(&self) -> bool {
        self.update_type == PersonaUpdateType::Status && self.error.is_some()
    }
}

/// Persona identity announced in `personaInit`; list order is the rendering slot order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaSummary {
    pub persona_id: String,
    pub persona_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_occupation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_stance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UpdateEvent {
    Status(StatusUpdate),
    Title {
        title: String,
    },
    Stream {
        token: String,
    },
    File {
        name: String,
        sha: String,
        mime: String,
    },
    FinalAnswer {
        text: String,
        interrupted: bool,
    },
    Reasoning(ReasoningUpdate),
    RouterMetadata {
        route: String,
        model: String,
    },
    Persona(PersonaUpdate),
    PersonaInit {
        personas: Vec<PersonaSummary>,
    },
}

/// Every `type` tag this crate understands.
pub const KNOWN_KINDS: &[&str] = &[
    "status",
    "title",
    "stream",
    "file",
    "finalAnswer",
    "reasoning",
    "routerMetadata",
    "persona",
    "personaInit",
];

impl UpdateEvent {
    pub fn status(status: Status) -> Self {
        UpdateEvent::Status(StatusUpdate {
            status,
            message: None,
            message_id: None,
        })
    }

    pub fn started(message_id: Option<String>) -> Self {
        UpdateEvent::Status(StatusUpdate {
            status: Status::Started,
            message: None,
            message_id,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        UpdateEvent::Status(StatusUpdate {
            status: Status::Error,
            message: Some(message.into()),
            message_id: None,
        })
    }

    pub fn finished() -> Self {
        Self::status(Status::Finished)
    }

    pub fn stream(token: impl Into<String>) -> Self {
        UpdateEvent::Stream {
            token: token.into(),
        }
    }

    pub fn final_answer(text: impl Into<String>, interrupted: bool) -> Self {
        UpdateEvent::FinalAnswer {
            text: text.into(),
            interrupted,
        }
    }

    pub fn reasoning_token(token: impl Into<String>) -> Self {
        UpdateEvent::Reasoning(ReasoningUpdate {
            subtype: ReasoningSubtype::Stream,
            token: Some(token.into()),
            status: None,
        })
    }

    pub fn reasoning_status(status: impl Into<String>) -> Self {
        UpdateEvent::Reasoning(ReasoningUpdate {
            subtype: ReasoningSubtype::Status,
            token: None,
            status: Some(status.into()),
        })
    }

    /// Wire tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateEvent::Status(_) => "status",
            UpdateEvent::Title { .. } => "title",
            UpdateEvent::Stream { .. } => "stream",
            UpdateEvent::File { .. } => "file",
            UpdateEvent::FinalAnswer { .. } => "finalAnswer",
            UpdateEvent::Reasoning(_) => "reasoning",
            UpdateEvent::RouterMetadata { .. } => "routerMetadata",
            UpdateEvent::Persona(_) => "persona",
            UpdateEvent::PersonaInit { .. } => "personaInit",
        }
    }

    /// High-frequency events only persist through their effect on content fields and are
    /// never written to a message's `updates` log.
    pub fn is_high_frequency(&self) -> bool {
        match self {
            UpdateEvent::Stream { .. } => true,
            UpdateEvent::Reasoning(r) => r.subtype == ReasoningSubtype::Stream,
            UpdateEvent::Persona(p) => !p.is_error(),
            UpdateEvent::Status(s) => s.status == Status::KeepAlive,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_wire_shape() {
        let ev = UpdateEvent::started(Some("m1".into()));
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "status", "status": "started", "messageId": "m1"})
        );

        let keep_alive: UpdateEvent =
            serde_json::from_value(json!({"type": "status", "status": "keepAlive"})).unwrap();
        assert_eq!(keep_alive, UpdateEvent::status(Status::KeepAlive));
    }

    #[test]
    fn test_persona_wire_shape() {
        let ev: UpdateEvent = serde_json::from_value(json!({
            "type": "persona",
            "personaId": "p1",
            "personaName": "Ada",
            "updateType": "finalAnswer",
            "text": "done",
            "interrupted": false
        }))
        .unwrap();
        match &ev {
            UpdateEvent::Persona(p) => {
                assert_eq!(p.update_type, PersonaUpdateType::FinalAnswer);
                assert_eq!(p.text.as_deref(), Some("done"));
                assert!(p.persona_occupation.is_none());
            }
            other => panic!("expected persona event, got {:?}", other),
        }
        assert!(ev.is_high_frequency());
    }

    #[test]
    fn test_reasoning_and_init_tags() {
        let ev = UpdateEvent::reasoning_status("thinking");
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "reasoning", "subtype": "status", "status": "thinking"})
        );
        assert!(!ev.is_high_frequency());
        assert!(UpdateEvent::reasoning_token("x").is_high_frequency());

        let init: UpdateEvent = serde_json::from_value(json!({
            "type": "personaInit",
            "personas": [{"personaId": "p1", "personaName": "Ada", "personaStance": "pro"}]
        }))
        .unwrap();
        assert_eq!(init.kind(), "personaInit");
    }

    #[test]
    fn test_persona_error_is_durable() {
        let ev = UpdateEvent::Persona(PersonaUpdate {
            persona_id: "p1".into(),
            persona_name: "Ada".into(),
            persona_occupation: None,
            persona_stance: None,
            update_type: PersonaUpdateType::Status,
            token: None,
            text: None,
            interrupted: None,
            status: None,
            route: None,
            model: None,
            error: Some("boom".into()),
        });
        assert!(!ev.is_high_frequency());
    }
}
