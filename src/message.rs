//! Conversation message model.
//!
//! Field names serialize in camelCase and the role is stored under `from`, matching the
//! documents already persisted by the conversation store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::update::UpdateEvent;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Marks a node as belonging to a persona-branch rooted at `message_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchedFrom {
    pub message_id: String,
    pub persona_id: String,
}

impl BranchedFrom {
    pub fn new(message_id: impl Into<String>, persona_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            persona_id: persona_id.into(),
        }
    }

    /// Grouping key used when comparing sibling branches.
    pub fn key(&self) -> String {
        format!("{}:{}", self.message_id, self.persona_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterMetadata {
    pub route: String,
    pub model: String,
}

/// One persona's answer inside a multi-persona assistant message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaResponse {
    pub persona_id: String,
    pub persona_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_occupation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_stance: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_metadata: Option<RouterMetadata>,
}

impl PersonaResponse {
    pub fn empty(persona_id: impl Into<String>, persona_name: impl Into<String>) -> Self {
        Self {
            persona_id: persona_id.into(),
            persona_name: persona_name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetacognitiveKind {
    Comprehension,
    Perspective,
}

/// A reflective prompt that was shown (and possibly accepted) on a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetacognitiveEvent {
    #[serde(rename = "type")]
    pub kind: MetacognitiveKind,
    pub prompt_text: String,
    pub trigger_frequency: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_persona_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_persona_name: Option<String>,
    pub accepted: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_message_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRef {
    /// Content hash of a file held by the file store.
    Hash,
    /// Inline base64 payload.
    Base64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFile {
    #[serde(rename = "type")]
    pub kind: FileRef,
    pub name: String,
    pub value: String,
    pub mime: String,
}

/// A node of the conversation tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(rename = "from")]
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Ids from the root down to the parent; empty for a root.
    #[serde(default)]
    pub ancestors: Vec<String>,
    /// Child ids in creation order.
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branched_from: Option<BranchedFrom>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub persona_responses: Vec<PersonaResponse>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metacognitive_events: Vec<MetacognitiveEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<UpdateEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_metadata: Option<RouterMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<MessageFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Parent id, if this is not a root.
    pub fn parent_id(&self) -> Option<&str> {
        self.ancestors.last().map(String::as_str)
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    pub fn persona_response(&self, persona_id: &str) -> Option<&PersonaResponse> {
        self.persona_responses
            .iter()
            .find(|p| p.persona_id == persona_id)
    }

    pub fn persona_response_mut(&mut self, persona_id: &str) -> Option<&mut PersonaResponse> {
        self.persona_responses
            .iter_mut()
            .find(|p| p.persona_id == persona_id)
    }
}

/// Caller-supplied fields for a node about to be inserted. The tree assigns id, ancestors
/// and children.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub branched_from: Option<BranchedFrom>,
    pub persona_responses: Vec<PersonaResponse>,
    pub files: Vec<MessageFile>,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            branched_from: None,
            persona_responses: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant() -> Self {
        Self::new(Role::Assistant, "")
    }

    pub fn branched_from(mut self, branch: Option<BranchedFrom>) -> Self {
        self.branched_from = branch;
        self
    }

    pub fn persona_responses(mut self, responses: Vec<PersonaResponse>) -> Self {
        self.persona_responses = responses;
        self
    }

    pub fn files(mut self, files: Vec<MessageFile>) -> Self {
        self.files = files;
        self
    }

    pub(crate) fn into_message(self, id: String, ancestors: Vec<String>) -> Message {
        let now = Utc::now();
        Message {
            id,
            role: self.role,
            content: self.content,
            ancestors,
            children: Vec::new(),
            branched_from: self.branched_from,
            persona_responses: self.persona_responses,
            metacognitive_events: Vec::new(),
            updates: Vec::new(),
            reasoning: None,
            interrupted: None,
            router_metadata: None,
            files: self.files,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serializes_role_as_from() {
        let msg = NewMessage::user("hello").into_message("m1".into(), vec![]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["from"], "user");
        assert_eq!(json["id"], "m1");
        assert!(json.get("personaResponses").is_none());
    }

    #[test]
    fn test_message_deserializes_stored_document() {
        let json = r#"{
            "id": "a1",
            "from": "assistant",
            "content": "",
            "ancestors": ["u1"],
            "children": [],
            "branchedFrom": {"messageId": "u0", "personaId": "p1"},
            "personaResponses": [
                {"personaId": "p1", "personaName": "Ada", "content": "hi"}
            ],
            "metacognitiveEvents": [{
                "type": "perspective",
                "promptText": "Ask Bob?",
                "triggerFrequency": 3,
                "accepted": false,
                "timestamp": "2024-01-01T00:00:00Z"
            }]
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.parent_id(), Some("u1"));
        assert_eq!(msg.branched_from.as_ref().unwrap().key(), "u0:p1");
        assert_eq!(msg.persona_response("p1").unwrap().content, "hi");
        assert_eq!(msg.metacognitive_events[0].kind, MetacognitiveKind::Perspective);
    }
}
