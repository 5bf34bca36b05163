//! Conversation tree stored as a flat id-indexed arena.
//!
//! Each node carries its full `ancestors` chain and an ordered `children` list. The arena
//! keeps nodes in creation order, which is the "natural order" used when no target is
//! given. Nodes are never removed here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::message::{Message, NewMessage};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("message '{0}' not found")]
    NotFound(String),
    #[error("message '{0}' already exists")]
    DuplicateId(String),
}

#[derive(Debug, Clone, Default)]
pub struct ConversationTree {
    messages: Vec<Message>,
    index: HashMap<String, usize>,
}

impl ConversationTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from stored messages, keeping their order.
    pub fn from_messages(messages: Vec<Message>) -> Result<Self, TreeError> {
        let mut index = HashMap::with_capacity(messages.len());
        for (i, m) in messages.iter().enumerate() {
            if index.insert(m.id.clone(), i).is_some() {
                return Err(TreeError::DuplicateId(m.id.clone()));
            }
        }
        Ok(Self { messages, index })
    }

    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// All nodes in creation order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.index.get(id).map(|&i| &self.messages[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        match self.index.get(id) {
            Some(&i) => Some(&mut self.messages[i]),
            None => None,
        }
    }

    pub fn require(&self, id: &str) -> Result<&Message, TreeError> {
        self.get(id).ok_or_else(|| TreeError::NotFound(id.to_string()))
    }

    pub fn require_mut(&mut self, id: &str) -> Result<&mut Message, TreeError> {
        self.get_mut(id)
            .ok_or_else(|| TreeError::NotFound(id.to_string()))
    }

    /// Last node in creation order.
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    fn push(&mut self, message: Message) -> String {
        let id = message.id.clone();
        self.index.insert(id.clone(), self.messages.len());
        self.messages.push(message);
        id
    }

    /// Insert `data` under `parent_id`, or as a new root when `parent_id` is `None`.
    /// Returns the new node's id.
    pub fn add_child(
        &mut self,
        data: NewMessage,
        parent_id: Option<&str>,
    ) -> Result<String, TreeError> {
        let id = Self::new_id();
        let ancestors = match parent_id {
            None => Vec::new(),
            Some(pid) => {
                let parent = self.require_mut(pid)?;
                parent.children.push(id.clone());
                let mut ancestors = parent.ancestors.clone();
                ancestors.push(pid.to_string());
                ancestors
            }
        };
        Ok(self.push(data.into_message(id, ancestors)))
    }

    /// Insert `data` next to `sibling_id`, sharing its parent. The new id goes last in the
    /// parent's `children`.
    pub fn add_sibling(&mut self, data: NewMessage, sibling_id: &str) -> Result<String, TreeError> {
        let ancestors = self.require(sibling_id)?.ancestors.clone();
        let id = Self::new_id();
        if let Some(parent_id) = ancestors.last() {
            self.require_mut(parent_id)?.children.push(id.clone());
        }
        Ok(self.push(data.into_message(id, ancestors)))
    }

    /// Root-to-leaf chain ending at `leaf_id`.
    pub fn build_subtree(&self, leaf_id: &str) -> Result<Vec<&Message>, TreeError> {
        let leaf = self.require(leaf_id)?;
        let mut chain = Vec::with_capacity(leaf.ancestors.len() + 1);
        for ancestor_id in &leaf.ancestors {
            chain.push(self.require(ancestor_id)?);
        }
        chain.push(leaf);
        Ok(chain)
    }

    /// Rename `old_id` to `new_id` in place and repoint the parent's `children` entry.
    ///
    /// When the parent does not list `old_id`, `new_id` is appended to its children. A node
    /// is never dropped by this operation.
    pub fn reconcile_id(&mut self, old_id: &str, new_id: &str) -> Result<(), TreeError> {
        if old_id == new_id || (self.contains(new_id) && !self.contains(old_id)) {
            return Ok(());
        }
        if self.contains(new_id) {
            return Err(TreeError::DuplicateId(new_id.to_string()));
        }
        let idx = self
            .index
            .remove(old_id)
            .ok_or_else(|| TreeError::NotFound(old_id.to_string()))?;
        self.messages[idx].id = new_id.to_string();
        self.index.insert(new_id.to_string(), idx);

        // Descendants record the old id in their ancestor chains.
        for m in self.messages.iter_mut() {
            for a in m.ancestors.iter_mut() {
                if a == old_id {
                    *a = new_id.to_string();
                }
            }
        }

        let parent_id = match self.messages[idx].parent_id() {
            Some(p) => p.to_string(),
            None => {
                debug!(old_id, new_id, "reconciled root message id");
                return Ok(());
            }
        };
        match self.get_mut(&parent_id) {
            Some(parent) => match parent.children.iter().position(|c| c == old_id) {
                Some(pos) => parent.children[pos] = new_id.to_string(),
                None => {
                    warn!(
                        parent_id = %parent_id,
                        old_id,
                        new_id,
                        "parent missing child entry, appending reconciled id"
                    );
                    parent.children.push(new_id.to_string());
                }
            },
            None => {
                error!(parent_id = %parent_id, old_id, new_id, "parent not found for reconciled message");
            }
        }
        debug!(old_id, new_id, "reconciled message id");
        Ok(())
    }
}

/// A titled conversation and its message tree.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub tree: ConversationTree,
}

/// Stored form of a [`Conversation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
}

pub const DEFAULT_TITLE: &str = "New Chat";

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: DEFAULT_TITLE.to_string(),
            tree: ConversationTree::new(),
        }
    }

    pub fn from_record(record: ConversationRecord) -> Result<Self, TreeError> {
        Ok(Self {
            id: record.id,
            title: record.title,
            tree: ConversationTree::from_messages(record.messages)?,
        })
    }

    pub fn to_record(&self) -> ConversationRecord {
        ConversationRecord {
            id: self.id.clone(),
            title: self.title.clone(),
            messages: self.tree.messages().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    #[test]
    fn test_add_child_links_parent() {
        let mut tree = ConversationTree::new();
        let root = tree.add_child(NewMessage::user("hi"), None).unwrap();
        let reply = tree.add_child(NewMessage::assistant(), Some(&root)).unwrap();

        assert!(tree.get(&root).unwrap().ancestors.is_empty());
        assert_eq!(tree.get(&root).unwrap().children, vec![reply.clone()]);
        assert_eq!(tree.get(&reply).unwrap().ancestors, vec![root.clone()]);
        assert_eq!(tree.get(&reply).unwrap().role, Role::Assistant);
    }

    #[test]
    fn test_add_child_unknown_parent() {
        let mut tree = ConversationTree::new();
        let err = tree
            .add_child(NewMessage::user("x"), Some("missing"))
            .unwrap_err();
        assert_eq!(err, TreeError::NotFound("missing".into()));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_build_subtree_after_add_child() {
        let mut tree = ConversationTree::new();
        let a = tree.add_child(NewMessage::user("a"), None).unwrap();
        let b = tree.add_child(NewMessage::assistant(), Some(&a)).unwrap();
        let c = tree.add_child(NewMessage::user("c"), Some(&b)).unwrap();

        let ids: Vec<&str> = tree
            .build_subtree(&c)
            .unwrap()
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(ids, vec![a.as_str(), b.as_str(), c.as_str()]);

        assert!(matches!(
            tree.build_subtree("nope"),
            Err(TreeError::NotFound(_))
        ));
    }

    #[test]
    fn test_add_sibling_appends_last() {
        let mut tree = ConversationTree::new();
        let root = tree.add_child(NewMessage::user("q"), None).unwrap();
        let first = tree.add_child(NewMessage::assistant(), Some(&root)).unwrap();
        let retry = tree.add_sibling(NewMessage::assistant(), &first).unwrap();

        assert_eq!(tree.get(&root).unwrap().children, vec![first, retry.clone()]);
        assert_eq!(tree.get(&retry).unwrap().ancestors, vec![root]);
        assert!(matches!(
            tree.add_sibling(NewMessage::assistant(), "ghost"),
            Err(TreeError::NotFound(_))
        ));
    }

    #[test]
    fn test_sibling_of_root_is_root() {
        let mut tree = ConversationTree::new();
        let root = tree.add_child(NewMessage::user("q"), None).unwrap();
        let other = tree.add_sibling(NewMessage::user("q2"), &root).unwrap();
        assert!(tree.get(&other).unwrap().ancestors.is_empty());
    }

    #[test]
    fn test_reconcile_id_replaces_single_entry() {
        let mut tree = ConversationTree::new();
        let root = tree.add_child(NewMessage::user("q"), None).unwrap();
        let a = tree.add_child(NewMessage::assistant(), Some(&root)).unwrap();
        let b = tree.add_child(NewMessage::assistant(), Some(&root)).unwrap();

        tree.reconcile_id(&b, "server-id").unwrap();

        assert_eq!(
            tree.get(&root).unwrap().children,
            vec![a, "server-id".to_string()]
        );
        assert!(tree.get(&b).is_none());
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_reconcile_id_missing_child_entry_appends() {
        let mut tree = ConversationTree::new();
        let root = tree.add_child(NewMessage::user("q"), None).unwrap();
        let a = tree.add_child(NewMessage::assistant(), Some(&root)).unwrap();
        tree.get_mut(&root).unwrap().children.clear();

        tree.reconcile_id(&a, "srv").unwrap();

        assert_eq!(tree.get(&root).unwrap().children, vec!["srv".to_string()]);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_reconcile_id_unknown_parent_keeps_nodes() {
        let user = NewMessage::user("q").into_message("u".into(), vec![]);
        let orphan = NewMessage::assistant().into_message("tmp".into(), vec!["gone".into()]);
        let mut tree = ConversationTree::from_messages(vec![user, orphan]).unwrap();

        tree.reconcile_id("tmp", "srv").unwrap();

        assert_eq!(tree.len(), 2);
        assert!(tree.get("tmp").is_none());
        assert!(tree.get("u").is_some());
        let renamed = tree.get("srv").unwrap();
        assert_eq!(renamed.ancestors, vec!["gone".to_string()]);
        assert_eq!(tree.messages()[1].id, "srv");
    }

    #[test]
    fn test_reconcile_id_updates_descendant_ancestors() {
        let mut tree = ConversationTree::new();
        let root = tree.add_child(NewMessage::user("q"), None).unwrap();
        let a = tree.add_child(NewMessage::assistant(), Some(&root)).unwrap();
        let c = tree.add_child(NewMessage::user("next"), Some(&a)).unwrap();

        tree.reconcile_id(&a, "srv").unwrap();
        assert_eq!(
            tree.get(&c).unwrap().ancestors,
            vec![root, "srv".to_string()]
        );
    }

    #[test]
    fn test_conversation_record_roundtrip_keeps_order() {
        let mut conv = Conversation::new("c1");
        let root = conv.tree.add_child(NewMessage::user("q"), None).unwrap();
        conv.tree
            .add_child(NewMessage::assistant(), Some(&root))
            .unwrap();
        let restored = Conversation::from_record(conv.to_record()).unwrap();
        assert_eq!(restored.tree.messages(), conv.tree.messages());
        assert_eq!(restored.title, DEFAULT_TITLE);
    }
}
