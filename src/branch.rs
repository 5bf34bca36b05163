//! Linear views derived from the conversation tree: the displayed path, retry
//! alternatives, and persona-branch slices.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::message::{BranchedFrom, Message};
use crate::persona::PersonaRef;
use crate::tree::ConversationTree;

/// The persona-branch the user is currently looking at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchState {
    pub message_id: String,
    pub persona_id: String,
    pub persona_name: String,
}

impl BranchState {
    pub fn branched_from(&self) -> BranchedFrom {
        BranchedFrom::new(self.message_id.clone(), self.persona_id.clone())
    }

    fn matches(&self, b: &BranchedFrom) -> bool {
        b.message_id == self.message_id && b.persona_id == self.persona_id
    }
}

/// Currently displayed conversation: the target's ancestors, the target, then the most
/// recent child at every level below it.
///
/// Falls back to the last node when `target_id` is absent or unknown. Missing ancestors
/// are skipped and the descent stops at the first missing or already-visited child, so
/// the walk is bounded by the tree size.
pub fn path<'a>(tree: &'a ConversationTree, target_id: Option<&str>) -> Vec<&'a Message> {
    let target = match target_id.and_then(|id| tree.get(id)).or_else(|| tree.last()) {
        Some(t) => t,
        None => return Vec::new(),
    };

    let mut out: Vec<&Message> = target
        .ancestors
        .iter()
        .filter_map(|id| tree.get(id))
        .collect();
    out.push(target);

    let mut visited: HashSet<&str> = out.iter().map(|m| m.id.as_str()).collect();
    let mut current = target;
    while let Some(next) = current.children.last().and_then(|id| tree.get(id)) {
        if !visited.insert(next.id.as_str()) {
            break;
        }
        out.push(next);
        current = next;
    }
    out
}

/// Groups of sibling ids the user can flip between as retries of the same turn.
///
/// Children without `branched_from` are candidates, as are children whose branch key is
/// shared by at least one other sibling. A lone child with its own branch key is a
/// dedicated persona-branch and is left out. Only groups of two or more are returned.
pub fn alternative_groups(tree: &ConversationTree) -> Vec<Vec<String>> {
    let mut groups = Vec::new();
    for message in tree.messages() {
        if message.children.len() < 2 {
            continue;
        }

        let mut key_counts: HashMap<String, usize> = HashMap::new();
        for child in message.children.iter().filter_map(|id| tree.get(id)) {
            if let Some(b) = &child.branched_from {
                *key_counts.entry(b.key()).or_insert(0) += 1;
            }
        }

        let candidates: Vec<String> = message
            .children
            .iter()
            .filter(|id| match tree.get(id).and_then(|c| c.branched_from.as_ref()) {
                None => true,
                Some(b) => key_counts.get(&b.key()).copied().unwrap_or(0) > 1,
            })
            .cloned()
            .collect();

        if candidates.len() > 1 {
            groups.push(candidates);
        }
    }
    groups
}

/// Active branch: the explicit state when given, otherwise inferred from the last
/// message's `branched_from`.
pub fn detect_branch(
    messages: &[&Message],
    explicit: Option<&BranchState>,
    personas: &[PersonaRef],
) -> Option<BranchState> {
    if let Some(state) = explicit {
        return Some(state.clone());
    }
    let origin = messages.last()?.branched_from.as_ref()?;
    let persona_name = personas
        .iter()
        .find(|p| p.id == origin.persona_id)
        .and_then(|p| p.name.clone())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| origin.persona_id.clone());
    Some(BranchState {
        message_id: origin.message_id.clone(),
        persona_id: origin.persona_id.clone(),
        persona_name,
    })
}

/// Slice of `messages` relevant to `branch`; everything when there is no branch.
pub fn filter_by_branch<'a>(
    messages: &[&'a Message],
    branch: Option<&BranchState>,
) -> Vec<&'a Message> {
    let branch = match branch {
        Some(b) => b,
        None => return messages.to_vec(),
    };

    let branch_messages: Vec<&Message> = messages
        .iter()
        .copied()
        .filter(|m| m.branched_from.as_ref().is_some_and(|b| branch.matches(b)))
        .collect();

    let (anchor, tail) = match branch_messages.first() {
        Some(first) => (*first, branch_messages.clone()),
        None => {
            // Freshly created branch: show history up to the branch point.
            let point = match messages.iter().find(|m| m.id == branch.message_id) {
                Some(p) => *p,
                None => {
                    warn!(message_id = %branch.message_id, "branch point not found, showing all messages");
                    return messages.to_vec();
                }
            };
            (point, vec![point])
        }
    };

    let ancestor_ids: HashSet<&str> = anchor.ancestors.iter().map(String::as_str).collect();
    let mut out: Vec<&Message> = messages
        .iter()
        .copied()
        .filter(|m| ancestor_ids.contains(m.id.as_str()))
        .collect();
    out.extend(tail);
    out
}
