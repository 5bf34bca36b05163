//! Conversation persistence.
//!
//! Each conversation is one pretty-printed JSON document at `<dir>/<id>.json` holding its
//! title and the full message arena in natural order. Saving overwrites the document, so
//! repeated saves of the same state are harmless.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::message::Message;
use crate::tree::{Conversation, ConversationRecord, TreeError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid conversation document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid conversation id '{0}'")]
    InvalidId(String),
    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// Saves a conversation's messages and title.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Persist: Send + Sync {
    async fn persist(
        &self,
        conversation_id: &str,
        messages: &[Message],
        title: &str,
    ) -> Result<(), StoreError>;
}

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, conversation_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !conversation_id.is_empty()
            && conversation_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidId(conversation_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", conversation_id)))
    }

    /// Load a stored conversation. Returns `None` when nothing has been saved under the id.
    pub async fn load(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError> {
        let path = self.path_for(conversation_id)?;
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: ConversationRecord = serde_json::from_str(&data)?;
        debug!(conversation_id, messages = record.messages.len(), "conversation loaded");
        Ok(Some(Conversation::from_record(record)?))
    }
}

#[async_trait]
impl Persist for FileStore {
    async fn persist(
        &self,
        conversation_id: &str,
        messages: &[Message],
        title: &str,
    ) -> Result<(), StoreError> {
        let path = self.path_for(conversation_id)?;
        let record = ConversationRecord {
            id: conversation_id.to_string(),
            title: title.to_string(),
            messages: messages.to_vec(),
        };
        let data = serde_json::to_string_pretty(&record)?;

        // Replace the document through a sibling temp file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!(conversation_id, messages = messages.len(), "conversation persisted");
        Ok(())
    }
}
