//! Conversation mutations. Each call is a direct store round trip followed by a refetch;
//! nothing is applied locally first, so a failed call leaves nothing to roll back.

use crate::events::{EventBus, InboxEvent};
use crate::model::{Conversation, ConversationStatus, Tag};
use crate::store::{Store, StoreError};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum MutatorError {
    #[error("clearing messages is irreversible and must be confirmed")]
    ConfirmationRequired,
    #[error("{0}")]
    Store(#[from] StoreError),
}

pub struct ConversationMutator {
    store: Arc<dyn Store>,
    events: EventBus,
}

impl ConversationMutator {
    pub fn new(store: Arc<dyn Store>, events: EventBus) -> Self {
        Self { store, events }
    }

    async fn refetch(&self, id: &str) -> Result<Conversation, MutatorError> {
        let conversation = self
            .store
            .get_conversation(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.events.publish(InboxEvent::ConversationUpdated {
            conversation_id: conversation.id.clone(),
        });
        Ok(conversation)
    }

    /// Idempotent: setting the current status succeeds without change.
    pub async fn update_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation, MutatorError> {
        self.store.set_status(id, status).await?;
        log::info!("conversation {} status -> {:?}", id, status);
        self.refetch(id).await
    }

    /// Set semantics: adding a present tag succeeds without change.
    pub async fn add_tag(&self, id: &str, tag: Tag) -> Result<Conversation, MutatorError> {
        self.store.add_tag(id, tag).await?;
        log::info!("conversation {} tagged {:?}", id, tag);
        self.refetch(id).await
    }

    /// Delete every message but keep the conversation (status and tags survive).
    pub async fn clear_messages(
        &self,
        id: &str,
        confirmed: bool,
    ) -> Result<Conversation, MutatorError> {
        if !confirmed {
            return Err(MutatorError::ConfirmationRequired);
        }
        self.store.clear_messages(id).await?;
        log::info!("conversation {} cleared", id);
        self.refetch(id).await
    }

    /// Remove the conversation and its messages permanently.
    pub async fn delete_conversation(&self, id: &str) -> Result<(), MutatorError> {
        self.store.delete_conversation(id).await?;
        log::info!("conversation {} deleted", id);
        self.events.publish(InboxEvent::ConversationDeleted {
            conversation_id: id.to_string(),
        });
        Ok(())
    }
}
