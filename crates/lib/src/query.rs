//! Inbox reads: the filtered conversation list and an opened conversation's thread.
//!
//! The thread is a two-tier merge: canonical messages from the store (ascending
//! `sent_at`), then the delivery manager's pending entries in submit order. Pending
//! entries never interleave with confirmed history.

use crate::delivery::{DeliveryManager, PendingSend};
use crate::model::{Conversation, DeliveryStatus, Message, StatusFilter};
use crate::store::{Store, StoreError};
use serde::Serialize;
use std::sync::Arc;

/// One rendered row of a thread.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ThreadItem {
    Message(Message),
    Pending(PendingItem),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingItem {
    #[serde(flatten)]
    pub send: PendingSend,
    pub delivery_status: DeliveryStatus,
}

/// An opened conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub conversation: Conversation,
    pub items: Vec<ThreadItem>,
}

impl ConversationView {
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.items.iter().filter_map(|i| match i {
            ThreadItem::Message(m) => Some(m),
            ThreadItem::Pending(_) => None,
        })
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingSend> {
        self.items.iter().filter_map(|i| match i {
            ThreadItem::Pending(p) => Some(&p.send),
            ThreadItem::Message(_) => None,
        })
    }
}

/// Case-insensitive substring match on display name or last message preview. Empty term matches all.
pub fn matches_search(conversation: &Conversation, term: &str) -> bool {
    let term = term.trim();
    if term.is_empty() {
        return true;
    }
    let needle = term.to_lowercase();
    conversation.display_name.to_lowercase().contains(&needle)
        || conversation
            .last_message_preview
            .to_lowercase()
            .contains(&needle)
}

pub struct InboxQuery {
    store: Arc<dyn Store>,
    delivery: Arc<DeliveryManager>,
}

impl InboxQuery {
    pub fn new(store: Arc<dyn Store>, delivery: Arc<DeliveryManager>) -> Self {
        Self { store, delivery }
    }

    /// Conversations matching the status filter and search term, most recent first.
    pub async fn list_conversations(
        &self,
        filter: StatusFilter,
        search: &str,
    ) -> Result<Vec<Conversation>, StoreError> {
        let mut list = self.store.list_conversations(filter).await?;
        list.retain(|c| matches_search(c, search));
        Ok(list)
    }

    /// Open a conversation: marks it read, drops superseded pending entries, returns the merged thread.
    pub async fn get_conversation(&self, id: &str) -> Result<ConversationView, StoreError> {
        let conversation = self.store.reset_unread(id).await?;
        let messages = self.store.list_messages(id).await?;
        let dropped = self.delivery.reconcile(id, &messages).await;
        if dropped > 0 {
            log::debug!("conversation {}: {} pending sends confirmed", id, dropped);
        }
        let pending = self.delivery.pending_for(id).await;
        let mut items: Vec<ThreadItem> = messages.into_iter().map(ThreadItem::Message).collect();
        items.extend(pending.into_iter().map(|send| {
            ThreadItem::Pending(PendingItem {
                delivery_status: send.delivery_status(),
                send,
            })
        }));
        Ok(ConversationView {
            conversation,
            items,
        })
    }
}
