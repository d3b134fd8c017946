//! Inbox change notifications, fanned out to every interested session.

use crate::model::{ConversationId, TempId};
use serde::Serialize;
use tokio::sync::broadcast;

/// Something in the inbox changed; listeners refetch what they display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InboxEvent {
    /// A message was appended or the conversation record changed.
    #[serde(rename_all = "camelCase")]
    ConversationUpdated { conversation_id: ConversationId },
    #[serde(rename_all = "camelCase")]
    ConversationDeleted { conversation_id: ConversationId },
    /// A provider echo confirmed an outbound message carrying this correlation id.
    #[serde(rename_all = "camelCase")]
    OutboundConfirmed {
        conversation_id: ConversationId,
        correlation_id: TempId,
        external_message_id: String,
    },
}

/// Cloneable broadcast handle. Sending with no subscribers is not an error.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<InboxEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: InboxEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboxEvent> {
        self.tx.subscribe()
    }
}
