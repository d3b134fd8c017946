//! Delivery manager: optimistic outbound sends with failure tracking and retry.
//!
//! Each send attempt is a [`PendingSend`] kept in a local, ephemeral list that is never
//! written to the store. The store only ever sees the confirmed message, so a failed
//! attempt leaves canonical history untouched.
//!
//! ```text
//!  (none) --submit--> PENDING --success--> (removed; the confirmed message is in the store)
//!                     PENDING --failure--> FAILED
//!                     FAILED  --retry-->   PENDING   (same temp id)
//!                     FAILED  --discard--> (removed)
//! ```

use crate::channels::{ChannelError, OutboundRequest, OutboundTransport, SendReceipt, MAX_TEXT_CHARS};
use crate::events::{EventBus, InboxEvent};
use crate::model::{
    ConversationId, DeliveryStatus, Message, MessageType, NewMessage, TempId,
};
use crate::store::{AppendOutcome, Store, StoreError};
use crate::templates::{Template, TemplateError, TemplateRenderer};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

const CAPABILITY_HINT: &str = "Sending is blocked because the app is missing a permission or App Review approval for this platform. Grant it in the Meta app dashboard, then retry.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Pending,
    Failed,
}

/// How a failed attempt should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Missing permission or review approval; needs action outside the inbox.
    Capability,
    /// Network, rate limit, missing token, or anything else; retryable.
    Generic,
}

/// A transient, client-tracked outbound attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSend {
    pub temp_id: TempId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub status: PendingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Provider parameters of a template send, opaque to the inbox.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wire_parameters: Option<Vec<serde_json::Value>>,
    /// Set when the provider accepted the message but storing it failed; dropped once canonical data has it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_external_id: Option<String>,
}

impl PendingSend {
    pub fn delivery_status(&self) -> DeliveryStatus {
        match (self.status, &self.confirmed_external_id) {
            (_, Some(_)) => DeliveryStatus::Sent,
            (PendingStatus::Pending, None) => DeliveryStatus::Pending,
            (PendingStatus::Failed, None) => DeliveryStatus::Failed,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("message is {len} characters; the limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("no conversation selected")]
    NoConversationSelected,
    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),
    #[error("pending send not found: {0}")]
    PendingNotFound(TempId),
    #[error("pending send {temp_id} is {state}; only failed sends can be retried or discarded")]
    InvalidState { temp_id: TempId, state: &'static str },
    #[error("a retry of {0} is already in flight")]
    RetryInFlight(TempId),
    #[error("{message}")]
    Send {
        temp_id: TempId,
        kind: FailureKind,
        message: String,
    },
    #[error("template: {0}")]
    Template(#[from] TemplateError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Result of a successful attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReceipt {
    pub temp_id: TempId,
    pub conversation_id: ConversationId,
    pub external_message_id: String,
}

#[derive(Default)]
struct DeliveryState {
    /// In submit order.
    entries: Vec<PendingSend>,
    in_flight: HashSet<TempId>,
}

impl DeliveryState {
    fn entry_mut(&mut self, temp_id: &str) -> Option<&mut PendingSend> {
        self.entries.iter_mut().find(|e| e.temp_id == temp_id)
    }
}

pub struct DeliveryManager {
    store: Arc<dyn Store>,
    transport: Arc<dyn OutboundTransport>,
    events: EventBus,
    state: RwLock<DeliveryState>,
}

fn classify(temp_id: &str, err: &ChannelError) -> (FailureKind, String) {
    if err.is_capability() {
        (FailureKind::Capability, format!("{} ({})", CAPABILITY_HINT, err))
    } else {
        log::debug!("send {} failed with retryable error: {}", temp_id, err);
        (FailureKind::Generic, err.to_string())
    }
}

impl DeliveryManager {
    pub fn new(store: Arc<dyn Store>, transport: Arc<dyn OutboundTransport>, events: EventBus) -> Self {
        Self {
            store,
            transport,
            events,
            state: RwLock::new(DeliveryState::default()),
        }
    }

    /// Create the optimistic entry and mark it in flight. Call [`dispatch`](Self::dispatch) next.
    pub async fn begin(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<PendingSend, DeliveryError> {
        self.begin_with(conversation_id, content, None).await
    }

    async fn begin_with(
        &self,
        conversation_id: &str,
        content: &str,
        wire_parameters: Option<Vec<serde_json::Value>>,
    ) -> Result<PendingSend, DeliveryError> {
        if content.trim().is_empty() {
            return Err(DeliveryError::EmptyContent);
        }
        let len = content.chars().count();
        if len > MAX_TEXT_CHARS {
            return Err(DeliveryError::TooLong {
                len,
                max: MAX_TEXT_CHARS,
            });
        }
        if self.store.get_conversation(conversation_id).await?.is_none() {
            return Err(DeliveryError::ConversationNotFound(conversation_id.to_string()));
        }
        let entry = PendingSend {
            temp_id: format!("tmp-{}", uuid::Uuid::new_v4()),
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            status: PendingStatus::Pending,
            error: None,
            failure: None,
            attempts: 0,
            created_at: Utc::now(),
            wire_parameters,
            confirmed_external_id: None,
        };
        let mut g = self.state.write().await;
        g.in_flight.insert(entry.temp_id.clone());
        g.entries.push(entry.clone());
        Ok(entry)
    }

    /// Move a failed entry back to pending and mark it in flight. Rejects concurrent retries.
    pub async fn prepare_retry(&self, temp_id: &str) -> Result<PendingSend, DeliveryError> {
        let mut g = self.state.write().await;
        if g.in_flight.contains(temp_id) {
            return Err(DeliveryError::RetryInFlight(temp_id.to_string()));
        }
        let entry = g
            .entry_mut(temp_id)
            .ok_or_else(|| DeliveryError::PendingNotFound(temp_id.to_string()))?;
        if entry.confirmed_external_id.is_some() {
            return Err(DeliveryError::InvalidState {
                temp_id: temp_id.to_string(),
                state: "already sent",
            });
        }
        if entry.status != PendingStatus::Failed {
            return Err(DeliveryError::InvalidState {
                temp_id: temp_id.to_string(),
                state: "pending",
            });
        }
        entry.status = PendingStatus::Pending;
        entry.error = None;
        entry.failure = None;
        let out = entry.clone();
        g.in_flight.insert(temp_id.to_string());
        Ok(out)
    }

    /// Issue the outbound call for an in-flight entry and resolve it.
    pub async fn dispatch(&self, temp_id: &str) -> Result<DeliveryReceipt, DeliveryError> {
        let entry = {
            let mut g = self.state.write().await;
            if !g.in_flight.contains(temp_id) {
                return Err(DeliveryError::InvalidState {
                    temp_id: temp_id.to_string(),
                    state: "not in flight",
                });
            }
            let entry = g
                .entry_mut(temp_id)
                .ok_or_else(|| DeliveryError::PendingNotFound(temp_id.to_string()))?;
            entry.attempts += 1;
            entry.clone()
        };

        let result = match self.store.get_conversation(&entry.conversation_id).await {
            Ok(Some(conversation)) => {
                let request = OutboundRequest {
                    conversation_id: conversation.id,
                    platform: conversation.platform,
                    recipient_id: conversation.external_user_id,
                    content: entry.content.clone(),
                    correlation_id: entry.temp_id.clone(),
                };
                self.transport
                    .send_message(&request)
                    .await
                    .map_err(|e| classify(temp_id, &e))
            }
            Ok(None) => Err((
                FailureKind::Generic,
                format!("conversation {} no longer exists", entry.conversation_id),
            )),
            Err(e) => Err((FailureKind::Generic, e.to_string())),
        };

        match result {
            Ok(receipt) => Ok(self.resolve_success(&entry, receipt).await),
            Err((kind, message)) => {
                log::warn!("send {} failed ({:?}): {}", temp_id, kind, message);
                let mut g = self.state.write().await;
                g.in_flight.remove(temp_id);
                // An echo may have confirmed the message while the call was failing.
                let echoed = g
                    .entry_mut(temp_id)
                    .and_then(|e| e.confirmed_external_id.clone());
                if let Some(external_message_id) = echoed {
                    g.entries.retain(|e| e.temp_id != temp_id);
                    return Ok(DeliveryReceipt {
                        temp_id: temp_id.to_string(),
                        conversation_id: entry.conversation_id,
                        external_message_id,
                    });
                }
                if let Some(e) = g.entry_mut(temp_id) {
                    e.status = PendingStatus::Failed;
                    e.error = Some(message.clone());
                    e.failure = Some(kind);
                }
                Err(DeliveryError::Send {
                    temp_id: temp_id.to_string(),
                    kind,
                    message,
                })
            }
        }
    }

    async fn resolve_success(&self, entry: &PendingSend, receipt: SendReceipt) -> DeliveryReceipt {
        let outcome = self
            .store
            .append_message(NewMessage {
                conversation_id: entry.conversation_id.clone(),
                external_message_id: Some(receipt.external_message_id.clone()),
                is_from_customer: false,
                content: entry.content.clone(),
                media_url: None,
                message_type: MessageType::Text,
                sent_at: Utc::now(),
            })
            .await;
        let stored = match outcome {
            Ok(AppendOutcome::Appended(_)) => true,
            Ok(AppendOutcome::Duplicate) => {
                log::debug!("send {}: echo stored the message first", entry.temp_id);
                true
            }
            Err(e) => {
                log::warn!("send {}: storing confirmed message failed: {}", entry.temp_id, e);
                false
            }
        };
        {
            let mut g = self.state.write().await;
            g.in_flight.remove(&entry.temp_id);
            if stored {
                g.entries.retain(|e| e.temp_id != entry.temp_id);
            } else if let Some(e) = g.entry_mut(&entry.temp_id) {
                // The provider accepted it; retrying would send twice, so stay confirmed.
                e.status = PendingStatus::Pending;
                e.error = None;
                e.failure = None;
                e.confirmed_external_id = Some(receipt.external_message_id.clone());
            }
        }
        self.events.publish(InboxEvent::ConversationUpdated {
            conversation_id: entry.conversation_id.clone(),
        });
        DeliveryReceipt {
            temp_id: entry.temp_id.clone(),
            conversation_id: entry.conversation_id.clone(),
            external_message_id: receipt.external_message_id,
        }
    }

    /// Create and send in one call.
    pub async fn submit(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let entry = self.begin(conversation_id, content).await?;
        self.dispatch(&entry.temp_id).await
    }

    /// Render a template and send the rendered text; wire parameters ride along on the entry.
    pub async fn begin_template(
        &self,
        conversation_id: &str,
        renderer: &dyn TemplateRenderer,
        template: &Template,
        values: &HashMap<String, String>,
    ) -> Result<PendingSend, DeliveryError> {
        let rendered = renderer.render(template, values)?;
        self.begin_with(
            conversation_id,
            &rendered.rendered_text,
            Some(rendered.wire_parameters),
        )
        .await
    }

    pub async fn submit_template(
        &self,
        conversation_id: &str,
        renderer: &dyn TemplateRenderer,
        template: &Template,
        values: &HashMap<String, String>,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let entry = self
            .begin_template(conversation_id, renderer, template, values)
            .await?;
        self.dispatch(&entry.temp_id).await
    }

    /// Re-attempt a failed send with identical content under the same temp id.
    pub async fn retry(&self, temp_id: &str) -> Result<DeliveryReceipt, DeliveryError> {
        self.prepare_retry(temp_id).await?;
        self.dispatch(temp_id).await
    }

    /// Drop a failed entry without contacting the provider.
    pub async fn discard(&self, temp_id: &str) -> Result<PendingSend, DeliveryError> {
        let mut g = self.state.write().await;
        if g.in_flight.contains(temp_id) {
            return Err(DeliveryError::RetryInFlight(temp_id.to_string()));
        }
        let idx = g
            .entries
            .iter()
            .position(|e| e.temp_id == temp_id)
            .ok_or_else(|| DeliveryError::PendingNotFound(temp_id.to_string()))?;
        if g.entries[idx].status != PendingStatus::Failed {
            return Err(DeliveryError::InvalidState {
                temp_id: temp_id.to_string(),
                state: "pending",
            });
        }
        Ok(g.entries.remove(idx))
    }

    /// Resolve an entry from an echo event carrying its correlation id.
    ///
    /// The echo was stored before it was announced, so an idle entry is dropped. An entry
    /// whose call is still running is only marked; `dispatch` drops it when the call returns.
    pub async fn confirm(&self, correlation_id: &str, external_message_id: &str) -> bool {
        let mut g = self.state.write().await;
        if !g.in_flight.contains(correlation_id) {
            let before = g.entries.len();
            g.entries.retain(|e| e.temp_id != correlation_id);
            return g.entries.len() != before;
        }
        let Some(e) = g.entry_mut(correlation_id) else {
            return false;
        };
        e.error = None;
        e.failure = None;
        e.confirmed_external_id = Some(external_message_id.to_string());
        true
    }

    /// Drop confirmed entries of a conversation whose message is present in canonical data.
    pub async fn reconcile(&self, conversation_id: &str, canonical: &[Message]) -> usize {
        let known: HashSet<&str> = canonical
            .iter()
            .filter_map(|m| m.external_message_id.as_deref())
            .collect();
        let mut g = self.state.write().await;
        let DeliveryState { entries, in_flight } = &mut *g;
        let before = entries.len();
        entries.retain(|e| {
            let superseded = e.conversation_id == conversation_id
                && !in_flight.contains(&e.temp_id)
                && e
                    .confirmed_external_id
                    .as_deref()
                    .is_some_and(|id| known.contains(id));
            !superseded
        });
        before - entries.len()
    }

    /// Drop every entry of a conversation (it was deleted or cleared).
    pub async fn forget_conversation(&self, conversation_id: &str) {
        let mut g = self.state.write().await;
        let DeliveryState { entries, in_flight } = &mut *g;
        entries.retain(|e| e.conversation_id != conversation_id || in_flight.contains(&e.temp_id));
    }

    /// Entries of one conversation, in submit order.
    pub async fn pending_for(&self, conversation_id: &str) -> Vec<PendingSend> {
        self.state
            .read()
            .await
            .entries
            .iter()
            .filter(|e| e.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub async fn get(&self, temp_id: &str) -> Option<PendingSend> {
        self.state
            .read()
            .await
            .entries
            .iter()
            .find(|e| e.temp_id == temp_id)
            .cloned()
    }

    pub async fn all(&self) -> Vec<PendingSend> {
        self.state.read().await.entries.clone()
    }
}
