//! Agent inbox session: selection, list filter, polling, and the actions an agent takes.
//!
//! A session owns its delivery manager (pending sends are per agent) and shares the
//! store and event bus with the rest of the process. The conversation list snapshot is
//! published on a watch channel; every refresh replaces it (last write wins).

use crate::channels::OutboundTransport;
use crate::delivery::{DeliveryError, DeliveryManager, DeliveryReceipt, PendingSend};
use crate::events::{EventBus, InboxEvent};
use crate::model::{Conversation, ConversationId, ConversationStatus, StatusFilter, Tag};
use crate::mutator::{ConversationMutator, MutatorError};
use crate::query::{ConversationView, InboxQuery};
use crate::store::{Store, StoreError};
use crate::templates::{PlaceholderRenderer, Template, TemplateRenderer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;

/// Default poll period for the conversation list.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Why a refresh was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// Poll tick or change notification; skipped while another refresh is running.
    Timer,
    /// Explicit user refresh; always runs.
    Manual,
    /// Follow-up to a mutating action; always runs.
    Mutation,
}

/// Status filter plus free-text search applied to the conversation list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub status: StatusFilter,
    pub search: String,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct InboxSession {
    query: InboxQuery,
    mutator: ConversationMutator,
    delivery: Arc<DeliveryManager>,
    renderer: Arc<dyn TemplateRenderer>,
    events: EventBus,
    selected: RwLock<Option<ConversationId>>,
    filter: RwLock<ListFilter>,
    snapshot: watch::Sender<Vec<Conversation>>,
    refreshing: AtomicUsize,
}

impl InboxSession {
    pub fn new(store: Arc<dyn Store>, transport: Arc<dyn OutboundTransport>, events: EventBus) -> Self {
        let delivery = Arc::new(DeliveryManager::new(store.clone(), transport, events.clone()));
        let (snapshot, _) = watch::channel(Vec::new());
        Self {
            query: InboxQuery::new(store.clone(), delivery.clone()),
            mutator: ConversationMutator::new(store, events.clone()),
            delivery,
            renderer: Arc::new(PlaceholderRenderer),
            events,
            selected: RwLock::new(None),
            filter: RwLock::new(ListFilter::default()),
            snapshot,
            refreshing: AtomicUsize::new(0),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn delivery(&self) -> &Arc<DeliveryManager> {
        &self.delivery
    }

    /// Receives every new list snapshot.
    pub fn watch(&self) -> watch::Receiver<Vec<Conversation>> {
        self.snapshot.subscribe()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.snapshot.borrow().clone()
    }

    pub async fn selected(&self) -> Option<ConversationId> {
        self.selected.read().await.clone()
    }

    pub async fn filter(&self) -> ListFilter {
        self.filter.read().await.clone()
    }

    /// Reload the list with the current filter. Returns None when a timer refresh was suppressed.
    pub async fn refresh(
        &self,
        trigger: RefreshTrigger,
    ) -> Result<Option<Vec<Conversation>>, StoreError> {
        let previous = self.refreshing.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight(&self.refreshing);
        if trigger == RefreshTrigger::Timer && previous > 0 {
            log::trace!("refresh skipped: another refresh in flight");
            return Ok(None);
        }
        let filter = self.filter.read().await.clone();
        let list = self
            .query
            .list_conversations(filter.status, &filter.search)
            .await?;
        self.snapshot.send_replace(list.clone());
        Ok(Some(list))
    }

    /// Change the list filter and reload.
    pub async fn set_filter(&self, filter: ListFilter) -> Result<Vec<Conversation>, StoreError> {
        *self.filter.write().await = filter;
        Ok(self
            .refresh(RefreshTrigger::Manual)
            .await?
            .unwrap_or_default())
    }

    /// Select and open a conversation (marks it read).
    pub async fn open(&self, id: &str) -> Result<ConversationView, StoreError> {
        let view = self.query.get_conversation(id).await?;
        *self.selected.write().await = Some(view.conversation.id.clone());
        Ok(view)
    }

    /// Re-read the selected conversation's thread.
    pub async fn current(&self) -> Result<Option<ConversationView>, StoreError> {
        let Some(id) = self.selected().await else {
            return Ok(None);
        };
        match self.query.get_conversation(&id).await {
            Ok(view) => Ok(Some(view)),
            Err(StoreError::NotFound(_)) => {
                self.clear_selection_if(&id).await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn clear_selection_if(&self, id: &str) {
        let mut selected = self.selected.write().await;
        if selected.as_deref() == Some(id) {
            *selected = None;
        }
    }

    async fn require_selected(&self) -> Result<ConversationId, DeliveryError> {
        self.selected()
            .await
            .ok_or(DeliveryError::NoConversationSelected)
    }

    /// Optimistic half of a send: the pending entry exists once this returns.
    pub async fn begin_send(&self, content: &str) -> Result<PendingSend, DeliveryError> {
        let id = self.require_selected().await?;
        self.delivery.begin(&id, content).await
    }

    pub async fn begin_template_send(
        &self,
        template: &Template,
        values: &HashMap<String, String>,
    ) -> Result<PendingSend, DeliveryError> {
        let id = self.require_selected().await?;
        self.delivery
            .begin_template(&id, self.renderer.as_ref(), template, values)
            .await
    }

    pub async fn begin_retry(&self, temp_id: &str) -> Result<PendingSend, DeliveryError> {
        self.delivery.prepare_retry(temp_id).await
    }

    /// Network half of a send or retry; refreshes the list on success.
    pub async fn complete_send(&self, temp_id: &str) -> Result<DeliveryReceipt, DeliveryError> {
        let receipt = self.delivery.dispatch(temp_id).await?;
        if let Err(e) = self.refresh(RefreshTrigger::Mutation).await {
            log::warn!("refresh after send failed: {}", e);
        }
        Ok(receipt)
    }

    /// Send to the selected conversation.
    pub async fn send(&self, content: &str) -> Result<DeliveryReceipt, DeliveryError> {
        let entry = self.begin_send(content).await?;
        self.complete_send(&entry.temp_id).await
    }

    pub async fn send_template(
        &self,
        template: &Template,
        values: &HashMap<String, String>,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let entry = self.begin_template_send(template, values).await?;
        self.complete_send(&entry.temp_id).await
    }

    pub async fn retry(&self, temp_id: &str) -> Result<DeliveryReceipt, DeliveryError> {
        self.begin_retry(temp_id).await?;
        self.complete_send(temp_id).await
    }

    pub async fn discard(&self, temp_id: &str) -> Result<PendingSend, DeliveryError> {
        self.delivery.discard(temp_id).await
    }

    async fn after_mutation(&self) {
        if let Err(e) = self.refresh(RefreshTrigger::Mutation).await {
            log::warn!("refresh after mutation failed: {}", e);
        }
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation, MutatorError> {
        let c = self.mutator.update_status(id, status).await?;
        self.after_mutation().await;
        Ok(c)
    }

    pub async fn add_tag(&self, id: &str, tag: Tag) -> Result<Conversation, MutatorError> {
        let c = self.mutator.add_tag(id, tag).await?;
        self.after_mutation().await;
        Ok(c)
    }

    pub async fn clear_messages(&self, id: &str, confirmed: bool) -> Result<Conversation, MutatorError> {
        let c = self.mutator.clear_messages(id, confirmed).await?;
        // Confirmed entries can no longer be matched against canonical history.
        self.delivery.forget_conversation(id).await;
        self.after_mutation().await;
        Ok(c)
    }

    /// Delete a conversation; clears the selection when it was the selected one.
    pub async fn delete_conversation(&self, id: &str) -> Result<(), MutatorError> {
        self.mutator.delete_conversation(id).await?;
        self.clear_selection_if(id).await;
        self.delivery.forget_conversation(id).await;
        self.after_mutation().await;
        Ok(())
    }

    /// Refresh the list on a fixed period. The first tick fires immediately.
    pub fn spawn_polling(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = session.refresh(RefreshTrigger::Timer).await {
                    log::warn!("poll refresh failed: {}", e);
                }
            }
        })
    }

    /// Apply inbox events: echo confirmations resolve pending sends, changes trigger a refresh.
    pub fn spawn_event_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => session.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("session lagged {} events; refreshing", n);
                        let _ = session.refresh(RefreshTrigger::Timer).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn handle_event(&self, event: InboxEvent) {
        match event {
            InboxEvent::OutboundConfirmed {
                correlation_id,
                external_message_id,
                ..
            } => {
                if self.delivery.confirm(&correlation_id, &external_message_id).await {
                    log::debug!("pending send {} confirmed by echo", correlation_id);
                }
            }
            InboxEvent::ConversationDeleted { conversation_id } => {
                self.clear_selection_if(&conversation_id).await;
                self.delivery.forget_conversation(&conversation_id).await;
                let _ = self.refresh(RefreshTrigger::Timer).await;
            }
            InboxEvent::ConversationUpdated { .. } => {
                let _ = self.refresh(RefreshTrigger::Timer).await;
            }
        }
    }
}
