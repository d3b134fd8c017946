//! Webhook normalizer: writes decoded provider events into the canonical store.
//!
//! Ingestion never fails as a whole. Bad events are logged and skipped, replays are
//! dropped by the store's external-id dedup, and the caller always acknowledges the
//! provider. Profile enrichment runs in its own task after the message is stored, so a
//! slow Graph API never holds up ingestion.

use crate::channels::ProfileLookup;
use crate::events::{EventBus, InboxEvent};
use crate::model::{Conversation, NewMessage, Platform};
use crate::store::{AppendOutcome, Store, StoreError};
use crate::webhook::payload::{decode_payload, Decoded, InboundEvent};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-delivery counters, for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub duplicates: usize,
    pub ignored: usize,
    pub failed: usize,
}

pub struct WebhookNormalizer {
    store: Arc<dyn Store>,
    events: EventBus,
    profiles: Option<Arc<dyn ProfileLookup>>,
    /// Users already looked up (running, done or failed); each is looked up once.
    profile_attempts: Arc<Mutex<HashSet<(Platform, String)>>>,
}

impl WebhookNormalizer {
    pub fn new(store: Arc<dyn Store>, events: EventBus) -> Self {
        Self {
            store,
            events,
            profiles: None,
            profile_attempts: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Enable display name / picture enrichment for conversations without a name.
    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileLookup>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    /// Process one raw webhook body.
    pub async fn ingest(&self, body: &[u8]) -> IngestReport {
        let mut report = IngestReport::default();
        let decoded = match decode_payload(body) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("webhook: dropping undecodable delivery: {}", e);
                report.failed += 1;
                return report;
            }
        };
        for item in decoded {
            match item {
                Ok(Decoded::Message(event)) => match self.ingest_event(event).await {
                    Ok(true) => report.accepted += 1,
                    Ok(false) => report.duplicates += 1,
                    Err(e) => {
                        log::warn!("webhook: failed to store event: {}", e);
                        report.failed += 1;
                    }
                },
                Ok(Decoded::Ignored(reason)) => {
                    log::debug!("webhook: ignored event ({})", reason);
                    report.ignored += 1;
                }
                Err(e) => {
                    log::warn!("webhook: skipping event: {}", e);
                    report.failed += 1;
                }
            }
        }
        log::debug!(
            "webhook: accepted={} duplicates={} ignored={} failed={}",
            report.accepted,
            report.duplicates,
            report.ignored,
            report.failed
        );
        report
    }

    /// Store one event. Returns false when it was a replay of a known message.
    pub async fn ingest_event(&self, event: InboundEvent) -> Result<bool, StoreError> {
        // Known ids (including cleared or deleted messages) must not recreate a conversation.
        if self
            .store
            .is_known_message(event.platform, &event.external_message_id)
            .await?
        {
            if let Some(existing) = self
                .store
                .find_by_user(event.platform, &event.counterpart_id)
                .await?
            {
                self.announce_echo(&existing, &event);
            }
            log::debug!(
                "webhook: duplicate {} message {}",
                event.platform,
                event.external_message_id
            );
            return Ok(false);
        }

        let (conversation, _created) = self
            .store
            .resolve_or_create(event.platform, &event.counterpart_id)
            .await?;

        let outcome = self
            .store
            .append_message(NewMessage {
                conversation_id: conversation.id.clone(),
                external_message_id: Some(event.external_message_id.clone()),
                is_from_customer: !event.is_echo,
                content: event.content.clone(),
                media_url: event.media_url.clone(),
                message_type: event.message_type,
                sent_at: event.sent_at,
            })
            .await?;

        self.announce_echo(&conversation, &event);

        match outcome {
            AppendOutcome::Appended(_) => {
                self.events.publish(InboxEvent::ConversationUpdated {
                    conversation_id: conversation.id.clone(),
                });
                if conversation.display_name.is_empty() {
                    self.spawn_profile_refresh(&conversation).await;
                }
                Ok(true)
            }
            AppendOutcome::Duplicate => {
                log::debug!(
                    "webhook: duplicate {} message {}",
                    event.platform,
                    event.external_message_id
                );
                Ok(false)
            }
        }
    }

    /// An echo may arrive before or after the send call returns; either way it resolves the pending entry.
    fn announce_echo(&self, conversation: &Conversation, event: &InboundEvent) {
        if !event.is_echo {
            return;
        }
        if let Some(ref correlation_id) = event.correlation_id {
            self.events.publish(InboxEvent::OutboundConfirmed {
                conversation_id: conversation.id.clone(),
                correlation_id: correlation_id.clone(),
                external_message_id: event.external_message_id.clone(),
            });
        }
    }

    async fn spawn_profile_refresh(&self, conversation: &Conversation) {
        let Some(ref profiles) = self.profiles else {
            return;
        };
        let key = (conversation.platform, conversation.external_user_id.clone());
        if !self.profile_attempts.lock().await.insert(key.clone()) {
            return;
        }
        let profiles = Arc::clone(profiles);
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        let conversation_id = conversation.id.clone();
        tokio::spawn(async move {
            let (platform, user_id) = key;
            match profiles.fetch_profile(platform, &user_id).await {
                Ok(profile) => match store.update_profile(&conversation_id, profile).await {
                    Ok(_) => events.publish(InboxEvent::ConversationUpdated { conversation_id }),
                    Err(e) => {
                        log::debug!("webhook: storing profile for {} failed: {}", conversation_id, e)
                    }
                },
                Err(e) => {
                    log::debug!("webhook: profile lookup for {}:{} failed: {}", platform, user_id, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelError;
    use crate::model::StatusFilter;
    use crate::store::{MemoryStore, Profile};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn messenger(sender: &str, mid: &str, text: &str) -> Vec<u8> {
        json!({
            "object": "page",
            "entry": [{"id": "PAGE", "time": 1700000000000i64, "messaging": [{
                "sender": {"id": sender}, "recipient": {"id": "PAGE"},
                "timestamp": 1700000000000i64,
                "message": {"mid": mid, "text": text}
            }]}]
        })
        .to_string()
        .into_bytes()
    }

    fn normalizer() -> (WebhookNormalizer, Arc<MemoryStore>, EventBus) {
        let store = Arc::new(MemoryStore::new());
        let events = EventBus::default();
        (WebhookNormalizer::new(store.clone(), events.clone()), store, events)
    }

    #[tokio::test]
    async fn replayed_event_is_stored_once() {
        let (n, store, _) = normalizer();
        let body = messenger("U1", "m1", "hi");
        let first = n.ingest(&body).await;
        let second = n.ingest(&body).await;
        assert_eq!(first.accepted, 1);
        assert_eq!(second.duplicates, 1);

        let convs = store.list_conversations(StatusFilter::All).await.unwrap();
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].platform, Platform::Facebook);
        assert_eq!(convs[0].external_user_id, "U1");
        assert_eq!(convs[0].unread_count, 1);
        let msgs = store.list_messages(&convs[0].id).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "hi");
        assert!(msgs[0].is_from_customer);
    }

    #[tokio::test]
    async fn concurrent_replays_never_duplicate() {
        let (n, store, _) = normalizer();
        let n = Arc::new(n);
        let body = Arc::new(messenger("U1", "m1", "hi"));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let n = n.clone();
            let body = body.clone();
            handles.push(tokio::spawn(async move { n.ingest(&body).await }));
        }
        let mut accepted = 0;
        for h in handles {
            accepted += h.await.unwrap().accepted;
        }
        assert_eq!(accepted, 1);
        let convs = store.list_conversations(StatusFilter::All).await.unwrap();
        assert_eq!(convs.len(), 1);
        assert_eq!(store.list_messages(&convs[0].id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_entry_does_not_abort_batch() {
        let (n, store, _) = normalizer();
        let body = json!({
            "object": "instagram",
            "entry": [
                {"messaging": [{"recipient": {"id": "IG"}, "message": {"mid": "x"}}]},
                {"messaging": [{
                    "sender": {"id": "IGU"}, "recipient": {"id": "IG"},
                    "timestamp": 1700000000000i64,
                    "message": {"mid": "ig-1", "text": "hey"}
                }]}
            ]
        })
        .to_string();
        let report = n.ingest(body.as_bytes()).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.accepted, 1);
        assert!(store
            .find_by_user(Platform::Instagram, "IGU")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn echo_is_outbound_and_announces_confirmation() {
        let (n, store, events) = normalizer();
        let mut rx = events.subscribe();
        let body = json!({
            "object": "page",
            "entry": [{"messaging": [{
                "sender": {"id": "PAGE"}, "recipient": {"id": "U1"},
                "timestamp": 1700000000000i64,
                "message": {"mid": "m_out", "text": "hello", "is_echo": true, "metadata": "tmp-9"}
            }]}]
        })
        .to_string();
        n.ingest(body.as_bytes()).await;

        let conv = store.find_by_user(Platform::Facebook, "U1").await.unwrap().unwrap();
        assert_eq!(conv.unread_count, 0);
        let msgs = store.list_messages(&conv.id).await.unwrap();
        assert!(!msgs[0].is_from_customer);

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            InboxEvent::OutboundConfirmed {
                conversation_id: conv.id.clone(),
                correlation_id: "tmp-9".into(),
                external_message_id: "m_out".into(),
            }
        );
    }

    struct CountingProfiles {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ProfileLookup for CountingProfiles {
        async fn fetch_profile(&self, platform: Platform, _id: &str) -> Result<Profile, ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ChannelError::MissingCredentials(platform));
            }
            Ok(Profile {
                display_name: Some("Ada".into()),
                profile_pic_url: Some("https://cdn/ada.jpg".into()),
            })
        }
    }

    #[tokio::test]
    async fn profile_is_fetched_once_for_new_conversation() {
        let store = Arc::new(MemoryStore::new());
        let profiles = Arc::new(CountingProfiles {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let n = WebhookNormalizer::new(store.clone(), EventBus::default()).with_profiles(profiles.clone());
        n.ingest(&messenger("U1", "m1", "a")).await;
        n.ingest(&messenger("U1", "m2", "b")).await;
        let conv = wait_for_name(&store, "U1").await;
        assert_eq!(conv.display_name, "Ada");
        assert_eq!(conv.profile_pic_url.as_deref(), Some("https://cdn/ada.jpg"));
        n.ingest(&messenger("U1", "m3", "c")).await;
        assert_eq!(profiles.calls.load(Ordering::SeqCst), 1);
    }

    async fn wait_for_name(store: &MemoryStore, user: &str) -> Conversation {
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                let conv = store.find_by_user(Platform::Facebook, user).await.unwrap().unwrap();
                if !conv.display_name.is_empty() {
                    return conv;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("profile stored")
    }

    struct HangingProfiles;

    #[async_trait]
    impl ProfileLookup for HangingProfiles {
        async fn fetch_profile(&self, _platform: Platform, _id: &str) -> Result<Profile, ChannelError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn hanging_profile_lookup_does_not_block_ingestion() {
        let store = Arc::new(MemoryStore::new());
        let n = WebhookNormalizer::new(store.clone(), EventBus::default())
            .with_profiles(Arc::new(HangingProfiles));
        let report = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            n.ingest(&messenger("U1", "m1", "hi")),
        )
        .await
        .expect("ingest finished while the lookup hangs");
        assert_eq!(report.accepted, 1);
        let conv = store.find_by_user(Platform::Facebook, "U1").await.unwrap().unwrap();
        assert_eq!(store.list_messages(&conv.id).await.unwrap().len(), 1);
        assert_eq!(conv.unread_count, 1);
    }

    #[tokio::test]
    async fn failed_profile_lookup_still_ingests_and_is_not_retried() {
        let store = Arc::new(MemoryStore::new());
        let profiles = Arc::new(CountingProfiles {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let n = WebhookNormalizer::new(store.clone(), EventBus::default()).with_profiles(profiles.clone());
        assert_eq!(n.ingest(&messenger("U1", "m1", "a")).await.accepted, 1);
        assert_eq!(n.ingest(&messenger("U1", "m2", "b")).await.accepted, 1);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(profiles.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replay_after_delete_does_not_recreate_conversation() {
        let (n, store, _) = normalizer();
        let body = messenger("U1", "m1", "hi");
        n.ingest(&body).await;
        let conv = store.find_by_user(Platform::Facebook, "U1").await.unwrap().unwrap();
        store.delete_conversation(&conv.id).await.unwrap();

        let report = n.ingest(&body).await;
        assert_eq!(report.duplicates, 1);
        assert!(store.list_conversations(StatusFilter::All).await.unwrap().is_empty());
    }
}
