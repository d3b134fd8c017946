//! Canonical store: the single source of truth for conversations and messages.
//!
//! Every mutation of a conversation or message goes through [`Store`]. Appends are
//! deduplicated on (platform, external message id) under the same write lock that
//! inserts the message, so concurrent webhook replays can never produce duplicates.
//! Ids of cleared or deleted messages stay known, so a late replay cannot bring them back.

use crate::model::{
    Conversation, ConversationId, ConversationStatus, Message, NewMessage, Platform, StatusFilter,
    Tag,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    NotFound(ConversationId),
    #[error("store io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store snapshot invalid: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result of appending a message.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// The message was stored; conversation stats were updated in the same step.
    Appended(Message),
    /// A message with the same external id already exists on this platform.
    Duplicate,
}

/// Presentation data refreshed opportunistically from the provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub display_name: Option<String>,
    pub profile_pic_url: Option<String>,
}

/// Operations the inbox needs from durable storage.
#[async_trait]
pub trait Store: Send + Sync {
    /// Return the conversation for (platform, external user id), creating an open, untagged one if missing.
    /// The bool is true when the conversation was created by this call.
    async fn resolve_or_create(
        &self,
        platform: Platform,
        external_user_id: &str,
    ) -> Result<(Conversation, bool), StoreError>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    async fn find_by_user(
        &self,
        platform: Platform,
        external_user_id: &str,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Conversations matching the filter, most recent activity first.
    async fn list_conversations(&self, filter: StatusFilter) -> Result<Vec<Conversation>, StoreError>;

    /// Messages of a conversation in ascending `sent_at` order.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;

    async fn find_message_by_external_id(
        &self,
        platform: Platform,
        external_message_id: &str,
    ) -> Result<Option<Message>, StoreError>;

    /// True when the id was ever stored on this platform, including messages since cleared or deleted.
    async fn is_known_message(
        &self,
        platform: Platform,
        external_message_id: &str,
    ) -> Result<bool, StoreError>;

    /// Dedup-check, append, and update `last_message_*` / `unread_count` atomically.
    async fn append_message(&self, message: NewMessage) -> Result<AppendOutcome, StoreError>;

    async fn update_profile(&self, id: &str, profile: Profile) -> Result<Conversation, StoreError>;

    async fn set_status(&self, id: &str, status: ConversationStatus) -> Result<Conversation, StoreError>;

    async fn add_tag(&self, id: &str, tag: Tag) -> Result<Conversation, StoreError>;

    async fn reset_unread(&self, id: &str) -> Result<Conversation, StoreError>;

    /// Delete every message of the conversation; the conversation record survives.
    async fn clear_messages(&self, id: &str) -> Result<Conversation, StoreError>;

    /// Delete the conversation and all its messages.
    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemovedMessage {
    platform: Platform,
    external_message_id: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    #[serde(default)]
    removed: Vec<RemovedMessage>,
}

#[derive(Default, Clone)]
struct Inner {
    conversations: HashMap<ConversationId, Conversation>,
    /// (platform, external user id) -> conversation id
    by_user: HashMap<(Platform, String), ConversationId>,
    /// conversation id -> messages, kept sorted by sent_at
    messages: HashMap<ConversationId, Vec<Message>>,
    /// (platform, external message id) -> conversation id
    by_external_id: HashMap<(Platform, String), ConversationId>,
    /// External ids of cleared or deleted messages.
    removed: HashSet<(Platform, String)>,
}

impl Inner {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut inner = Inner::default();
        for c in snapshot.conversations {
            inner
                .by_user
                .insert((c.platform, c.external_user_id.clone()), c.id.clone());
            inner.conversations.insert(c.id.clone(), c);
        }
        for m in snapshot.messages {
            let Some(conv) = inner.conversations.get(&m.conversation_id) else {
                log::debug!("store snapshot: dropping orphan message {}", m.id);
                continue;
            };
            if let Some(ref ext) = m.external_message_id {
                inner
                    .by_external_id
                    .insert((conv.platform, ext.clone()), m.conversation_id.clone());
            }
            inner
                .messages
                .entry(m.conversation_id.clone())
                .or_default()
                .push(m);
        }
        for list in inner.messages.values_mut() {
            list.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        }
        inner.removed = snapshot
            .removed
            .into_iter()
            .map(|r| (r.platform, r.external_message_id))
            .collect();
        inner
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            conversations: self.conversations.values().cloned().collect(),
            messages: self.messages.values().flatten().cloned().collect(),
            removed: self
                .removed
                .iter()
                .map(|(platform, id)| RemovedMessage {
                    platform: *platform,
                    external_message_id: id.clone(),
                })
                .collect(),
        }
    }

    fn is_known(&self, key: &(Platform, String)) -> bool {
        self.by_external_id.contains_key(key) || self.removed.contains(key)
    }

    fn conversation_mut(&mut self, id: &str) -> Result<&mut Conversation, StoreError> {
        self.conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn drop_messages(&mut self, id: &str) {
        let Some(platform) = self.conversations.get(id).map(|c| c.platform) else {
            return;
        };
        if let Some(list) = self.messages.remove(id) {
            for m in list {
                if let Some(ext) = m.external_message_id {
                    let key = (platform, ext);
                    self.by_external_id.remove(&key);
                    self.removed.insert(key);
                }
            }
        }
    }
}

/// In-memory store with optional JSON snapshot persistence.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Purely in-memory store (nothing is written to disk).
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            path: None,
        }
    }

    /// Load from a snapshot file (missing file starts empty) and persist after every mutation.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let inner = match tokio::fs::read_to_string(&path).await {
            Ok(s) => Inner::from_snapshot(serde_json::from_str(&s)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Inner::default(),
            Err(e) => return Err(e.into()),
        };
        log::debug!(
            "store loaded {} conversation(s) from {}",
            inner.conversations.len(),
            path.display()
        );
        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
            path: Some(path),
        })
    }

    async fn save(&self, inner: &Inner) -> Result<(), StoreError> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&inner.snapshot())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Apply `f` to a copy, persist the copy, then install it. A failed write changes nothing.
    async fn commit<T, F>(&self, inner: &mut Inner, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(&mut Inner) -> Result<T, StoreError> + Send,
    {
        if self.path.is_none() {
            return f(inner);
        }
        let mut next = inner.clone();
        let out = f(&mut next)?;
        self.save(&next).await?;
        *inner = next;
        Ok(out)
    }

    async fn mutate<F>(&self, id: &str, f: F) -> Result<Conversation, StoreError>
    where
        F: FnOnce(&mut Conversation) -> bool + Send,
    {
        let mut g = self.inner.write().await;
        let mut updated = g.conversation_mut(id)?.clone();
        if !f(&mut updated) {
            return Ok(updated);
        }
        self.commit(&mut g, |inner| {
            inner
                .conversations
                .insert(updated.id.clone(), updated.clone());
            Ok(updated)
        })
        .await
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn resolve_or_create(
        &self,
        platform: Platform,
        external_user_id: &str,
    ) -> Result<(Conversation, bool), StoreError> {
        let key = (platform, external_user_id.to_string());
        {
            let g = self.inner.read().await;
            if let Some(c) = g.by_user.get(&key).and_then(|id| g.conversations.get(id)) {
                return Ok((c.clone(), false));
            }
        }
        let mut g = self.inner.write().await;
        // Re-check under the write lock; another ingestion may have created it meanwhile.
        if let Some(c) = g.by_user.get(&key).and_then(|id| g.conversations.get(id)) {
            return Ok((c.clone(), false));
        }
        let conv = Conversation::new(platform, external_user_id);
        self.commit(&mut g, |inner| {
            inner.by_user.insert(key, conv.id.clone());
            inner.conversations.insert(conv.id.clone(), conv.clone());
            Ok(())
        })
        .await?;
        log::debug!("store: created conversation {} for {}:{}", conv.id, platform, external_user_id);
        Ok((conv, true))
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.inner.read().await.conversations.get(id).cloned())
    }

    async fn find_by_user(
        &self,
        platform: Platform,
        external_user_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let g = self.inner.read().await;
        Ok(g
            .by_user
            .get(&(platform, external_user_id.to_string()))
            .and_then(|id| g.conversations.get(id))
            .cloned())
    }

    async fn list_conversations(&self, filter: StatusFilter) -> Result<Vec<Conversation>, StoreError> {
        let g = self.inner.read().await;
        let mut list: Vec<Conversation> = g
            .conversations
            .values()
            .filter(|c| filter.matches(c.status))
            .cloned()
            .collect();
        list.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(list)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let g = self.inner.read().await;
        if !g.conversations.contains_key(conversation_id) {
            return Err(StoreError::NotFound(conversation_id.to_string()));
        }
        Ok(g.messages.get(conversation_id).cloned().unwrap_or_default())
    }

    async fn find_message_by_external_id(
        &self,
        platform: Platform,
        external_message_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let g = self.inner.read().await;
        let Some(conv_id) = g
            .by_external_id
            .get(&(platform, external_message_id.to_string()))
        else {
            return Ok(None);
        };
        Ok(g.messages.get(conv_id).and_then(|list| {
            list.iter()
                .find(|m| m.external_message_id.as_deref() == Some(external_message_id))
                .cloned()
        }))
    }

    async fn is_known_message(
        &self,
        platform: Platform,
        external_message_id: &str,
    ) -> Result<bool, StoreError> {
        let g = self.inner.read().await;
        Ok(g.is_known(&(platform, external_message_id.to_string())))
    }

    async fn append_message(&self, message: NewMessage) -> Result<AppendOutcome, StoreError> {
        let mut g = self.inner.write().await;
        let platform = g.conversation_mut(&message.conversation_id)?.platform;
        if let Some(ref ext) = message.external_message_id {
            if g.is_known(&(platform, ext.clone())) {
                return Ok(AppendOutcome::Duplicate);
            }
        }
        let stored = Message {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            external_message_id: message.external_message_id,
            conversation_id: message.conversation_id,
            is_from_customer: message.is_from_customer,
            content: message.content,
            media_url: message.media_url,
            message_type: message.message_type,
            sent_at: message.sent_at,
        };
        self.commit(&mut g, |inner| {
            if let Some(ref ext) = stored.external_message_id {
                inner
                    .by_external_id
                    .insert((platform, ext.clone()), stored.conversation_id.clone());
            }
            let list = inner
                .messages
                .entry(stored.conversation_id.clone())
                .or_default();
            // Keep ascending sent_at; equal timestamps keep arrival order.
            let pos = list.partition_point(|m| m.sent_at <= stored.sent_at);
            list.insert(pos, stored.clone());
            let is_latest = pos + 1 == list.len();

            let conv = inner.conversation_mut(&stored.conversation_id)?;
            if is_latest || conv.last_message_at.is_none() {
                conv.last_message_at = Some(stored.sent_at);
                conv.last_message_preview = stored.preview();
            }
            if stored.is_from_customer {
                conv.unread_count = conv.unread_count.saturating_add(1);
            }
            Ok(AppendOutcome::Appended(stored))
        })
        .await
    }

    async fn update_profile(&self, id: &str, profile: Profile) -> Result<Conversation, StoreError> {
        self.mutate(id, |c| {
            let mut changed = false;
            if let Some(name) = profile.display_name.filter(|n| !n.trim().is_empty()) {
                changed |= c.display_name != name;
                c.display_name = name;
            }
            if let Some(pic) = profile.profile_pic_url {
                changed |= c.profile_pic_url.as_deref() != Some(pic.as_str());
                c.profile_pic_url = Some(pic);
            }
            changed
        })
        .await
    }

    async fn set_status(&self, id: &str, status: ConversationStatus) -> Result<Conversation, StoreError> {
        self.mutate(id, |c| {
            let changed = c.status != status;
            c.status = status;
            changed
        })
        .await
    }

    async fn add_tag(&self, id: &str, tag: Tag) -> Result<Conversation, StoreError> {
        self.mutate(id, |c| c.tags.insert(tag)).await
    }

    async fn reset_unread(&self, id: &str) -> Result<Conversation, StoreError> {
        self.mutate(id, |c| {
            let changed = c.unread_count != 0;
            c.unread_count = 0;
            changed
        })
        .await
    }

    async fn clear_messages(&self, id: &str) -> Result<Conversation, StoreError> {
        let mut g = self.inner.write().await;
        g.conversation_mut(id)?;
        self.commit(&mut g, |inner| {
            inner.drop_messages(id);
            let conv = inner.conversation_mut(id)?;
            conv.last_message_at = None;
            conv.last_message_preview.clear();
            conv.unread_count = 0;
            Ok(conv.clone())
        })
        .await
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError> {
        let mut g = self.inner.write().await;
        g.conversation_mut(id)?;
        self.commit(&mut g, |inner| {
            inner.drop_messages(id);
            if let Some(conv) = inner.conversations.remove(id) {
                inner.by_user.remove(&(conv.platform, conv.external_user_id));
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageType;
    use chrono::{Duration, Utc};

    fn inbound(conv: &str, ext: Option<&str>, text: &str, at: chrono::DateTime<Utc>) -> NewMessage {
        NewMessage {
            conversation_id: conv.to_string(),
            external_message_id: ext.map(str::to_string),
            is_from_customer: true,
            content: text.to_string(),
            media_url: None,
            message_type: MessageType::Text,
            sent_at: at,
        }
    }

    #[tokio::test]
    async fn resolve_or_create_is_unique_per_platform_and_user() {
        let store = MemoryStore::new();
        let (a, created_a) = store.resolve_or_create(Platform::Facebook, "U1").await.unwrap();
        let (b, created_b) = store.resolve_or_create(Platform::Facebook, "U1").await.unwrap();
        let (c, _) = store.resolve_or_create(Platform::Instagram, "U1").await.unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.status, ConversationStatus::Open);
        assert!(a.tags.is_empty());
        assert_eq!(a.unread_count, 0);
    }

    #[tokio::test]
    async fn concurrent_resolve_creates_one_conversation() {
        let store = MemoryStore::new();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let s = store.clone();
            handles.push(tokio::spawn(async move {
                s.resolve_or_create(Platform::Instagram, "U9").await.unwrap().0.id
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.list_conversations(StatusFilter::All).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn append_dedups_on_external_id() {
        let store = MemoryStore::new();
        let (conv, _) = store.resolve_or_create(Platform::Facebook, "U1").await.unwrap();
        let now = Utc::now();
        let first = store.append_message(inbound(&conv.id, Some("m1"), "hi", now)).await.unwrap();
        let second = store.append_message(inbound(&conv.id, Some("m1"), "hi", now)).await.unwrap();
        assert!(matches!(first, AppendOutcome::Appended(_)));
        assert_eq!(second, AppendOutcome::Duplicate);
        assert_eq!(store.list_messages(&conv.id).await.unwrap().len(), 1);
        let conv = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(conv.unread_count, 1);
        assert_eq!(conv.last_message_preview, "hi");
    }

    #[tokio::test]
    async fn messages_are_ordered_by_sent_at() {
        let store = MemoryStore::new();
        let (conv, _) = store.resolve_or_create(Platform::Facebook, "U1").await.unwrap();
        let now = Utc::now();
        store.append_message(inbound(&conv.id, Some("b"), "second", now)).await.unwrap();
        store
            .append_message(inbound(&conv.id, Some("a"), "first", now - Duration::seconds(5)))
            .await
            .unwrap();
        let list = store.list_messages(&conv.id).await.unwrap();
        let texts: Vec<&str> = list.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
        // A late-arriving older message does not replace the preview.
        let conv = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(conv.last_message_preview, "second");
    }

    #[tokio::test]
    async fn clear_keeps_conversation_and_rejects_replays() {
        let store = MemoryStore::new();
        let (conv, _) = store.resolve_or_create(Platform::Facebook, "U1").await.unwrap();
        store.add_tag(&conv.id, Tag::Vip).await.unwrap();
        store.set_status(&conv.id, ConversationStatus::Closed).await.unwrap();
        store.append_message(inbound(&conv.id, Some("m1"), "hi", Utc::now())).await.unwrap();
        let cleared = store.clear_messages(&conv.id).await.unwrap();
        assert!(cleared.tags.contains(&Tag::Vip));
        assert_eq!(cleared.status, ConversationStatus::Closed);
        assert!(store.list_messages(&conv.id).await.unwrap().is_empty());
        assert!(store
            .find_message_by_external_id(Platform::Facebook, "m1")
            .await
            .unwrap()
            .is_none());

        // A provider retry of the cleared message stays cleared.
        let replay = store
            .append_message(inbound(&conv.id, Some("m1"), "hi", Utc::now()))
            .await
            .unwrap();
        assert_eq!(replay, AppendOutcome::Duplicate);
        assert!(store.list_messages(&conv.id).await.unwrap().is_empty());
        assert!(store.is_known_message(Platform::Facebook, "m1").await.unwrap());
        assert!(!store.is_known_message(Platform::Instagram, "m1").await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_conversation_and_user_key() {
        let store = MemoryStore::new();
        let (conv, _) = store.resolve_or_create(Platform::Facebook, "U1").await.unwrap();
        store.delete_conversation(&conv.id).await.unwrap();
        assert!(store.get_conversation(&conv.id).await.unwrap().is_none());
        assert!(store.find_by_user(Platform::Facebook, "U1").await.unwrap().is_none());
        assert!(matches!(
            store.delete_conversation(&conv.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox.json");
        let conv_id = {
            let store = MemoryStore::open(&path).await.unwrap();
            let (conv, _) = store.resolve_or_create(Platform::Instagram, "U2").await.unwrap();
            store.append_message(inbound(&conv.id, Some("m7"), "yo", Utc::now())).await.unwrap();
            conv.id
        };
        let store = MemoryStore::open(&path).await.unwrap();
        assert_eq!(store.list_messages(&conv_id).await.unwrap().len(), 1);
        let dup = store.append_message(inbound(&conv_id, Some("m7"), "yo", Utc::now())).await.unwrap();
        assert_eq!(dup, AppendOutcome::Duplicate);

        store.clear_messages(&conv_id).await.unwrap();
        let store = MemoryStore::open(&path).await.unwrap();
        assert!(store.is_known_message(Platform::Instagram, "m7").await.unwrap());
    }

    #[tokio::test]
    async fn failed_write_leaves_state_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox.json");
        let store = MemoryStore::open(&path).await.unwrap();
        let (conv, _) = store.resolve_or_create(Platform::Facebook, "U1").await.unwrap();
        store.append_message(inbound(&conv.id, Some("m1"), "hi", Utc::now())).await.unwrap();

        // A directory where the snapshot file should be makes every write fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(store.set_status(&conv.id, ConversationStatus::Closed).await.is_err());
        assert!(store.add_tag(&conv.id, Tag::Urgent).await.is_err());
        assert!(store
            .append_message(inbound(&conv.id, Some("m2"), "again", Utc::now()))
            .await
            .is_err());
        assert!(store.clear_messages(&conv.id).await.is_err());
        assert!(store.delete_conversation(&conv.id).await.is_err());
        assert!(store.resolve_or_create(Platform::Facebook, "U2").await.is_err());

        let unchanged = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, ConversationStatus::Open);
        assert!(unchanged.tags.is_empty());
        assert_eq!(unchanged.unread_count, 1);
        assert_eq!(store.list_messages(&conv.id).await.unwrap().len(), 1);
        assert!(!store.is_known_message(Platform::Facebook, "m2").await.unwrap());
        assert!(store.find_by_user(Platform::Facebook, "U2").await.unwrap().is_none());
    }
}
