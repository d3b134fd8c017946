//! Canonical conversation and message model shared by every inbox component.
//!
//! Provider payloads are normalized into these types at the webhook boundary; nothing
//! downstream branches on the provider shape again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Opaque conversation identifier, stable per external thread.
pub type ConversationId = String;

/// Internal message identifier.
pub type MessageId = String;

/// Locally generated identifier of a pending outbound send.
pub type TempId = String;

/// External chat platform a conversation lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Facebook,
    Instagram,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Facebook => "facebook",
            Platform::Instagram => "instagram",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle flag of a conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Open,
    Closed,
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "open" => Ok(ConversationStatus::Open),
            "closed" => Ok(ConversationStatus::Closed),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// Status filter for conversation listing (`all` means unfiltered).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    #[default]
    All,
    Open,
    Closed,
}

impl StatusFilter {
    pub fn matches(&self, status: ConversationStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Open => status == ConversationStatus::Open,
            StatusFilter::Closed => status == ConversationStatus::Closed,
        }
    }
}

impl FromStr for StatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "all" => Ok(StatusFilter::All),
            "open" => Ok(StatusFilter::Open),
            "closed" => Ok(StatusFilter::Closed),
            other => Err(format!("unknown status filter: {}", other)),
        }
    }
}

/// Fixed tag vocabulary agents can attach to a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    Lead,
    Customer,
    Support,
    Urgent,
    FollowUp,
    Vip,
}

impl FromStr for Tag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "lead" => Ok(Tag::Lead),
            "customer" => Ok(Tag::Customer),
            "support" => Ok(Tag::Support),
            "urgent" => Ok(Tag::Urgent),
            "follow_up" => Ok(Tag::FollowUp),
            "vip" => Ok(Tag::Vip),
            other => Err(format!("unknown tag: {}", other)),
        }
    }
}

/// The durable thread between the business and one external platform user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub platform: Platform,
    pub external_user_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_pic_url: Option<String>,
    #[serde(default)]
    pub status: ConversationStatus,
    #[serde(default)]
    pub tags: BTreeSet<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_message_preview: String,
    #[serde(default)]
    pub unread_count: u32,
}

impl Conversation {
    /// A freshly discovered conversation: open, untagged, nothing unread.
    pub fn new(platform: Platform, external_user_id: impl Into<String>) -> Self {
        Self {
            id: format!("conv-{}", uuid::Uuid::new_v4()),
            platform,
            external_user_id: external_user_id.into(),
            display_name: String::new(),
            profile_pic_url: None,
            status: ConversationStatus::Open,
            tags: BTreeSet::new(),
            last_message_at: None,
            last_message_preview: String::new(),
            unread_count: 0,
        }
    }
}

/// Attachment kind carried alongside (or instead of) text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
    Sticker,
    Other,
}

impl MessageType {
    /// Map a provider attachment `type` string.
    pub fn from_attachment(kind: &str) -> Self {
        match kind {
            "image" => MessageType::Image,
            "video" | "reel" | "ig_reel" => MessageType::Video,
            "audio" => MessageType::Audio,
            "file" => MessageType::File,
            "sticker" | "like_heart" => MessageType::Sticker,
            _ => MessageType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Video => "video",
            MessageType::Audio => "audio",
            MessageType::File => "file",
            MessageType::Sticker => "sticker",
            MessageType::Other => "attachment",
        }
    }
}

/// A single durable, ordered unit of content within a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_message_id: Option<String>,
    pub conversation_id: ConversationId,
    pub is_from_customer: bool,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    /// Short text for the conversation list: the content, or `[image]` style for attachment-only messages.
    pub fn preview(&self) -> String {
        let text = self.content.trim();
        if !text.is_empty() {
            return truncate_preview(text);
        }
        format!("[{}]", self.message_type.as_str())
    }
}

const PREVIEW_MAX_CHARS: usize = 120;

fn truncate_preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_MAX_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(PREVIEW_MAX_CHARS - 1).collect();
    out.push('…');
    out
}

/// A message about to be appended to the store (ids and conversation stats are assigned by the store).
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub external_message_id: Option<String>,
    pub is_from_customer: bool,
    pub content: String,
    pub media_url: Option<String>,
    pub message_type: MessageType,
    pub sent_at: DateTime<Utc>,
}

/// Client-visible delivery state of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    /// Reserved for provider delivery receipts. Those webhook events are currently
    /// acknowledged and dropped, so nothing produces this state yet.
    Delivered,
    Failed,
}
