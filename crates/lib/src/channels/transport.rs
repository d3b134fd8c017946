//! Seams to the outside world: outbound send, profile lookup, and credentials.
//!
//! The delivery manager and webhook normalizer only see these traits; the Meta Graph
//! client in `meta` is the production implementation.

use crate::model::{ConversationId, Platform, TempId};
use crate::store::Profile;
use async_trait::async_trait;

/// Longest text message the providers accept, in characters.
pub const MAX_TEXT_CHARS: usize = 2000;

/// Graph API error codes that mean the app lacks a permission or review approval.
const CAPABILITY_ERROR_CODES: &[i64] = &[3, 10];
const PERMISSION_ERROR_CODE_RANGE: std::ops::RangeInclusive<i64> = 200..=299;
/// Code 10 with this subcode is the 24h messaging window, not a missing permission.
const OUTSIDE_WINDOW_SUBCODE: i64 = 2018278;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Provider refused because a permission or app review approval is missing.
    #[error("{message}")]
    Capability { code: Option<i64>, message: String },
    #[error("no active access token for {0}")]
    MissingCredentials(Platform),
    #[error("provider api error {status}: {message}")]
    Api {
        status: u16,
        code: Option<i64>,
        message: String,
    },
    #[error("provider request failed: {0}")]
    Request(String),
}

impl ChannelError {
    pub fn is_capability(&self) -> bool {
        matches!(self, ChannelError::Capability { .. })
    }

    /// Build the right variant from a Graph API error body.
    pub fn from_api(status: u16, code: Option<i64>, subcode: Option<i64>, message: String) -> Self {
        let capability = match code {
            Some(10) if subcode == Some(OUTSIDE_WINDOW_SUBCODE) => false,
            Some(c) => CAPABILITY_ERROR_CODES.contains(&c) || PERMISSION_ERROR_CODE_RANGE.contains(&c),
            None => false,
        };
        let lower = message.to_lowercase();
        if capability || lower.contains("app review") || lower.contains("does not have the capability")
        {
            ChannelError::Capability { code, message }
        } else {
            ChannelError::Api {
                status,
                code,
                message,
            }
        }
    }
}

impl From<reqwest::Error> for ChannelError {
    fn from(e: reqwest::Error) -> Self {
        ChannelError::Request(e.to_string())
    }
}

/// One outbound message as handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub conversation_id: ConversationId,
    pub platform: Platform,
    /// Platform-scoped id of the counterpart.
    pub recipient_id: String,
    pub content: String,
    /// Client-supplied id echoed back by providers that support it.
    pub correlation_id: TempId,
}

/// Provider acknowledgement of an accepted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub external_message_id: String,
}

#[async_trait]
pub trait OutboundTransport: Send + Sync {
    async fn send_message(&self, request: &OutboundRequest) -> Result<SendReceipt, ChannelError>;
}

#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn fetch_profile(
        &self,
        platform: Platform,
        external_user_id: &str,
    ) -> Result<Profile, ChannelError>;
}

/// Connection metadata for one platform.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub platform: Platform,
    pub connected: bool,
}

/// Source of platform access tokens. Token absence is a per-call error, never a crash.
pub trait CredentialsProvider: Send + Sync {
    fn active_token(&self, platform: Platform) -> Option<String>;

    fn connection_status(&self) -> Vec<ConnectionStatus> {
        [Platform::Facebook, Platform::Instagram]
            .into_iter()
            .map(|platform| ConnectionStatus {
                platform,
                connected: self.active_token(platform).is_some(),
            })
            .collect()
    }
}

/// Tokens fixed at startup (resolved from config and environment).
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    pub facebook: Option<String>,
    pub instagram: Option<String>,
}

impl StaticCredentials {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            facebook: crate::config::resolve_platform_token(config, Platform::Facebook),
            instagram: crate::config::resolve_platform_token(config, Platform::Instagram),
        }
    }
}

impl CredentialsProvider for StaticCredentials {
    fn active_token(&self, platform: Platform) -> Option<String> {
        match platform {
            Platform::Facebook => self.facebook.clone(),
            Platform::Instagram => self.instagram.clone(),
        }
    }
}
