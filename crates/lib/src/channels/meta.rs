//! Meta Graph API client: Messenger and Instagram Direct sends plus profile lookup.

use crate::channels::transport::{
    ChannelError, CredentialsProvider, OutboundRequest, OutboundTransport, ProfileLookup,
    SendReceipt,
};
use crate::model::Platform;
use crate::store::Profile;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_GRAPH_API_BASE: &str = "https://graph.facebook.com/v19.0";

/// Upper bound for one Graph API call, connect included.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct SendResponse {
    message_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: GraphErrorBody,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    error_subcode: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    profile_pic: Option<String>,
}

/// Graph API client shared by both platforms; the token is chosen per call from the credentials provider.
#[derive(Clone)]
pub struct MetaClient {
    base_url: String,
    client: reqwest::Client,
    credentials: Arc<dyn CredentialsProvider>,
}

impl MetaClient {
    pub fn new(
        base_url: Option<String>,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Result<Self, ChannelError> {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_GRAPH_API_BASE.to_string());
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url,
            client,
            credentials,
        })
    }

    fn token(&self, platform: Platform) -> Result<String, ChannelError> {
        self.credentials
            .active_token(platform)
            .ok_or(ChannelError::MissingCredentials(platform))
    }

    async fn error_from_response(res: reqwest::Response) -> ChannelError {
        let status = res.status().as_u16();
        let body = res.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(env) => ChannelError::from_api(
                status,
                env.error.code,
                env.error.error_subcode,
                env.error.message,
            ),
            Err(_) => ChannelError::Api {
                status,
                code: None,
                message: body,
            },
        }
    }
}

fn send_body(request: &OutboundRequest) -> serde_json::Value {
    let mut message = serde_json::json!({ "text": request.content });
    // Only Messenger returns metadata on the echo event.
    if request.platform == Platform::Facebook {
        message["metadata"] = serde_json::Value::String(request.correlation_id.clone());
    }
    serde_json::json!({
        "recipient": { "id": request.recipient_id },
        "messaging_type": "RESPONSE",
        "message": message,
    })
}

#[async_trait]
impl OutboundTransport for MetaClient {
    /// POST /me/messages with the platform's token.
    async fn send_message(&self, request: &OutboundRequest) -> Result<SendReceipt, ChannelError> {
        let token = self.token(request.platform)?;
        let url = format!("{}/me/messages", self.base_url);
        let res = self
            .client
            .post(&url)
            .query(&[("access_token", token.as_str())])
            .json(&send_body(request))
            .send()
            .await?;
        if !res.status().is_success() {
            let err = Self::error_from_response(res).await;
            log::warn!(
                "{} send to {} failed: {}",
                request.platform,
                request.recipient_id,
                err
            );
            return Err(err);
        }
        let data: SendResponse = res.json().await?;
        log::debug!("{} send accepted: {}", request.platform, data.message_id);
        Ok(SendReceipt {
            external_message_id: data.message_id,
        })
    }
}

#[async_trait]
impl ProfileLookup for MetaClient {
    /// GET /{user-id}?fields=... for display name and picture.
    async fn fetch_profile(
        &self,
        platform: Platform,
        external_user_id: &str,
    ) -> Result<Profile, ChannelError> {
        let token = self.token(platform)?;
        let fields = match platform {
            Platform::Facebook => "name,profile_pic",
            Platform::Instagram => "name,username,profile_pic",
        };
        let url = format!("{}/{}", self.base_url, external_user_id);
        let res = self
            .client
            .get(&url)
            .query(&[("fields", fields), ("access_token", token.as_str())])
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(Self::error_from_response(res).await);
        }
        let data: ProfileResponse = res.json().await?;
        Ok(Profile {
            display_name: data.name.filter(|n| !n.trim().is_empty()).or(data.username),
            profile_pic_url: data.profile_pic,
        })
    }
}
