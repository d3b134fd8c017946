//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.inbox/config.json`) and environment.
//! Secrets (gateway token, platform tokens, app secret) can always be overridden by env.

use crate::model::Platform;
use crate::templates::Template;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Provider settings (Meta webhook, Messenger, Instagram).
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Inbox behavior (polling, storage).
    #[serde(default)]
    pub inbox: InboxConfig,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 15252).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Auth settings. When absent, defaults to no auth for loopback bind.
    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require connect.auth.token.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret for WebSocket connect. Overridden by INBOX_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require connect.auth.token to match configured token.
    Token,
}

fn default_gateway_port() -> u16 {
    15252
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

/// Per-provider config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub meta: MetaWebhookConfig,
    #[serde(default)]
    pub facebook: FacebookChannelConfig,
    #[serde(default)]
    pub instagram: InstagramChannelConfig,
}

/// Webhook subscription settings shared by Messenger and Instagram.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaWebhookConfig {
    /// Token Meta echoes in the GET verification handshake. Overridden by META_VERIFY_TOKEN env.
    pub verify_token: Option<String>,
    /// App secret for X-Hub-Signature-256 checks. Overridden by META_APP_SECRET env. When unset, payloads are not signature-checked.
    pub app_secret: Option<String>,
    /// Graph API base URL (default https://graph.facebook.com/v19.0).
    pub graph_api_base: Option<String>,
}

/// Messenger (Facebook Page) config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacebookChannelConfig {
    /// Page access token. Overridden by FACEBOOK_PAGE_TOKEN env when set.
    pub page_access_token: Option<String>,
}

/// Instagram Direct config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstagramChannelConfig {
    /// Instagram messaging access token. Overridden by INSTAGRAM_ACCESS_TOKEN env when set.
    pub access_token: Option<String>,
}

/// Inbox behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxConfig {
    /// Seconds between conversation list refreshes (default 30).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// JSON snapshot file for the store. Relative paths resolve against the config file's parent. Default: `inbox.json` next to the config.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    /// Look up display name and picture when a conversation is first seen (default true).
    #[serde(default = "default_true")]
    pub fetch_profiles: bool,
    /// Saved reply templates, sent by name with `{{variable}}` values.
    #[serde(default)]
    pub templates: Vec<Template>,
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            store_path: None,
            fetch_profiles: true,
            templates: Vec::new(),
        }
    }
}

/// Env var wins when set and non-empty; otherwise the trimmed config value.
fn env_or(var: &str, configured: Option<&String>) -> Option<String> {
    std::env::var(var)
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            configured
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the gateway token: env INBOX_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    env_or("INBOX_GATEWAY_TOKEN", config.gateway.auth.token.as_ref())
}

/// Resolve the webhook verify token: env META_VERIFY_TOKEN overrides config.
pub fn resolve_verify_token(config: &Config) -> Option<String> {
    env_or("META_VERIFY_TOKEN", config.channels.meta.verify_token.as_ref())
}

/// Resolve the app secret used for payload signatures: env META_APP_SECRET overrides config.
pub fn resolve_app_secret(config: &Config) -> Option<String> {
    env_or("META_APP_SECRET", config.channels.meta.app_secret.as_ref())
}

/// Resolve a platform access token (FACEBOOK_PAGE_TOKEN / INSTAGRAM_ACCESS_TOKEN override config).
pub fn resolve_platform_token(config: &Config, platform: Platform) -> Option<String> {
    match platform {
        Platform::Facebook => env_or(
            "FACEBOOK_PAGE_TOKEN",
            config.channels.facebook.page_access_token.as_ref(),
        ),
        Platform::Instagram => env_or(
            "INSTAGRAM_ACCESS_TOKEN",
            config.channels.instagram.access_token.as_ref(),
        ),
    }
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("INBOX_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".inbox").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used (for resolving the config directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Resolve the store snapshot path: `inbox.storePath` (relative to the config file's parent) or `inbox.json` next to the config.
pub fn resolve_store_path(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.inbox.store_path {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                p.clone()
            } else {
                config_parent.join(p)
            }
        }
        _ => config_parent.join("inbox.json"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_port_and_bind() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 15252);
        assert_eq!(g.bind, "127.0.0.1");
    }

    #[test]
    fn empty_json_gives_defaults() {
        let c: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(c.inbox.poll_interval_secs, 30);
        assert!(c.inbox.fetch_profiles);
        assert_eq!(c.gateway.auth.mode, GatewayAuthMode::None);
    }

    #[test]
    fn parses_camel_case_channel_settings() {
        let c: Config = serde_json::from_str(
            r#"{
                "channels": {
                    "meta": { "verifyToken": "v", "appSecret": "s" },
                    "facebook": { "pageAccessToken": " fb " }
                },
                "inbox": { "pollIntervalSecs": 5, "fetchProfiles": false }
            }"#,
        )
        .unwrap();
        assert_eq!(c.channels.meta.verify_token.as_deref(), Some("v"));
        assert_eq!(c.inbox.poll_interval_secs, 5);
        assert!(!c.inbox.fetch_profiles);
        assert!(c.inbox.templates.is_empty());
        assert_eq!(
            env_or("INBOX_TEST_UNSET_VAR", c.channels.facebook.page_access_token.as_ref()),
            Some("fb".to_string())
        );
    }

    #[test]
    fn resolve_store_path_default() {
        let config = Config::default();
        let path = Path::new("/home/user/.inbox/config.json");
        assert_eq!(
            resolve_store_path(&config, path),
            PathBuf::from("/home/user/.inbox/inbox.json")
        );
    }

    #[test]
    fn resolve_store_path_relative_and_absolute() {
        let mut config = Config::default();
        let path = Path::new("/home/user/.inbox/config.json");
        config.inbox.store_path = Some(PathBuf::from("data/store.json"));
        assert_eq!(
            resolve_store_path(&config, path),
            PathBuf::from("/home/user/.inbox/data/store.json")
        );
        config.inbox.store_path = Some(PathBuf::from("/var/lib/inbox.json"));
        assert_eq!(
            resolve_store_path(&config, path),
            PathBuf::from("/var/lib/inbox.json")
        );
    }
}
