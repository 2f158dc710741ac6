//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.aicard/config.json`) and environment.
//! Environment variables win over file values when they are set and non-empty.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// DingTalk app credentials, card template and stream connection settings.
    #[serde(default)]
    pub dingtalk: DingTalkConfig,

    /// Generative-AI backend (Dify application API).
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Relay behavior: update throttle, fallback replies, temp files.
    #[serde(default)]
    pub relay: RelayConfig,
}

/// A required setting that is absent after file and env resolution.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing configuration: {0}")]
    Missing(&'static str),
}

/// DingTalk app settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DingTalkConfig {
    /// App key. Overridden by DINGTALK_APP_KEY env when set.
    pub client_id: Option<String>,
    /// App secret. Overridden by DINGTALK_APP_SECRET env when set.
    pub client_secret: Option<String>,
    /// Robot code used for media downloads and card delivery. Defaults to the client id.
    pub robot_code: Option<String>,
    /// AI card template id. Overridden by CARD_TEMPLATE_ID env when set.
    pub card_template_id: Option<String>,
    /// Template variable the streamed answer is written to.
    #[serde(default = "default_content_key")]
    pub content_key: String,
    /// Fixed delay between reconnect attempts of the stream connection.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// A stream session with no inbound traffic for this long is dropped and
    /// reconnected; a ping goes out after half of it. 0 disables the check.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// OpenAPI base (tests point this at a local server).
    #[serde(default = "default_dingtalk_api_base")]
    pub api_base: String,
}

/// Which upstream endpoint plain text messages are sent to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEndpoint {
    /// Chat application: POST chat-messages with `query`.
    #[default]
    Chat,
    /// Workflow application: POST workflows/run with input `query`.
    Workflow,
}

/// Dify application API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// Application API key. Overridden by DIFY_API_KEY env when set.
    pub api_key: Option<String>,
    /// API base, e.g. "https://api.dify.ai/v1". Overridden by DIFY_BASE_URL env when set.
    pub base_url: Option<String>,
    #[serde(default)]
    pub text_endpoint: TextEndpoint,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    #[serde(default = "default_workflow_path")]
    pub workflow_path: String,
    #[serde(default = "default_upload_path")]
    pub upload_path: String,
    /// Prompt passed to the image analysis workflow alongside the uploaded file.
    #[serde(default = "default_image_prompt")]
    pub image_prompt: String,
    /// Maximum silence between two reads of a streaming response. 0 disables the limit.
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
}

/// Relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Minimum character growth before an intermediate card update is pushed.
    /// Overridden by AICARD_THROTTLE_CHARS env when set.
    #[serde(default = "default_throttle_chars")]
    pub throttle_chars: usize,
    /// Reply sent for message types the bot does not handle. No card is created for those.
    #[serde(default = "default_unsupported_reply")]
    pub unsupported_reply: String,
    /// Directory for downloaded images while they are uploaded upstream (default: OS temp dir).
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// How long shutdown waits for in-flight messages.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_content_key() -> String {
    "content".to_string()
}

fn default_reconnect_delay_secs() -> u64 {
    3
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_dingtalk_api_base() -> String {
    "https://api.dingtalk.com".to_string()
}

fn default_chat_path() -> String {
    "/chat-messages".to_string()
}

fn default_workflow_path() -> String {
    "/workflows/run".to_string()
}

fn default_upload_path() -> String {
    "/files/upload".to_string()
}

fn default_image_prompt() -> String {
    "Describe this image in detail and point out anything noteworthy.".to_string()
}

fn default_stream_idle_timeout_secs() -> u64 {
    120
}

fn default_throttle_chars() -> usize {
    20
}

fn default_unsupported_reply() -> String {
    "Sorry, I can only read text and images.".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for DingTalkConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            robot_code: None,
            card_template_id: None,
            content_key: default_content_key(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            api_base: default_dingtalk_api_base(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            text_endpoint: TextEndpoint::default(),
            chat_path: default_chat_path(),
            workflow_path: default_workflow_path(),
            upload_path: default_upload_path(),
            image_prompt: default_image_prompt(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            throttle_chars: default_throttle_chars(),
            unsupported_reply: default_unsupported_reply(),
            temp_dir: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// Non-empty, trimmed value of an environment variable.
fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn nonempty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the DingTalk app key: env DINGTALK_APP_KEY overrides config.
pub fn resolve_client_id(config: &Config) -> Option<String> {
    env_nonempty("DINGTALK_APP_KEY").or_else(|| nonempty(&config.dingtalk.client_id))
}

/// Resolve the DingTalk app secret: env DINGTALK_APP_SECRET overrides config.
pub fn resolve_client_secret(config: &Config) -> Option<String> {
    env_nonempty("DINGTALK_APP_SECRET").or_else(|| nonempty(&config.dingtalk.client_secret))
}

/// Resolve the card template id: env CARD_TEMPLATE_ID overrides config.
pub fn resolve_card_template_id(config: &Config) -> Option<String> {
    env_nonempty("CARD_TEMPLATE_ID").or_else(|| nonempty(&config.dingtalk.card_template_id))
}

/// Robot code: explicit config value, else the resolved client id.
pub fn resolve_robot_code(config: &Config) -> Option<String> {
    nonempty(&config.dingtalk.robot_code).or_else(|| resolve_client_id(config))
}

/// Resolve the upstream API key: env DIFY_API_KEY overrides config.
pub fn resolve_upstream_api_key(config: &Config) -> Option<String> {
    env_nonempty("DIFY_API_KEY").or_else(|| nonempty(&config.upstream.api_key))
}

/// Resolve the upstream base URL (without trailing slash): env DIFY_BASE_URL overrides config.
pub fn resolve_upstream_base_url(config: &Config) -> Option<String> {
    env_nonempty("DIFY_BASE_URL")
        .or_else(|| nonempty(&config.upstream.base_url))
        .map(|u| u.trim_end_matches('/').to_string())
}

/// Resolve the coalescing threshold: env AICARD_THROTTLE_CHARS overrides config when it parses.
pub fn resolve_throttle_chars(config: &Config) -> usize {
    env_nonempty("AICARD_THROTTLE_CHARS")
        .and_then(|s| s.parse().ok())
        .unwrap_or(config.relay.throttle_chars)
}

/// DingTalk credentials required to open the stream connection.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub robot_code: String,
}

/// Resolve credentials or report the first missing field.
pub fn require_credentials(config: &Config) -> Result<Credentials, ConfigError> {
    let client_id = resolve_client_id(config).ok_or(ConfigError::Missing("dingtalk.clientId"))?;
    let client_secret =
        resolve_client_secret(config).ok_or(ConfigError::Missing("dingtalk.clientSecret"))?;
    let robot_code = resolve_robot_code(config).unwrap_or_else(|| client_id.clone());
    Ok(Credentials {
        client_id,
        client_secret,
        robot_code,
    })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("AICARD_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".aicard").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, AICARD_CONFIG_PATH, or the default path. Missing file => default config.
/// Returns the config and the path that was used.
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

/// Show only the first and last two characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 6 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 4), tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_every_section() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.dingtalk.content_key, "content");
        assert_eq!(config.dingtalk.reconnect_delay_secs, 3);
        assert_eq!(config.upstream.chat_path, "/chat-messages");
        assert_eq!(config.upstream.text_endpoint, TextEndpoint::Chat);
        assert_eq!(config.relay.throttle_chars, 20);
    }

    #[test]
    fn camel_case_keys_are_read() {
        let config: Config = serde_json::from_str(
            r#"{
                "dingtalk": { "clientId": "ding123", "cardTemplateId": "tpl.schema" },
                "upstream": { "baseUrl": "http://localhost/v1/", "textEndpoint": "workflow" },
                "relay": { "throttleChars": 5 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.dingtalk.client_id.as_deref(), Some("ding123"));
        assert_eq!(config.dingtalk.card_template_id.as_deref(), Some("tpl.schema"));
        assert_eq!(config.upstream.text_endpoint, TextEndpoint::Workflow);
        assert_eq!(config.relay.throttle_chars, 5);
    }

    #[test]
    fn robot_code_falls_back_to_client_id() {
        let mut config = Config::default();
        config.dingtalk.client_id = Some("app-key".into());
        config.dingtalk.robot_code = Some("   ".into());
        if std::env::var("DINGTALK_APP_KEY").is_err() {
            assert_eq!(resolve_robot_code(&config).as_deref(), Some("app-key"));
        }
    }

    #[test]
    fn missing_secret_is_reported_by_name() {
        let mut config = Config::default();
        config.dingtalk.client_id = Some("app-key".into());
        if std::env::var("DINGTALK_APP_SECRET").is_err() {
            let err = require_credentials(&config).unwrap_err();
            assert!(err.to_string().contains("dingtalk.clientSecret"));
        }
    }

    #[test]
    fn mask_secret_keeps_edges() {
        assert_eq!(mask_secret("abcdefgh"), "ab****gh");
        assert_eq!(mask_secret("abc"), "***");
    }
}
