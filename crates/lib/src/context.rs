//! Application context: resolved config and the shared clients built from it.
//!
//! Built once by the binary and passed down; every handler task shares the same
//! HTTP client and token cache.

use crate::channels::{DingTalkClient, DingTalkConnector, DingTalkTokenCache, FrameHandler, Supervisor};
use crate::config::{self, Config, ConfigError, Credentials};
use crate::llm::DifyClient;
use crate::relay::{Relay, RelaySettings};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AppContext {
    pub config: Config,
    pub http: reqwest::Client,
    pub credentials: Credentials,
    pub tokens: Arc<DingTalkTokenCache>,
}

impl AppContext {
    /// Fails when the DingTalk credentials are missing.
    pub fn new(config: Config) -> Result<Self> {
        let credentials = config::require_credentials(&config)?;
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        let tokens = Arc::new(DingTalkTokenCache::new(
            http.clone(),
            &config.dingtalk.api_base,
            &credentials,
        ));
        Ok(Self {
            config,
            http,
            credentials,
            tokens,
        })
    }

    /// Relay settings resolved from config and env. Fails without a card template.
    pub fn relay_settings(&self) -> Result<RelaySettings, ConfigError> {
        RelaySettings::from_config(&self.config)
    }

    /// Relay wired to the DingTalk OpenAPI and the Dify backend.
    pub fn relay(&self, settings: RelaySettings) -> Arc<Relay> {
        let dify = DifyClient::from_config(self.http.clone(), &self.config);
        if !dify.is_configured() {
            log::warn!("relay: upstream api key or base url not set; every card will fail");
        }
        let platform = Arc::new(DingTalkClient::new(
            self.http.clone(),
            &self.config.dingtalk.api_base,
            self.credentials.robot_code.clone(),
            self.tokens.clone(),
        ));
        Arc::new(Relay::new(
            platform.clone(),
            Arc::new(dify),
            platform.clone(),
            platform,
            settings,
        ))
    }

    /// Supervisor for the Stream mode connection, dispatching to `handler`.
    pub fn supervisor(&self, handler: Arc<dyn FrameHandler>) -> Supervisor {
        let connector = Arc::new(
            DingTalkConnector::new(
                self.http.clone(),
                &self.config.dingtalk.api_base,
                self.credentials.clone(),
            )
            .with_idle_timeout(Some(Duration::from_secs(self.config.dingtalk.idle_timeout_secs))),
        );
        Supervisor::new(
            connector,
            handler,
            Duration::from_secs(self.config.dingtalk.reconnect_delay_secs),
            Duration::from_secs(self.config.relay.shutdown_grace_secs),
        )
    }
}
