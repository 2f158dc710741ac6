//! Per-message pipeline: classify, create the card, stream the upstream answer into it.

use crate::channels::{
    CallbackFrame, DingTalkError, FrameHandler, ImageRef, InboundMessage, MediaSource, TextReplier,
    BOT_MESSAGE_TOPIC,
};
use crate::config::{self, Config, ConfigError};
use crate::llm::{Snapshot, SnapshotStream, Upstream, UpstreamError, NO_RESULT};
use crate::relay::card::{CardApi, CardError, CardSession, CardState};
use crate::relay::coalesce::Coalescer;
use crate::relay::router::{classify, Route};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Settings the relay reads per message.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub template_id: String,
    pub content_key: String,
    pub throttle_chars: usize,
    pub unsupported_reply: String,
    /// Where downloaded images are kept while uploaded; None = OS temp dir.
    pub temp_dir: Option<PathBuf>,
    /// Fallback when the callback does not name the receiving robot.
    pub robot_code: String,
}

impl RelaySettings {
    /// Resolve from config (env overrides applied). The card template is required.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let template_id = config::resolve_card_template_id(config)
            .ok_or(ConfigError::Missing("dingtalk.cardTemplateId"))?;
        Ok(Self {
            template_id,
            content_key: config.dingtalk.content_key.clone(),
            throttle_chars: config::resolve_throttle_chars(config),
            unsupported_reply: config.relay.unsupported_reply.clone(),
            temp_dir: config.relay.temp_dir.clone(),
            robot_code: config::resolve_robot_code(config).unwrap_or_default(),
        })
    }
}

/// Anything that ends a card as failed.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("image download code not found")]
    MissingDownloadCode,
    #[error("image download failed: {0}")]
    MediaDownload(DingTalkError),
    #[error("temp file: {0}")]
    TempFile(std::io::Error),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Card(#[from] CardError),
}

/// Handles inbound messages. Shared by all handler tasks; holds no per-message state.
pub struct Relay {
    cards: Arc<dyn CardApi>,
    upstream: Arc<dyn Upstream>,
    media: Arc<dyn MediaSource>,
    replier: Arc<dyn TextReplier>,
    settings: RelaySettings,
}

/// Work that needs a card.
enum Job<'a> {
    Text(&'a str),
    Image(&'a ImageRef),
}

impl Relay {
    pub fn new(
        cards: Arc<dyn CardApi>,
        upstream: Arc<dyn Upstream>,
        media: Arc<dyn MediaSource>,
        replier: Arc<dyn TextReplier>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            cards,
            upstream,
            media,
            replier,
            settings,
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Handle one message to completion. Never returns an error: failures end
    /// up on the card, or in the log when no card exists.
    pub async fn handle_message(&self, message: InboundMessage) {
        log::info!(
            "relay: message {} from {} in {}",
            message.id,
            message.sender.sender_nick.as_deref().unwrap_or("?"),
            message.sender.conversation_id
        );
        match classify(&message) {
            Route::Text(query) => self.relay_to_card(&message, Job::Text(&query)).await,
            Route::Image(image) => self.relay_to_card(&message, Job::Image(&image)).await,
            Route::Unsupported(kind) => {
                log::info!("relay: unsupported message type {:?} in {}", kind, message.id);
                if let Err(e) = self
                    .replier
                    .reply_text(&message.sender, &self.settings.unsupported_reply)
                    .await
                {
                    log::warn!("relay: unsupported-type reply for {} failed: {}", message.id, e);
                }
            }
        }
    }

    async fn relay_to_card(&self, message: &InboundMessage, job: Job<'_>) {
        let mut card = match CardSession::create(
            Arc::clone(&self.cards),
            &message.sender,
            &self.settings.template_id,
            &self.settings.content_key,
            "",
        )
        .await
        {
            Ok(card) => card,
            Err(e) => {
                log::error!("relay: creating card for {} failed: {}", message.id, e);
                return;
            }
        };
        log::debug!("relay: card {} created for {}", card.card_id(), message.id);

        match self.stream_into(&mut card, message, job).await {
            Ok(()) => log::info!("relay: card {} finished", card.card_id()),
            Err(RelayError::Card(CardError::Terminated(state))) => {
                log::warn!("relay: card {} already {:?}", card.card_id(), state);
            }
            Err(e) => {
                log::warn!("relay: card {} failed: {}", card.card_id(), e);
                // A finish whose network call failed already made the card terminal.
                if card.state() == CardState::Pending {
                    if let Err(e) = card.fail(&format!("processing failed: {}", e)).await {
                        log::warn!("relay: marking card {} failed: {}", card.card_id(), e);
                    }
                }
            }
        }
    }

    async fn stream_into(
        &self,
        card: &mut CardSession,
        message: &InboundMessage,
        job: Job<'_>,
    ) -> Result<(), RelayError> {
        let user = message.sender.user_id();
        match job {
            Job::Text(query) => {
                let stream = self.upstream.answer_text(query, user).await?;
                self.pump(card, stream).await
            }
            Job::Image(image) => {
                let code = image
                    .download_code
                    .as_deref()
                    .ok_or(RelayError::MissingDownloadCode)?;
                let robot_code = message
                    .sender
                    .robot_code
                    .as_deref()
                    .unwrap_or(&self.settings.robot_code);
                let bytes = self
                    .media
                    .download(code, robot_code)
                    .await
                    .map_err(RelayError::MediaDownload)?;
                let file = self.write_temp_image(&bytes).await?;
                let stream = self.upstream.analyze_image(file.path(), user).await?;
                let result = self.pump(card, stream).await;
                if let Err(e) = file.close() {
                    log::warn!("relay: removing temp image: {}", e);
                }
                result
            }
        }
    }

    /// The file is removed when the handle is dropped, on every path.
    async fn write_temp_image(&self, bytes: &[u8]) -> Result<NamedTempFile, RelayError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("aicard-").suffix(image_extension(bytes));
        let file = match &self.settings.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(RelayError::TempFile)?;
        tokio::fs::write(file.path(), bytes)
            .await
            .map_err(RelayError::TempFile)?;
        log::debug!("relay: image ({} bytes) at {}", bytes.len(), file.path().display());
        Ok(file)
    }

    /// Drive the snapshot stream into the card: throttled pushes, a final push unless
    /// the card already shows that text, then finish.
    async fn pump(&self, card: &mut CardSession, mut stream: SnapshotStream) -> Result<(), RelayError> {
        let mut coalescer = Coalescer::new(self.settings.throttle_chars);
        let mut last: Option<Snapshot> = None;
        while let Some(snapshot) = stream.next().await {
            let snapshot = snapshot?;
            if coalescer.offer(&snapshot) {
                card.push(&snapshot.content).await?;
            }
            last = Some(snapshot);
        }
        let last = last
            .filter(|s| !s.is_blank())
            .unwrap_or_else(|| Snapshot::new(NO_RESULT));
        if coalescer.finish(&last) && card.last_pushed() != last.content {
            card.push(&last.content).await?;
        }
        card.finish(&last.content).await?;
        Ok(())
    }
}

#[async_trait]
impl FrameHandler for Relay {
    async fn handle(&self, frame: CallbackFrame) {
        if frame.topic != BOT_MESSAGE_TOPIC {
            log::debug!("relay: ignoring frame {} on topic {}", frame.message_id, frame.topic);
            return;
        }
        match InboundMessage::from_callback(&frame.data) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => log::warn!("relay: unreadable bot message {}: {}", frame.message_id, e),
        }
    }
}

/// File suffix from the image magic bytes; upstream picks the mime type from it.
fn image_extension(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        ".png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        ".jpg"
    } else if bytes.starts_with(b"GIF8") {
        ".gif"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        ".webp"
    } else {
        ".jpg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_from_magic_bytes() {
        assert_eq!(image_extension(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A]), ".png");
        assert_eq!(image_extension(&[0xFF, 0xD8, 0xFF, 0xE0]), ".jpg");
        assert_eq!(image_extension(b"GIF89a"), ".gif");
        assert_eq!(image_extension(b"RIFF\0\0\0\0WEBPVP8 "), ".webp");
        assert_eq!(image_extension(b"??"), ".jpg");
    }

    #[test]
    fn settings_require_template() {
        let mut config = Config::default();
        config.dingtalk.card_template_id = None;
        if std::env::var("CARD_TEMPLATE_ID").map(|v| v.trim().is_empty()).unwrap_or(true) {
            assert!(matches!(
                RelaySettings::from_config(&config),
                Err(ConfigError::Missing("dingtalk.cardTemplateId"))
            ));
        }
        config.dingtalk.card_template_id = Some("tpl.schema".into());
        config.dingtalk.client_id = Some("ding-app".into());
        let settings = RelaySettings::from_config(&config).unwrap();
        assert_eq!(settings.content_key, "content");
        assert!(!settings.template_id.is_empty());
    }
}
