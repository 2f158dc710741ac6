//! AI card projection: one card per handled message, updated in place until a
//! single terminal update (finished or failed).

use crate::channels::{DingTalkError, SenderContext};
use async_trait::async_trait;
use std::sync::Arc;

/// Shown when a card is dropped before it reached a terminal state.
const INTERRUPTED: &str = "processing was interrupted";

/// Remote card operations.
#[async_trait]
pub trait CardApi: Send + Sync {
    /// Create and deliver a card into the sender's conversation. Returns the card instance id.
    async fn create_card(
        &self,
        target: &SenderContext,
        template_id: &str,
        content_key: &str,
        initial: &str,
    ) -> Result<String, DingTalkError>;

    /// Write one field of a card.
    async fn stream_update(&self, update: &CardUpdate) -> Result<(), DingTalkError>;
}

/// One streaming update of a card field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardUpdate {
    pub card_id: String,
    pub key: String,
    pub value: String,
    pub append: bool,
    pub finished: bool,
    pub failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Pending,
    Finished,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum CardError {
    #[error("card is already {0:?}")]
    Terminated(CardState),
    #[error(transparent)]
    Api(#[from] DingTalkError),
}

/// A delivered card and its state: `Pending -> (push)* -> Finished | Failed`.
pub struct CardSession {
    api: Arc<dyn CardApi>,
    card_id: String,
    content_key: String,
    last_pushed: String,
    state: CardState,
}

impl CardSession {
    /// Create the remote card. Exactly one create per session.
    pub async fn create(
        api: Arc<dyn CardApi>,
        target: &SenderContext,
        template_id: &str,
        content_key: &str,
        initial: &str,
    ) -> Result<Self, DingTalkError> {
        let card_id = api
            .create_card(target, template_id, content_key, initial)
            .await?;
        Ok(Self {
            api,
            card_id,
            content_key: content_key.to_string(),
            last_pushed: initial.to_string(),
            state: CardState::Pending,
        })
    }

    pub fn card_id(&self) -> &str {
        &self.card_id
    }

    pub fn state(&self) -> CardState {
        self.state
    }

    pub fn last_pushed(&self) -> &str {
        &self.last_pushed
    }

    /// In-progress update.
    pub async fn push(&mut self, content: &str) -> Result<(), CardError> {
        self.ensure_pending()?;
        self.api
            .stream_update(&self.update(content, false, false))
            .await?;
        self.last_pushed = content.to_string();
        Ok(())
    }

    /// Terminal success. The session is terminal even if the update itself fails.
    pub async fn finish(&mut self, content: &str) -> Result<(), CardError> {
        self.ensure_pending()?;
        self.state = CardState::Finished;
        self.api
            .stream_update(&self.update(content, true, false))
            .await?;
        self.last_pushed = content.to_string();
        Ok(())
    }

    /// Terminal failure. The session is terminal even if the update itself fails.
    pub async fn fail(&mut self, message: &str) -> Result<(), CardError> {
        self.ensure_pending()?;
        self.state = CardState::Failed;
        self.api
            .stream_update(&self.update(message, false, true))
            .await?;
        self.last_pushed = message.to_string();
        Ok(())
    }

    fn ensure_pending(&self) -> Result<(), CardError> {
        match self.state {
            CardState::Pending => Ok(()),
            state => Err(CardError::Terminated(state)),
        }
    }

    fn update(&self, value: &str, finished: bool, failed: bool) -> CardUpdate {
        CardUpdate {
            card_id: self.card_id.clone(),
            key: self.content_key.clone(),
            value: value.to_string(),
            append: false,
            finished,
            failed,
        }
    }
}

impl Drop for CardSession {
    /// A pending card left behind (panic, aborted task) gets a best-effort failed update.
    fn drop(&mut self) {
        if self.state != CardState::Pending {
            return;
        }
        self.state = CardState::Failed;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("relay: card {} dropped while pending, no runtime to fail it", self.card_id);
            return;
        };
        let api = Arc::clone(&self.api);
        let update = self.update(INTERRUPTED, false, true);
        runtime.spawn(async move {
            if let Err(e) = api.stream_update(&update).await {
                log::warn!("relay: failing abandoned card {}: {}", update.card_id, e);
            }
        });
    }
}
