//! Platform capabilities the relay needs besides cards: access tokens, media and plain replies.

use crate::channels::dingtalk::DingTalkError;
use crate::channels::inbound::SenderContext;
use async_trait::async_trait;

/// Supplies a valid platform access token.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, DingTalkError>;
}

/// Exchanges a download code for the raw media bytes.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// `robot_code` is the robot that received the message.
    async fn download(&self, download_code: &str, robot_code: &str) -> Result<Vec<u8>, DingTalkError>;
}

/// Sends a plain text reply into the sender's conversation.
#[async_trait]
pub trait TextReplier: Send + Sync {
    async fn reply_text(&self, to: &SenderContext, text: &str) -> Result<(), DingTalkError>;
}
