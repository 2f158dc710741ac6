//! DingTalk channel: Stream mode connection, inbound bot messages, and the
//! platform OpenAPI (tokens, cards, media, plain replies).
//!
//! The supervisor keeps the connection alive and hands each callback frame to a
//! `FrameHandler` on its own task.

mod dingtalk;
mod inbound;
mod platform;
mod protocol;
mod supervisor;

pub use dingtalk::{DingTalkClient, DingTalkConnector, DingTalkError, DingTalkTokenCache, WsSession};
pub use inbound::{ContentKind, ConversationType, ImageRef, InboundMessage, SenderContext};
pub use platform::{MediaSource, TextReplier, TokenProvider};
pub use protocol::{
    AckFrame, CallbackFrame, FrameType, OpenConnectionRequest, OpenConnectionResponse, StreamFrame,
    BOT_MESSAGE_TOPIC,
};
pub use supervisor::{ConnectionState, Connector, FrameHandler, StreamSession, Supervisor};
