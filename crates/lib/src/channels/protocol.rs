//! DingTalk Stream mode wire types (connection open, frames, acks).

use serde::{Deserialize, Serialize};

/// Topic of robot message callbacks.
pub const BOT_MESSAGE_TOPIC: &str = "/v1.0/im/bot/messages/get";

/// Body of POST /v1.0/gateway/connections/open.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenConnectionRequest {
    pub client_id: String,
    pub client_secret: String,
    pub subscriptions: Vec<Subscription>,
    pub ua: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    #[serde(rename = "type")]
    pub typ: String,
    pub topic: String,
}

/// Response of connections/open: WebSocket endpoint and one-time ticket.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenConnectionResponse {
    pub endpoint: String,
    pub ticket: String,
}

/// Frame kind: `SYSTEM` (ping/disconnect), `EVENT`, `CALLBACK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameType {
    System,
    Event,
    Callback,
}

/// Wire frame: `{ "specVersion", "type", "headers", "data" }`; `data` is a JSON string.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFrame {
    #[serde(default)]
    pub spec_version: Option<String>,
    #[serde(rename = "type")]
    pub typ: FrameType,
    #[serde(default)]
    pub headers: FrameHeaders,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameHeaders {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Ack written back for every frame: `{ "code", "headers", "message", "data" }`.
#[derive(Debug, Clone, Serialize)]
pub struct AckFrame {
    pub code: u16,
    pub headers: AckHeaders,
    pub message: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckHeaders {
    pub content_type: String,
    pub message_id: String,
}

/// A non-system frame handed to the relay.
#[derive(Debug, Clone)]
pub struct CallbackFrame {
    pub kind: FrameType,
    pub topic: String,
    pub message_id: String,
    pub data: String,
}

impl AckFrame {
    pub fn ok(message_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            code: 200,
            headers: AckHeaders {
                content_type: "application/json".to_string(),
                message_id: message_id.into(),
            },
            message: "OK".to_string(),
            data: data.into(),
        }
    }

    /// Ack for a callback or event frame.
    pub fn for_frame(frame: &CallbackFrame) -> Self {
        let data = match frame.kind {
            FrameType::Event => r#"{"status":"SUCCESS","message":"success"}"#,
            _ => r#"{"response":null}"#,
        };
        Self::ok(frame.message_id.clone(), data)
    }
}

impl OpenConnectionRequest {
    /// Subscribe to all events and to robot message callbacks.
    pub fn new(client_id: &str, client_secret: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            subscriptions: vec![
                Subscription {
                    typ: "EVENT".to_string(),
                    topic: "*".to_string(),
                },
                Subscription {
                    typ: "CALLBACK".to_string(),
                    topic: BOT_MESSAGE_TOPIC.to_string(),
                },
            ],
            ua: format!("aicard/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}
