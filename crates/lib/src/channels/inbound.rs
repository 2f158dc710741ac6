//! Inbound message from DingTalk: the robot callback payload and its classified form.

use serde::Deserialize;

/// Reference to an image the platform holds for us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Code to exchange (with the robot code) for a download URL. None when the payload has none.
    pub download_code: Option<String>,
}

/// What the message carries, as far as the relay is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentKind {
    Text(String),
    Image(ImageRef),
    /// Platform message type the bot does not handle (e.g. "audio", "file").
    Unsupported(String),
}

/// Single chat or group chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationType {
    Single,
    Group,
}

/// Who sent the message and where to answer.
#[derive(Debug, Clone)]
pub struct SenderContext {
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    pub sender_staff_id: Option<String>,
    pub sender_id: Option<String>,
    pub sender_nick: Option<String>,
    pub robot_code: Option<String>,
    /// Short-lived webhook for plain replies into the same conversation.
    pub session_webhook: Option<String>,
}

impl SenderContext {
    /// Stable id for the end user, passed upstream as `user`.
    pub fn user_id(&self) -> &str {
        self.sender_staff_id
            .as_deref()
            .or(self.sender_id.as_deref())
            .unwrap_or(&self.conversation_id)
    }
}

/// A message from a channel to be relayed. Immutable once received.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: String,
    pub sender: SenderContext,
    pub kind: ContentKind,
    /// Raw callback data as received.
    pub payload: serde_json::Value,
}

/// Robot callback (`/v1.0/im/bot/messages/get`) data, as far as we read it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatbotMessage {
    #[serde(default)]
    msg_id: String,
    #[serde(default)]
    msgtype: String,
    #[serde(default)]
    conversation_id: String,
    #[serde(default)]
    conversation_type: Option<String>,
    #[serde(default)]
    sender_staff_id: Option<String>,
    #[serde(default)]
    sender_id: Option<String>,
    #[serde(default)]
    sender_nick: Option<String>,
    #[serde(default)]
    robot_code: Option<String>,
    #[serde(default)]
    session_webhook: Option<String>,
    #[serde(default)]
    text: Option<TextContent>,
    #[serde(default)]
    content: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    #[serde(default)]
    content: String,
}

impl InboundMessage {
    /// Parse robot callback data (the JSON string inside a stream frame).
    pub fn from_callback(data: &str) -> Result<Self, serde_json::Error> {
        let payload: serde_json::Value = serde_json::from_str(data)?;
        let msg: ChatbotMessage = serde_json::from_value(payload.clone())?;
        let kind = classify_content(&msg);
        let conversation_type = match msg.conversation_type.as_deref() {
            Some("2") => ConversationType::Group,
            _ => ConversationType::Single,
        };
        Ok(Self {
            id: msg.msg_id,
            sender: SenderContext {
                conversation_id: msg.conversation_id,
                conversation_type,
                sender_staff_id: msg.sender_staff_id.filter(|s| !s.is_empty()),
                sender_id: msg.sender_id.filter(|s| !s.is_empty()),
                sender_nick: msg.sender_nick,
                robot_code: msg.robot_code.filter(|s| !s.is_empty()),
                session_webhook: msg.session_webhook.filter(|s| !s.is_empty()),
            },
            kind,
            payload,
        })
    }
}

/// Primary `downloadCode`, else `pictureDownloadCode`.
fn download_code(value: &serde_json::Value) -> Option<String> {
    ["downloadCode", "pictureDownloadCode"]
        .iter()
        .filter_map(|k| value.get(*k).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn classify_content(msg: &ChatbotMessage) -> ContentKind {
    match msg.msgtype.as_str() {
        "text" => ContentKind::Text(
            msg.text
                .as_ref()
                .map(|t| t.content.trim().to_string())
                .unwrap_or_default(),
        ),
        "picture" => ContentKind::Image(ImageRef {
            download_code: msg.content.as_ref().and_then(download_code),
        }),
        "richText" => {
            let items: Vec<serde_json::Value> = msg
                .content
                .as_ref()
                .and_then(|c| c.get("richText"))
                .and_then(|r| r.as_array())
                .cloned()
                .unwrap_or_default();
            let picture = items.iter().find(|item| {
                item.get("type").and_then(|t| t.as_str()) == Some("picture")
                    || item.get("downloadCode").is_some()
                    || item.get("pictureDownloadCode").is_some()
            });
            if let Some(item) = picture {
                return ContentKind::Image(ImageRef {
                    download_code: download_code(item),
                });
            }
            let text: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect();
            if text.is_empty() {
                ContentKind::Unsupported(msg.msgtype.clone())
            } else {
                ContentKind::Text(text.join("\n"))
            }
        }
        other => ContentKind::Unsupported(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(msgtype: &str, extra: serde_json::Value) -> String {
        let mut v = serde_json::json!({
            "msgId": "msg-1",
            "msgtype": msgtype,
            "conversationId": "cid-1",
            "conversationType": "2",
            "senderStaffId": "staff-9",
            "robotCode": "ding-robot",
            "sessionWebhook": "https://oapi.dingtalk.com/robot/sendBySession?session=x"
        });
        if let (Some(obj), Some(extra)) = (v.as_object_mut(), extra.as_object()) {
            for (k, val) in extra {
                obj.insert(k.clone(), val.clone());
            }
        }
        v.to_string()
    }

    #[test]
    fn text_message() {
        let msg = InboundMessage::from_callback(&base(
            "text",
            serde_json::json!({ "text": { "content": "  hello " } }),
        ))
        .unwrap();
        assert_eq!(msg.id, "msg-1");
        assert_eq!(msg.kind, ContentKind::Text("hello".into()));
        assert_eq!(msg.sender.conversation_type, ConversationType::Group);
        assert_eq!(msg.sender.user_id(), "staff-9");
    }

    #[test]
    fn picture_prefers_download_code() {
        let msg = InboundMessage::from_callback(&base(
            "picture",
            serde_json::json!({ "content": { "downloadCode": "dc-1", "pictureDownloadCode": "pdc-1" } }),
        ))
        .unwrap();
        assert_eq!(
            msg.kind,
            ContentKind::Image(ImageRef {
                download_code: Some("dc-1".into())
            })
        );
    }

    #[test]
    fn picture_falls_back_to_picture_download_code() {
        let msg = InboundMessage::from_callback(&base(
            "picture",
            serde_json::json!({ "content": { "pictureDownloadCode": "pdc-1" } }),
        ))
        .unwrap();
        assert_eq!(
            msg.kind,
            ContentKind::Image(ImageRef {
                download_code: Some("pdc-1".into())
            })
        );
    }

    #[test]
    fn picture_without_code_keeps_image_kind() {
        let msg =
            InboundMessage::from_callback(&base("picture", serde_json::json!({ "content": {} })))
                .unwrap();
        assert_eq!(msg.kind, ContentKind::Image(ImageRef { download_code: None }));
    }

    #[test]
    fn rich_text_with_picture_is_image() {
        let msg = InboundMessage::from_callback(&base(
            "richText",
            serde_json::json!({ "content": { "richText": [
                { "text": "look at this" },
                { "type": "picture", "downloadCode": "dc-rich" }
            ] } }),
        ))
        .unwrap();
        assert_eq!(
            msg.kind,
            ContentKind::Image(ImageRef {
                download_code: Some("dc-rich".into())
            })
        );
    }

    #[test]
    fn rich_text_without_picture_is_text() {
        let msg = InboundMessage::from_callback(&base(
            "richText",
            serde_json::json!({ "content": { "richText": [ { "text": "a" }, { "text": "b" } ] } }),
        ))
        .unwrap();
        assert_eq!(msg.kind, ContentKind::Text("a\nb".into()));
    }

    #[test]
    fn audio_is_unsupported() {
        let msg = InboundMessage::from_callback(&base("audio", serde_json::json!({}))).unwrap();
        assert_eq!(msg.kind, ContentKind::Unsupported("audio".into()));
    }
}
