//! In-process fakes for the relay's platform traits, shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use lib::channels::{
    ConversationType, DingTalkError, InboundMessage, MediaSource, SenderContext, TextReplier,
};
use lib::relay::{CardApi, CardUpdate, RelaySettings};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Records every card operation.
#[derive(Default)]
pub struct FakeCards {
    pub created: AtomicUsize,
    pub updates: Mutex<Vec<CardUpdate>>,
    pub fail_create: bool,
    /// Reject the update whose 0-based index matches.
    pub fail_update_at: Option<usize>,
}

impl FakeCards {
    pub fn updates(&self) -> Vec<CardUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn terminal_updates(&self) -> usize {
        self.updates()
            .iter()
            .filter(|u| u.finished || u.failed)
            .count()
    }
}

#[async_trait]
impl CardApi for FakeCards {
    async fn create_card(
        &self,
        target: &SenderContext,
        _template_id: &str,
        _content_key: &str,
        _initial: &str,
    ) -> Result<String, DingTalkError> {
        if self.fail_create {
            return Err(DingTalkError::Protocol("create refused".into()));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("card-{}-{}", target.conversation_id, n))
    }

    async fn stream_update(&self, update: &CardUpdate) -> Result<(), DingTalkError> {
        let mut updates = self.updates.lock().unwrap();
        let index = updates.len();
        updates.push(update.clone());
        if self.fail_update_at == Some(index) {
            return Err(DingTalkError::Protocol("update refused".into()));
        }
        Ok(())
    }
}

/// Serves fixed bytes for any download code.
pub struct FakeMedia {
    pub bytes: Vec<u8>,
    pub calls: AtomicUsize,
}

impl FakeMedia {
    pub fn png() -> Self {
        Self {
            bytes: vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0],
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn download(&self, _download_code: &str, _robot_code: &str) -> Result<Vec<u8>, DingTalkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.bytes.clone())
    }
}

/// Collects plain replies.
#[derive(Default)]
pub struct FakeReplier {
    pub replies: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl TextReplier for FakeReplier {
    async fn reply_text(&self, to: &SenderContext, text: &str) -> Result<(), DingTalkError> {
        self.replies
            .lock()
            .unwrap()
            .push((to.conversation_id.clone(), text.to_string()));
        Ok(())
    }
}

pub fn settings(throttle_chars: usize, temp_dir: Option<PathBuf>) -> RelaySettings {
    RelaySettings {
        template_id: "tpl.schema".into(),
        content_key: "content".into(),
        throttle_chars,
        unsupported_reply: "text and images only".into(),
        temp_dir,
        robot_code: "ding-robot".into(),
    }
}

/// Robot callback data as DingTalk sends it.
pub fn callback(msgtype: &str, extra: serde_json::Value) -> String {
    let mut v = serde_json::json!({
        "msgId": "msg-1",
        "msgtype": msgtype,
        "conversationId": "cid-1",
        "conversationType": "1",
        "senderStaffId": "staff-1",
        "senderNick": "tester",
        "robotCode": "ding-robot",
        "sessionWebhook": "http://127.0.0.1:1/session"
    });
    if let (Some(obj), Some(extra)) = (v.as_object_mut(), extra.as_object()) {
        for (k, val) in extra {
            obj.insert(k.clone(), val.clone());
        }
    }
    v.to_string()
}

pub fn message(msgtype: &str, extra: serde_json::Value) -> InboundMessage {
    InboundMessage::from_callback(&callback(msgtype, extra)).expect("parse callback")
}

pub fn text_message(text: &str) -> InboundMessage {
    message("text", serde_json::json!({ "text": { "content": text } }))
}

pub fn sender() -> SenderContext {
    SenderContext {
        conversation_id: "cid-1".into(),
        conversation_type: ConversationType::Single,
        sender_staff_id: Some("staff-1".into()),
        sender_id: None,
        sender_nick: None,
        robot_code: None,
        session_webhook: None,
    }
}

/// Fresh directory under the OS temp dir.
pub fn temp_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("aicard-{}-{}", label, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub fn dir_is_empty(dir: &std::path::Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}
