//! DingTalk channel: Stream mode WebSocket connection, access tokens, AI card,
//! media download and session-webhook replies via the OpenAPI.

use crate::channels::inbound::{ConversationType, SenderContext};
use crate::channels::platform::{MediaSource, TextReplier, TokenProvider};
use crate::channels::protocol::{
    AckFrame, CallbackFrame, FrameType, OpenConnectionRequest, OpenConnectionResponse, StreamFrame,
};
use crate::channels::supervisor::{Connector, StreamSession};
use crate::config::Credentials;
use crate::relay::{CardApi, CardUpdate};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Refresh a cached token this long before it expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Upper bound for the WebSocket handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum DingTalkError {
    #[error("dingtalk request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("dingtalk {what} failed: {status} {body}")]
    Api {
        what: &'static str,
        status: u16,
        body: String,
    },
    #[error("dingtalk websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("dingtalk protocol error: {0}")]
    Protocol(String),
    #[error("no session webhook to reply to")]
    NoWebhook,
    #[error("dingtalk {0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
}

/// Return the response when successful, else an `Api` error carrying status and body.
async fn check(res: reqwest::Response, what: &'static str) -> Result<reqwest::Response, DingTalkError> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status().as_u16();
    let body = res.text().await.unwrap_or_default();
    Err(DingTalkError::Api { what, status, body })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenResponse {
    access_token: String,
    #[serde(default)]
    expire_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// App access token, fetched on demand and cached until shortly before expiry.
pub struct DingTalkTokenCache {
    http: reqwest::Client,
    api_base: String,
    app_key: String,
    app_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl DingTalkTokenCache {
    pub fn new(http: reqwest::Client, api_base: &str, credentials: &Credentials) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            app_key: credentials.client_id.clone(),
            app_secret: credentials.client_secret.clone(),
            cached: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<AccessTokenResponse, DingTalkError> {
        let url = format!("{}/v1.0/oauth2/accessToken", self.api_base);
        let body = serde_json::json!({ "appKey": self.app_key, "appSecret": self.app_secret });
        let res = self.http.post(&url).json(&body).send().await?;
        let res = check(res, "accessToken").await?;
        Ok(res.json().await?)
    }
}

#[async_trait]
impl TokenProvider for DingTalkTokenCache {
    async fn access_token(&self) -> Result<String, DingTalkError> {
        let mut cached = self.cached.lock().await;
        if let Some(ref t) = *cached {
            if Instant::now() + TOKEN_REFRESH_MARGIN < t.expires_at {
                return Ok(t.token.clone());
            }
        }
        let fresh = self.fetch().await?;
        log::debug!("dingtalk: access token refreshed (expires in {}s)", fresh.expire_in);
        let token = fresh.access_token.clone();
        *cached = Some(CachedToken {
            token: fresh.access_token,
            expires_at: Instant::now() + Duration::from_secs(fresh.expire_in),
        });
        Ok(token)
    }
}

/// OpenAPI client for cards, media and replies.
#[derive(Clone)]
pub struct DingTalkClient {
    http: reqwest::Client,
    api_base: String,
    robot_code: String,
    tokens: Arc<dyn TokenProvider>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadUrlResponse {
    download_url: String,
}

impl DingTalkClient {
    /// `robot_code` is used for group card delivery when the message does not carry one.
    pub fn new(
        http: reqwest::Client,
        api_base: &str,
        robot_code: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            robot_code: robot_code.into(),
            tokens,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// Card delivery body: group chats go through the robot, single chats to the sender's robot space.
    fn deliver_body(
        &self,
        target: &SenderContext,
        template_id: &str,
        out_track_id: &str,
        content_key: &str,
        initial: &str,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "cardTemplateId": template_id,
            "outTrackId": out_track_id,
            "cardData": { "cardParamMap": { content_key: initial } },
            "callbackType": "STREAM",
            "userIdType": 1,
        });
        let robot_code = target.robot_code.as_deref().unwrap_or(&self.robot_code);
        match target.conversation_type {
            ConversationType::Group => {
                body["openSpaceId"] =
                    format!("dtv1.card//IM_GROUP.{}", target.conversation_id).into();
                body["imGroupOpenSpaceModel"] = serde_json::json!({ "supportForward": true });
                body["imGroupOpenDeliverModel"] = serde_json::json!({ "robotCode": robot_code });
            }
            ConversationType::Single => {
                body["openSpaceId"] =
                    format!("dtv1.card//IM_ROBOT.{}", target.user_id()).into();
                body["imRobotOpenSpaceModel"] = serde_json::json!({ "supportForward": true });
                body["imRobotOpenDeliverModel"] = serde_json::json!({ "spaceType": "IM_ROBOT" });
            }
        }
        body
    }
}

#[async_trait]
impl CardApi for DingTalkClient {
    async fn create_card(
        &self,
        target: &SenderContext,
        template_id: &str,
        content_key: &str,
        initial: &str,
    ) -> Result<String, DingTalkError> {
        let out_track_id = uuid::Uuid::new_v4().to_string();
        let body = self.deliver_body(target, template_id, &out_track_id, content_key, initial);
        let token = self.tokens.access_token().await?;
        let res = self
            .http
            .post(self.url("/v1.0/card/instances/createAndDeliver"))
            .header("x-acs-dingtalk-access-token", token)
            .json(&body)
            .send()
            .await?;
        check(res, "card createAndDeliver").await?;
        log::debug!("dingtalk: delivered card {}", out_track_id);
        Ok(out_track_id)
    }

    async fn stream_update(&self, update: &CardUpdate) -> Result<(), DingTalkError> {
        let body = serde_json::json!({
            "outTrackId": update.card_id,
            "guid": uuid::Uuid::new_v4().to_string(),
            "key": update.key,
            "content": update.value,
            "isFull": !update.append,
            "isFinalize": update.finished,
            "isError": update.failed,
        });
        let token = self.tokens.access_token().await?;
        let res = self
            .http
            .put(self.url("/v1.0/card/streaming"))
            .header("x-acs-dingtalk-access-token", token)
            .json(&body)
            .send()
            .await?;
        check(res, "card streaming").await?;
        Ok(())
    }
}

#[async_trait]
impl MediaSource for DingTalkClient {
    async fn download(&self, download_code: &str, robot_code: &str) -> Result<Vec<u8>, DingTalkError> {
        let token = self.tokens.access_token().await?;
        let body = serde_json::json!({ "downloadCode": download_code, "robotCode": robot_code });
        let res = self
            .http
            .post(self.url("/v1.0/robot/messageFiles/download"))
            .header("x-acs-dingtalk-access-token", token)
            .json(&body)
            .send()
            .await?;
        let res = check(res, "messageFiles download").await?;
        let data: DownloadUrlResponse = res.json().await?;
        let res = self.http.get(&data.download_url).send().await?;
        let res = check(res, "media fetch").await?;
        let bytes = res.bytes().await?;
        log::debug!("dingtalk: downloaded {} bytes of media", bytes.len());
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl TextReplier for DingTalkClient {
    async fn reply_text(&self, to: &SenderContext, text: &str) -> Result<(), DingTalkError> {
        let webhook = to.session_webhook.as_deref().ok_or(DingTalkError::NoWebhook)?;
        let body = serde_json::json!({ "msgtype": "text", "text": { "content": text } });
        let res = self.http.post(webhook).json(&body).send().await?;
        check(res, "session webhook reply").await?;
        Ok(())
    }
}

/// Opens Stream mode sessions: registers the connection over HTTP, then dials the WebSocket.
pub struct DingTalkConnector {
    http: reqwest::Client,
    api_base: String,
    credentials: Credentials,
    idle_timeout: Option<Duration>,
}

impl DingTalkConnector {
    pub fn new(http: reqwest::Client, api_base: &str, credentials: Credentials) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            credentials,
            idle_timeout: None,
        }
    }

    /// Sessions fail after `limit` without any inbound traffic, and send a
    /// WebSocket ping after half of it. None keeps sessions open indefinitely.
    pub fn with_idle_timeout(mut self, limit: Option<Duration>) -> Self {
        self.idle_timeout = limit.filter(|d| !d.is_zero());
        self
    }

    /// POST connections/open; returns the WebSocket URL with the ticket attached.
    async fn open(&self) -> Result<String, DingTalkError> {
        let url = format!("{}/v1.0/gateway/connections/open", self.api_base);
        let body =
            OpenConnectionRequest::new(&self.credentials.client_id, &self.credentials.client_secret);
        let res = self.http.post(&url).json(&body).send().await?;
        let res = check(res, "connections open").await?;
        let data: OpenConnectionResponse = res.json().await?;
        let mut ws_url = reqwest::Url::parse(&data.endpoint)
            .map_err(|e| DingTalkError::Protocol(format!("bad endpoint {}: {}", data.endpoint, e)))?;
        ws_url.query_pairs_mut().append_pair("ticket", &data.ticket);
        Ok(ws_url.to_string())
    }
}

#[async_trait]
impl Connector for DingTalkConnector {
    async fn connect(&self) -> Result<Box<dyn StreamSession>, DingTalkError> {
        let ws_url = self.open().await?;
        let (ws, _) = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            tokio_tungstenite::connect_async(ws_url.as_str()),
        )
        .await
        .map_err(|_| DingTalkError::Timeout("websocket handshake", HANDSHAKE_TIMEOUT))??;
        Ok(Box::new(WsSession::new(ws, self.idle_timeout)))
    }
}

/// One live Stream mode WebSocket. Answers system pings itself and, with an
/// idle limit, pings a quiet server and gives up on a silent one.
pub struct WsSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    idle_timeout: Option<Duration>,
    last_seen: Instant,
    pinged: bool,
}

impl WsSession {
    pub fn new(ws: WebSocketStream<MaybeTlsStream<TcpStream>>, idle_timeout: Option<Duration>) -> Self {
        Self {
            ws,
            idle_timeout,
            last_seen: Instant::now(),
            pinged: false,
        }
    }

    /// Next WebSocket message, bounded by the idle limit.
    async fn read(&mut self) -> Option<Result<Message, DingTalkError>> {
        let Some(limit) = self.idle_timeout else {
            return self.ws.next().await.map(|r| r.map_err(DingTalkError::from));
        };
        loop {
            let quiet = self.last_seen.elapsed();
            if quiet >= limit {
                log::warn!("dingtalk: no traffic for {:?}, dropping stream", quiet);
                return Some(Err(DingTalkError::Timeout("stream read", limit)));
            }
            let ping_after = limit / 2;
            let wait = if !self.pinged && quiet < ping_after {
                ping_after - quiet
            } else {
                limit - quiet
            };
            match tokio::time::timeout(wait, self.ws.next()).await {
                Ok(next) => {
                    self.last_seen = Instant::now();
                    self.pinged = false;
                    return next.map(|r| r.map_err(DingTalkError::from));
                }
                Err(_) if !self.pinged => {
                    self.pinged = true;
                    log::debug!("dingtalk: stream quiet, sending ping");
                    if let Err(e) = self.ws.send(Message::Ping(Vec::new())).await {
                        return Some(Err(e.into()));
                    }
                }
                Err(_) => {}
            }
        }
    }

    async fn send_ack(&mut self, ack: &AckFrame) -> Result<(), DingTalkError> {
        let text = serde_json::to_string(ack)
            .map_err(|e| DingTalkError::Protocol(format!("encoding ack: {}", e)))?;
        self.ws.send(Message::Text(text)).await?;
        Ok(())
    }
}

#[async_trait]
impl StreamSession for WsSession {
    async fn next_frame(&mut self) -> Option<Result<CallbackFrame, DingTalkError>> {
        loop {
            let msg = match self.read().await? {
                Ok(m) => m,
                Err(e) => return Some(Err(e)),
            };
            let text = match msg {
                Message::Text(text) => text,
                Message::Ping(payload) => {
                    if let Err(e) = self.ws.send(Message::Pong(payload)).await {
                        return Some(Err(e.into()));
                    }
                    continue;
                }
                Message::Close(frame) => {
                    log::info!("dingtalk: server closed stream: {:?}", frame);
                    return None;
                }
                _ => continue,
            };
            let frame: StreamFrame = match serde_json::from_str(&text) {
                Ok(f) => f,
                Err(e) => {
                    log::warn!("dingtalk: ignoring unparsable frame ({}): {}", e, text);
                    continue;
                }
            };
            match frame.typ {
                FrameType::System => match frame.headers.topic.as_str() {
                    "ping" => {
                        let ack = AckFrame::ok(frame.headers.message_id.clone(), frame.data.clone());
                        if let Err(e) = self.send_ack(&ack).await {
                            return Some(Err(e));
                        }
                    }
                    "disconnect" => {
                        log::info!("dingtalk: server requested disconnect");
                        return None;
                    }
                    other => log::debug!("dingtalk: ignoring system topic {}", other),
                },
                kind => {
                    return Some(Ok(CallbackFrame {
                        kind,
                        topic: frame.headers.topic,
                        message_id: frame.headers.message_id,
                        data: frame.data,
                    }))
                }
            }
        }
    }

    async fn ack(&mut self, frame: &CallbackFrame) -> Result<(), DingTalkError> {
        self.send_ack(&AckFrame::for_frame(frame)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticToken;

    #[async_trait]
    impl TokenProvider for StaticToken {
        async fn access_token(&self) -> Result<String, DingTalkError> {
            Ok("token".to_string())
        }
    }

    fn sender(conversation_type: ConversationType) -> SenderContext {
        SenderContext {
            conversation_id: "cid-1".into(),
            conversation_type,
            sender_staff_id: Some("staff-1".into()),
            sender_id: None,
            sender_nick: None,
            robot_code: None,
            session_webhook: None,
        }
    }

    fn client() -> DingTalkClient {
        DingTalkClient::new(
            reqwest::Client::new(),
            "https://api.dingtalk.com/",
            "robot-1",
            Arc::new(StaticToken),
        )
    }

    #[test]
    fn group_card_is_delivered_by_robot() {
        let body = client().deliver_body(
            &sender(ConversationType::Group),
            "tpl",
            "track-1",
            "content",
            "",
        );
        assert_eq!(body["openSpaceId"], "dtv1.card//IM_GROUP.cid-1");
        assert_eq!(body["imGroupOpenDeliverModel"]["robotCode"], "robot-1");
        assert_eq!(body["cardData"]["cardParamMap"]["content"], "");
    }

    #[test]
    fn single_card_goes_to_robot_space() {
        let body = client().deliver_body(
            &sender(ConversationType::Single),
            "tpl",
            "track-1",
            "content",
            "",
        );
        assert_eq!(body["openSpaceId"], "dtv1.card//IM_ROBOT.staff-1");
        assert_eq!(body["imRobotOpenDeliverModel"]["spaceType"], "IM_ROBOT");
    }

    #[tokio::test]
    async fn reply_without_webhook_fails() {
        let err = client()
            .reply_text(&sender(ConversationType::Single), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, DingTalkError::NoWebhook));
    }
}
