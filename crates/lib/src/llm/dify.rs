//! Dify application API client.
//! Text goes to chat-messages (or a workflow, per config); images are uploaded and
//! analyzed by a workflow. Responses are consumed as an event stream and exposed as
//! a stream of cumulative snapshots.

use crate::config::{self, Config, TextEndpoint, UpstreamConfig};
use crate::llm::snapshot::{Snapshot, NO_RESULT};
use crate::llm::sse::{SseDecoder, StreamEvent};
use crate::llm::{SnapshotStream, Upstream};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream api key or base url not configured")]
    AuthMissing,
    #[error("upstream unavailable: HTTP {status}: {body}")]
    Unavailable { status: u16, body: String },
    #[error("upstream error: {0}")]
    Stream(String),
    #[error("upstream stream idle for more than {0:?}")]
    Timeout(Duration),
    #[error("upstream file upload failed: {0}")]
    UploadFailed(String),
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("reading upload file: {0}")]
    Io(#[from] std::io::Error),
}

/// Client for the Dify HTTP API.
#[derive(Clone)]
pub struct DifyClient {
    api_key: Option<String>,
    base_url: Option<String>,
    settings: UpstreamConfig,
    idle_timeout: Option<Duration>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    inputs: serde_json::Value,
    query: &'a str,
    response_mode: &'static str,
    user: &'a str,
}

#[derive(Debug, Serialize)]
struct WorkflowRequest<'a> {
    inputs: serde_json::Value,
    response_mode: &'static str,
    user: &'a str,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

impl DifyClient {
    /// `base_url` is the API root (e.g. "https://api.dify.ai/v1"); paths come from `settings`.
    pub fn new(
        client: reqwest::Client,
        api_key: Option<String>,
        base_url: Option<String>,
        settings: UpstreamConfig,
    ) -> Self {
        let idle_timeout = match settings.stream_idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            settings,
            idle_timeout,
            client,
        }
    }

    /// Build from config with env overrides (DIFY_API_KEY, DIFY_BASE_URL).
    pub fn from_config(client: reqwest::Client, config: &Config) -> Self {
        Self::new(
            client,
            config::resolve_upstream_api_key(config),
            config::resolve_upstream_base_url(config),
            config.upstream.clone(),
        )
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() && self.base_url.is_some()
    }

    /// Full URL for an API path plus the key to send with it.
    fn endpoint(&self, path: &str) -> Result<(String, &str), UpstreamError> {
        match (&self.base_url, &self.api_key) {
            (Some(base), Some(key)) => {
                let path = if path.starts_with('/') {
                    path.to_string()
                } else {
                    format!("/{}", path)
                };
                Ok((format!("{}{}", base, path), key.as_str()))
            }
            _ => Err(UpstreamError::AuthMissing),
        }
    }

    /// POST chat-messages in streaming mode.
    pub async fn chat_stream(&self, query: &str, user: &str) -> Result<SnapshotStream, UpstreamError> {
        let (url, key) = self.endpoint(&self.settings.chat_path)?;
        let body = ChatRequest {
            inputs: serde_json::json!({}),
            query,
            response_mode: "streaming",
            user,
        };
        let res = self.post_streaming(&url, key, &body).await?;
        Ok(snapshot_stream(res, self.idle_timeout))
    }

    /// POST workflows/run in streaming mode with the given inputs.
    pub async fn workflow_stream(
        &self,
        inputs: serde_json::Value,
        user: &str,
    ) -> Result<SnapshotStream, UpstreamError> {
        let (url, key) = self.endpoint(&self.settings.workflow_path)?;
        let body = WorkflowRequest {
            inputs,
            response_mode: "streaming",
            user,
        };
        let res = self.post_streaming(&url, key, &body).await?;
        Ok(snapshot_stream(res, self.idle_timeout))
    }

    /// POST files/upload (multipart). Returns the upstream file id.
    pub async fn upload_file(&self, path: &Path, user: &str) -> Result<String, UpstreamError> {
        let (url, key) = self.endpoint(&self.settings.upload_path)?;
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime_for(path))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("user", user.to_string());
        let res = self
            .client
            .post(&url)
            .bearer_auth(key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| UpstreamError::UploadFailed(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(UpstreamError::UploadFailed(format!("{} {}", status, body)));
        }
        let data: UploadResponse = res
            .json()
            .await
            .map_err(|e| UpstreamError::UploadFailed(e.to_string()))?;
        log::debug!("dify: uploaded {} as file {}", path.display(), data.id);
        Ok(data.id)
    }

    async fn post_streaming<T: Serialize + ?Sized>(
        &self,
        url: &str,
        key: &str,
        body: &T,
    ) -> Result<reqwest::Response, UpstreamError> {
        let res = self
            .client
            .post(url)
            .bearer_auth(key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            log::warn!("dify: POST {} returned {}: {}", url, status, body);
            return Err(UpstreamError::Unavailable { status, body });
        }
        Ok(res)
    }
}

#[async_trait]
impl Upstream for DifyClient {
    async fn answer_text(&self, query: &str, user: &str) -> Result<SnapshotStream, UpstreamError> {
        match self.settings.text_endpoint {
            TextEndpoint::Chat => self.chat_stream(query, user).await,
            TextEndpoint::Workflow => {
                self.workflow_stream(serde_json::json!({ "query": query }), user)
                    .await
            }
        }
    }

    async fn analyze_image(&self, image: &Path, user: &str) -> Result<SnapshotStream, UpstreamError> {
        let file_id = self.upload_file(image, user).await?;
        let inputs = serde_json::json!({
            "image": {
                "type": "image",
                "transfer_method": "local_file",
                "upload_file_id": file_id,
            },
            "prompt": self.settings.image_prompt,
        });
        self.workflow_stream(inputs, user).await
    }
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Outcome of applying one event to the accumulator.
enum Step {
    Updated,
    Ignored,
    Done,
}

fn apply(snapshot: &mut Snapshot, event: StreamEvent) -> Result<Step, UpstreamError> {
    match event {
        StreamEvent::ContentDelta(full) => {
            snapshot.replace(&full);
            Ok(Step::Updated)
        }
        StreamEvent::ContentChunk(fragment) => {
            snapshot.append(&fragment);
            Ok(Step::Updated)
        }
        StreamEvent::Error(message) => Err(UpstreamError::Stream(message)),
        StreamEvent::Done => Ok(Step::Done),
        StreamEvent::Lifecycle { .. } | StreamEvent::Unknown(_) => Ok(Step::Ignored),
    }
}

/// Turn a successful streaming response into a lazy, single-pass snapshot stream.
/// Ends after `message_end` or end of body. When the answer ends up blank the
/// last item is the NO_RESULT placeholder.
pub fn snapshot_stream(response: reqwest::Response, idle_timeout: Option<Duration>) -> SnapshotStream {
    let stream = try_stream! {
        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut snapshot = Snapshot::default();
        let mut done = false;
        while !done {
            let next = match idle_timeout {
                Some(limit) => tokio::time::timeout(limit, body.next())
                    .await
                    .map_err(|_| UpstreamError::Timeout(limit))?,
                None => body.next().await,
            };
            let chunk = match next {
                Some(chunk) => chunk.map_err(UpstreamError::Request)?,
                None => break,
            };
            for event in decoder.feed(&chunk) {
                match apply(&mut snapshot, event)? {
                    Step::Updated => yield snapshot.clone(),
                    Step::Done => {
                        done = true;
                        break;
                    }
                    Step::Ignored => {}
                }
            }
        }
        if !done {
            if let Some(event) = decoder.finish() {
                if let Step::Updated = apply(&mut snapshot, event)? {
                    yield snapshot.clone();
                }
            }
        }
        if snapshot.is_blank() {
            yield Snapshot::new(NO_RESULT);
        }
    };
    Box::pin(stream)
}
