//! Upstream generative-AI backend: event-stream decoding and the Dify client.
//!
//! The relay only sees the `Upstream` trait and a stream of cumulative snapshots.

mod dify;
mod snapshot;
pub mod sse;

pub use dify::{snapshot_stream, DifyClient, UpstreamError};
pub use snapshot::{Snapshot, NO_RESULT};
pub use sse::{SseDecoder, Stage, StreamEvent};

use async_trait::async_trait;
use futures_util::Stream;
use std::path::Path;
use std::pin::Pin;

/// Lazy, single-pass sequence of cumulative answers for one request.
pub type SnapshotStream = Pin<Box<dyn Stream<Item = Result<Snapshot, UpstreamError>> + Send>>;

/// A backend that answers text and analyzes images, streaming its output.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send a user's text; `user` identifies the end user to the backend.
    async fn answer_text(&self, query: &str, user: &str) -> Result<SnapshotStream, UpstreamError>;

    /// Upload an image file and run the analysis workflow on it.
    async fn analyze_image(&self, image: &Path, user: &str) -> Result<SnapshotStream, UpstreamError>;
}
