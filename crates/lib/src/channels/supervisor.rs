//! Connection supervisor: keeps one Stream mode session alive and hands every
//! frame to a handler task without waiting for it.
//!
//! Connect failures and dropped sessions are retried after a fixed delay, forever.
//! Handler tasks live in a `JoinSet` owned by the supervisor; they outlive the
//! session that delivered their frame and are only awaited at shutdown.

use crate::channels::dingtalk::DingTalkError;
use crate::channels::protocol::CallbackFrame;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};

/// Opens a fresh session with the message source.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StreamSession>, DingTalkError>;
}

/// A live duplex session.
#[async_trait]
pub trait StreamSession: Send {
    /// Next frame for the relay; None once the server ended the session.
    async fn next_frame(&mut self) -> Option<Result<CallbackFrame, DingTalkError>>;

    /// Acknowledge a frame so the server does not redeliver it.
    async fn ack(&mut self, frame: &CallbackFrame) -> Result<(), DingTalkError>;
}

/// Processes one frame. Runs on its own task.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn handle(&self, frame: CallbackFrame);
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

enum SessionEnd {
    Closed,
    Failed(DingTalkError),
    Shutdown,
}

pub struct Supervisor {
    connector: Arc<dyn Connector>,
    handler: Arc<dyn FrameHandler>,
    reconnect_delay: Duration,
    shutdown_grace: Duration,
    state: watch::Sender<ConnectionState>,
}

impl Supervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        handler: Arc<dyn FrameHandler>,
        reconnect_delay: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            handler,
            reconnect_delay,
            shutdown_grace,
            state,
        }
    }

    /// Subscribe to connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Run until `shutdown` turns true (or its sender is dropped), then drain in-flight handlers.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut attempt: u64 = 0;
        'outer: loop {
            if *shutdown.borrow() {
                break;
            }
            attempt += 1;
            self.state.send_replace(ConnectionState::Connecting);
            log::info!("dingtalk: connecting (attempt {})", attempt);
            let connected = tokio::select! {
                res = self.connector.connect() => res,
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break 'outer;
                    }
                    continue;
                }
            };
            match connected {
                Ok(session) => {
                    attempt = 0;
                    self.state.send_replace(ConnectionState::Connected);
                    log::info!("dingtalk: stream connected");
                    match self.pump(session, &mut tasks, &mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Closed => log::info!("dingtalk: stream closed"),
                        SessionEnd::Failed(e) => log::warn!("dingtalk: stream error: {}", e),
                    }
                }
                Err(e) => log::warn!("dingtalk: connect failed: {}", e),
            }
            self.state.send_replace(ConnectionState::Disconnected);
            log::info!("dingtalk: reconnecting in {:?}", self.reconnect_delay);

            let backoff = tokio::time::sleep(self.reconnect_delay);
            tokio::pin!(backoff);
            loop {
                tokio::select! {
                    _ = &mut backoff => break,
                    Some(res) = tasks.join_next() => log_task_end(res),
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break 'outer;
                        }
                    }
                }
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
        self.drain(tasks).await;
    }

    /// Receive loop of one session. Acks each frame, spawns its handler, reads on.
    /// `next_frame` is only ever cancelled by shutdown.
    async fn pump(
        &self,
        mut session: Box<dyn StreamSession>,
        tasks: &mut JoinSet<()>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                frame = session.next_frame() => match frame {
                    None => return SessionEnd::Closed,
                    Some(Err(e)) => return SessionEnd::Failed(e),
                    Some(Ok(frame)) => {
                        if let Err(e) = session.ack(&frame).await {
                            return SessionEnd::Failed(e);
                        }
                        log::debug!("dingtalk: dispatching frame {} ({})", frame.message_id, frame.topic);
                        let handler = Arc::clone(&self.handler);
                        tasks.spawn(async move { handler.handle(frame).await });
                        while let Some(res) = tasks.try_join_next() {
                            log_task_end(res);
                        }
                    }
                },
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return SessionEnd::Shutdown;
                    }
                }
            }
        }
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        log::info!(
            "dingtalk: waiting up to {:?} for {} in-flight message(s)",
            self.shutdown_grace,
            tasks.len()
        );
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(res) = tasks.join_next().await {
                log_task_end(res);
            }
        })
        .await;
        if drained.is_err() {
            log::warn!("dingtalk: abandoning {} in-flight message(s)", tasks.len());
            tasks.abort_all();
        }
    }
}

fn log_task_end(res: Result<(), JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            log::error!("relay: message task panicked: {}", e);
        } else {
            log::debug!("relay: message task cancelled");
        }
    }
}
