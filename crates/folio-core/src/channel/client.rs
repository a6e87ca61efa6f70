//! Persistent channel connection
//!
//! Maintains a long-lived WebSocket connection that receives change
//! notifications pushed by the server. Reconnects automatically with
//! exponential backoff and gives up after a bounded number of consecutive
//! failed attempts.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::message::ChannelMessage;
use crate::error::{SyncError, SyncResult};
use crate::models::ChangeEvent;

/// Commands sent to the channel task
#[derive(Debug, Clone)]
pub enum ChannelCommand {
    /// Tell other clients about a local change
    Notify(ChangeEvent),
    /// Close the connection and end the task
    Shutdown,
}

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the channel task
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Connection status changed
    StatusChanged(ChannelStatus),
    /// A connection was established; `session` counts connections from 1
    Connected { session: u64 },
    /// Change pushed by another client
    Remote(ChangeEvent),
    /// Connection attempt or message failed
    Error(String),
    /// Reconnect attempts exhausted, the task has ended
    GaveUp { attempts: u32 },
}

/// Configuration for the realtime channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket URL
    pub url: String,
    /// Bearer token sent with the handshake
    pub api_token: Option<String>,
    /// Identifies our own notifications when the server echoes them
    pub client_id: String,
    /// Delay before the first reconnect attempt
    pub initial_reconnect_delay: Duration,
    /// Consecutive failed attempts before giving up (0 retries forever)
    pub max_reconnect_attempts: u32,
    /// Handshake timeout
    pub connect_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_token: None,
            client_id: format!("folio-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 10,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Derive the channel URL from the server's HTTP base URL
pub fn channel_url(server_url: &str) -> SyncResult<String> {
    let base = server_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(SyncError::NotConfigured(format!(
            "server URL '{}' must start with http:// or https://",
            server_url
        )));
    };
    Ok(format!("{}/ws", ws))
}

/// Delay before the next attempt after `failed_attempts` consecutive failures
///
/// Starts at `initial` and doubles with each failure.
pub fn backoff_delay(initial: Duration, failed_attempts: u32) -> Duration {
    let exponent = failed_attempts.saturating_sub(1).min(16);
    initial.saturating_mul(1u32 << exponent)
}

/// Handle to control the channel task
pub struct ChannelHandle {
    /// Send commands to the channel task
    pub command_tx: mpsc::Sender<ChannelCommand>,
    /// Receive events from the channel task
    pub event_rx: mpsc::Receiver<ChannelEvent>,
    /// Watch connection status
    pub status_rx: watch::Receiver<ChannelStatus>,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    pub fn status(&self) -> ChannelStatus {
        *self.status_rx.borrow()
    }

    /// Send a notification without waiting; dropped if the task is busy or gone
    pub fn notify(&self, event: ChangeEvent) {
        if let Err(e) = self.command_tx.try_send(ChannelCommand::Notify(event)) {
            debug!("Dropped outbound notification: {}", e);
        }
    }

    /// Close the connection and wait for the task to finish
    pub async fn shutdown(self) {
        let ChannelHandle {
            command_tx,
            event_rx,
            task,
            ..
        } = self;
        // A task blocked on a full event queue must not hold up shutdown
        drop(event_rx);
        let _ = command_tx.send(ChannelCommand::Shutdown).await;
        let _ = task.await;
    }
}

/// Spawn the channel task
///
/// The task connects immediately and keeps reconnecting until it is shut
/// down or runs out of attempts.
pub fn spawn_channel(config: ChannelConfig) -> ChannelHandle {
    let (command_tx, command_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(64);
    let (status_tx, status_rx) = watch::channel(ChannelStatus::Disconnected);

    let task = tokio::spawn(channel_task_loop(config, command_rx, event_tx, status_tx));

    ChannelHandle {
        command_tx,
        event_rx,
        status_rx,
        task,
    }
}

/// How a connected session ended
enum SessionEnd {
    Shutdown,
    Dropped,
}

async fn set_status(
    status: ChannelStatus,
    status_tx: &watch::Sender<ChannelStatus>,
    event_tx: &mpsc::Sender<ChannelEvent>,
) {
    let _ = status_tx.send(status);
    let _ = event_tx.send(ChannelEvent::StatusChanged(status)).await;
}

/// Main channel loop with reconnection
async fn channel_task_loop(
    config: ChannelConfig,
    mut command_rx: mpsc::Receiver<ChannelCommand>,
    event_tx: mpsc::Sender<ChannelEvent>,
    status_tx: watch::Sender<ChannelStatus>,
) {
    let mut session = 0u64;
    let mut failed_attempts = 0u32;

    loop {
        set_status(ChannelStatus::Connecting, &status_tx, &event_tx).await;

        match connect_and_listen(&config, &mut session, &mut command_rx, &event_tx, &status_tx)
            .await
        {
            Ok(SessionEnd::Shutdown) => {
                set_status(ChannelStatus::Disconnected, &status_tx, &event_tx).await;
                break;
            }
            Ok(SessionEnd::Dropped) => {
                info!("Channel connection dropped");
                failed_attempts = 0;
            }
            Err(e) => {
                failed_attempts += 1;
                warn!("Channel connect attempt {} failed: {}", failed_attempts, e);
                let _ = event_tx.send(ChannelEvent::Error(e.to_string())).await;
            }
        }

        set_status(ChannelStatus::Disconnected, &status_tx, &event_tx).await;

        if config.max_reconnect_attempts > 0 && failed_attempts >= config.max_reconnect_attempts {
            warn!("Giving up on channel after {} attempts", failed_attempts);
            let _ = event_tx
                .send(ChannelEvent::GaveUp {
                    attempts: failed_attempts,
                })
                .await;
            break;
        }

        let delay = backoff_delay(config.initial_reconnect_delay, failed_attempts);
        debug!("Reconnecting in {:?}", delay);

        // Wait before reconnecting, but check for shutdown command
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = command_rx.recv() => match cmd {
                    Some(ChannelCommand::Shutdown) | None => return,
                    Some(ChannelCommand::Notify(event)) => {
                        debug!("Not connected, dropping notification for {}", event.path());
                    }
                }
            }
        }
    }
}

fn build_request(config: &ChannelConfig) -> SyncResult<Request> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| SyncError::NotConfigured(format!("invalid channel URL: {}", e)))?;

    if let Some(token) = &config.api_token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| SyncError::NotConfigured(format!("invalid API token: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

/// Connect and run the receive loop until disconnection or shutdown
///
/// An `Err` means no connection was established.
async fn connect_and_listen(
    config: &ChannelConfig,
    session: &mut u64,
    command_rx: &mut mpsc::Receiver<ChannelCommand>,
    event_tx: &mpsc::Sender<ChannelEvent>,
    status_tx: &watch::Sender<ChannelStatus>,
) -> SyncResult<SessionEnd> {
    let request = build_request(config)?;
    let handshake = tokio::time::timeout(config.connect_timeout, connect_async(request));
    let (ws_stream, _response) = handshake
        .await
        .map_err(|_| SyncError::network("channel connect", "handshake timed out"))?
        .map_err(|e| SyncError::network("channel connect", e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();

    *session += 1;
    info!("Channel connected (session {})", session);
    set_status(ChannelStatus::Connected, status_tx, event_tx).await;
    let _ = event_tx
        .send(ChannelEvent::Connected { session: *session })
        .await;

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(ChannelCommand::Notify(event)) => {
                        let message = ChannelMessage::from_event(&event, &config.client_id);
                        let text = match message.encode() {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Could not encode notification: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!("Channel send failed: {}", e);
                            return Ok(SessionEnd::Dropped);
                        }
                    }
                    Some(ChannelCommand::Shutdown) | None => {
                        write.close().await.ok();
                        return Ok(SessionEnd::Shutdown);
                    }
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&text, config, event_tx).await;
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => handle_inbound(&text, config, event_tx).await,
                        Err(_) => warn!("Ignoring non-UTF-8 channel message"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Ok(SessionEnd::Dropped);
                    }
                    Some(Err(e)) => {
                        warn!("Channel receive failed: {}", e);
                        let _ = event_tx.send(ChannelEvent::Error(e.to_string())).await;
                        return Ok(SessionEnd::Dropped);
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Decode one inbound message and forward it
async fn handle_inbound(text: &str, config: &ChannelConfig, event_tx: &mpsc::Sender<ChannelEvent>) {
    let message = match ChannelMessage::decode(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("Dropping malformed channel message: {}", e);
            return;
        }
    };

    if message.origin.as_deref() == Some(config.client_id.as_str()) {
        return;
    }

    match message.into_event() {
        Ok(event) => {
            debug!("Remote {:?} for {}", event.kind, event.path());
            let _ = event_tx.send(ChannelEvent::Remote(event)).await;
        }
        Err(e) => warn!("Dropping channel message: {}", e),
    }
}
