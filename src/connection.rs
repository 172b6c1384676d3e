//! Connection manager: owns one physical WebSocket per logical endpoint
//!
//! Transport mechanics (handshake, heartbeat, reconnect-with-backoff) are
//! hidden behind a task that owns the socket. Callers interact through a
//! command channel and observe the link through a state watch, a raw-frame
//! broadcast, and a connected/disconnected event broadcast. The `Connected`
//! event is what drives subscription replay after a reconnect.

use crate::config::ConnectionConfig;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Connection attempt timed out")]
    Timeout,
    #[error("Not connected")]
    NotConnected,
    #[error("Connection task is gone")]
    ChannelSend,
    #[error("No usable URL: {0}")]
    UrlUnavailable(String),
    #[error("Reconnection attempts exhausted")]
    RetriesExhausted,
}

/// Transport-level connection state, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Lifecycle events observable by other components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Link established; fired on every connect including reconnects.
    Connected,
    /// Link lost or closed.
    Disconnected,
}

/// Resolves the URL to dial, at connect time.
///
/// Private endpoints derive their URL from a live session credential, so the
/// URL must be re-resolved on every (re)connect attempt rather than captured
/// once at construction.
#[async_trait]
pub trait UrlProvider: Send + Sync {
    async fn url(&self) -> Result<Url, ConnectionError>;
}

/// Fixed URL for public endpoints.
pub struct StaticUrl(Url);

impl StaticUrl {
    pub fn new(url: &str) -> Result<Self, ConnectionError> {
        Ok(Self(Url::parse(url)?))
    }
}

#[async_trait]
impl UrlProvider for StaticUrl {
    async fn url(&self) -> Result<Url, ConnectionError> {
        Ok(self.0.clone())
    }
}

/// Outbound frame sink, the multiplexer's view of a connection.
///
/// Sends fail fast with [`ConnectionError::NotConnected`] while the link is
/// down; replaying subscriptions after reconnect is the resubscription
/// coordinator's job, not a send queue's.
pub trait FrameSink: Send + Sync {
    fn send_text(&self, text: String) -> Result<(), ConnectionError>;
}

#[derive(Debug)]
enum Command {
    Connect,
    Send(String),
    Disconnect,
}

/// Handle to one connection-owning task.
pub struct Connection {
    command_tx: mpsc::UnboundedSender<Command>,
    frame_tx: broadcast::Sender<String>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl Connection {
    /// Spawn the connection task. The link stays down until [`connect`] or
    /// [`request_connect`] is called.
    ///
    /// [`connect`]: Connection::connect
    /// [`request_connect`]: Connection::request_connect
    pub fn spawn(config: ConnectionConfig, url_provider: Arc<dyn UrlProvider>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (frame_tx, _) = broadcast::channel(config.frame_buffer_size);
        let (event_tx, _) = broadcast::channel(16);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let task_frame_tx = frame_tx.clone();
        let task_event_tx = event_tx.clone();
        tokio::spawn(async move {
            connection_task(
                config,
                url_provider,
                command_rx,
                task_frame_tx,
                task_event_tx,
                state_tx,
            )
            .await;
        });

        Self {
            command_tx,
            frame_tx,
            event_tx,
            state_rx,
        }
    }

    /// Request a connect and wait until the link is up.
    ///
    /// No-op when already connected or connecting. Returns
    /// [`ConnectionError::RetriesExhausted`] when the configured attempt
    /// budget runs out before a handshake succeeds.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut state_rx = self.state_rx.clone();
        // Mark the current snapshot seen before requesting, so a fast
        // connect-and-fail cycle is still observed as a change.
        let initial = *state_rx.borrow_and_update();
        match initial {
            ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
            ConnectionState::Reconnecting => {}
            ConnectionState::Disconnected => self.request_connect()?,
        }

        loop {
            state_rx
                .changed()
                .await
                .map_err(|_| ConnectionError::ChannelSend)?;
            match *state_rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => return Err(ConnectionError::RetriesExhausted),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
            }
        }
    }

    /// Fire-and-forget connect request.
    pub fn request_connect(&self) -> Result<(), ConnectionError> {
        self.command_tx
            .send(Command::Connect)
            .map_err(|_| ConnectionError::ChannelSend)
    }

    /// Close the link. The task stays alive and can connect again.
    pub fn disconnect(&self) -> Result<(), ConnectionError> {
        self.command_tx
            .send(Command::Disconnect)
            .map_err(|_| ConnectionError::ChannelSend)
    }

    /// Receiver of raw inbound text frames.
    pub fn frames(&self) -> broadcast::Receiver<String> {
        self.frame_tx.subscribe()
    }

    /// Receiver of connected/disconnected events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

impl FrameSink for Connection {
    fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        if !self.is_alive() {
            return Err(ConnectionError::NotConnected);
        }
        self.command_tx
            .send(Command::Send(text))
            .map_err(|_| ConnectionError::ChannelSend)
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum SessionEnd {
    /// Caller asked for the disconnect.
    Requested,
    /// Transport dropped out from under us.
    Dropped,
    /// Every handle is gone; the task should exit.
    HandlesGone,
}

/// Main connection task: idle until a connect request, then a
/// connect/session/backoff cycle until disconnected or dropped.
async fn connection_task(
    config: ConnectionConfig,
    url_provider: Arc<dyn UrlProvider>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    frame_tx: broadcast::Sender<String>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,
) {
    'idle: loop {
        match command_rx.recv().await {
            Some(Command::Connect) => {}
            Some(Command::Disconnect) => continue 'idle,
            Some(Command::Send(_)) => {
                debug!("Dropping outbound frame while disconnected");
                continue 'idle;
            }
            None => return,
        }

        let mut failed_attempts: u32 = 0;
        let mut backoff = ExponentialBackoff {
            initial_interval: config.initial_reconnect_delay,
            max_interval: config.max_reconnect_delay,
            max_elapsed_time: None,
            ..Default::default()
        };

        'connect: loop {
            let _ = state_tx.send(if failed_attempts == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });

            match try_connect(&config, url_provider.as_ref()).await {
                Ok(ws_stream) => {
                    let _ = state_tx.send(ConnectionState::Connected);
                    let _ = event_tx.send(ConnectionEvent::Connected);
                    backoff.reset();

                    let end = run_session(ws_stream, &config, &mut command_rx, &frame_tx).await;
                    let _ = state_tx.send(ConnectionState::Disconnected);
                    let _ = event_tx.send(ConnectionEvent::Disconnected);

                    match end {
                        SessionEnd::Requested => {
                            info!("WebSocket connection closed on request");
                            continue 'idle;
                        }
                        SessionEnd::HandlesGone => return,
                        SessionEnd::Dropped => {
                            let delay = backoff
                                .next_backoff()
                                .unwrap_or(config.max_reconnect_delay);
                            warn!(?delay, "Connection lost, reconnecting");
                            if !sleep_or_disconnect(&mut command_rx, delay).await {
                                continue 'idle;
                            }
                            failed_attempts = 1;
                        }
                    }
                }
                Err(e) => {
                    error!("WebSocket connection attempt failed: {}", e);
                    failed_attempts += 1;

                    if config.max_reconnect_attempts > 0
                        && failed_attempts >= config.max_reconnect_attempts
                    {
                        error!("Maximum reconnection attempts reached");
                        let _ = state_tx.send(ConnectionState::Disconnected);
                        continue 'idle;
                    }

                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(config.max_reconnect_delay);
                    warn!(?delay, attempt = failed_attempts, "Retrying connection");
                    if !sleep_or_disconnect(&mut command_rx, delay).await {
                        let _ = state_tx.send(ConnectionState::Disconnected);
                        continue 'idle;
                    }
                }
            }
        }
    }
}

async fn try_connect(
    config: &ConnectionConfig,
    url_provider: &dyn UrlProvider,
) -> Result<WsStream, ConnectionError> {
    let url = url_provider.url().await?;
    debug!(%url, "Connecting to WebSocket");

    let (ws_stream, response) =
        tokio::time::timeout(config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ConnectionError::Timeout)??;

    info!(status = ?response.status(), "WebSocket connected");
    Ok(ws_stream)
}

/// Run one connected session until it ends.
async fn run_session(
    ws_stream: WsStream,
    config: &ConnectionConfig,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    frame_tx: &broadcast::Sender<String>,
) -> SessionEnd {
    let (mut write, mut read) = ws_stream.split();

    let mut heartbeat = interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first interval tick fires immediately; use it to prime last_pong.
    heartbeat.tick().await;

    let mut last_pong = Instant::now();
    let pong_timeout = config.heartbeat_interval * 2;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if frame_tx.send(text.to_string()).is_err() {
                            trace!("No frame receivers attached");
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            error!("Failed to answer ping: {}", e);
                            return SessionEnd::Dropped;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "WebSocket closed by server");
                        return SessionEnd::Dropped;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        return SessionEnd::Dropped;
                    }
                    None => {
                        warn!("WebSocket stream ended");
                        return SessionEnd::Dropped;
                    }
                    _ => {}
                }
            }

            cmd = command_rx.recv() => {
                match cmd {
                    Some(Command::Send(text)) => {
                        trace!(frame = %text, "Sending frame");
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            error!("Failed to send frame: {}", e);
                            return SessionEnd::Dropped;
                        }
                    }
                    Some(Command::Disconnect) => {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Requested;
                    }
                    Some(Command::Connect) => {
                        // Already connected.
                    }
                    None => return SessionEnd::HandlesGone,
                }
            }

            _ = heartbeat.tick() => {
                if last_pong.elapsed() > pong_timeout {
                    warn!("Heartbeat timeout - no pong received");
                    return SessionEnd::Dropped;
                }
                if let Err(e) = write.send(Message::Ping(vec![].into())).await {
                    error!("Failed to send heartbeat: {}", e);
                    return SessionEnd::Dropped;
                }
            }
        }
    }
}

/// Sleep out a backoff delay, but honor a disconnect arriving mid-wait.
/// Returns false when the caller should give up the reconnect cycle.
async fn sleep_or_disconnect(
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    delay: Duration,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = command_rx.recv() => {
                match cmd {
                    Some(Command::Disconnect) | None => return false,
                    Some(Command::Send(_)) => {
                        debug!("Dropping outbound frame while reconnecting");
                    }
                    Some(Command::Connect) => {}
                }
            }
        }
    }
}
