use crate::audio::PlaybackScheduler;
use crate::config::Config;
use crate::outbound::{OutboundQueue, QueuePolicy};
use crate::protocol::{
    ABNORMAL_CLOSE_CODE, AudioFrame, INTENTIONAL_CLOSE_CODE, ServerMessage,
};
use anyhow::Context;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use mac_address::get_mac_address;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use url::Url;
use uuid::Uuid;

pub type WsError = tokio_tungstenite::tungstenite::Error;
pub type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type WsStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

type OpenFuture = Pin<Box<dyn Future<Output = anyhow::Result<Socket>> + Send>>;
type ConnectReply = oneshot::Sender<Result<(), TransportError>>;

/// An opened socket, split into its two halves.
pub struct Socket {
    pub sink: WsSink,
    pub stream: WsStream,
}

/// Opens sockets. Resolving means the transport reported "opened".
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> anyhow::Result<Socket>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Linear backoff: attempt `n` waits `base_delay * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed before opening: {0}")]
    OpenFailed(String),

    #[error("connection was closed before it opened")]
    ClosedBeforeOpen,

    #[error("network link is not running")]
    Stopped,
}

/// What observers see coming out of the link.
#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    Connected,
    Disconnected { code: u16, reconnecting: bool },
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// `{"type":"state"}` status string.
    State(String),
    /// Server audio that could not be decoded or scheduled.
    AudioRejected(String),
    /// Any message type the link does not handle itself.
    Other(Value),
}

enum NetCommand {
    Connect(ConnectReply),
    Send(AudioFrame),
    Close {
        code: u16,
        reason: String,
        done: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Cloneable front end of a running [`NetLink`].
#[derive(Clone)]
pub struct NetHandle {
    cmd_tx: mpsc::UnboundedSender<NetCommand>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl NetHandle {
    /// Resolves once the socket is open. Joins an open already in flight.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(NetCommand::Connect(reply))
            .map_err(|_| TransportError::Stopped)?;
        rx.await.map_err(|_| TransportError::Stopped)?
    }

    /// Write now if connected, queue otherwise.
    pub fn send(&self, frame: AudioFrame) -> Result<(), TransportError> {
        self.cmd_tx
            .send(NetCommand::Send(frame))
            .map_err(|_| TransportError::Stopped)
    }

    /// Intentional close: no reconnect, queue discarded, playback released.
    pub async fn close(&self, code: u16, reason: &str) {
        let (done, rx) = oneshot::channel();
        let cmd = NetCommand::Close {
            code,
            reason: reason.to_string(),
            done,
        };
        if self.cmd_tx.send(cmd).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the link task. Open sockets are closed with 1000.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(NetCommand::Shutdown);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

/// Everything that lives and dies with one logical connection.
struct Session {
    attempts: u32,
    queue: OutboundQueue,
    opening: Option<OpenFuture>,
    sink: Option<WsSink>,
    stream: Option<WsStream>,
    retry: Option<Pin<Box<Sleep>>>,
    waiters: Vec<ConnectReply>,
}

impl Session {
    fn new(queue_policy: QueuePolicy) -> Self {
        Self {
            attempts: 0,
            queue: OutboundQueue::new(queue_policy),
            opening: None,
            sink: None,
            stream: None,
            retry: None,
            waiters: Vec::new(),
        }
    }
}

/// Owns the socket, the outbound queue, the reconnect timer and the playback
/// scheduler. Everything is mutated from inside [`NetLink::run`] only.
pub struct NetLink {
    connector: Arc<dyn Connector>,
    reconnect: ReconnectPolicy,
    queue_policy: QueuePolicy,
    tx: mpsc::UnboundedSender<NetEvent>,
    rx_cmd: mpsc::UnboundedReceiver<NetCommand>,
    state_tx: watch::Sender<ConnectionState>,
    playback: PlaybackScheduler,
    session: Session,
}

impl NetLink {
    pub fn new(
        connector: Arc<dyn Connector>,
        playback: PlaybackScheduler,
        reconnect: ReconnectPolicy,
        queue_policy: QueuePolicy,
    ) -> (Self, NetHandle, mpsc::UnboundedReceiver<NetEvent>) {
        let (tx, rx_event) = mpsc::unbounded_channel();
        let (cmd_tx, rx_cmd) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let link = Self {
            connector,
            reconnect,
            queue_policy,
            tx,
            rx_cmd,
            state_tx,
            playback,
            session: Session::new(queue_policy),
        };
        (link, NetHandle { cmd_tx, state_rx }, rx_event)
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.rx_cmd.recv() => match cmd {
                    Some(NetCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                opened = poll_open(&mut self.session.opening) => {
                    self.session.opening = None;
                    self.on_open_result(opened).await;
                }
                msg = next_message(&mut self.session.stream) => {
                    self.on_socket_message(msg);
                }
                _ = wait_retry(&mut self.session.retry) => {
                    self.session.retry = None;
                    log::info!("Reconnecting (attempt {})...", self.session.attempts);
                    self.start_open();
                }
            }
        }

        self.close_session(INTENTIONAL_CLOSE_CODE, "client shutdown").await;
        log::info!("Network link stopped");
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            log::debug!("Connection state: {} -> {}", previous, state);
        }
    }

    fn emit(&self, event: NetEvent) {
        // 没有观察者时直接丢弃
        let _ = self.tx.send(event);
    }

    async fn handle_command(&mut self, cmd: NetCommand) {
        match cmd {
            NetCommand::Connect(reply) => {
                if self.state() == ConnectionState::Connected {
                    let _ = reply.send(Ok(()));
                    return;
                }
                self.session.waiters.push(reply);
                if self.session.opening.is_none() {
                    self.start_open();
                }
            }
            NetCommand::Send(frame) => {
                if self.state() == ConnectionState::Connected {
                    self.write_frame(frame).await;
                } else {
                    self.enqueue(frame);
                }
            }
            NetCommand::Close { code, reason, done } => {
                self.close_session(code, &reason).await;
                let _ = done.send(());
            }
            NetCommand::Shutdown => {}
        }
    }

    fn start_open(&mut self) {
        // 取消挂起的重连定时器，同一时间只允许一个连接在建立
        self.session.retry = None;
        let connector = self.connector.clone();
        self.session.opening = Some(Box::pin(async move { connector.open().await }));
        self.set_state(ConnectionState::Connecting);
    }

    async fn on_open_result(&mut self, opened: anyhow::Result<Socket>) {
        match opened {
            Ok(socket) => {
                self.session.sink = Some(socket.sink);
                self.session.stream = Some(socket.stream);
                self.session.attempts = 0;
                self.set_state(ConnectionState::Connected);
                log::info!("Connected!");
                self.emit(NetEvent::Connected);
                for waiter in self.session.waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.flush_queue().await;
            }
            Err(e) => {
                log::warn!("Connection error: {:#}", e);
                let err = TransportError::OpenFailed(format!("{:#}", e));
                for waiter in self.session.waiters.drain(..) {
                    let _ = waiter.send(Err(err.clone()));
                }
                self.on_connection_lost(ABNORMAL_CLOSE_CODE);
            }
        }
    }

    fn on_socket_message(&mut self, msg: Option<Result<Message, WsError>>) {
        match msg {
            Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()),
            Some(Ok(Message::Binary(data))) => {
                log::debug!("Ignoring {} byte binary frame", data.len());
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = match frame {
                    Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_string()),
                    None => (u16::from(CloseCode::Status), String::new()),
                };
                log::info!("Server closed connection: code={} reason={:?}", code, reason);
                self.on_connection_lost(code);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                log::warn!("Socket error: {}", e);
                self.on_connection_lost(ABNORMAL_CLOSE_CODE);
            }
            None => {
                log::warn!("Socket stream ended without a close frame");
                self.on_connection_lost(ABNORMAL_CLOSE_CODE);
            }
        }
    }

    fn dispatch(&mut self, text: &str) {
        match ServerMessage::parse(text) {
            Ok(ServerMessage::State(value)) => {
                log::info!("Server state: {}", value);
                self.emit(NetEvent::State(value));
            }
            Ok(ServerMessage::Audio(audio)) => match self.playback.play(&audio) {
                Ok(start_at) => log::trace!("Scheduled server audio at {:.3}s", start_at),
                Err(e) => {
                    log::warn!("Dropping server audio: {}", e);
                    self.emit(NetEvent::AudioRejected(e.to_string()));
                }
            },
            Ok(ServerMessage::Other(value)) => self.emit(NetEvent::Other(value)),
            Err(e) => {
                let preview: String = text.chars().take(80).collect();
                log::warn!("Discarding unparsable message ({}): {}", e, preview);
            }
        }
    }

    /// Socket gone without us asking. Decide whether to try again.
    fn on_connection_lost(&mut self, code: u16) {
        self.session.sink = None;
        self.session.stream = None;
        self.set_state(ConnectionState::Disconnected);

        let attempt = self.session.attempts + 1;
        let reconnecting =
            code != INTENTIONAL_CLOSE_CODE && attempt <= self.reconnect.max_attempts;
        self.emit(NetEvent::Disconnected { code, reconnecting });

        if reconnecting {
            self.session.attempts = attempt;
            let delay = self.reconnect.delay_for(attempt);
            log::warn!(
                "Connection lost (code {}). Retrying in {:?} (attempt {}/{})",
                code,
                delay,
                attempt,
                self.reconnect.max_attempts
            );
            self.session.retry = Some(Box::pin(tokio::time::sleep(delay)));
            self.emit(NetEvent::ReconnectScheduled { attempt, delay });
        } else {
            if code != INTENTIONAL_CLOSE_CODE {
                log::error!(
                    "Connection lost (code {}), giving up after {} attempts",
                    code,
                    self.session.attempts
                );
            } else {
                log::info!("Connection closed normally by server");
            }
            self.end_session();
        }
    }

    /// The session will never reconnect on its own; drop it so the next
    /// connect starts with a full retry budget and an empty queue.
    fn end_session(&mut self) {
        let mut session = std::mem::replace(&mut self.session, Session::new(self.queue_policy));
        for waiter in session.waiters.drain(..) {
            let _ = waiter.send(Err(TransportError::ClosedBeforeOpen));
        }
        if !session.queue.is_empty() {
            log::info!("Discarding {} queued frames", session.queue.len());
        }
    }

    fn enqueue(&mut self, frame: AudioFrame) {
        if self.session.queue.push(frame).is_some() {
            log::warn!(
                "Outbound queue full, dropped a frame ({} dropped so far)",
                self.session.queue.dropped()
            );
        }
    }

    async fn write_frame(&mut self, frame: AudioFrame) {
        let json = match frame.to_json() {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to serialize audio frame: {}", e);
                return;
            }
        };
        let Some(sink) = self.session.sink.as_mut() else {
            self.enqueue(frame);
            return;
        };
        if let Err(e) = sink.send(Message::Text(json.into())).await {
            log::warn!("Send failed: {}", e);
            self.session.queue.requeue_front(frame);
            self.on_connection_lost(ABNORMAL_CLOSE_CODE);
        }
    }

    async fn flush_queue(&mut self) {
        if self.session.queue.is_empty() {
            return;
        }
        log::info!("Flushing {} queued frames", self.session.queue.len());
        while self.state() == ConnectionState::Connected {
            let Some(frame) = self.session.queue.pop() else {
                break;
            };
            self.write_frame(frame).await;
        }
    }

    /// Tear the session down and replace it with a fresh one.
    async fn close_session(&mut self, code: u16, reason: &str) {
        let mut session = std::mem::replace(&mut self.session, Session::new(self.queue_policy));
        // 丢弃定时器和正在建立的连接
        session.retry = None;
        session.opening = None;
        session.stream = None;

        if let Some(mut sink) = session.sink.take() {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            };
            match tokio::time::timeout(Duration::from_secs(1), sink.send(Message::Close(Some(frame))))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::debug!("Close frame not delivered: {}", e),
                Err(_) => log::debug!("Close frame timed out"),
            }
        }

        for waiter in session.waiters.drain(..) {
            let _ = waiter.send(Err(TransportError::ClosedBeforeOpen));
        }
        if !session.queue.is_empty() {
            log::info!("Discarding {} queued frames", session.queue.len());
        }

        self.playback.teardown();
        if self.state() != ConnectionState::Disconnected {
            log::info!("Connection closed: code={} reason={:?}", code, reason);
        }
        self.set_state(ConnectionState::Disconnected);
        self.emit(NetEvent::Disconnected {
            code,
            reconnecting: false,
        });
    }
}

async fn poll_open(slot: &mut Option<OpenFuture>) -> anyhow::Result<Socket> {
    match slot.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_message(stream: &mut Option<WsStream>) -> Option<Result<Message, WsError>> {
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_retry(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry.as_mut() {
        Some(sleep) => sleep.await,
        None => std::future::pending().await,
    }
}

/// Device id for the handshake: configured value, else MAC, else a UUID.
pub fn resolve_device_id(configured: &str) -> String {
    if !configured.is_empty() && configured != "unknown-device" {
        return configured.to_string();
    }
    match get_mac_address() {
        // 注意大小写一致，以匹配典型的Linux行为
        Ok(Some(mac)) => mac.to_string().to_lowercase(),
        _ => Uuid::new_v4().to_string(),
    }
}

/// Real WebSocket connector built from [`Config`].
pub struct WsConnector {
    url: String,
    token: String,
    device_id: String,
    client_id: String,
}

impl WsConnector {
    pub fn new(url: &str, token: &str, device_id: &str, client_id: &str) -> Self {
        Self {
            url: url.to_string(),
            token: token.to_string(),
            device_id: device_id.to_string(),
            client_id: client_id.to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let client_id = if config.client_id == "unknown-client" {
            Uuid::new_v4().to_string()
        } else {
            config.client_id.clone()
        };
        Self::new(
            config.ws_url,
            config.ws_token,
            &resolve_device_id(&config.device_id),
            &client_id,
        )
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self) -> anyhow::Result<Socket> {
        let url = Url::parse(&self.url).context("invalid ws_url")?;
        let host = url.host_str().context("ws_url has no host")?;
        let host = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let request = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(self.url.as_str())
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Device-Id", &self.device_id)
            .header("Client-Id", &self.client_id)
            .header("Protocol-Version", "1")
            .body(())?;

        log::info!("Connecting to {}...", self.url);
        let (ws_stream, _) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect to {}", self.url))?;
        let (write, read) = ws_stream.split();

        Ok(Socket {
            sink: Box::pin(write),
            stream: Box::pin(read),
        })
    }
}
