use std::{
    future,
    pin::Pin,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, future::BoxFuture};
use herald_types::{ConnectionState, IncomingNotification};
use herald_wire::{
    ABNORMAL_CLOSURE, InboundFrame, NORMAL_CLOSURE, NOTIFICATION_PATH, OutboundFrame, UrlError,
    notification_socket_url, parse_frame,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Instant, Interval, MissedTickBehavior, Sleep},
};
use tokio_tungstenite::tungstenite::{
    self, Message,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use tracing::{debug, info, warn};
use url::Url;

/// Close code reported when the server sends a close frame without a status.
const NO_STATUS_RECEIVED: u16 = 1005;

/// Configuration for [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// HTTP(S) base URL of the notification service.
    pub base_url: String,
    /// Socket path appended to the base URL.
    pub path: String,
    /// Interval between client heartbeat pings while connected.
    pub heartbeat_interval: Duration,
    /// Delay before the first reconnect; doubles with every further attempt.
    pub reconnect_base_delay: Duration,
    /// Consecutive reconnect attempts scheduled before giving up.
    pub max_reconnect_attempts: u32,
    /// Capacity of the handle-to-driver command channel.
    pub command_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            path: NOTIFICATION_PATH.to_string(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            command_capacity: 32,
        }
    }
}

/// Delay before reconnect attempt number `attempts` (zero-based).
pub fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(attempts))
}

/// Supplies the bearer token used to authenticate the socket.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns the current token, or `None` when no session is authenticated.
    async fn token(&self) -> Option<String>;
}

/// Token provider backed by a fixed value.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Errors produced while opening a socket.
#[derive(Debug, Error)]
pub enum DialError {
    /// The WebSocket handshake failed.
    #[error("websocket handshake failed: {0}")]
    Handshake(#[source] Box<tungstenite::Error>),
    /// The transport refused the connection.
    #[error("connection refused: {0}")]
    Refused(String),
}

/// Frame queued for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A text message.
    Text(String),
    /// Close the socket with the given code.
    Close(u16),
}

/// Event reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A text message arrived.
    Text(String),
    /// A transport error occurred; a `Closed` event follows.
    Error(String),
    /// The socket closed with the given code.
    Closed(u16),
}

/// Driver-side end of an open socket.
#[derive(Debug)]
pub struct Socket {
    outbound: mpsc::Sender<Outbound>,
    inbound: mpsc::Receiver<SocketEvent>,
}

/// Transport-side end of an open socket.
#[derive(Debug)]
pub struct SocketPeer {
    /// Events delivered to the connection driver.
    pub events: mpsc::Sender<SocketEvent>,
    /// Frames the connection driver wants written.
    pub outbound: mpsc::Receiver<Outbound>,
}

impl Socket {
    /// Creates a connected socket/peer pair with bounded buffers.
    pub fn pair(capacity: usize) -> (Socket, SocketPeer) {
        let (events, inbound) = mpsc::channel(capacity);
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        (
            Socket { outbound, inbound },
            SocketPeer {
                events,
                outbound: outbound_rx,
            },
        )
    }
}

/// Opens sockets for the connection driver.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Opens a socket to `url`. Resolves once the socket is open.
    async fn dial(&self, url: Url) -> Result<Socket, DialError>;
}

/// [`Dialer`] backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct TungsteniteDialer {
    buffer: usize,
}

impl TungsteniteDialer {
    /// Creates a dialer whose sockets buffer up to `buffer` frames per direction.
    pub fn new(buffer: usize) -> Self {
        Self { buffer }
    }
}

impl Default for TungsteniteDialer {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Dialer for TungsteniteDialer {
    async fn dial(&self, url: Url) -> Result<Socket, DialError> {
        debug!(host = ?url.host_str(), path = url.path(), "opening notification socket");
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|err| DialError::Handshake(Box::new(err)))?;

        let (socket, peer) = Socket::pair(self.buffer);
        tokio::spawn(pump_websocket(stream, peer));
        Ok(socket)
    }
}

async fn pump_websocket<S>(stream: tokio_tungstenite::WebSocketStream<S>, peer: SocketPeer)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = stream.split();
    let SocketPeer {
        events,
        mut outbound,
    } = peer;

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(Outbound::Text(text)) => {
                    if let Err(err) = write.send(Message::Text(text.into())).await {
                        let _ = events.send(SocketEvent::Error(err.to_string())).await;
                        let _ = events.send(SocketEvent::Closed(ABNORMAL_CLOSURE)).await;
                        break;
                    }
                }
                Some(Outbound::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: String::new().into(),
                    };
                    if let Err(err) = write.send(Message::Close(Some(frame))).await {
                        debug!(%err, "failed to send close frame");
                    }
                    break;
                }
                None => {
                    let _ = write.close().await;
                    break;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if events.send(SocketEvent::Text(text.as_str().to_owned())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map_or(NO_STATUS_RECEIVED, |frame| u16::from(frame.code));
                    let _ = events.send(SocketEvent::Closed(code)).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = events.send(SocketEvent::Error(err.to_string())).await;
                    let _ = events.send(SocketEvent::Closed(ABNORMAL_CLOSURE)).await;
                    break;
                }
                None => {
                    let _ = events.send(SocketEvent::Closed(ABNORMAL_CLOSURE)).await;
                    break;
                }
            },
        }
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Callback<T>)>>,
}

impl<T: 'static> Registry<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        })
    }

    fn add(self: &Arc<Self>, callback: Callback<T>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));

        let registry = Arc::downgrade(self);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry
                        .entries
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    fn emit(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in callbacks {
            callback(value);
        }
    }
}

/// Handle for one callback registration.
///
/// Dropping the handle keeps the callback registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Removes the callback this handle was returned for.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

enum Command {
    Connect { ack: oneshot::Sender<()> },
    Disconnect { ack: oneshot::Sender<()> },
}

/// Owner of the persistent notification socket.
///
/// Cloning yields another handle to the same connection. The background
/// driver stops once every handle is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    notifications: Arc<Registry<IncomingNotification>>,
    connection: Arc<Registry<bool>>,
}

impl ConnectionManager {
    /// Creates a disconnected manager and spawns its driver task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        cfg: LinkConfig,
        tokens: Arc<dyn TokenProvider>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(cfg.command_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let notifications = Registry::new();
        let connection = Registry::new();

        let driver = Driver {
            cfg,
            tokens,
            dialer,
            commands: commands_rx,
            state: state_tx,
            notifications: Arc::clone(&notifications),
            connection: Arc::clone(&connection),
            phase: Phase::Idle,
            reconnect_attempts: 0,
            should_reconnect: false,
        };
        tokio::spawn(driver.run());

        Self {
            inner: Arc::new(Inner {
                commands: commands_tx,
                state: state_rx,
                notifications,
                connection,
            }),
        }
    }

    /// Starts connecting unless already connecting or connected.
    ///
    /// Returns once the request has been taken up; the socket opens in the
    /// background. Re-enables automatic reconnection and resets the attempt
    /// counter.
    pub async fn connect(&self) {
        self.request(|ack| Command::Connect { ack }).await;
    }

    /// Closes the socket, cancels every timer and disables reconnection.
    ///
    /// Connection listeners have been told `false` by the time this returns.
    pub async fn disconnect(&self) {
        self.request(|ack| Command::Disconnect { ack }).await;
    }

    /// Registers a callback for every accepted inbound notification.
    pub fn on_notification<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&IncomingNotification) + Send + Sync + 'static,
    {
        self.inner.notifications.add(Arc::new(callback))
    }

    /// Registers a callback for transitions into and out of the connected state.
    pub fn on_connection_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.inner.connection.add(Arc::new(callback))
    }

    /// Whether the socket is currently open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Returns a receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    async fn request(&self, make: impl FnOnce(oneshot::Sender<()>) -> Command) {
        let (ack, done) = oneshot::channel();
        if self.inner.commands.send(make(ack)).await.is_err() {
            warn!("connection driver stopped; ignoring request");
            return;
        }
        let _ = done.await;
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish()
    }
}

enum Attempt {
    NoToken,
    BadUrl(UrlError),
    Dialed(Result<Socket, DialError>),
}

enum Phase {
    Idle,
    Connecting(BoxFuture<'static, Attempt>),
    Open { socket: Socket, heartbeat: Interval },
    Backoff(Pin<Box<Sleep>>),
}

enum Wake {
    Command(Option<Command>),
    Attempt(Attempt),
    Socket(Option<SocketEvent>),
    Heartbeat,
    ReconnectDue,
}

impl Phase {
    async fn wake(&mut self) -> Wake {
        match self {
            Phase::Idle => future::pending().await,
            Phase::Connecting(attempt) => Wake::Attempt(attempt.as_mut().await),
            Phase::Open { socket, heartbeat } => tokio::select! {
                event = socket.inbound.recv() => Wake::Socket(event),
                _ = heartbeat.tick() => Wake::Heartbeat,
            },
            Phase::Backoff(sleep) => {
                sleep.as_mut().await;
                Wake::ReconnectDue
            }
        }
    }
}

struct Driver {
    cfg: LinkConfig,
    tokens: Arc<dyn TokenProvider>,
    dialer: Arc<dyn Dialer>,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<ConnectionState>,
    notifications: Arc<Registry<IncomingNotification>>,
    connection: Arc<Registry<bool>>,
    phase: Phase,
    reconnect_attempts: u32,
    should_reconnect: bool,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                biased;
                command = self.commands.recv() => Wake::Command(command),
                wake = self.phase.wake() => wake,
            };

            match wake {
                Wake::Command(Some(Command::Connect { ack })) => {
                    self.connect();
                    let _ = ack.send(());
                }
                Wake::Command(Some(Command::Disconnect { ack })) => {
                    self.disconnect();
                    let _ = ack.send(());
                }
                Wake::Command(None) => {
                    debug!("all connection handles dropped; stopping driver");
                    self.disconnect();
                    break;
                }
                Wake::Attempt(attempt) => self.on_attempt(attempt),
                Wake::Socket(Some(SocketEvent::Text(text))) => self.on_text(&text),
                Wake::Socket(Some(SocketEvent::Error(err))) => {
                    warn!(%err, "notification socket error");
                }
                Wake::Socket(Some(SocketEvent::Closed(code))) => self.on_close(code),
                Wake::Socket(None) => self.on_close(ABNORMAL_CLOSURE),
                Wake::Heartbeat => self.send(OutboundFrame::Ping),
                Wake::ReconnectDue => {
                    info!(attempt = self.reconnect_attempts, "reconnecting notification socket");
                    self.begin_attempt();
                }
            }
        }
    }

    fn connect(&mut self) {
        if matches!(self.phase, Phase::Connecting(_) | Phase::Open { .. }) {
            debug!("connect ignored; socket already active");
            return;
        }

        self.should_reconnect = true;
        self.reconnect_attempts = 0;
        self.begin_attempt();
    }

    fn begin_attempt(&mut self) {
        let tokens = Arc::clone(&self.tokens);
        let dialer = Arc::clone(&self.dialer);
        let base_url = self.cfg.base_url.clone();
        let path = self.cfg.path.clone();

        self.phase = Phase::Connecting(Box::pin(async move {
            let Some(token) = tokens.token().await else {
                return Attempt::NoToken;
            };
            let url = match notification_socket_url(&base_url, &path, &token) {
                Ok(url) => url,
                Err(err) => return Attempt::BadUrl(err),
            };
            Attempt::Dialed(dialer.dial(url).await)
        }));
        self.set_state(ConnectionState::Connecting);
    }

    fn on_attempt(&mut self, attempt: Attempt) {
        match attempt {
            Attempt::NoToken => {
                warn!("no auth token available; not connecting notification socket");
                self.phase = Phase::Idle;
                self.set_state(ConnectionState::Disconnected);
            }
            Attempt::BadUrl(err) => {
                warn!(%err, base_url = %self.cfg.base_url, "cannot derive notification socket url");
                self.phase = Phase::Idle;
                self.set_state(ConnectionState::Disconnected);
            }
            Attempt::Dialed(Ok(socket)) => self.on_open(socket),
            Attempt::Dialed(Err(err)) => {
                warn!(%err, "failed to open notification socket");
                self.on_close(ABNORMAL_CLOSURE);
            }
        }
    }

    fn on_open(&mut self, socket: Socket) {
        let period = self.cfg.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.reconnect_attempts = 0;
        self.phase = Phase::Open { socket, heartbeat };
        self.set_state(ConnectionState::Connected);
        info!("notification socket connected");
        self.connection.emit(&true);
    }

    fn on_close(&mut self, code: u16) {
        let was_open = matches!(self.phase, Phase::Open { .. });
        self.phase = Phase::Idle;
        self.set_state(ConnectionState::Disconnected);

        if was_open {
            info!(code, "notification socket closed");
            self.connection.emit(&false);
        }

        if code == NORMAL_CLOSURE {
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if !self.should_reconnect {
            return;
        }

        if self.reconnect_attempts >= self.cfg.max_reconnect_attempts {
            warn!(
                attempts = self.reconnect_attempts,
                "giving up on notification socket until the next connect"
            );
            return;
        }

        let delay = backoff_delay(self.cfg.reconnect_base_delay, self.reconnect_attempts);
        self.reconnect_attempts += 1;
        info!(
            attempt = self.reconnect_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling notification socket reconnect"
        );
        self.phase = Phase::Backoff(Box::pin(tokio::time::sleep(delay)));
        self.set_state(ConnectionState::ReconnectScheduled);
    }

    fn disconnect(&mut self) {
        self.should_reconnect = false;
        self.reconnect_attempts = 0;

        if let Phase::Open { socket, .. } = std::mem::replace(&mut self.phase, Phase::Idle) {
            if let Err(err) = socket.outbound.try_send(Outbound::Close(NORMAL_CLOSURE)) {
                debug!(%err, "could not queue close frame");
            }
            info!("notification socket disconnected");
        }

        self.set_state(ConnectionState::Disconnected);
        self.connection.emit(&false);
    }

    fn on_text(&mut self, text: &str) {
        match parse_frame(text) {
            Ok(InboundFrame::Notification(incoming))
            | Ok(InboundFrame::SystemAnnouncement(incoming)) => {
                debug!(id = %incoming.id, kind = incoming.kind.as_str(), "notification frame received");
                self.notifications.emit(&incoming);
            }
            Ok(InboundFrame::BadgeUpdate(_)) => debug!("ignoring badge update"),
            Ok(InboundFrame::Ping) => self.send(OutboundFrame::Pong),
            Ok(InboundFrame::Unrecognized { tag }) => {
                warn!(%tag, "dropping frame with unrecognized type");
            }
            Err(err) => warn!(%err, "dropping malformed frame"),
        }
    }

    fn send(&self, frame: OutboundFrame) {
        let Phase::Open { socket, .. } = &self.phase else {
            return;
        };
        if let Err(err) = socket.outbound.try_send(Outbound::Text(frame.encode())) {
            warn!(?frame, %err, "failed to queue outbound frame");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use herald_types::NotificationType;

    use super::*;

    struct FakeDialer {
        fail: bool,
        dials: Mutex<Vec<(Instant, Url)>>,
        peers: mpsc::UnboundedSender<SocketPeer>,
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        async fn dial(&self, url: Url) -> Result<Socket, DialError> {
            self.dials.lock().unwrap().push((Instant::now(), url));
            if self.fail {
                return Err(DialError::Refused("connection refused".to_string()));
            }
            let (socket, peer) = Socket::pair(16);
            let _ = self.peers.send(peer);
            Ok(socket)
        }
    }

    impl FakeDialer {
        fn dial_count(&self) -> usize {
            self.dials.lock().unwrap().len()
        }
    }

    struct NeverToken;

    #[async_trait]
    impl TokenProvider for NeverToken {
        async fn token(&self) -> Option<String> {
            future::pending().await
        }
    }

    fn harness(
        fail: bool,
        tokens: Arc<dyn TokenProvider>,
    ) -> (
        ConnectionManager,
        Arc<FakeDialer>,
        mpsc::UnboundedReceiver<SocketPeer>,
    ) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(FakeDialer {
            fail,
            dials: Mutex::new(Vec::new()),
            peers: peers_tx,
        });
        let manager = ConnectionManager::new(LinkConfig::default(), tokens, dialer.clone());
        (manager, dialer, peers_rx)
    }

    fn token() -> Arc<dyn TokenProvider> {
        Arc::new(StaticToken(Some("secret".to_string())))
    }

    fn record_flips(manager: &ConnectionManager) -> Arc<Mutex<Vec<bool>>> {
        let flips = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&flips);
        let _subscription = manager.on_connection_change(move |up| sink.lock().unwrap().push(*up));
        flips
    }

    async fn wait_for(manager: &ConnectionManager, wanted: ConnectionState) {
        manager
            .watch_state()
            .wait_for(|state| *state == wanted)
            .await
            .unwrap();
    }

    async fn send_text(peer: &SocketPeer, text: &str) {
        peer.events
            .send(SocketEvent::Text(text.to_string()))
            .await
            .unwrap();
    }

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_millis(1000);
        let delays: Vec<u64> = (0..5)
            .map(|attempt| backoff_delay(base, attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[tokio::test(start_paused = true)]
    async fn dial_uses_rewritten_url_with_token() {
        let (manager, dialer, mut peers) = harness(false, token());
        manager.connect().await;
        let _peer = peers.recv().await.unwrap();

        let dials = dialer.dials.lock().unwrap();
        assert_eq!(
            dials[0].1.as_str(),
            "ws://localhost:8080/ws/notifications?token=secret"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn open_notifies_and_sends_heartbeat_after_interval() {
        let (manager, _dialer, mut peers) = harness(false, token());
        let flips = record_flips(&manager);

        manager.connect().await;
        let mut peer = peers.recv().await.unwrap();
        wait_for(&manager, ConnectionState::Connected).await;
        let opened = Instant::now();

        assert!(manager.is_connected());
        assert_eq!(*flips.lock().unwrap(), vec![true]);

        let frame = peer.outbound.recv().await.unwrap();
        assert_eq!(frame, Outbound::Text(OutboundFrame::Ping.encode()));
        assert_eq!(opened.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn server_ping_is_answered_with_pong() {
        let (manager, _dialer, mut peers) = harness(false, token());
        manager.connect().await;
        let mut peer = peers.recv().await.unwrap();

        send_text(&peer, r#"{"type":"ping"}"#).await;

        let frame = peer.outbound.recv().await.unwrap();
        assert_eq!(frame, Outbound::Text(OutboundFrame::Pong.encode()));
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_dispatched_by_type() {
        let (manager, _dialer, mut peers) = harness(false, token());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let _subscription = manager.on_notification(move |incoming| {
            sink.lock()
                .unwrap()
                .push((incoming.id.clone(), incoming.kind));
        });

        manager.connect().await;
        let mut peer = peers.recv().await.unwrap();

        send_text(
            &peer,
            r#"{"type":"notification","data":{"id":"1","type":"wallet","title":"Top-up","body":"0.1 BTC received"}}"#,
        )
        .await;
        send_text(&peer, "{garbage").await;
        send_text(&peer, r#"{"type":"badge_update","data":{"count":7}}"#).await;
        send_text(&peer, r#"{"type":"typing","data":{}}"#).await;
        send_text(
            &peer,
            r#"{"type":"system_announcement","data":{"id":"2","type":"security","title":"Downtime","body":"Scheduled maintenance"}}"#,
        )
        .await;
        send_text(&peer, r#"{"type":"ping"}"#).await;
        let _pong = peer.outbound.recv().await.unwrap();

        assert_eq!(
            *received.lock().unwrap(),
            vec![
                ("1".to_string(), NotificationType::Wallet),
                ("2".to_string(), NotificationType::System),
            ]
        );
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_removes_only_its_own_callback() {
        let (manager, _dialer, mut peers) = harness(false, token());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let first_sink = Arc::clone(&first);
        let first_subscription = manager.on_notification(move |_| {
            first_sink.fetch_add(1, Ordering::SeqCst);
        });
        let second_sink = Arc::clone(&second);
        let _second_subscription = manager.on_notification(move |_| {
            second_sink.fetch_add(1, Ordering::SeqCst);
        });
        first_subscription.unsubscribe();

        manager.connect().await;
        let mut peer = peers.recv().await.unwrap();
        send_text(
            &peer,
            r#"{"type":"notification","data":{"id":"1","type":"card","title":"Card issued","body":"Ready to use"}}"#,
        )
        .await;
        send_text(&peer, r#"{"type":"ping"}"#).await;
        let _pong = peer.outbound.recv().await.unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent_while_active() {
        let (manager, dialer, mut peers) = harness(false, token());

        manager.connect().await;
        manager.connect().await;
        let _peer = peers.recv().await.unwrap();
        wait_for(&manager, ConnectionState::Connected).await;
        manager.connect().await;

        assert_eq!(dialer.dial_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_token_skips_connection() {
        let (manager, dialer, _peers) = harness(false, Arc::new(StaticToken(None)));
        let flips = record_flips(&manager);

        manager.connect().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(dialer.dial_count(), 0);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(flips.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_reconnects_after_base_delay() {
        let (manager, _dialer, mut peers) = harness(false, token());
        let flips = record_flips(&manager);

        manager.connect().await;
        let first = peers.recv().await.unwrap();
        wait_for(&manager, ConnectionState::Connected).await;

        let closed_at = Instant::now();
        first
            .events
            .send(SocketEvent::Closed(ABNORMAL_CLOSURE))
            .await
            .unwrap();
        let second = peers.recv().await.unwrap();
        assert_eq!(closed_at.elapsed(), Duration::from_secs(1));
        wait_for(&manager, ConnectionState::Connected).await;

        let closed_at = Instant::now();
        second
            .events
            .send(SocketEvent::Closed(ABNORMAL_CLOSURE))
            .await
            .unwrap();
        let _third = peers.recv().await.unwrap();
        assert_eq!(closed_at.elapsed(), Duration::from_secs(1));
        wait_for(&manager, ConnectionState::Connected).await;

        assert_eq!(*flips.lock().unwrap(), vec![true, false, true, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn normal_close_from_server_does_not_reconnect() {
        let (manager, dialer, mut peers) = harness(false, token());

        manager.connect().await;
        let peer = peers.recv().await.unwrap();
        wait_for(&manager, ConnectionState::Connected).await;

        peer.events
            .send(SocketEvent::Closed(NORMAL_CLOSURE))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(dialer.dial_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_back_off_exponentially_then_stop() {
        let (manager, dialer, _peers) = harness(true, token());
        let started = Instant::now();

        manager.connect().await;
        tokio::time::sleep(Duration::from_secs(300)).await;

        let offsets: Vec<u64> = dialer
            .dials
            .lock()
            .unwrap()
            .iter()
            .map(|(at, _)| at.duration_since(started).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 1, 3, 7, 15, 31]);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.connect().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(dialer.dial_count(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let (manager, dialer, _peers) = harness(true, token());
        let flips = record_flips(&manager);

        manager.connect().await;
        wait_for(&manager, ConnectionState::ReconnectScheduled).await;
        manager.disconnect().await;

        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(dialer.dial_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(*flips.lock().unwrap(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_socket_normally() {
        let (manager, dialer, mut peers) = harness(false, token());
        let flips = record_flips(&manager);

        manager.connect().await;
        let mut peer = peers.recv().await.unwrap();
        wait_for(&manager, ConnectionState::Connected).await;

        manager.disconnect().await;

        assert!(!manager.is_connected());
        assert_eq!(*flips.lock().unwrap(), vec![true, false]);
        assert_eq!(
            peer.outbound.recv().await,
            Some(Outbound::Close(NORMAL_CLOSURE))
        );
        assert_eq!(peer.outbound.recv().await, None);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(dialer.dial_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_connecting_abandons_attempt() {
        let (manager, dialer, _peers) = harness(false, Arc::new(NeverToken));

        manager.connect().await;
        assert_eq!(manager.state(), ConnectionState::Connecting);
        manager.disconnect().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(dialer.dial_count(), 0);
    }
}
