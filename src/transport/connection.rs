//! Persistent connection to a paired device
//!
//! One [`ConnectionEngine`] owns at most one live TCP link. Each call to
//! [`ConnectionEngine::connect`] starts a *run*: a supervisor task that
//! connects, waits for the link to fail, sleeps according to the
//! [`ReconnectPolicy`](super::ReconnectPolicy) and tries again, until
//! [`ConnectionEngine::disconnect`] cancels the run.
//!
//! Task layout per run:
//!
//! ```text
//! run token ──┬── supervisor (connect / backoff loop)
//!             └── link token (child, one per live connection)
//!                   ├── receive loop
//!                   └── handshake + keep-alive
//! ```
//!
//! Cancelling the run token tears down every task of the run at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::framing::{self, FrameError};
use super::protocol::SyncMessage;
use super::{ConnectionState, TransportConfig, TransportError};

/// Events published by the engine for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection state changed
    StateChanged(ConnectionState),

    /// A reconnect attempt was scheduled after `delay`
    ReconnectScheduled { attempt: u32, delay: Duration },
}

/// Persistent, self-healing connection to one peer
#[derive(Clone)]
pub struct ConnectionEngine {
    inner: Arc<Inner>,
}

struct Inner {
    device_id: String,
    config: TransportConfig,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<TransportEvent>,
    message_tx: mpsc::UnboundedSender<SyncMessage>,
    shared: Mutex<Shared>,
    next_link_id: AtomicU64,
}

/// State shared between the public API and the background tasks
#[derive(Default)]
struct Shared {
    /// Last address passed to `connect`, reused for every retry
    target: Option<Target>,

    /// Token of the active run; `None` after `disconnect`
    run: Option<CancellationToken>,

    /// Live link, if any
    link: Option<Link>,
}

#[derive(Debug, Clone)]
struct Target {
    host: String,
    port: u16,
}

#[derive(Clone)]
struct Link {
    id: u64,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    cancel: CancellationToken,
}

impl ConnectionEngine {
    /// Create an idle engine for the local device `device_id`.
    ///
    /// Returns the engine and the stream of envelopes received from the peer.
    pub fn new(
        device_id: impl Into<String>,
        config: TransportConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SyncMessage>) {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, _) = broadcast::channel(64);

        let inner = Arc::new(Inner {
            device_id: device_id.into(),
            config,
            state_tx,
            event_tx,
            message_tx,
            shared: Mutex::new(Shared::default()),
            next_link_id: AtomicU64::new(1),
        });

        (Self { inner }, message_rx)
    }

    /// Local device identity announced in every envelope
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Watch the connection state
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Every state change and reconnect decision, in order
    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Address used for the current or most recent run
    pub fn last_target(&self) -> Option<(String, u16)> {
        self.inner
            .lock_shared()
            .target
            .as_ref()
            .map(|t| (t.host.clone(), t.port))
    }

    /// Start connecting to `host:port` in the background.
    ///
    /// Any existing run is torn down first. Returns immediately; progress is
    /// reported through [`subscribe_state`](Self::subscribe_state). Must be
    /// called from within a Tokio runtime.
    pub fn connect(&self, host: impl Into<String>, port: u16) {
        let target = Target {
            host: host.into(),
            port,
        };
        let run = CancellationToken::new();

        {
            let mut shared = self.inner.lock_shared();
            if let Some(previous) = shared.run.replace(run.clone()) {
                previous.cancel();
            }
            if let Some(link) = shared.link.take() {
                link.cancel.cancel();
            }
            shared.target = Some(target.clone());
            self.inner.set_state(ConnectionState::Connecting);
        }

        info!(host = %target.host, port = target.port, "Starting connection");
        tokio::spawn(Arc::clone(&self.inner).supervise(run, target));
    }

    /// Tear down the connection and suppress reconnects until the next
    /// [`connect`](Self::connect). Safe to call repeatedly.
    pub fn disconnect(&self) {
        let mut shared = self.inner.lock_shared();
        let had_run = shared.run.is_some();

        if let Some(run) = shared.run.take() {
            run.cancel();
        }
        if let Some(link) = shared.link.take() {
            link.cancel.cancel();
        }
        self.inner.set_state(ConnectionState::Disconnected);
        drop(shared);

        if had_run {
            info!("Disconnected");
        }
    }

    /// Frame and send `message` on the live link.
    ///
    /// Returns `false` without side effects when no link is attached or the
    /// message cannot be framed. A write failure returns `false` and moves
    /// the engine to `Error`, which schedules a reconnect.
    pub async fn send_message(&self, message: &SyncMessage) -> bool {
        let link = self.inner.lock_shared().link.clone();

        match link {
            Some(link) => self.inner.send_on_link(&link, message).await,
            None => {
                warn!(message_type = %message.message_type, "Cannot send: not connected");
                false
            }
        }
    }
}

impl Inner {
    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a state change. Callers hold the shared lock so transitions
    /// are totally ordered with `connect`/`disconnect`.
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state.clone());
        if previous != state {
            debug!(%state, "Connection state changed");
            let _ = self.event_tx.send(TransportEvent::StateChanged(state));
        }
    }

    /// Connect / backoff loop for one run
    async fn supervise(self: Arc<Self>, run: CancellationToken, target: Target) {
        let mut attempt: u32 = 1;

        loop {
            {
                let _shared = self.lock_shared();
                if run.is_cancelled() {
                    return;
                }
                self.set_state(ConnectionState::Connecting);
            }

            info!(host = %target.host, port = target.port, attempt, "Connecting");

            let connected = tokio::select! {
                _ = run.cancelled() => return,
                result = time::timeout(
                    self.config.connect_timeout,
                    TcpStream::connect((target.host.as_str(), target.port)),
                ) => result,
            };

            let failure = match connected {
                Ok(Ok(stream)) => match self.install_link(&run, stream) {
                    Some(link_cancel) => {
                        attempt = 1;
                        tokio::select! {
                            _ = run.cancelled() => return,
                            _ = link_cancel.cancelled() => {}
                        }
                        // The link task that failed has already published Error.
                        None
                    }
                    None => return,
                },
                Ok(Err(e)) => Some(
                    TransportError::Connection {
                        message: format!("{}:{}: {}", target.host, target.port, e),
                    }
                    .to_string(),
                ),
                Err(_) => Some(TransportError::Timeout(self.config.connect_timeout).to_string()),
            };

            let delay = self.config.reconnect.delay_for_attempt(attempt);
            {
                let _shared = self.lock_shared();
                if run.is_cancelled() {
                    return;
                }
                if let Some(reason) = failure {
                    warn!(%reason, attempt, "Connection attempt failed");
                    self.set_state(ConnectionState::Error(reason));
                }
                let _ = self
                    .event_tx
                    .send(TransportEvent::ReconnectScheduled { attempt, delay });
            }
            info!(
                delay_ms = delay.as_millis() as u64,
                next_attempt = attempt + 1,
                "Scheduling reconnect"
            );
            attempt = attempt.saturating_add(1);

            tokio::select! {
                _ = run.cancelled() => return,
                _ = time::sleep(delay) => {}
            }
        }
    }

    /// Attach a fresh stream as the live link and spawn its tasks.
    ///
    /// Returns the link's cancellation token, or `None` when the run was
    /// cancelled while the connection was being established.
    fn install_link(
        self: &Arc<Self>,
        run: &CancellationToken,
        stream: TcpStream,
    ) -> Option<CancellationToken> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();

        let link = Link {
            id: self.next_link_id.fetch_add(1, Ordering::Relaxed),
            writer: Arc::new(AsyncMutex::new(writer)),
            cancel: run.child_token(),
        };

        {
            let mut shared = self.lock_shared();
            if run.is_cancelled() {
                return None;
            }
            shared.link = Some(link.clone());
            self.set_state(ConnectionState::Connected);
        }

        info!(peer = ?peer, link = link.id, "Connected");

        tokio::spawn(Arc::clone(self).keep_alive(link.clone()));
        tokio::spawn(Arc::clone(self).receive_loop(link.id, reader, link.cancel.clone()));

        Some(link.cancel)
    }

    /// Report that link `link_id` is dead.
    ///
    /// Ignored when the link has already been replaced or torn down, which
    /// also covers failures racing a manual `disconnect`.
    fn fail_link(&self, link_id: u64, reason: String) {
        let mut shared = self.lock_shared();

        match shared.link.as_ref() {
            Some(link) if link.id == link_id => {}
            _ => {
                debug!(link = link_id, %reason, "Ignoring failure of stale link");
                return;
            }
        }
        let active_run = shared.run.as_ref().is_some_and(|run| !run.is_cancelled());

        if let Some(link) = shared.link.take() {
            if active_run {
                warn!(link = link_id, %reason, "Connection lost");
                self.set_state(ConnectionState::Error(reason));
            }
            // Wakes the supervisor and stops this link's tasks
            link.cancel.cancel();
        }
    }

    async fn send_on_link(&self, link: &Link, message: &SyncMessage) -> bool {
        let max = self.config.max_frame_len;

        let body = match message.to_json_bytes() {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %TransportError::from(e), "Failed to serialize message");
                return false;
            }
        };
        if body.is_empty() || body.len() > max {
            warn!(
                message_type = %message.message_type,
                bytes = body.len(),
                max,
                "Refusing to send message outside frame bounds"
            );
            return false;
        }

        let result = tokio::select! {
            _ = link.cancel.cancelled() => return false,
            result = async {
                let mut writer = link.writer.lock().await;
                time::timeout(
                    self.config.write_timeout,
                    framing::write_frame(&mut *writer, &body, max),
                )
                .await
            } => result,
        };

        match result {
            Ok(Ok(())) => {
                debug!(
                    message_type = %message.message_type,
                    bytes = body.len(),
                    "Sent message"
                );
                true
            }
            Ok(Err(e)) => {
                self.fail_link(link.id, TransportError::from(e).to_string());
                false
            }
            Err(_) => {
                self.fail_link(
                    link.id,
                    TransportError::Timeout(self.config.write_timeout).to_string(),
                );
                false
            }
        }
    }

    /// Send the handshake, then a ping every keep-alive interval
    async fn keep_alive(self: Arc<Self>, link: Link) {
        let handshake = SyncMessage::handshake(self.device_id.as_str());
        if !self.send_on_link(&link, &handshake).await {
            return;
        }
        debug!(link = link.id, "Sent handshake");

        let period = self.config.keepalive_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = link.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let ping = SyncMessage::ping(self.device_id.as_str());
                    if !self.send_on_link(&link, &ping).await {
                        warn!(link = link.id, "Ping failed, connection may be dead");
                        return;
                    }
                }
            }
        }
    }

    /// Read frames until the link fails or is cancelled
    async fn receive_loop(
        self: Arc<Self>,
        link_id: u64,
        mut reader: OwnedReadHalf,
        cancel: CancellationToken,
    ) {
        let max = self.config.max_frame_len;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return,
                frame = framing::read_frame(&mut reader, max) => frame,
            };

            match frame {
                Ok(body) => {
                    debug!(bytes = body.len(), "Received frame");
                    match SyncMessage::from_json_bytes(&body) {
                        Ok(message) => {
                            if self.message_tx.send(message).is_err() {
                                debug!("Message receiver dropped; discarding envelope");
                            }
                        }
                        Err(e) => {
                            let preview = String::from_utf8_lossy(&body[..body.len().min(100)]);
                            warn!(error = %e, %preview, "Dropping malformed message");
                        }
                    }
                }
                Err(FrameError::Closed) => {
                    self.fail_link(link_id, "Connection closed by peer".to_string());
                    return;
                }
                Err(e) => {
                    self.fail_link(link_id, TransportError::from(e).to_string());
                    return;
                }
            }
        }
    }
}
