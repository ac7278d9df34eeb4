//! # Connection
//!
//! Owns one transport at a time and turns its lifecycle into a `ConnectionState`.
//!
//! ## Lifecycle:
//! ```text
//! Disconnected ─connect()─► Connecting ─open─► Connected
//!       ▲                       │                 │ unexpected close
//!       └──────── failure ──────┘                 ▼
//!       ◄──── budget exhausted ──────────── Reconnecting ─timer─► Connecting
//!
//! any state ─disconnect()─► Closed
//! ```
//!
//! ## Cancellation:
//! Every `connect()`/`disconnect()` bumps a generation counter under the lifecycle lock.
//! Timers, in-flight attempts and reader tasks carry the generation they were started
//! with and do nothing once it is stale, so a timer that is already firing when
//! `disconnect()` runs cannot open a new socket.
//!
//! ## Write path:
//! `send()` only enqueues onto the transport's outbound channel; the transport's single
//! writer task owns the socket sink. It is safe to call from the reader task, the
//! capture task, or any caller.

use crate::config::ConnectionConfig;
use crate::dispatcher::{Dispatcher, MessageHandler, ObserverList}; // Inbound fan-out
use crate::error::{SessionError, SessionResult};
use crate::protocol::{ClientEvent, Message};
use crate::state::SessionMetrics;
use crate::transport::{Connector, TransportEvent, TransportHandle, WireFrame}; // Socket seam
use futures_util::future::{BoxFuture, FutureExt, Shared}; // One connect outcome, many awaiters
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch}; // Outbound queue and state signal
use tokio::task::JoinHandle; // Reader and timer tasks, aborted on cancel
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Linear reconnect backoff: the n-th consecutive retry waits `base_delay × n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    pub attempt: u32,
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffState {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            base_delay,
            max_attempts,
        }
    }

    /// Advance to the next attempt and return its delay, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;
        Some(self.base_delay.checked_mul(self.attempt).unwrap_or(Duration::MAX))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Reported to close observers.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: String,
    /// True when the close came from `disconnect()`
    pub expected: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub connect_timeout: Duration,
}

impl From<&ConnectionConfig> for ConnectionOptions {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_attempts: config.max_attempts,
            connect_timeout: config.connect_timeout(),
        }
    }
}

type PendingConnect = Shared<BoxFuture<'static, SessionResult<()>>>;

#[derive(Clone)]
struct Endpoint {
    target: String,
    credential: String,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("target", &self.target)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Everything that changes together, guarded by one lock.
struct Lifecycle {
    endpoint: Option<Endpoint>,          // Last requested target and credential
    generation: u64,                     // Bumped by connect()/disconnect()
    transport_id: u64,                   // Bumped per opened transport
    outbound: Option<mpsc::UnboundedSender<WireFrame>>, // Present only while Connected
    pending: Option<PendingConnect>,     // In-flight attempt, if any
    backoff: BackoffState,
    reconnect_timer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    dispatcher: Arc<Dispatcher>,
    metrics: SessionMetrics,
    state: watch::Sender<ConnectionState>,
    lifecycle: Mutex<Lifecycle>,
    error_observers: ObserverList<SessionError>,
    close_observers: ObserverList<CloseInfo>,
    open_observers: ObserverList<()>,
}

/// Cheaply clonable handle; all clones drive the same transport.
///
/// ## Rust Concepts:
/// - **Arc<Inner>**: every clone points at the same state, so the capture task, the
///   reader task and the caller can each hold a `Connection`
/// - **Weak**: observers registered on the connection itself use `WeakConnection`
///   so the connection does not keep itself alive
/// - **watch::Sender**: the current state is readable at any time and subscribers
///   are woken on every change
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Non-owning handle for observers registered on the connection itself.
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl Connection {
    pub fn new(connector: Arc<dyn Connector>, options: ConnectionOptions, metrics: SessionMetrics) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                connect_timeout: options.connect_timeout,
                dispatcher: Arc::new(Dispatcher::new(metrics.clone())),
                metrics,
                state,
                lifecycle: Mutex::new(Lifecycle {
                    endpoint: None,
                    generation: 0,
                    transport_id: 0,
                    outbound: None,
                    pending: None,
                    backoff: BackoffState::new(options.base_delay, options.max_attempts),
                    reconnect_timer: None,
                    reader: None,
                }),
                error_observers: ObserverList::default(),
                close_observers: ObserverList::default(),
                open_observers: ObserverList::default(),
            }),
        }
    }

    /// Open a transport to `target`.
    ///
    /// ## Rust Concepts:
    /// - **Shared future**: the attempt runs on its own task; `Shared` lets every
    ///   concurrent caller await the same outcome (which is why `SessionError` is `Clone`)
    /// - **Scoped lock**: the lifecycle lock is released before awaiting
    ///
    /// Resolves once the transport is open. A call made while an attempt to the same
    /// target and credential is in flight joins that attempt instead of opening a second
    /// socket; a call for a different endpoint cancels it (its callers get `Closed`).
    /// A call for the endpoint that is already connected returns immediately.
    pub async fn connect(&self, target: &str, credential: &str) -> SessionResult<()> {
        let pending = {
            let mut lc = self.inner.lifecycle.lock();
            let same_endpoint = lc
                .endpoint
                .as_ref()
                .is_some_and(|e| e.target == target && e.credential == credential);
            let joinable = lc.pending.clone().filter(|_| same_endpoint);
            if let Some(pending) = joinable {
                debug!("Joining in-flight connect attempt");
                pending
            } else if same_endpoint && lc.pending.is_none() && self.state() == ConnectionState::Connected {
                return Ok(());
            } else {
                // A different endpoint supersedes whatever attempt is in flight.
                lc.generation += 1;
                if let Some(timer) = lc.reconnect_timer.take() {
                    timer.abort();
                }
                if let Some(reader) = lc.reader.take() {
                    reader.abort();
                }
                lc.outbound = None;
                lc.backoff.reset();
                lc.endpoint = Some(Endpoint {
                    target: target.to_string(),
                    credential: credential.to_string(),
                });
                info!(url = %target, "Connecting");
                self.begin_attempt(&mut lc, false)
            }
        };
        pending.await
    }

    /// Close the transport and stop all automatic reconnection.
    /// Repeated calls are no-ops; close observers hear about each close once.
    pub fn disconnect(&self) {
        let (was_open, previous) = {
            let mut lc = self.inner.lifecycle.lock();
            lc.generation += 1;
            if let Some(timer) = lc.reconnect_timer.take() {
                timer.abort();
            }
            if let Some(reader) = lc.reader.take() {
                reader.abort();
            }
            lc.pending = None;
            lc.backoff.reset();
            // Dropping the sender ends the writer task, which closes the socket.
            let was_open = lc.outbound.take().is_some();
            let previous = self.inner.state.send_replace(ConnectionState::Closed);
            (was_open, previous)
        };
        if previous == ConnectionState::Closed {
            debug!("Already closed");
            return;
        }
        debug!(from = ?previous, to = ?ConnectionState::Closed, "Connection state changed");
        info!(was_open, "Connection closed by caller");
        self.inner.close_observers.notify(&CloseInfo {
            code: Some(1000),
            reason: "client disconnect".to_string(),
            expected: true,
        });
    }

    /// Serialize and enqueue `message`. Returns false (and logs) when not connected.
    pub fn send(&self, message: &Message) -> bool {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "Refusing to send unencodable message");
                return false;
            }
        };
        self.write(WireFrame::Text(text), message.kind())
    }

    pub fn send_event(&self, event: ClientEvent) -> bool {
        match event.into_message() {
            Ok(message) => self.send(&message),
            Err(err) => {
                warn!(error = %err, "Failed to encode client event");
                false
            }
        }
    }

    /// Same connected-only contract as `send`, for opaque payloads.
    pub fn send_binary(&self, bytes: Vec<u8>) -> bool {
        self.write(WireFrame::Binary(bytes), "binary")
    }

    fn write(&self, frame: WireFrame, label: &str) -> bool {
        let outbound = {
            let lc = self.inner.lifecycle.lock();
            if self.state() == ConnectionState::Connected {
                lc.outbound.clone()
            } else {
                None
            }
        };
        match outbound {
            Some(tx) if tx.send(frame).is_ok() => {
                self.inner.metrics.record_frame_sent();
                true
            }
            _ => {
                warn!(message_type = label, state = ?self.state(), "Send while not connected; dropping");
                self.inner.metrics.record_frame_dropped();
                false
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn backoff(&self) -> BackoffState {
        self.inner.lifecycle.lock().backoff
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.inner.metrics
    }

    /// Observe every decoded inbound message (a type-agnostic dispatcher handler).
    pub fn on_message(&self, handler: MessageHandler) {
        self.inner.dispatcher.on_any(handler);
    }

    pub fn on_error<F>(&self, observer: F)
    where
        F: Fn(&SessionError) + Send + Sync + 'static,
    {
        self.inner.error_observers.add(observer);
    }

    pub fn on_close<F>(&self, observer: F)
    where
        F: Fn(&CloseInfo) + Send + Sync + 'static,
    {
        self.inner.close_observers.add(observer);
    }

    /// Called after every Connected transition, including automatic reconnects.
    pub fn on_open<F>(&self, observer: F)
    where
        F: Fn(&()) + Send + Sync + 'static,
    {
        self.inner.open_observers.add(observer);
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.inner.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "Connection state changed");
        }
    }

    /// Spawn one establishment attempt for the current generation. Caller holds the lock.
    fn begin_attempt(&self, lc: &mut Lifecycle, reconnecting: bool) -> PendingConnect {
        let Some(endpoint) = lc.endpoint.clone() else {
            let missing = SessionError::NotConfigured("no connection target".to_string());
            return futures_util::future::ready(Err(missing)).boxed().shared();
        };
        let generation = lc.generation;
        self.set_state(ConnectionState::Connecting);

        let this = self.clone();
        let task = tokio::spawn(async move { this.establish(generation, endpoint, reconnecting).await });
        let pending = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(SessionError::Internal(format!("connect task failed: {}", e))),
            }
        }
        .boxed()
        .shared();
        lc.pending = Some(pending.clone());
        pending
    }

    async fn establish(self, generation: u64, endpoint: Endpoint, reconnecting: bool) -> SessionResult<()> {
        let timeout = self.inner.connect_timeout;
        let attempt = self.inner.connector.connect(&endpoint.target, &endpoint.credential);
        let outcome = match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(format!(
                "no handshake within {} ms",
                timeout.as_millis()
            ))),
        };
        self.finish_attempt(generation, &endpoint, outcome, reconnecting)
    }

    fn finish_attempt(
        &self,
        generation: u64,
        endpoint: &Endpoint,
        outcome: SessionResult<TransportHandle>,
        reconnecting: bool,
    ) -> SessionResult<()> {
        let mut lc = self.inner.lifecycle.lock();
        if lc.generation != generation {
            debug!("Discarding outcome of a cancelled connect attempt");
            return Err(SessionError::Closed(
                "connection was closed while connecting".to_string(),
            ));
        }
        lc.pending = None;

        match outcome {
            Ok(handle) => {
                lc.transport_id += 1;
                let transport_id = lc.transport_id;
                lc.outbound = Some(handle.outbound);
                lc.backoff.reset();
                let reader = self.clone().read_loop(handle.inbound, generation, transport_id);
                lc.reader = Some(tokio::spawn(reader));
                self.set_state(ConnectionState::Connected);
                drop(lc);

                self.inner.metrics.record_connect();
                info!(url = %endpoint.target, reconnecting, "Connected");
                self.inner.open_observers.notify(&());
                Ok(())
            }
            Err(err) if reconnecting => {
                warn!(error = %err, attempt = lc.backoff.attempt, "Reconnect attempt failed");
                let exhausted = self.schedule_reconnect(&mut lc);
                drop(lc);
                if let Some(exhausted) = exhausted {
                    self.inner.error_observers.notify(&exhausted);
                }
                Err(err)
            }
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                drop(lc);
                warn!(url = %endpoint.target, error = %err, "Connect failed");
                Err(err)
            }
        }
    }

    async fn read_loop(
        self,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
        generation: u64,
        transport_id: u64,
    ) {
        while let Some(event) = inbound.recv().await {
            match event {
                TransportEvent::Frame(WireFrame::Text(text)) => {
                    self.inner.metrics.record_frame_received();
                    match Message::from_json(&text) {
                        Ok(message) => {
                            self.inner.dispatcher.dispatch(&message);
                        }
                        Err(err) => {
                            warn!(error = %err, len = text.len(), "Discarding malformed inbound frame");
                            self.inner.metrics.record_malformed_frame();
                        }
                    }
                }
                TransportEvent::Frame(WireFrame::Binary(bytes)) => {
                    self.inner.metrics.record_frame_received();
                    self.inner.dispatcher.dispatch_binary(&bytes);
                }
                TransportEvent::Error(reason) => {
                    warn!(%reason, "Transport error");
                    self.inner.error_observers.notify(&SessionError::Transport(reason));
                }
                TransportEvent::Closed { code, reason } => {
                    self.handle_close(generation, transport_id, code, reason);
                    return;
                }
            }
        }
        self.handle_close(generation, transport_id, None, "transport ended".to_string());
    }

    fn handle_close(&self, generation: u64, transport_id: u64, code: Option<u16>, reason: String) {
        let exhausted = {
            let mut lc = self.inner.lifecycle.lock();
            if lc.generation != generation || lc.transport_id != transport_id {
                return;
            }
            lc.outbound = None;
            lc.reader = None;
            warn!(?code, %reason, "Connection closed unexpectedly");
            self.schedule_reconnect(&mut lc)
        };
        self.inner.close_observers.notify(&CloseInfo {
            code,
            reason,
            expected: false,
        });
        if let Some(exhausted) = exhausted {
            self.inner.error_observers.notify(&exhausted);
        }
    }

    /// Arm the next reconnect timer, or settle in Disconnected when the budget is spent.
    /// Caller holds the lock; the returned error must be reported after releasing it.
    fn schedule_reconnect(&self, lc: &mut Lifecycle) -> Option<SessionError> {
        let Some(delay) = lc.backoff.next_delay() else {
            self.set_state(ConnectionState::Disconnected);
            error!(
                attempts = lc.backoff.max_attempts,
                "Reconnect budget exhausted; staying disconnected"
            );
            return Some(SessionError::RetriesExhausted(lc.backoff.max_attempts));
        };

        self.set_state(ConnectionState::Reconnecting);
        self.inner.metrics.record_reconnect_attempt();
        warn!(
            attempt = lc.backoff.attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );

        let generation = lc.generation;
        let this = self.clone();
        lc.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.fire_reconnect(generation);
        }));
        None
    }

    fn fire_reconnect(&self, generation: u64) {
        let mut lc = self.inner.lifecycle.lock();
        if lc.generation != generation {
            return;
        }
        lc.reconnect_timer = None;
        info!(attempt = lc.backoff.attempt, "Reconnecting");
        // The attempt runs on its own task; its outcome is handled in finish_attempt.
        let _ = self.begin_attempt(&mut lc, true);
    }
}
