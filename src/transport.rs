//! # Transport Layer
//!
//! The physical socket sits behind the `Connector` trait so the connection logic can be
//! exercised without a network.
//!
//! ## Shape of an open transport:
//! - **outbound**: an unbounded channel drained by exactly one writer task. Every write
//!   from every context (socket reader, audio callback, caller) goes through this queue,
//!   so frames are never interleaved.
//! - **inbound**: lifecycle events (`Frame`, `Error`, `Closed`) produced by the reader task.
//!
//! Dropping the outbound sender closes the socket: the writer task sends a close frame
//! once its queue ends.

use crate::error::{SessionError, SessionResult};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Request};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Events produced by an open transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(WireFrame),
    /// Non-fatal report; a `Closed` event follows if the socket is gone
    Error(String),
    Closed { code: Option<u16>, reason: String },
}

/// Channels of one established transport.
pub struct TransportHandle {
    pub outbound: mpsc::UnboundedSender<WireFrame>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports. Implementations must resolve (success or failure) for every call.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, target: &str, credential: &str) -> BoxFuture<'static, SessionResult<TransportHandle>>;
}

/// WebSocket connector built on tokio-tungstenite.
///
/// The credential is sent as a bearer token; configured headers are added to the
/// same handshake request.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    headers: BTreeMap<String, String>,
}

impl WsConnector {
    pub fn new(headers: BTreeMap<String, String>) -> Self {
        Self { headers }
    }

    /// Build the handshake request. Fails for malformed targets or header values.
    pub fn build_request(&self, target: &str, credential: &str) -> SessionResult<Request<()>> {
        let mut request = target
            .into_client_request()
            .map_err(|e| SessionError::InvalidTarget(format!("{}: {}", target, e)))?;

        let headers = request.headers_mut();
        if !credential.is_empty() {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", credential))
                .map_err(|e| SessionError::InvalidTarget(format!("credential is not a valid header: {}", e)))?;
            headers.insert(AUTHORIZATION, bearer);
        }
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SessionError::InvalidTarget(format!("bad header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SessionError::InvalidTarget(format!("bad header value: {}", e)))?;
            headers.insert(name, value);
        }
        Ok(request)
    }
}

impl Connector for WsConnector {
    fn connect(&self, target: &str, credential: &str) -> BoxFuture<'static, SessionResult<TransportHandle>> {
        let request = self.build_request(target, credential);
        Box::pin(async move {
            let request = request?;
            let (stream, response) = connect_async(request).await?;
            debug!(status = %response.status(), "WebSocket handshake accepted");

            let (mut sink, mut source) = stream.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireFrame>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();

            // Single writer
            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    let msg = match frame {
                        WireFrame::Text(text) => WsMessage::Text(text),
                        WireFrame::Binary(bytes) => WsMessage::Binary(bytes),
                    };
                    if let Err(e) = sink.send(msg).await {
                        warn!("WebSocket write failed: {}", e);
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            tokio::spawn(async move {
                loop {
                    let event = match source.next().await {
                        Some(Ok(WsMessage::Text(text))) => TransportEvent::Frame(WireFrame::Text(text)),
                        Some(Ok(WsMessage::Binary(bytes))) => TransportEvent::Frame(WireFrame::Binary(bytes)),
                        Some(Ok(WsMessage::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                                .unwrap_or((None, String::new()));
                            let _ = in_tx.send(TransportEvent::Closed { code, reason });
                            return;
                        }
                        // Ping/pong are answered by tungstenite itself
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            let _ = in_tx.send(TransportEvent::Error(e.to_string()));
                            let _ = in_tx.send(TransportEvent::Closed {
                                code: None,
                                reason: e.to_string(),
                            });
                            return;
                        }
                        None => {
                            let _ = in_tx.send(TransportEvent::Closed {
                                code: None,
                                reason: "stream ended".to_string(),
                            });
                            return;
                        }
                    };
                    if in_tx.send(event).is_err() {
                        // Connection no longer listening
                        return;
                    }
                }
            });

            Ok(TransportHandle {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-process connector. Each accepted connect creates a `MockRemote` the test can
    //! use to inject events and read what the connection wrote.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Debug, Clone)]
    pub enum ConnectScript {
        Accept,
        AcceptAfter(Duration),
        Reject(String),
        Hang,
    }

    pub struct MockRemote {
        pub written: mpsc::UnboundedReceiver<WireFrame>,
        pub events: mpsc::UnboundedSender<TransportEvent>,
    }

    impl MockRemote {
        pub fn send_text(&self, text: &str) {
            let _ = self
                .events
                .send(TransportEvent::Frame(WireFrame::Text(text.to_string())));
        }

        pub fn close(&self, code: u16, reason: &str) {
            let _ = self.events.send(TransportEvent::Closed {
                code: Some(code),
                reason: reason.to_string(),
            });
        }

        pub fn drain(&mut self) -> Vec<WireFrame> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.written.try_recv() {
                frames.push(frame);
            }
            frames
        }
    }

    #[derive(Default)]
    struct MockState {
        script: VecDeque<ConnectScript>,
        attempts: Vec<(Instant, String, String)>,
        remotes: Vec<Option<MockRemote>>,
        // Keeps every inbound channel open even after the test takes its remote.
        keepalive: Vec<mpsc::UnboundedSender<TransportEvent>>,
    }

    #[derive(Default)]
    pub struct MockConnector {
        state: Mutex<MockState>,
    }

    impl MockConnector {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Queue the outcome of a future connect; an empty script accepts.
        pub fn push(&self, script: ConnectScript) {
            self.state.lock().script.push_back(script);
        }

        pub fn attempts(&self) -> Vec<Instant> {
            self.state.lock().attempts.iter().map(|(at, _, _)| *at).collect()
        }

        pub fn attempt_count(&self) -> usize {
            self.state.lock().attempts.len()
        }

        pub fn last_credential(&self) -> Option<String> {
            self.state.lock().attempts.last().map(|(_, _, cred)| cred.clone())
        }

        /// Take the remote end of the `index`-th accepted transport.
        pub fn take_remote(&self, index: usize) -> MockRemote {
            self.state
                .lock()
                .remotes
                .get_mut(index)
                .and_then(Option::take)
                .expect("no such remote")
        }

        pub fn accepted(&self) -> usize {
            self.state.lock().remotes.len()
        }

        fn accept(&self) -> TransportHandle {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let mut state = self.state.lock();
            state.keepalive.push(in_tx.clone());
            state.remotes.push(Some(MockRemote {
                written: out_rx,
                events: in_tx,
            }));
            TransportHandle {
                outbound: out_tx,
                inbound: in_rx,
            }
        }
    }

    impl Connector for Arc<MockConnector> {
        fn connect(&self, target: &str, credential: &str) -> BoxFuture<'static, SessionResult<TransportHandle>> {
            let script = {
                let mut state = self.state.lock();
                state
                    .attempts
                    .push((Instant::now(), target.to_string(), credential.to_string()));
                state.script.pop_front().unwrap_or(ConnectScript::Accept)
            };
            let this = self.clone();
            Box::pin(async move {
                match script {
                    ConnectScript::Accept => Ok(this.accept()),
                    ConnectScript::AcceptAfter(delay) => {
                        tokio::time::sleep(delay).await;
                        Ok(this.accept())
                    }
                    ConnectScript::Reject(reason) => Err(SessionError::ConnectFailed(reason)),
                    ConnectScript::Hang => futures_util::future::pending().await,
                }
            })
        }
    }
}
