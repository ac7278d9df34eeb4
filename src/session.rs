//! # Session Coordinator
//!
//! The façade the surrounding application talks to. One coordinator owns exactly one
//! connection, one capture pipeline, one playback pipeline and the presence tracker.
//!
//! ## Data flow:
//! microphone → capture → `Connection::send` → remote service → inbound frames →
//! dispatcher → {playback, presence inference, transcript observers}
//!
//! ## Lifecycle operations:
//! - `connect(target, credential)`: open the connection and remember the endpoint
//! - `start_listening()`: connect lazily if needed, then acquire the microphone
//! - `stop_listening()`: release the microphone, keep the connection
//! - `commit()`: end the user turn and ask for a response
//! - `disconnect()`: stop everything and return presence to Idle

use crate::audio::{CapturePipeline, PlaybackEvent, PlaybackMode, PlaybackPipeline}; // Both audio directions
use crate::config::AppConfig;
use crate::connection::{Connection, ConnectionOptions, ConnectionState};
use crate::device::{self, AudioInput, AudioOutput}; // Microphone and speaker seams
use crate::dispatcher::{handler, ObserverList};
use crate::error::{SessionError, SessionResult};
use crate::presence::{Presence, PresenceState, PresenceTracker};
use crate::protocol::{ClientEvent, Message, RealtimeEvent, SessionSettings};
use crate::state::{MetricsSnapshot, SessionMetrics};
use crate::transport::{Connector, WsConnector};
use chrono::{DateTime, Utc}; // Session timestamps
use parking_lot::Mutex;
use serde::Serialize; // Status snapshots go out as JSON
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid; // Unique session identifiers

const PCM16: &str = "pcm16";

/// Transcript text delivered to observers. Deltas arrive with `is_final = false`; the
/// closing event of a response carries the full text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
}

/// Point-in-time view for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: Uuid,
    pub connection: ConnectionState,
    pub presence: Presence,
    pub presence_state: PresenceState,
    pub listening: bool,
    pub playback_active: bool,
    pub playback_mode: PlaybackMode,
    pub created_at: DateTime<Utc>,
    pub metrics: MetricsSnapshot,
}

#[derive(Clone)]
struct Endpoint {
    target: String,
    credential: String,
}

/// One voice session.
///
/// ## Rust Concepts:
/// - **Composition**: the coordinator owns its parts and wires them together with
///   closures in `wire()`; the parts never reference the coordinator
/// - **Clone handles**: `PresenceTracker` and `PlaybackPipeline` are `Arc` wrappers, so
///   the closures capture cheap clones instead of borrowing `self`
/// - **Drop**: dropping the coordinator disconnects the connection
pub struct SessionCoordinator {
    session_id: Uuid,                // Unique ID for logs and status
    created_at: DateTime<Utc>,       // When the session was built
    connection: Connection,          // The one transport of this session
    capture: CapturePipeline,        // Microphone → audio-append messages
    playback: PlaybackPipeline,      // Audio deltas → output device
    presence: PresenceTracker,       // Listening/speaking flags
    transcripts: Arc<ObserverList<TranscriptEvent>>,
    errors: Arc<ObserverList<SessionError>>,
    endpoint: Mutex<Option<Endpoint>>, // Remembered for lazy connects
}

impl SessionCoordinator {
    /// Build a coordinator over explicit transport and device implementations.
    pub fn new(
        config: &AppConfig,
        connector: Arc<dyn Connector>,
        input: Arc<dyn AudioInput>,
        output: Arc<dyn AudioOutput>,
    ) -> SessionResult<Self> {
        let mode: PlaybackMode = config
            .audio
            .playback_mode
            .parse()
            .map_err(SessionError::Config)?;

        let metrics = SessionMetrics::new();
        let connection = Connection::new(connector, ConnectionOptions::from(&config.connection), metrics.clone());
        let capture = CapturePipeline::new(
            input,
            config.audio.sample_rate,
            config.audio.chunk_samples,
            config.response.modalities.clone(),
        );
        let playback = PlaybackPipeline::new(output, config.audio.sample_rate, mode, metrics);
        let presence = PresenceTracker::new(config.presence.debounce());

        let coordinator = Self {
            session_id: Uuid::new_v4(),
            created_at: Utc::now(),
            connection,
            capture,
            playback,
            presence,
            transcripts: Arc::new(ObserverList::default()),
            errors: Arc::new(ObserverList::default()),
            endpoint: Mutex::new(None),
        };
        coordinator.wire(config);

        info!(
            session_id = %coordinator.session_id,
            playback_mode = ?mode,
            chunk_samples = coordinator.capture.chunk_samples(),
            "Session created"
        );
        Ok(coordinator)
    }

    /// Build a coordinator with the WebSocket transport and the configured devices.
    pub fn from_config(config: &AppConfig) -> SessionResult<Self> {
        let connector = Arc::new(WsConnector::new(config.connection.headers.clone()));
        let input = device::input_from_config(&config.audio.input_device)?;
        let output = device::output_from_config(&config.audio.output_device)?;
        Self::new(config, connector, input, output)
    }

    fn wire(&self, config: &AppConfig) {
        // Inbound events: presence first, then transcripts and service errors
        let presence = self.presence.clone();
        let transcripts = self.transcripts.clone();
        let errors = self.errors.clone();
        let pending_text = Arc::new(Mutex::new(String::new()));
        self.connection.on_message(handler(move |message: &Message| {
            let event = RealtimeEvent::classify(message);
            presence.observe(&event);
            match event {
                RealtimeEvent::TranscriptDelta(delta) => {
                    pending_text.lock().push_str(&delta);
                    transcripts.notify(&TranscriptEvent {
                        text: delta,
                        is_final: false,
                    });
                }
                RealtimeEvent::TranscriptDone(text) => {
                    let accumulated = std::mem::take(&mut *pending_text.lock());
                    transcripts.notify(&TranscriptEvent {
                        text: text.unwrap_or(accumulated),
                        is_final: true,
                    });
                }
                RealtimeEvent::Error(description) => {
                    warn!(error = %description, "Service reported an error");
                    errors.notify(&SessionError::Service(description));
                }
                _ => {}
            }
            Ok(())
        }));

        self.playback.attach(self.connection.dispatcher());

        let presence = self.presence.clone();
        self.playback.on_event(move |event| {
            presence.set_output_active(*event == PlaybackEvent::Started);
        });

        let errors = self.errors.clone();
        self.connection.on_error(move |err| errors.notify(err));

        let response = &config.response;
        if response.instructions.is_some() || response.voice.is_some() {
            let settings = SessionSettings {
                instructions: response.instructions.clone(),
                voice: response.voice.clone(),
                input_audio_format: PCM16.to_string(),
                output_audio_format: PCM16.to_string(),
            };
            let connection = self.connection.downgrade();
            self.connection.on_open(move |_| {
                if let Some(connection) = connection.upgrade() {
                    debug!("Sending session update");
                    connection.send_event(ClientEvent::SessionUpdate {
                        session: settings.clone(),
                    });
                }
            });
        }
    }

    /// Open the connection and remember the endpoint for lazy reconnects from
    /// `start_listening()`.
    pub async fn connect(&self, target: &str, credential: &str) -> SessionResult<()> {
        self.set_endpoint(target, credential);
        self.connection.connect(target, credential).await
    }

    /// Remember where to connect without connecting yet.
    pub fn set_endpoint(&self, target: &str, credential: &str) {
        *self.endpoint.lock() = Some(Endpoint {
            target: target.to_string(),
            credential: credential.to_string(),
        });
    }

    /// Begin capturing. Connects first when the connection is not up. A device failure is
    /// returned as is and Listening is never entered.
    pub async fn start_listening(&self) -> SessionResult<()> {
        if !self.connection.is_connected() {
            let endpoint = self.endpoint.lock().clone().ok_or_else(|| {
                SessionError::NotConfigured("start_listening before any connect target was set".to_string())
            })?;
            self.connection.connect(&endpoint.target, &endpoint.credential).await?;
        }

        self.capture.start(&self.connection)?;
        self.presence.set_listening(true);
        Ok(())
    }

    /// Stop capturing. The connection stays open.
    pub fn stop_listening(&self) {
        self.capture.stop();
        self.presence.set_listening(false);
    }

    /// Commit the captured turn and request a response.
    pub fn commit(&self) -> bool {
        self.capture.commit(&self.connection)
    }

    pub fn disconnect(&self) {
        self.capture.stop();
        self.connection.disconnect();
        self.playback.reset();
        self.presence.reset();
        info!(session_id = %self.session_id, "Session disconnected");
    }

    pub fn on_transcript<F>(&self, observer: F)
    where
        F: Fn(&TranscriptEvent) + Send + Sync + 'static,
    {
        self.transcripts.add(observer);
    }

    pub fn on_presence_change<F>(&self, observer: F)
    where
        F: Fn(&Presence) + Send + Sync + 'static,
    {
        self.presence.on_change(observer);
    }

    /// Connection errors, exhausted retries and service-reported errors.
    pub fn on_error<F>(&self, observer: F)
    where
        F: Fn(&SessionError) + Send + Sync + 'static,
    {
        self.errors.add(observer);
    }

    pub fn presence(&self) -> Presence {
        self.presence.current()
    }

    pub fn subscribe_presence(&self) -> watch::Receiver<Presence> {
        self.presence.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn metrics(&self) -> &SessionMetrics {
        self.connection.metrics()
    }

    pub fn status(&self) -> SessionStatus {
        let presence = self.presence.current();
        SessionStatus {
            session_id: self.session_id,
            connection: self.connection.state(),
            presence,
            presence_state: presence.state(),
            listening: self.capture.is_active(),
            playback_active: self.playback.is_active(),
            playback_mode: self.playback.mode(),
            created_at: self.created_at,
            metrics: self.metrics().snapshot(),
        }
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}
