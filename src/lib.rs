//! # Realtime Voice Session
//!
//! Client-side session core for a realtime conversational-audio service: a reconnecting
//! WebSocket connection, a message dispatcher, microphone capture and speaker playback
//! pipelines, and a coordinator that derives debounced presence from the event stream.
//!
//! ## Module map:
//! - **config**: layered configuration (defaults, `config.toml`, `APP_` environment)
//! - **error**: the crate error type
//! - **state**: session metrics
//! - **protocol**: message envelope, outbound events, inbound event classification
//! - **transport**: the socket seam (`Connector`) and its WebSocket implementation
//! - **connection**: lifecycle, send path and linear-backoff reconnect
//! - **dispatcher**: ordered fan-out of inbound messages
//! - **audio**: PCM conversion, capture and playback pipelines
//! - **device**: microphone/speaker seams and backends
//! - **presence**: debounced listening/speaking inference
//! - **session**: the coordinator façade
//! - **status**: read-only HTTP status endpoints

pub mod audio;
pub mod config;
pub mod connection;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod state;
pub mod status;
pub mod transport;

pub use config::AppConfig;
pub use connection::{Connection, ConnectionState};
pub use error::{SessionError, SessionResult};
pub use presence::{Presence, PresenceState};
pub use session::{SessionCoordinator, TranscriptEvent};
