//! # Session Metrics
//!
//! Counters shared by the connection, the dispatcher and the audio pipelines.
//! Every component holds a clone of the same `SessionMetrics`; the status endpoint
//! reads a snapshot.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: The socket reader task, the capture task and the status handlers all hold a reference
//! - **RwLock**: Many readers (status requests) or one writer (a counter bump)
//! - `parking_lot::RwLock` is used so a panicking handler can never poison the counters

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Shared, cheaply clonable metrics handle.
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    counters: Arc<RwLock<MetricCounters>>,

    /// When this session core was created (never changes)
    start_time: Instant,
    started_at: DateTime<Utc>,
}

/// Raw counters, all monotonically increasing.
#[derive(Debug, Default, Clone, Serialize)]
pub struct MetricCounters {
    /// Text and binary frames handed to the transport writer
    pub frames_sent: u64,
    /// Sends attempted while not connected
    pub frames_dropped: u64,
    /// Frames read from the transport
    pub frames_received: u64,
    /// Text frames that failed to decode as a JSON object
    pub malformed_frames: u64,
    /// Handlers that errored or panicked during dispatch
    pub handler_failures: u64,
    /// Capture chunks sent as audio-append messages
    pub audio_chunks_sent: u64,
    /// Capture chunks dropped because the connection was down
    pub audio_chunks_dropped: u64,
    /// Playback buffers handed to the output device
    pub playback_buffers: u64,
    /// Reconnect attempts scheduled after unexpected closes
    pub reconnect_attempts: u64,
    /// Successful Connected transitions
    pub connects: u64,
}

/// Snapshot returned to the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    #[serde(flatten)]
    pub counters: MetricCounters,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(RwLock::new(MetricCounters::default())),
            start_time: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Apply a mutation to the counters under the write lock.
    fn bump(&self, f: impl FnOnce(&mut MetricCounters)) {
        let mut counters = self.counters.write();
        f(&mut counters);
    }

    pub fn record_frame_sent(&self) {
        self.bump(|c| c.frames_sent += 1);
    }

    pub fn record_frame_dropped(&self) {
        self.bump(|c| c.frames_dropped += 1);
    }

    pub fn record_frame_received(&self) {
        self.bump(|c| c.frames_received += 1);
    }

    pub fn record_malformed_frame(&self) {
        self.bump(|c| c.malformed_frames += 1);
    }

    pub fn record_handler_failure(&self) {
        self.bump(|c| c.handler_failures += 1);
    }

    pub fn record_audio_chunk(&self, sent: bool) {
        self.bump(|c| {
            if sent {
                c.audio_chunks_sent += 1;
            } else {
                c.audio_chunks_dropped += 1;
            }
        });
    }

    pub fn record_playback_buffer(&self) {
        self.bump(|c| c.playback_buffers += 1);
    }

    pub fn record_reconnect_attempt(&self) {
        self.bump(|c| c.reconnect_attempts += 1);
    }

    pub fn record_connect(&self) {
        self.bump(|c| c.connects += 1);
    }

    /// Copy of the counters; the lock is released before the caller serializes anything.
    pub fn counters(&self) -> MetricCounters {
        self.counters.read().clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters(),
            started_at: self.started_at,
            uptime_seconds: self.uptime_seconds(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = SessionMetrics::new();
        let other = metrics.clone();

        metrics.record_frame_sent();
        other.record_frame_sent();
        other.record_audio_chunk(false);

        let counters = metrics.counters();
        assert_eq!(counters.frames_sent, 2);
        assert_eq!(counters.audio_chunks_dropped, 1);
        assert_eq!(counters.audio_chunks_sent, 0);
    }

    #[test]
    fn test_snapshot_serializes_flat() {
        let metrics = SessionMetrics::new();
        metrics.record_malformed_frame();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["malformed_frames"], 1);
        assert!(json.get("uptime_seconds").is_some());
    }
}
