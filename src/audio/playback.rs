//! # Audio Playback Pipeline
//!
//! Renders inbound audio deltas as soon as they are decoded.
//!
//! ## Scheduling modes:
//! - **Sequenced** (default): each buffer starts when the previous one ends, or now if
//!   the output is idle. The first chunk still plays immediately; later chunks never
//!   overlap.
//! - **Immediate**: every buffer starts the moment it is decoded. Chunks arriving faster
//!   than real time overlap in the device mix.
//!
//! ## Activity signal:
//! Each scheduled buffer has a known start and end. A lifecycle task per buffer marks
//! those instants; the pipeline is "active" while at least one buffer is rendering, and
//! observers get `Started`/`Stopped` on the edges.

use crate::audio::pcm;
use crate::device::{AudioOutput, PlaybackBuffer};
use crate::dispatcher::{handler, Dispatcher, MessageHandler, ObserverList};
use crate::error::{SessionError, SessionResult};
use crate::protocol::{event_types, Message};
use crate::state::SessionMetrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    #[default]
    Sequenced,
    Immediate,
}

impl std::str::FromStr for PlaybackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequenced" | "queued" => Ok(PlaybackMode::Sequenced),
            "immediate" => Ok(PlaybackMode::Immediate),
            other => Err(format!("Unknown playback mode: {}", other)),
        }
    }
}

/// Edges of the "audio output active" signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started,
    Stopped,
}

#[derive(Default)]
struct Schedule {
    /// End of the last scheduled buffer
    tail: Option<Instant>,
    rendering: usize,
    /// Bumped by `reset()`; lifecycle tasks from an older epoch are ignored
    epoch: u64,
}

struct PlaybackInner {
    output: Arc<dyn AudioOutput>,
    sample_rate: u32,
    mode: PlaybackMode,
    metrics: SessionMetrics,
    schedule: Mutex<Schedule>,
    active: watch::Sender<bool>,
    observers: ObserverList<PlaybackEvent>,
}

#[derive(Clone)]
pub struct PlaybackPipeline {
    inner: Arc<PlaybackInner>,
}

impl PlaybackPipeline {
    pub fn new(output: Arc<dyn AudioOutput>, sample_rate: u32, mode: PlaybackMode, metrics: SessionMetrics) -> Self {
        let (active, _) = watch::channel(false);
        Self {
            inner: Arc::new(PlaybackInner {
                output,
                sample_rate,
                mode,
                metrics,
                schedule: Mutex::new(Schedule::default()),
                active,
                observers: ObserverList::default(),
            }),
        }
    }

    pub fn mode(&self) -> PlaybackMode {
        self.inner.mode
    }

    /// Subscribe this pipeline to the audio-delta message types. Returns the handler so
    /// it can be removed later.
    pub fn attach(&self, dispatcher: &Dispatcher) -> MessageHandler {
        let pipeline = self.clone();
        let on_delta = handler(move |message: &Message| {
            pipeline.handle_message(message)?;
            Ok(())
        });
        dispatcher.on(event_types::AUDIO_DELTA, on_delta.clone());
        dispatcher.on(event_types::OUTPUT_AUDIO_DELTA, on_delta.clone());
        on_delta
    }

    pub fn detach(&self, dispatcher: &Dispatcher, on_delta: &MessageHandler) {
        dispatcher.off(event_types::AUDIO_DELTA, on_delta);
        dispatcher.off(event_types::OUTPUT_AUDIO_DELTA, on_delta);
    }

    fn handle_message(&self, message: &Message) -> SessionResult<()> {
        let payload = message
            .str_field("delta")
            .or_else(|| message.str_field("audio"))
            .ok_or_else(|| SessionError::Protocol(format!("{} without audio payload", message.kind())))?;
        self.play_chunk(payload).map(|_| ())
    }

    /// Decode one base64 PCM16 delta and schedule it. Returns the start delay used.
    pub fn play_chunk(&self, payload: &str) -> SessionResult<Duration> {
        let samples = pcm::decode_chunk(payload).map_err(|err| {
            warn!(error = %err, "Dropping undecodable audio delta");
            err
        })?;
        if samples.is_empty() {
            return Ok(Duration::ZERO);
        }
        let buffer = PlaybackBuffer {
            samples,
            sample_rate: self.inner.sample_rate,
        };
        let length = buffer.duration();

        let (delay, start, end, epoch) = {
            let mut schedule = self.inner.schedule.lock();
            let now = Instant::now();
            let start = match (self.inner.mode, schedule.tail) {
                (PlaybackMode::Sequenced, Some(tail)) if tail > now => tail,
                _ => now,
            };
            let end = start + length;
            schedule.tail = Some(schedule.tail.map_or(end, |tail| tail.max(end)));
            (start - now, start, end, schedule.epoch)
        };

        self.inner.output.schedule(buffer, delay)?;
        self.inner.metrics.record_playback_buffer();
        debug!(
            delay_ms = delay.as_millis() as u64,
            length_ms = length.as_millis() as u64,
            "Scheduled playback buffer"
        );

        let pipeline = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(start).await;
            pipeline.buffer_started(epoch);
            tokio::time::sleep_until(end).await;
            pipeline.buffer_ended(epoch);
        });
        Ok(delay)
    }

    fn buffer_started(&self, epoch: u64) {
        let edge = {
            let mut schedule = self.inner.schedule.lock();
            if schedule.epoch != epoch {
                return;
            }
            schedule.rendering += 1;
            self.update_activity(&schedule)
        };
        self.notify_edge(edge);
    }

    fn buffer_ended(&self, epoch: u64) {
        let edge = {
            let mut schedule = self.inner.schedule.lock();
            if schedule.epoch != epoch {
                return;
            }
            schedule.rendering = schedule.rendering.saturating_sub(1);
            self.update_activity(&schedule)
        };
        self.notify_edge(edge);
    }

    /// Active while something renders or a queued buffer is about to start, so
    /// back-to-back buffers read as one continuous interval.
    fn update_activity(&self, schedule: &Schedule) -> Option<PlaybackEvent> {
        let now = Instant::now();
        let active = schedule.rendering > 0 || schedule.tail.is_some_and(|tail| tail > now);
        let previous = self.inner.active.send_replace(active);
        match (previous, active) {
            (false, true) => Some(PlaybackEvent::Started),
            (true, false) => Some(PlaybackEvent::Stopped),
            _ => None,
        }
    }

    fn notify_edge(&self, edge: Option<PlaybackEvent>) {
        if let Some(event) = edge {
            self.inner.observers.notify(&event);
        }
    }

    /// Drop everything queued and force the activity signal low.
    pub fn reset(&self) {
        let edge = {
            let mut schedule = self.inner.schedule.lock();
            schedule.epoch += 1;
            schedule.tail = None;
            schedule.rendering = 0;
            self.update_activity(&schedule)
        };
        self.inner.output.clear();
        self.notify_edge(edge);
    }

    /// Whether any buffer is currently rendering.
    pub fn is_active(&self) -> bool {
        *self.inner.active.borrow()
    }

    pub fn subscribe_active(&self) -> watch::Receiver<bool> {
        self.inner.active.subscribe()
    }

    pub fn on_event<F>(&self, observer: F)
    where
        F: Fn(&PlaybackEvent) + Send + Sync + 'static,
    {
        self.inner.observers.add(observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockOutput;
    use std::sync::atomic::Ordering;

    const RATE: u32 = 24_000;

    fn pipeline(mode: PlaybackMode) -> (Arc<MockOutput>, PlaybackPipeline) {
        let output = MockOutput::new();
        let pipeline = PlaybackPipeline::new(Arc::new(output.clone()), RATE, mode, SessionMetrics::new());
        (output, pipeline)
    }

    /// base64 PCM16 payload lasting `ms` milliseconds at 24 kHz
    fn delta(ms: u64) -> String {
        let samples = vec![0.25f32; (RATE as u64 * ms / 1000) as usize];
        pcm::encode_chunk(&samples)
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("sequenced".parse::<PlaybackMode>().unwrap(), PlaybackMode::Sequenced);
        assert_eq!("Immediate".parse::<PlaybackMode>().unwrap(), PlaybackMode::Immediate);
        assert!("shuffle".parse::<PlaybackMode>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequenced_buffers_play_back_to_back() {
        let (output, pipeline) = pipeline(PlaybackMode::Sequenced);
        pipeline.play_chunk(&delta(100)).unwrap();
        pipeline.play_chunk(&delta(100)).unwrap();
        pipeline.play_chunk(&delta(50)).unwrap();

        assert_eq!(
            output.delays(),
            vec![Duration::ZERO, Duration::from_millis(100), Duration::from_millis(200)]
        );

        // Once everything has played, the next chunk starts immediately again
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pipeline.play_chunk(&delta(100)).unwrap(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_mode_never_delays() {
        let (output, pipeline) = pipeline(PlaybackMode::Immediate);
        pipeline.play_chunk(&delta(100)).unwrap();
        pipeline.play_chunk(&delta(100)).unwrap();
        assert_eq!(output.delays(), vec![Duration::ZERO, Duration::ZERO]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_signal_spans_all_buffers() {
        let (_output, pipeline) = pipeline(PlaybackMode::Sequenced);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        pipeline.on_event(move |event| sink.lock().push(*event));

        pipeline.play_chunk(&delta(100)).unwrap();
        pipeline.play_chunk(&delta(100)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(pipeline.is_active());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(pipeline.is_active());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pipeline.is_active());
        assert_eq!(*events.lock(), vec![PlaybackEvent::Started, PlaybackEvent::Stopped]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forces_idle() {
        let (output, pipeline) = pipeline(PlaybackMode::Sequenced);
        pipeline.play_chunk(&delta(500)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(pipeline.is_active());

        pipeline.reset();
        assert!(!pipeline.is_active());
        assert_eq!(output.clears.load(Ordering::SeqCst), 1);
        // The stale lifecycle task must not flip the signal again
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!pipeline.is_active());
        assert_eq!(pipeline.play_chunk(&delta(100)).unwrap(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attached_to_dispatcher() {
        let (output, pipeline) = pipeline(PlaybackMode::Sequenced);
        let dispatcher = Dispatcher::default();
        let on_delta = pipeline.attach(&dispatcher);

        let msg = Message::new(event_types::AUDIO_DELTA).with_field("delta", delta(20));
        assert_eq!(dispatcher.dispatch(&msg).failed, 0);
        assert_eq!(output.scheduled.lock().len(), 1);
        assert_eq!(output.scheduled.lock()[0].0.samples.len(), 480);

        let broken = Message::new(event_types::AUDIO_DELTA).with_field("delta", "%%%");
        assert_eq!(dispatcher.dispatch(&broken).failed, 1);
        assert_eq!(output.scheduled.lock().len(), 1);

        pipeline.detach(&dispatcher, &on_delta);
        assert_eq!(dispatcher.handler_count(event_types::AUDIO_DELTA), 0);
    }
}
