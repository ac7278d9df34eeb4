//! # Audio Capture Pipeline
//!
//! Microphone blocks → fixed-length chunks → PCM16 → base64 → `input_audio_buffer.append`.
//!
//! ## Flow:
//! 1. `start()` acquires the input device; a failure is returned to the caller unchanged
//! 2. A capture task accumulates device blocks into chunks of `chunk_samples`
//! 3. Each full chunk is sent only while capture is active and the connection is
//!    Connected; otherwise it is dropped and counted. Nothing is buffered for later.
//! 4. `stop()` releases the device and discards any partial chunk
//!
//! Committing the input buffer is separate: `commit()` sends the commit message followed
//! by a response request.

use crate::audio::buffer::ChunkAccumulator;
use crate::audio::pcm;
use crate::connection::Connection;
use crate::device::{AudioInput, DeviceGuard};
use crate::error::SessionResult;
use crate::protocol::{ClientEvent, ResponseRequest};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

struct RunningCapture {
    task: JoinHandle<()>,
    guard: DeviceGuard,
}

pub struct CapturePipeline {
    input: Arc<dyn AudioInput>,
    sample_rate: u32,
    chunk_samples: usize,
    modalities: Vec<String>,
    active: Arc<AtomicBool>,
    running: Mutex<Option<RunningCapture>>,
}

impl CapturePipeline {
    /// `chunk_samples` is fixed for the life of the pipeline.
    pub fn new(input: Arc<dyn AudioInput>, sample_rate: u32, chunk_samples: usize, modalities: Vec<String>) -> Self {
        Self {
            input,
            sample_rate,
            chunk_samples: chunk_samples.max(1),
            modalities,
            active: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
        }
    }

    pub fn chunk_samples(&self) -> usize {
        self.chunk_samples
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Acquire the microphone and start streaming chunks through `connection`.
    /// Calling it while already capturing is a no-op.
    pub fn start(&self, connection: &Connection) -> SessionResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("Capture already running");
            return Ok(());
        }

        let stream = self.input.open(self.sample_rate).map_err(|err| {
            error!(error = %err, "Failed to acquire input device");
            err
        })?;
        let (mut samples, guard) = stream.into_parts();

        let connection = connection.clone();
        let active = self.active.clone();
        let mut accumulator = ChunkAccumulator::new(self.chunk_samples);
        let task = tokio::spawn(async move {
            while let Some(block) = samples.recv().await {
                for chunk in accumulator.push(&block) {
                    forward_chunk(&connection, &active, &chunk);
                }
            }
            debug!("Input stream ended");
        });

        self.active.store(true, Ordering::SeqCst);
        *running = Some(RunningCapture { task, guard });
        info!(
            sample_rate = self.sample_rate,
            chunk_samples = self.chunk_samples,
            "Audio capture started"
        );
        Ok(())
    }

    /// Stop capturing and release the device. Does not notify the remote service.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(running) = self.running.lock().take() {
            running.task.abort();
            drop(running.guard);
            info!("Audio capture stopped");
        }
    }

    /// Close the current user turn: commit the input buffer, then request a response.
    pub fn commit(&self, connection: &Connection) -> bool {
        let committed = connection.send_event(ClientEvent::AudioCommit);
        let requested = connection.send_event(ClientEvent::ResponseCreate {
            response: ResponseRequest {
                modalities: self.modalities.clone(),
            },
        });
        committed && requested
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn forward_chunk(connection: &Connection, active: &AtomicBool, chunk: &[f32]) {
    let metrics = connection.metrics();
    if !active.load(Ordering::SeqCst) || !connection.is_connected() {
        metrics.record_audio_chunk(false);
        return;
    }
    let audio = pcm::encode_chunk(chunk);
    let sent = connection.send_event(ClientEvent::AudioAppend { audio });
    metrics.record_audio_chunk(sent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;
    use crate::device::mock::MockInput;
    use crate::error::SessionError;
    use crate::protocol::{event_types, Message};
    use crate::state::SessionMetrics;
    use crate::transport::mock::{MockConnector, MockRemote};
    use crate::transport::WireFrame;
    use std::time::Duration;

    fn connection(mock: &Arc<MockConnector>) -> Connection {
        let options = ConnectionOptions {
            base_delay: Duration::from_millis(100),
            max_attempts: 3,
            connect_timeout: Duration::from_secs(1),
        };
        Connection::new(Arc::new(mock.clone()), options, SessionMetrics::new())
    }

    fn sent_messages(remote: &mut MockRemote) -> Vec<Message> {
        remote
            .drain()
            .into_iter()
            .filter_map(|frame| match frame {
                WireFrame::Text(text) => Message::from_json(&text).ok(),
                WireFrame::Binary(_) => None,
            })
            .collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_chunks_are_sent_while_connected() {
        let mock = MockConnector::new();
        let connection = connection(&mock);
        connection.connect("wss://t", "tok").await.unwrap();
        let mut remote = mock.take_remote(0);

        let input = MockInput::new();
        let capture = CapturePipeline::new(Arc::new(input.clone()), 24_000, 4, vec!["audio".into()]);
        capture.start(&connection).unwrap();

        assert!(input.feed(vec![0.5; 6]).await);
        assert!(input.feed(vec![-2.0; 2]).await);
        settle().await;

        let messages = sent_messages(&mut remote);
        assert_eq!(messages.len(), 2);
        for msg in &messages {
            assert_eq!(msg.kind(), event_types::AUDIO_APPEND);
            let samples = pcm::decode_chunk(msg.str_field("audio").unwrap()).unwrap();
            assert_eq!(samples.len(), 4);
        }
        // Second chunk: two 0.5 samples then two clamped samples
        let second = pcm::decode_chunk(messages[1].str_field("audio").unwrap()).unwrap();
        assert_eq!(pcm::float_to_i16(second[3]), -32767);
        assert_eq!(connection.metrics().counters().audio_chunks_sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_are_dropped_after_disconnect() {
        let mock = MockConnector::new();
        let connection = connection(&mock);
        connection.connect("wss://t", "tok").await.unwrap();
        let mut remote = mock.take_remote(0);

        let input = MockInput::new();
        let capture = CapturePipeline::new(Arc::new(input.clone()), 24_000, 2, vec![]);
        capture.start(&connection).unwrap();

        input.feed(vec![0.1; 2]).await;
        settle().await;
        assert_eq!(sent_messages(&mut remote).len(), 1);

        // Remote drops the socket; capture keeps running but nothing is sent
        remote.close(1006, "gone");
        settle().await;
        input.feed(vec![0.1; 4]).await;
        settle().await;
        assert!(sent_messages(&mut remote).is_empty());

        let counters = connection.metrics().counters();
        assert_eq!(counters.audio_chunks_sent, 1);
        assert_eq!(counters.audio_chunks_dropped, 2);
        assert_eq!(counters.frames_dropped, 0);
    }

    #[tokio::test]
    async fn test_device_failure_is_surfaced() {
        let mock = MockConnector::new();
        let connection = connection(&mock);
        let input = MockInput::new();
        input.fail_with(SessionError::PermissionDenied("microphone".into()));

        let capture = CapturePipeline::new(Arc::new(input.clone()), 24_000, 4, vec![]);
        let err = capture.start(&connection).unwrap_err();
        assert!(matches!(err, SessionError::PermissionDenied(_)));
        assert!(!capture.is_active());
    }

    #[tokio::test]
    async fn test_stop_releases_device() {
        let mock = MockConnector::new();
        let connection = connection(&mock);
        let input = MockInput::new();
        let capture = CapturePipeline::new(Arc::new(input.clone()), 24_000, 4, vec![]);

        capture.start(&connection).unwrap();
        capture.start(&connection).unwrap();
        assert_eq!(input.opened(), 1);

        capture.stop();
        assert!(!capture.is_active());
        assert_eq!(input.released(), 1);
        capture.stop();
        assert_eq!(input.released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_sends_commit_then_response_request() {
        let mock = MockConnector::new();
        let connection = connection(&mock);
        connection.connect("wss://t", "tok").await.unwrap();
        let mut remote = mock.take_remote(0);

        let capture = CapturePipeline::new(
            Arc::new(MockInput::new()),
            24_000,
            4,
            vec!["audio".into(), "text".into()],
        );
        assert!(capture.commit(&connection));

        let kinds: Vec<String> = sent_messages(&mut remote)
            .iter()
            .map(|m| m.kind().to_string())
            .collect();
        assert_eq!(kinds, vec![event_types::AUDIO_COMMIT, event_types::RESPONSE_CREATE]);
    }
}
