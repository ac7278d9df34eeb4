//! # Audio Devices
//!
//! Microphone and speaker access behind two small traits, so the pipelines never touch
//! a platform API directly.
//!
//! ## Backends:
//! - **null**: always available; the input never yields samples and the output discards
//!   buffers. Used for headless runs.
//! - **cpal** (cargo feature `cpal`): real hardware through the default host. Streams
//!   live on a dedicated thread because `cpal::Stream` is not `Send` on every platform.
//!
//! Selecting `cpal` in a build without the feature falls back to `null` with a warning.

use crate::error::{SessionError, SessionResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Blocks buffered between the device callback and the capture task.
pub const INPUT_QUEUE_BLOCKS: usize = 64;

/// Releases the underlying device when dropped.
pub struct DeviceGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DeviceGuard {
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// An open microphone: mono float blocks at `sample_rate`.
pub struct InputStream {
    pub samples: mpsc::Receiver<Vec<f32>>,
    pub sample_rate: u32,
    guard: DeviceGuard,
}

impl InputStream {
    pub fn new(samples: mpsc::Receiver<Vec<f32>>, sample_rate: u32, guard: DeviceGuard) -> Self {
        Self {
            samples,
            sample_rate,
            guard,
        }
    }

    /// Split into the sample receiver and the guard that keeps the device open.
    pub fn into_parts(self) -> (mpsc::Receiver<Vec<f32>>, DeviceGuard) {
        (self.samples, self.guard)
    }
}

/// Mono float samples ready for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.samples.len() as u64 * 1_000_000_000 / self.sample_rate as u64)
    }
}

pub trait AudioInput: Send + Sync {
    /// Acquire the device and start delivering mono blocks resampled to `sample_rate`.
    fn open(&self, sample_rate: u32) -> SessionResult<InputStream>;
}

pub trait AudioOutput: Send + Sync {
    /// Start rendering `buffer` after `delay`. Must not block.
    fn schedule(&self, buffer: PlaybackBuffer, delay: Duration) -> SessionResult<()>;

    /// Drop everything scheduled but not yet rendered.
    fn clear(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullInput;

impl AudioInput for NullInput {
    fn open(&self, sample_rate: u32) -> SessionResult<InputStream> {
        let (tx, rx) = mpsc::channel(1);
        // The sender lives in the guard so the stream stays open until released.
        Ok(InputStream::new(rx, sample_rate, DeviceGuard::new(move || drop(tx))))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn schedule(&self, _buffer: PlaybackBuffer, _delay: Duration) -> SessionResult<()> {
        Ok(())
    }
}

/// Device selection parsed from configuration strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceBackend {
    Null,
    /// `None` selects the host's default device
    Cpal(Option<String>),
}

impl std::str::FromStr for DeviceBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "" => Err("Empty device name".to_string()),
            "null" | "none" => Ok(DeviceBackend::Null),
            "default" | "cpal" => Ok(DeviceBackend::Cpal(None)),
            _ => Ok(DeviceBackend::Cpal(Some(trimmed.to_string()))),
        }
    }
}

/// Build the input device named by configuration.
pub fn input_from_config(name: &str) -> SessionResult<Arc<dyn AudioInput>> {
    let backend: DeviceBackend = name.parse().map_err(SessionError::Config)?;
    match backend {
        DeviceBackend::Null => Ok(Arc::new(NullInput)),
        #[cfg(feature = "cpal")]
        DeviceBackend::Cpal(device) => {
            tracing::info!(device = ?device, "Using cpal input");
            Ok(Arc::new(cpal_backend::CpalInput::new(device)))
        }
        #[cfg(not(feature = "cpal"))]
        DeviceBackend::Cpal(device) => {
            tracing::warn!(device = ?device, "Built without the `cpal` feature, using null input");
            Ok(Arc::new(NullInput))
        }
    }
}

/// Build the output device named by configuration.
pub fn output_from_config(name: &str) -> SessionResult<Arc<dyn AudioOutput>> {
    let backend: DeviceBackend = name.parse().map_err(SessionError::Config)?;
    match backend {
        DeviceBackend::Null => Ok(Arc::new(NullOutput)),
        #[cfg(feature = "cpal")]
        DeviceBackend::Cpal(device) => {
            tracing::info!(device = ?device, "Using cpal output");
            Ok(Arc::new(cpal_backend::CpalOutput::open(device)?))
        }
        #[cfg(not(feature = "cpal"))]
        DeviceBackend::Cpal(device) => {
            tracing::warn!(device = ?device, "Built without the `cpal` feature, using null output");
            Ok(Arc::new(NullOutput))
        }
    }
}

/// Map a platform error message onto the session error taxonomy.
pub fn classify_device_error(message: impl Into<String>) -> SessionError {
    let message = message.into();
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        SessionError::PermissionDenied(message)
    } else {
        SessionError::Device(message)
    }
}

#[cfg(feature = "cpal")]
mod cpal_backend {
    use super::*;
    use crate::audio::pcm;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::SampleFormat;
    use parking_lot::Mutex;
    use std::sync::mpsc as std_mpsc;
    use tracing::error;

    fn find_device(input: bool, name: Option<&str>) -> SessionResult<cpal::Device> {
        let host = cpal::default_host();
        let device = match name {
            None if input => host.default_input_device(),
            None => host.default_output_device(),
            Some(wanted) => {
                let is_wanted = |d: &cpal::Device| d.name().map(|n| n == wanted).unwrap_or(false);
                if input {
                    host.input_devices()
                        .map_err(|e| classify_device_error(e.to_string()))?
                        .find(is_wanted)
                } else {
                    host.output_devices()
                        .map_err(|e| classify_device_error(e.to_string()))?
                        .find(is_wanted)
                }
            }
        };
        device.ok_or_else(|| {
            SessionError::Device(format!(
                "no {} device{}",
                if input { "input" } else { "output" },
                name.map(|n| format!(" named '{}'", n)).unwrap_or_default()
            ))
        })
    }

    pub struct CpalInput {
        device: Option<String>,
    }

    impl CpalInput {
        pub fn new(device: Option<String>) -> Self {
            Self { device }
        }
    }

    impl AudioInput for CpalInput {
        fn open(&self, sample_rate: u32) -> SessionResult<InputStream> {
            let (tx, rx) = mpsc::channel::<Vec<f32>>(INPUT_QUEUE_BLOCKS);
            let (ready_tx, ready_rx) = std_mpsc::channel::<SessionResult<()>>();
            let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
            let name = self.device.clone();

            std::thread::Builder::new()
                .name("audio-input".to_string())
                .spawn(move || {
                    let stream = match build_input(name.as_deref(), sample_rate, tx) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(classify_device_error(e.to_string())));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));
                    // Hold the stream until the guard is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                })
                .map_err(|e| SessionError::Device(format!("failed to spawn input thread: {}", e)))?;

            ready_rx
                .recv()
                .map_err(|_| SessionError::Device("input thread exited during setup".to_string()))??;

            Ok(InputStream::new(
                rx,
                sample_rate,
                DeviceGuard::new(move || {
                    let _ = stop_tx.send(());
                }),
            ))
        }
    }

    fn build_input(name: Option<&str>, target_rate: u32, tx: mpsc::Sender<Vec<f32>>) -> SessionResult<cpal::Stream> {
        let device = find_device(true, name)?;
        let supported = device
            .default_input_config()
            .map_err(|e| classify_device_error(e.to_string()))?;
        let format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let channels = config.channels as usize;
        let device_rate = config.sample_rate.0;

        let deliver = move |mono: Vec<f32>| {
            let block = pcm::resample_linear(&mono, device_rate, target_rate);
            // Full queue: capture is lossy, drop the block
            let _ = tx.try_send(block);
        };
        let on_error = |e: cpal::StreamError| error!("Input stream error: {}", e);

        let stream = match format {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| deliver(pcm::downmix(data, channels)),
                on_error,
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let floats: Vec<f32> = data.iter().map(|&s| pcm::i16_to_float(s)).collect();
                    deliver(pcm::downmix(&floats, channels))
                },
                on_error,
                None,
            ),
            other => {
                return Err(SessionError::Device(format!(
                    "unsupported input sample format {:?}",
                    other
                )))
            }
        };
        stream.map_err(|e| classify_device_error(e.to_string()))
    }

    struct Voice {
        start_frame: u64,
        samples: Vec<f32>,
    }

    #[derive(Default)]
    struct Mixer {
        frame: u64,
        voices: Vec<Voice>,
    }

    impl Mixer {
        /// Fill one mono frame and advance the clock.
        fn next_sample(&mut self) -> f32 {
            let frame = self.frame;
            let mut sum = 0.0;
            for voice in &self.voices {
                if frame >= voice.start_frame {
                    if let Some(s) = voice.samples.get((frame - voice.start_frame) as usize) {
                        sum += s;
                    }
                }
            }
            self.frame += 1;
            sum.clamp(-1.0, 1.0)
        }

        fn retire_finished(&mut self) {
            let frame = self.frame;
            self.voices
                .retain(|v| v.start_frame + v.samples.len() as u64 > frame);
        }
    }

    /// Output device that mixes scheduled buffers by frame position.
    pub struct CpalOutput {
        mixer: Arc<Mutex<Mixer>>,
        device_rate: u32,
        stop: Mutex<Option<std_mpsc::Sender<()>>>,
    }

    impl CpalOutput {
        pub fn open(name: Option<String>) -> SessionResult<Self> {
            let mixer = Arc::new(Mutex::new(Mixer::default()));
            let (ready_tx, ready_rx) = std_mpsc::channel::<SessionResult<u32>>();
            let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
            let shared = mixer.clone();

            std::thread::Builder::new()
                .name("audio-output".to_string())
                .spawn(move || {
                    let (stream, rate) = match build_output(name.as_deref(), shared) {
                        Ok(built) => built,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(classify_device_error(e.to_string())));
                        return;
                    }
                    let _ = ready_tx.send(Ok(rate));
                    let _ = stop_rx.recv();
                    drop(stream);
                })
                .map_err(|e| SessionError::Device(format!("failed to spawn output thread: {}", e)))?;

            let device_rate = ready_rx
                .recv()
                .map_err(|_| SessionError::Device("output thread exited during setup".to_string()))??;

            Ok(Self {
                mixer,
                device_rate,
                stop: Mutex::new(Some(stop_tx)),
            })
        }
    }

    impl Drop for CpalOutput {
        fn drop(&mut self) {
            if let Some(stop) = self.stop.lock().take() {
                let _ = stop.send(());
            }
        }
    }

    impl AudioOutput for CpalOutput {
        fn schedule(&self, buffer: PlaybackBuffer, delay: Duration) -> SessionResult<()> {
            let samples = pcm::resample_linear(&buffer.samples, buffer.sample_rate, self.device_rate);
            let offset = (delay.as_secs_f64() * self.device_rate as f64).round() as u64;
            let mut mixer = self.mixer.lock();
            let start_frame = mixer.frame + offset;
            mixer.voices.push(Voice { start_frame, samples });
            Ok(())
        }

        fn clear(&self) {
            self.mixer.lock().voices.clear();
        }
    }

    fn build_output(name: Option<&str>, mixer: Arc<Mutex<Mixer>>) -> SessionResult<(cpal::Stream, u32)> {
        let device = find_device(false, name)?;
        let supported = device
            .default_output_config()
            .map_err(|e| classify_device_error(e.to_string()))?;
        let format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let channels = config.channels as usize;
        let rate = config.sample_rate.0;
        let on_error = |e: cpal::StreamError| error!("Output stream error: {}", e);

        let stream = match format {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut mixer = mixer.lock();
                    for frame in data.chunks_mut(channels) {
                        let s = mixer.next_sample();
                        frame.fill(s);
                    }
                    mixer.retire_finished();
                },
                on_error,
                None,
            ),
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let mut mixer = mixer.lock();
                    for frame in data.chunks_mut(channels) {
                        let s = pcm::float_to_i16(mixer.next_sample());
                        frame.fill(s);
                    }
                    mixer.retire_finished();
                },
                on_error,
                None,
            ),
            other => {
                return Err(SessionError::Device(format!(
                    "unsupported output sample format {:?}",
                    other
                )))
            }
        };
        let stream = stream.map_err(|e| classify_device_error(e.to_string()))?;
        Ok((stream, rate))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable devices for pipeline tests.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct MockInput {
        failure: Mutex<Option<SessionError>>,
        feed: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
        pub opened: AtomicUsize,
        pub released: Arc<AtomicUsize>,
    }

    impl MockInput {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn fail_with(&self, err: SessionError) {
            *self.failure.lock() = Some(err);
        }

        /// Push one device block. Returns false when no stream is open.
        pub async fn feed(&self, block: Vec<f32>) -> bool {
            let feed = self.feed.lock().clone();
            match feed {
                Some(tx) => tx.send(block).await.is_ok(),
                None => false,
            }
        }

        pub fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        pub fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }
    }

    impl AudioInput for Arc<MockInput> {
        fn open(&self, sample_rate: u32) -> SessionResult<InputStream> {
            if let Some(err) = self.failure.lock().clone() {
                return Err(err);
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(INPUT_QUEUE_BLOCKS);
            *self.feed.lock() = Some(tx);
            let released = self.released.clone();
            Ok(InputStream::new(
                rx,
                sample_rate,
                DeviceGuard::new(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                }),
            ))
        }
    }

    #[derive(Default)]
    pub struct MockOutput {
        pub scheduled: Mutex<Vec<(PlaybackBuffer, Duration)>>,
        pub clears: AtomicUsize,
    }

    impl MockOutput {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn delays(&self) -> Vec<Duration> {
            self.scheduled.lock().iter().map(|(_, d)| *d).collect()
        }
    }

    impl AudioOutput for Arc<MockOutput> {
        fn schedule(&self, buffer: PlaybackBuffer, delay: Duration) -> SessionResult<()> {
            self.scheduled.lock().push((buffer, delay));
            Ok(())
        }

        fn clear(&self) {
            self.clears.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("null".parse::<DeviceBackend>().unwrap(), DeviceBackend::Null);
        assert_eq!("Default".parse::<DeviceBackend>().unwrap(), DeviceBackend::Cpal(None));
        assert_eq!(
            "USB Headset".parse::<DeviceBackend>().unwrap(),
            DeviceBackend::Cpal(Some("USB Headset".to_string()))
        );
        assert!("  ".parse::<DeviceBackend>().is_err());
    }

    #[test]
    fn test_permission_errors_are_recognised() {
        assert!(matches!(
            classify_device_error("Microphone access denied by the user"),
            SessionError::PermissionDenied(_)
        ));
        assert!(matches!(classify_device_error("device unplugged"), SessionError::Device(_)));
    }

    #[test]
    fn test_playback_buffer_duration() {
        let buffer = PlaybackBuffer {
            samples: vec![0.0; 12_000],
            sample_rate: 24_000,
        };
        assert_eq!(buffer.duration(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_null_input_stays_open_until_released() {
        let stream = NullInput.open(24_000).unwrap();
        let (mut samples, guard) = stream.into_parts();
        assert!(samples.try_recv().is_err());
        drop(guard);
        assert!(samples.recv().await.is_none());
    }

    #[test]
    fn test_null_backend_from_config() {
        assert!(input_from_config("null").is_ok());
        assert!(output_from_config("none").is_ok());
        assert!(matches!(input_from_config(""), Err(SessionError::Config(_))));
    }
}
