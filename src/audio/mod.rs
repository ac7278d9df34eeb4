//! # Audio Pipelines
//!
//! Microphone audio out to the realtime service, synthesized audio back in.
//!
//! ## Key Components:
//! - **PCM**: float ⇄ 16-bit conversion, base64 framing, down-mix and resampling
//! - **Chunk Accumulator**: fixed-length chunking of device blocks
//! - **Capture Pipeline**: device → chunks → `input_audio_buffer.append` messages
//! - **Playback Pipeline**: audio deltas → decoded buffers → output device
//!
//! ## Audio Format:
//! - **Sample Rate**: fixed per session (24 kHz by default)
//! - **Bit Depth**: 16-bit PCM, little-endian
//! - **Channels**: mono

pub mod buffer; // Fixed-length chunk accumulator
pub mod capture; // Microphone → outbound messages
pub mod pcm; // Sample conversion and base64 framing
pub mod playback; // Inbound deltas → output device

pub use capture::CapturePipeline;
pub use playback::{PlaybackEvent, PlaybackMode, PlaybackPipeline};
