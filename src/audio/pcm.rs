//! # PCM Conversion
//!
//! Converts between the float samples audio devices work with and the 16-bit
//! little-endian PCM the realtime service expects, and wraps PCM bytes in base64 for
//! JSON transport.
//!
//! ## Sample Conversion:
//! - **Encode**: `round(clamp(s, -1, 1) × 32767)`. The scale is symmetric, so `-1.0`
//!   maps to `-32767`; `-32768` is only produced by decoding foreign data.
//! - **Decode**: `sample / 32767`. Decoding then re-encoding any encoded value gives
//!   back the same integer.
//!
//! ## Rust Concepts:
//! - **byteorder**: explicit little-endian reads/writes instead of relying on the host
//!   endianness
//! - **base64 engines**: `STANDARD` (padded) is what the service sends and accepts

use crate::error::{SessionError, SessionResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

const SCALE: f32 = 32767.0;

/// Convert one float sample to 16-bit PCM, clamping out-of-range input.
pub fn float_to_i16(sample: f32) -> i16 {
    // NaN from a misbehaving device becomes silence
    if sample.is_nan() {
        return 0;
    }
    (sample.clamp(-1.0, 1.0) * SCALE).round() as i16
}

pub fn i16_to_float(sample: i16) -> f32 {
    sample as f32 / SCALE
}

/// Encode float samples as 16-bit little-endian bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(float_to_i16(sample));
    }
    bytes
}

/// Decode 16-bit little-endian bytes into float samples.
///
/// ## Error Handling:
/// An odd byte count means the payload is not PCM16 and is rejected rather than
/// silently truncated.
pub fn decode_pcm16(bytes: &[u8]) -> SessionResult<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(SessionError::Codec(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(i16_to_float(sample));
    }
    Ok(samples)
}

/// Float samples → PCM16 → base64, the payload of an audio-append message.
pub fn encode_chunk(samples: &[f32]) -> String {
    STANDARD.encode(encode_pcm16(samples))
}

/// base64 → PCM16 → float samples, for inbound audio deltas.
pub fn decode_chunk(payload: &str) -> SessionResult<Vec<f32>> {
    let bytes = STANDARD.decode(payload.trim())?;
    decode_pcm16(&bytes)
}

/// Average interleaved frames down to one channel.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear-interpolation resampler.
///
/// Good enough for speech between common device rates (44.1/48 kHz) and the session
/// rate; it does no anti-alias filtering.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor().max(1.0) as usize;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = (position.floor() as usize).min(last);
            let next = (index + 1).min(last);
            let fraction = (position - index as f64) as f32;
            samples[index] + (samples[next] - samples[index]) * fraction
        })
        .collect()
}
