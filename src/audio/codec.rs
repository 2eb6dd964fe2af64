//! PCM wire codec for the streaming speech endpoint.
//!
//! Outbound: float samples at the capture rate → linear resample →
//! 16-bit signed little-endian PCM → base64 text envelope.
//! Inbound: base64 or raw PCM16LE bytes → float samples ready for the
//! playback queue.

use anyhow::Context;
use base64::Engine;

/// Sample rate the upstream endpoint expects for microphone input.
pub const WIRE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of model speech returned by the upstream endpoint.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Symmetric quantization scale. `-1.0` maps to `-32767`, leaving
/// `i16::MIN` unused so that encode/decode is exactly inverse on zero.
const PCM_SCALE: f32 = 32_767.0;

// ── Wire frame ─────────────────────────────────────────────────────

/// Encoded audio chunk as it travels inside a JSON control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    /// Base64 of PCM16LE mono samples.
    pub data: String,
    pub sample_rate: u32,
}

impl WireFrame {
    /// MIME type understood by both supported providers.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Number of PCM samples carried by this frame.
    pub fn sample_count(&self) -> usize {
        // base64: 4 chars per 3 bytes, minus padding
        let padding = self.data.bytes().rev().take_while(|b| *b == b'=').count();
        (self.data.len() / 4 * 3).saturating_sub(padding) / 2
    }
}

/// Decoded audio ready to be scheduled on the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlayableBuffer {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

// ── Outbound ───────────────────────────────────────────────────────

/// Encode captured float samples into the fixed 16 kHz wire format.
pub fn encode_outbound(samples: &[f32], source_rate: u32) -> WireFrame {
    encode_outbound_at(samples, source_rate, WIRE_SAMPLE_RATE)
}

/// Encode captured float samples for a provider with a different input rate.
pub fn encode_outbound_at(samples: &[f32], source_rate: u32, target_rate: u32) -> WireFrame {
    let resampled = resample_linear(samples, source_rate, target_rate);
    let pcm = f32_to_pcm16le(&resampled);
    WireFrame {
        data: base64::engine::general_purpose::STANDARD.encode(pcm),
        sample_rate: target_rate,
    }
}

/// Quantize float samples to PCM16LE. Out-of-range input is clamped to
/// the representable extremum instead of wrapping.
pub fn f32_to_pcm16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clamped = if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) };
        let q = (clamped * PCM_SCALE).round() as i16;
        out.extend_from_slice(&q.to_le_bytes());
    }
    out
}

// ── Inbound ────────────────────────────────────────────────────────

/// Decode a base64 wire frame into a playable buffer.
pub fn decode_inbound(frame: &WireFrame) -> anyhow::Result<PlayableBuffer> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(frame.data.as_bytes())
        .context("audio chunk is not valid base64")?;
    decode_pcm(&bytes, frame.sample_rate)
}

/// Decode raw PCM16LE bytes (already unwrapped from base64 by the
/// provider parser) into a playable buffer.
pub fn decode_pcm(bytes: &[u8], sample_rate: u32) -> anyhow::Result<PlayableBuffer> {
    let samples = pcm16le_to_f32(bytes)?;
    Ok(PlayableBuffer {
        samples,
        sample_rate,
    })
}

pub fn pcm16le_to_f32(bytes: &[u8]) -> anyhow::Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        anyhow::bail!("PCM16 chunk has odd length {}", bytes.len());
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / PCM_SCALE)
        .collect())
}

// ── Resampling / metering ──────────────────────────────────────────

/// Linear-interpolation resampler for mono float audio.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * u64::from(to_rate) / u64::from(from_rate)).max(1);
    let step = f64::from(from_rate) / f64::from(to_rate);
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

/// RMS level of a capture buffer, used for mic metering and the noise gate.
pub fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
