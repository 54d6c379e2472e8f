//! PCM wire codec: raw f32 audio ⇄ 16-bit little-endian PCM in base64.
//!
//! The remote model speaks `audio/pcm;rate=<N>` — contiguous 16-bit signed
//! little-endian samples, base64-encoded for the transport. Encoding is pure
//! and infallible; decoding validates structure and fails with
//! [`VoiceError::MalformedAudioData`] on anything that is not a positive
//! multiple of `2 * channels` bytes.

use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// One frame of decoded audio: mono f32 samples in [-1.0, 1.0] at a fixed
/// sample rate. Immutable once produced (by capture or by decode).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Frame duration in seconds on whatever clock plays it back.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// One encoded frame as it crosses the session boundary: base64 payload plus
/// a MIME-like descriptor (`audio/pcm;rate=<N>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedChunk {
    pub data: String,
    pub mime_type: String,
}

/// Encode a frame for the wire: clamp to [-1, 1], scale by 32768 with
/// round-to-nearest, pack as 16-bit little-endian, base64-encode.
/// Deterministic and infallible. The 32768 scale mirrors the decode divisor,
/// so every value on the 16-bit grid (`q / 32768`) survives a round trip
/// bit-exactly; +1.0 saturates to 32767.
pub fn encode_frame(frame: &AudioFrame) -> EncodedChunk {
    let mut bytes = Vec::with_capacity(frame.len() * 2);
    for &sample in frame.samples() {
        let scaled = (sample.clamp(-1.0, 1.0) * 32768.0).round();
        let quantized = scaled.clamp(-32768.0, 32767.0) as i16;
        bytes.extend_from_slice(&quantized.to_le_bytes());
    }

    EncodedChunk {
        data: BASE64.encode(&bytes),
        mime_type: format!("audio/pcm;rate={}", frame.sample_rate()),
    }
}

/// Inverse transport-encoding step only: base64 → raw bytes. Does not
/// interpret the bytes as samples.
pub fn decode_transport(data: &str) -> VoiceResult<Vec<u8>> {
    BASE64
        .decode(data)
        .map_err(|e| VoiceError::MalformedAudioData(format!("invalid base64 payload: {e}")))
}

/// Reinterpret raw bytes as interleaved 16-bit LE samples and build a frame.
///
/// Channels are de-interleaved into equal-length arrays of
/// `byte_len / 2 / channels` samples; this mono core keeps channel 0. Fails
/// with `MalformedAudioData` if the byte length is zero or not a multiple of
/// `2 * channels`.
pub fn bytes_to_frame(bytes: &[u8], sample_rate: u32, channels: u16) -> VoiceResult<AudioFrame> {
    if channels == 0 {
        return Err(VoiceError::MalformedAudioData(
            "channel count must be at least 1".to_string(),
        ));
    }
    let stride = 2 * channels as usize;
    if bytes.is_empty() || bytes.len() % stride != 0 {
        return Err(VoiceError::MalformedAudioData(format!(
            "byte length {} is not a positive multiple of {} (2 * {} channels)",
            bytes.len(),
            stride,
            channels
        )));
    }

    let interleaved: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .iter()
            .step_by(channels as usize)
            .copied()
            .collect()
    };

    Ok(AudioFrame::new(samples, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantized(values: &[f32]) -> Vec<f32> {
        // Snap to the 16-bit grid the codec uses, so round-trips are exact.
        values
            .iter()
            .map(|v| {
                let q = (v.clamp(-1.0, 1.0) * 32768.0).round().clamp(-32768.0, 32767.0);
                q as i16 as f32 / 32768.0
            })
            .collect()
    }

    #[test]
    fn encode_decode_round_trip_is_exact_for_quantized_samples() {
        let samples = quantized(&[0.0, 0.25, -0.25, 0.99, -0.99, 1.0, -1.0]);
        let frame = AudioFrame::new(samples.clone(), 24_000);

        let chunk = encode_frame(&frame);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=24000");

        let bytes = decode_transport(&chunk.data).unwrap();
        let decoded = bytes_to_frame(&bytes, 24_000, 1).unwrap();
        assert_eq!(decoded.samples(), samples.as_slice());
    }

    #[test]
    fn round_trip_error_is_within_one_quantum() {
        let samples: Vec<f32> = (0..512).map(|i| ((i as f32) * 0.013).sin()).collect();
        let frame = AudioFrame::new(samples.clone(), 16_000);

        let chunk = encode_frame(&frame);
        let bytes = decode_transport(&chunk.data).unwrap();
        let decoded = bytes_to_frame(&bytes, 16_000, 1).unwrap();

        for (a, b) in samples.iter().zip(decoded.samples()) {
            assert!((a - b).abs() <= 1.0 / 32768.0, "{} vs {}", a, b);
        }
    }

    #[test]
    fn every_sixteen_bit_grid_value_survives_the_round_trip() {
        // Exact reconstruction for q / 32768 across the full signed range,
        // including values where a 32767 scale would land one step low.
        let grid: Vec<i16> = vec![
            -32768, -32767, -8192, -8191, -1, 0, 1, 8191, 8192, 12345, 32766, 32767,
        ];
        let samples: Vec<f32> = grid.iter().map(|&q| q as f32 / 32768.0).collect();
        let frame = AudioFrame::new(samples.clone(), 24_000);

        let bytes = decode_transport(&encode_frame(&frame).data).unwrap();
        let decoded = bytes_to_frame(&bytes, 24_000, 1).unwrap();
        assert_eq!(decoded.samples(), samples.as_slice());
    }

    #[test]
    fn out_of_range_samples_are_clamped() {
        let frame = AudioFrame::new(vec![2.0, -2.0], 16_000);
        let bytes = decode_transport(&encode_frame(&frame).data).unwrap();
        let decoded = bytes_to_frame(&bytes, 16_000, 1).unwrap();

        // +1.0 saturates one step below full scale; -1.0 hits it exactly.
        assert!((decoded.samples()[0] - 32767.0 / 32768.0).abs() < 1e-6);
        assert_eq!(decoded.samples()[1], -1.0);
    }

    #[test]
    fn odd_byte_length_is_malformed() {
        let err = bytes_to_frame(&[0u8, 1, 2], 24_000, 1).unwrap_err();
        assert!(matches!(err, VoiceError::MalformedAudioData(_)));
    }

    #[test]
    fn empty_payload_is_malformed() {
        let err = bytes_to_frame(&[], 24_000, 1).unwrap_err();
        assert!(matches!(err, VoiceError::MalformedAudioData(_)));
    }

    #[test]
    fn stereo_length_must_be_multiple_of_four() {
        // Six bytes = three i16 samples: fine for mono, malformed for stereo.
        let bytes = [0u8, 0, 1, 0, 2, 0];
        assert!(bytes_to_frame(&bytes, 24_000, 1).is_ok());
        assert!(matches!(
            bytes_to_frame(&bytes, 24_000, 2),
            Err(VoiceError::MalformedAudioData(_))
        ));
    }

    #[test]
    fn stereo_decode_keeps_channel_zero() {
        // Interleaved pairs (L, R): keep L.
        let mut bytes = Vec::new();
        for (l, r) in [(100i16, -100i16), (200, -200)] {
            bytes.extend_from_slice(&l.to_le_bytes());
            bytes.extend_from_slice(&r.to_le_bytes());
        }
        let frame = bytes_to_frame(&bytes, 24_000, 2).unwrap();
        assert_eq!(frame.len(), 2);
        assert!((frame.samples()[0] - 100.0 / 32768.0).abs() < 1e-6);
        assert!((frame.samples()[1] - 200.0 / 32768.0).abs() < 1e-6);
    }

    #[test]
    fn invalid_base64_is_malformed() {
        let err = decode_transport("not//valid!!base64??").unwrap_err();
        assert!(matches!(err, VoiceError::MalformedAudioData(_)));
    }

    #[test]
    fn frame_duration() {
        let frame = AudioFrame::new(vec![0.0; 4800], 24_000);
        assert!((frame.duration_secs() - 0.2).abs() < 1e-9);
    }
}
