use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

pub const OPENAI_REALTIME_API_PCM16_SAMPLE_RATE: f64 = 24000.0;
pub const GEMINI_LIVE_API_PCM16_SAMPLE_RATE: f64 = 16000.0;
pub const GEMINI_LIVE_API_OUTPUT_SAMPLE_RATE: f64 = 24000.0;
pub const DEFAULT_CLIENT_SAMPLE_RATE: f64 = 24000.0;
pub const DEFAULT_RESAMPLER_CHUNK_SIZE: usize = 512;

/// Creates a mono resampler converting `in_sampling_rate` to `out_sampling_rate`.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Resamples a continuous audio stream delivered in arbitrarily sized pieces.
///
/// The underlying resampler consumes fixed-size chunks; samples that do not
/// fill a chunk yet are held until the next push. When both rates match the
/// samples pass through untouched.
pub struct StreamResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: f64, out_rate: f64, chunk_size: usize) -> anyhow::Result<Self> {
        let inner = if (in_rate - out_rate).abs() < f64::EPSILON {
            None
        } else {
            Some(create_resampler(in_rate, out_rate, chunk_size)?)
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    /// Feeds `samples` in and returns whatever output is ready.
    pub fn push(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if needed == 0 || self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match resampler.process(&[chunk], None) {
                Ok(mut channels) => {
                    if let Some(channel) = channels.pop() {
                        out.extend(channel);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Dropping audio chunk that failed to resample"),
            }
        }
        out
    }

    /// Samples waiting for a full chunk.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Interprets little-endian PCM16 bytes as normalized f32 samples.
pub fn pcm16_le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
        .collect()
}

/// Decodes base64 PCM16 audio into normalized f32 samples.
pub fn decode_f32_from_base64_i16(base64_fragment: &str) -> Vec<f32> {
    match base64::engine::general_purpose::STANDARD.decode(base64_fragment) {
        Ok(bytes) => pcm16_le_to_f32(&bytes),
        Err(e) => {
            tracing::error!(error = %e, "Failed to decode base64 audio fragment");
            Vec::new()
        }
    }
}

/// Encodes f32 samples as base64 PCM16, clamping out-of-range values.
pub fn encode_f32_to_base64_i16(pcm32: &[f32]) -> String {
    let pcm16: Vec<u8> = pcm32
        .iter()
        .flat_map(|&sample| {
            let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            v.to_le_bytes()
        })
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&pcm16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_pcm16_le_to_f32() {
        // 16384 and -32768, little endian, plus a dangling byte.
        let samples = pcm16_le_to_f32(&[0x00, 0x40, 0x00, 0x80, 0x01]);
        assert_eq!(samples.len(), 2);
        assert_abs_diff_eq!(samples[0], 0.5, epsilon = 0.0001);
        assert_abs_diff_eq!(samples[1], -1.0, epsilon = 0.0001);
    }

    #[test]
    fn test_base64_helpers() {
        let encoded = encode_f32_to_base64_i16(&[0.5, -1.0, 2.0]);
        let decoded = decode_f32_from_base64_i16(&encoded);
        assert_eq!(decoded.len(), 3);
        assert_abs_diff_eq!(decoded[0], 0.5, epsilon = 0.001);
        assert_abs_diff_eq!(decoded[1], -1.0, epsilon = 0.001);
        assert!(decoded[2] <= 1.0);

        assert!(decode_f32_from_base64_i16("invalid_base64!").is_empty());
    }

    #[test]
    fn test_matching_rates_pass_through() {
        let mut resampler = StreamResampler::new(24000.0, 24000.0, 512).unwrap();
        let input = vec![0.25f32; 37];
        assert_eq!(resampler.push(&input), input);
        assert_eq!(resampler.buffered(), 0);
    }

    #[test]
    fn test_partial_chunks_are_buffered() {
        let mut resampler = StreamResampler::new(24000.0, 16000.0, 512).unwrap();

        assert!(resampler.push(&[0.0; 100]).is_empty());
        assert_eq!(resampler.buffered(), 100);

        let out = resampler.push(&[0.0; 412]);
        assert!(!out.is_empty());
        assert_eq!(resampler.buffered(), 0);
    }

    #[test]
    fn test_output_length_follows_ratio() {
        let mut resampler = StreamResampler::new(
            GEMINI_LIVE_API_PCM16_SAMPLE_RATE,
            DEFAULT_CLIENT_SAMPLE_RATE,
            DEFAULT_RESAMPLER_CHUNK_SIZE,
        )
        .unwrap();

        let out = resampler.push(&vec![0.1f32; 512 * 8]);
        let expected = 512.0 * 8.0 * 1.5;
        let ratio = out.len() as f64 / expected;
        assert!((0.8..1.2).contains(&ratio), "got {} samples", out.len());
    }
}
