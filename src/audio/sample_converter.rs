use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use tracing::trace;

const LOG_TARGET: &str = "soundboard_engine::audio::sample_converter";

/// Converts a decoded symphonia buffer of any sample type into interleaved
/// S16LE bytes.
pub fn convert_to_s16le_bytes(decoded: AudioBufferRef<'_>) -> Vec<u8> {
    let spec = *decoded.spec();
    let num_frames = decoded.frames();
    if num_frames == 0 {
        return Vec::new();
    }

    trace!(
        target: LOG_TARGET,
        "Converting buffer ({} frames, {} channels) to S16LE",
        num_frames,
        spec.channels.count()
    );

    let mut sample_buf = SampleBuffer::<i16>::new(num_frames as u64, spec);
    sample_buf.copy_interleaved_ref(decoded);
    samples_to_le_bytes(sample_buf.samples())
}

/// Serializes interleaved i16 samples as little-endian bytes.
pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Scales S16LE bytes in place by `gain` (0.0..=1.0). A trailing odd byte is
/// left untouched.
pub fn apply_gain_s16le(bytes: &mut [u8], gain: f32) {
    if gain >= 1.0 {
        return;
    }
    let gain = gain.max(0.0);
    for pair in bytes.chunks_exact_mut(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        let scaled = (sample as f32 * gain).clamp(-32768.0, 32767.0) as i16;
        pair.copy_from_slice(&scaled.to_le_bytes());
    }
}

/// Reinterprets S16LE bytes as samples, as the ALSA writer expects.
pub fn le_bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
