//! Stream and output format descriptions.

use symphonia::core::audio::Channels;
use symphonia::core::codecs::{CodecParameters, CodecType};

/// Bytes per output sample; the engine always outputs signed 16-bit PCM.
pub const BYTES_PER_SAMPLE: usize = 2;

/// How the container's audio track is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Interleaved signed 16-bit little-endian PCM, read without a decoder.
    RawPcm16,
    /// Anything that has to go through a decoder.
    Encoded(CodecType),
}

/// What the container reports about its audio track.
#[derive(Debug, Clone)]
pub struct MediaFormat {
    pub encoding: Encoding,
    pub sample_rate: u32,
    pub channels: usize,
    pub duration_ms: Option<u64>,
    /// Parameters needed to construct a decoder; absent for synthetic sources.
    pub codec_params: Option<CodecParameters>,
}

impl MediaFormat {
    /// The pool key: decoders are shared by encoding and channel count only.
    pub fn decoder_key(&self) -> DecoderKey {
        DecoderKey {
            encoding: self.encoding,
            channels: self.channels,
        }
    }

    /// Output format the sink starts with before the decoder says otherwise.
    pub fn initial_output_format(&self) -> OutputFormat {
        OutputFormat::new(self.sample_rate, self.channels)
    }

    pub fn is_raw(&self) -> bool {
        self.encoding == Encoding::RawPcm16
    }
}

/// Pool matching key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecoderKey {
    pub encoding: Encoding,
    pub channels: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    S16Le,
}

/// Format the output device is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channel_mask: Channels,
    pub encoding: SampleEncoding,
}

impl OutputFormat {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channel_mask: channel_mask_for(channels),
            encoding: SampleEncoding::S16Le,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channel_mask.count()
    }

    pub fn frame_size(&self) -> usize {
        self.channel_count().max(1) * BYTES_PER_SAMPLE
    }

    pub fn bytes_to_frames(&self, bytes: usize) -> u64 {
        (bytes / self.frame_size()) as u64
    }

    pub fn frames_to_ms(&self, frames: u64) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        frames * 1000 / self.sample_rate as u64
    }

    pub fn bytes_to_ms(&self, bytes: usize) -> u64 {
        self.frames_to_ms(self.bytes_to_frames(bytes))
    }
}

/// Channel mask with the first `count` positions set.
pub fn channel_mask_for(count: usize) -> Channels {
    match count {
        0 | 1 => Channels::FRONT_LEFT,
        2 => Channels::FRONT_LEFT | Channels::FRONT_RIGHT,
        n => {
            let bits = if n >= 32 { u32::MAX } else { (1u32 << n) - 1 };
            Channels::from_bits_truncate(bits)
        }
    }
}
