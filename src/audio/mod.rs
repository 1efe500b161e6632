//! Audio plumbing: demuxing, pooled decoders, the decode pipeline and the
//! output sink.

#[cfg(feature = "alsa-backend")]
pub mod alsa_handler;
#[cfg(feature = "alsa-backend")]
pub mod alsa_writer;
pub mod codec;
pub mod container;
pub mod decoder_pool;
pub mod device;
pub mod error;
pub mod format;
pub mod output_sink;
pub mod pipeline;
pub mod sample_converter;

pub use decoder_pool::{DecoderLease, DecoderPool, MAX_DECODERS_PER_KEY};
pub use error::{AudioError, DeviceError, EngineWarning};
pub use format::{DecoderKey, Encoding, MediaFormat, OutputFormat};
pub use output_sink::{OutputSink, WriteOutcome};
pub use pipeline::{DecodePipeline, Extracted};
