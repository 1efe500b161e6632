//! Decoder device protocol and the symphonia-backed implementation.
//!
//! A [`Codec`] is driven the way a hardware decoder is: encoded samples are
//! queued as input (with `None` marking end of stream) and decoded output is
//! polled separately with a bounded wait.

use crate::audio::container::EncodedSample;
use crate::audio::error::AudioError;
use crate::audio::format::{MediaFormat, OutputFormat};
use crate::audio::sample_converter;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const LOG_TARGET: &str = "soundboard_engine::audio::codec";

/// Result of polling a decoder for output.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecOutput {
    /// Decoded S16LE PCM.
    Buffer(Vec<u8>),
    /// Final decoded PCM; no output follows until the decoder is flushed.
    EndOfStream(Vec<u8>),
    /// Nothing available within the poll timeout.
    TryAgain,
    /// Subsequent buffers use this format.
    FormatChanged(OutputFormat),
    /// Codec-specific configuration data, carries no audio.
    CodecConfig,
    Error(String),
}

#[async_trait]
pub trait Codec: Send {
    /// Prepares the decoder for a new stream. Called on every lease.
    fn configure(&mut self, format: &MediaFormat) -> Result<(), AudioError>;

    /// Queues one encoded sample, or the end-of-stream marker when `None`.
    fn queue_input(&mut self, sample: Option<EncodedSample>) -> Result<(), AudioError>;

    /// Waits up to `timeout` for the next output.
    async fn dequeue_output(&mut self, timeout: Duration) -> CodecOutput;

    /// Discards queued input and output and resets decoder state.
    fn flush(&mut self);
}

/// Builds decoders for the pool.
pub trait DecoderFactory: Send + Sync {
    fn create(&self, format: &MediaFormat) -> Result<Box<dyn Codec>, AudioError>;
}

/// Outputs of one batch of packets, with the decoder handed back.
type DecodeJob = JoinHandle<(Box<dyn Decoder>, Vec<CodecOutput>, Option<OutputFormat>)>;

/// Decoder backed by symphonia's codec registry. Queued packets are decoded
/// on the blocking pool; `dequeue_output` waits for that work up to its
/// timeout and leaves a slow batch running for the next poll.
pub struct SymphoniaCodec {
    /// `None` while a batch is in flight.
    decoder: Option<Box<dyn Decoder>>,
    params: CodecParameters,
    current_format: Option<OutputFormat>,
    input: VecDeque<EncodedSample>,
    in_flight: Option<DecodeJob>,
    pending: VecDeque<CodecOutput>,
    eos_queued: bool,
    eos_emitted: bool,
}

fn make_decoder(params: &CodecParameters) -> Result<Box<dyn Decoder>, AudioError> {
    symphonia::default::get_codecs()
        .make(params, &DecoderOptions::default())
        .map_err(|e| AudioError::NoSuitableDecoder(e.to_string()))
}

fn same_stream_params(a: &CodecParameters, b: &CodecParameters) -> bool {
    a.codec == b.codec
        && a.sample_rate == b.sample_rate
        && a.channels == b.channels
        && a.extra_data == b.extra_data
        && a.bits_per_sample == b.bits_per_sample
        && a.max_frames_per_packet == b.max_frames_per_packet
}

/// Decodes `samples` in order. Runs on a blocking thread.
fn decode_batch(
    decoder: &mut dyn Decoder,
    samples: Vec<EncodedSample>,
    mut current_format: Option<OutputFormat>,
) -> (Vec<CodecOutput>, Option<OutputFormat>) {
    let mut outputs = Vec::new();
    for sample in samples {
        let packet = Packet::new_from_boxed_slice(
            sample.track_id,
            sample.ts,
            sample.dur,
            sample.data.into_boxed_slice(),
        );
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let format = OutputFormat::new(spec.rate, spec.channels.count());
                if current_format != Some(format) {
                    debug!(
                        target: LOG_TARGET,
                        "Decoder output format: rate={}, channels={}",
                        spec.rate,
                        spec.channels.count()
                    );
                    current_format = Some(format);
                    outputs.push(CodecOutput::FormatChanged(format));
                }
                let bytes = sample_converter::convert_to_s16le_bytes(decoded);
                if !bytes.is_empty() {
                    outputs.push(CodecOutput::Buffer(bytes));
                }
            }
            Err(SymphoniaError::DecodeError(e)) => {
                // Corrupt packets are skipped.
                warn!(target: LOG_TARGET, "Skipping undecodable packet: {}", e);
            }
            Err(e) => {
                outputs.push(CodecOutput::Error(e.to_string()));
                break;
            }
        }
    }
    (outputs, current_format)
}

impl SymphoniaCodec {
    pub fn new(params: CodecParameters) -> Result<Self, AudioError> {
        let decoder = make_decoder(&params)?;
        Ok(Self {
            decoder: Some(decoder),
            params,
            current_format: None,
            input: VecDeque::new(),
            in_flight: None,
            pending: VecDeque::new(),
            eos_queued: false,
            eos_emitted: false,
        })
    }

    /// Hands every queued packet to the blocking pool in one batch.
    fn start_batch(&mut self) {
        if self.in_flight.is_some() || self.input.is_empty() {
            return;
        }
        let Some(mut decoder) = self.decoder.take() else {
            return;
        };
        let samples: Vec<EncodedSample> = self.input.drain(..).collect();
        let current_format = self.current_format;
        trace!(target: LOG_TARGET, "Decoding {} packets.", samples.len());
        self.in_flight = Some(tokio::task::spawn_blocking(move || {
            let (outputs, format) = decode_batch(decoder.as_mut(), samples, current_format);
            (decoder, outputs, format)
        }));
    }
}

#[async_trait]
impl Codec for SymphoniaCodec {
    fn configure(&mut self, format: &MediaFormat) -> Result<(), AudioError> {
        let params = format
            .codec_params
            .as_ref()
            .ok_or_else(|| AudioError::NoSuitableDecoder("stream has no codec parameters".to_string()))?;
        if !same_stream_params(&self.params, params) || self.decoder.is_none() {
            debug!(target: LOG_TARGET, "Reconfiguring decoder for new stream parameters.");
            self.in_flight = None;
            self.decoder = Some(make_decoder(params)?);
            self.params = params.clone();
        }
        self.flush();
        Ok(())
    }

    fn queue_input(&mut self, sample: Option<EncodedSample>) -> Result<(), AudioError> {
        if self.eos_queued {
            return Err(AudioError::InvalidState("input queued after end of stream".to_string()));
        }
        match sample {
            Some(sample) => self.input.push_back(sample),
            None => {
                trace!(target: LOG_TARGET, "End of stream queued.");
                self.eos_queued = true;
            }
        }
        Ok(())
    }

    async fn dequeue_output(&mut self, timeout: Duration) -> CodecOutput {
        if let Some(out) = self.pending.pop_front() {
            return out;
        }
        self.start_batch();

        if let Some(job) = self.in_flight.as_mut() {
            let finished = tokio::time::timeout(timeout, job).await;
            match finished {
                Err(_) => return CodecOutput::TryAgain,
                Ok(Ok((decoder, outputs, format))) => {
                    self.in_flight = None;
                    self.decoder = Some(decoder);
                    self.current_format = format;
                    self.pending.extend(outputs);
                }
                Ok(Err(e)) => {
                    self.in_flight = None;
                    return CodecOutput::Error(format!("decode task failed: {}", e));
                }
            }
            if let Some(out) = self.pending.pop_front() {
                return out;
            }
        }

        if self.eos_queued && self.input.is_empty() && self.in_flight.is_none() && !self.eos_emitted {
            self.eos_emitted = true;
            return CodecOutput::EndOfStream(Vec::new());
        }
        CodecOutput::TryAgain
    }

    fn flush(&mut self) {
        if self.in_flight.take().is_some() {
            // The batch keeps the decoder; start over with a fresh one.
            match make_decoder(&self.params) {
                Ok(decoder) => self.decoder = Some(decoder),
                Err(e) => warn!(target: LOG_TARGET, "Could not rebuild decoder on flush: {}", e),
            }
        }
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.reset();
        }
        self.input.clear();
        self.pending.clear();
        self.current_format = None;
        self.eos_queued = false;
        self.eos_emitted = false;
    }
}

/// Default factory: one symphonia decoder per lease.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoderFactory;

impl DecoderFactory for SymphoniaDecoderFactory {
    fn create(&self, format: &MediaFormat) -> Result<Box<dyn Codec>, AudioError> {
        let params = format
            .codec_params
            .clone()
            .ok_or_else(|| AudioError::NoSuitableDecoder(format!("{:?}", format.encoding)))?;
        Ok(Box::new(SymphoniaCodec::new(params)?))
    }
}
