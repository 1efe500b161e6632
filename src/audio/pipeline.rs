//! Decode pipeline: pulls samples from the container, drives the leased
//! decoder and hands PCM chunks to the controller.

use crate::audio::codec::CodecOutput;
use crate::audio::container::Container;
use crate::audio::decoder_pool::DecoderLease;
use crate::audio::error::AudioError;
use crate::audio::format::MediaFormat;
use crate::audio::output_sink::{shutdown_signalled, OutputSink};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

const LOG_TARGET: &str = "soundboard_engine::audio::pipeline";

pub const OUTPUT_POLL_TIMEOUT: Duration = Duration::from_millis(1);
/// The first poll after a (re)start gives the decoder time to spin up.
pub const FIRST_OUTPUT_POLL_TIMEOUT: Duration = Duration::from_millis(20);
pub const MAX_OUTPUT_RETRIES: u32 = 5;
/// The end-of-stream chunk of a decoded stream is zero-padded to this size.
pub const MIN_TRAILING_CHUNK_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputState {
    Continue,
    /// Container exhausted; the end-of-stream marker goes out next.
    EndNext,
    End,
}

/// One step of extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    Chunk(Vec<u8>),
    /// Last chunk of the stream (possibly empty).
    EndOfStream(Vec<u8>),
    /// The decoder produced nothing within its retry budget.
    Stalled,
}

pub struct DecodePipeline {
    container: Box<dyn Container>,
    lease: Option<DecoderLease>,
    buffer_size: usize,
    input: InputState,
    retries: u32,
    first_poll: bool,
    finished: bool,
}

impl DecodePipeline {
    /// `lease` must be present for encoded streams and absent for raw PCM.
    pub fn new(
        container: Box<dyn Container>,
        lease: Option<DecoderLease>,
        buffer_size: usize,
    ) -> Result<Self, AudioError> {
        if !container.format().is_raw() && lease.is_none() {
            return Err(AudioError::NoSuitableDecoder(format!(
                "{:?}",
                container.format().encoding
            )));
        }
        Ok(Self {
            container,
            lease,
            buffer_size,
            input: InputState::Continue,
            retries: 0,
            first_poll: true,
            finished: false,
        })
    }

    pub fn format(&self) -> &MediaFormat {
        self.container.format()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn set_buffer_size(&mut self, buffer_size: usize) {
        self.buffer_size = buffer_size;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn has_lease(&self) -> bool {
        self.lease.is_some()
    }

    /// Decodes until at least `buffer_size` bytes are available or the
    /// stream ends. Fails with a timeout if the decoder yields nothing.
    pub async fn prime(
        &mut self,
        sink: &mut OutputSink,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<Vec<u8>, AudioError> {
        let mut primed = Vec::with_capacity(self.buffer_size);
        while primed.len() < self.buffer_size {
            match self.extract_next_buffer(sink, shutdown_rx).await? {
                Extracted::Chunk(bytes) => primed.extend_from_slice(&bytes),
                Extracted::EndOfStream(bytes) => {
                    primed.extend_from_slice(&bytes);
                    break;
                }
                Extracted::Stalled => {
                    if primed.is_empty() {
                        return Err(AudioError::Timeout("decoder produced no audio while priming".to_string()));
                    }
                    debug!(target: LOG_TARGET, "Decoder stalled, priming ends early at {} bytes.", primed.len());
                    break;
                }
            }
        }
        debug!(target: LOG_TARGET, "Primed {} bytes (finished: {}).", primed.len(), self.finished);
        Ok(primed)
    }

    /// Produces the next chunk of PCM.
    pub async fn extract_next_buffer(
        &mut self,
        sink: &mut OutputSink,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<Extracted, AudioError> {
        if self.finished {
            return Ok(Extracted::EndOfStream(Vec::new()));
        }
        if self.lease.is_none() {
            return self.extract_raw();
        }
        self.extract_decoded(sink, shutdown_rx).await
    }

    fn extract_raw(&mut self) -> Result<Extracted, AudioError> {
        match self.container.read_sample()? {
            Some(sample) => Ok(Extracted::Chunk(sample.data)),
            None => {
                self.finished = true;
                Ok(Extracted::EndOfStream(Vec::new()))
            }
        }
    }

    async fn extract_decoded(
        &mut self,
        sink: &mut OutputSink,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<Extracted, AudioError> {
        loop {
            if shutdown_signalled(shutdown_rx) {
                return Err(AudioError::ShutdownRequested);
            }

            self.feed_input()?;

            let timeout = if self.first_poll {
                FIRST_OUTPUT_POLL_TIMEOUT
            } else {
                OUTPUT_POLL_TIMEOUT
            };
            self.first_poll = false;

            let output = match self.lease.as_mut() {
                Some(lease) => lease.codec_mut()?.dequeue_output(timeout).await,
                None => return Err(AudioError::InvalidState("decoder lease missing".to_string())),
            };

            match output {
                CodecOutput::Buffer(bytes) => {
                    self.retries = 0;
                    if bytes.is_empty() {
                        continue;
                    }
                    return Ok(Extracted::Chunk(bytes));
                }
                CodecOutput::EndOfStream(mut bytes) => {
                    self.finished = true;
                    if bytes.len() < MIN_TRAILING_CHUNK_BYTES {
                        bytes.resize(MIN_TRAILING_CHUNK_BYTES, 0);
                    }
                    trace!(target: LOG_TARGET, "Decoder reached end of stream.");
                    return Ok(Extracted::EndOfStream(bytes));
                }
                CodecOutput::TryAgain => {
                    self.retries += 1;
                    if self.retries >= MAX_OUTPUT_RETRIES {
                        self.retries = 0;
                        trace!(target: LOG_TARGET, "No decoder output after {} polls.", MAX_OUTPUT_RETRIES);
                        return Ok(Extracted::Stalled);
                    }
                }
                CodecOutput::FormatChanged(format) => {
                    sink.rebuild(format).await?;
                }
                CodecOutput::CodecConfig => {
                    trace!(target: LOG_TARGET, "Ignoring codec config output.");
                }
                CodecOutput::Error(msg) => {
                    warn!(target: LOG_TARGET, "Decoder error: {}", msg);
                    return Err(AudioError::DecodingError(msg));
                }
            }
        }
    }

    fn feed_input(&mut self) -> Result<(), AudioError> {
        let codec = match self.lease.as_mut() {
            Some(lease) => lease.codec_mut()?,
            None => return Ok(()),
        };
        match self.input {
            InputState::Continue => match self.container.read_sample()? {
                Some(sample) => codec.queue_input(Some(sample))?,
                None => {
                    trace!(target: LOG_TARGET, "Container exhausted.");
                    self.input = InputState::EndNext;
                }
            },
            InputState::EndNext => {
                codec.queue_input(None)?;
                self.input = InputState::End;
            }
            InputState::End => {}
        }
        Ok(())
    }

    /// Returns to the start of the stream.
    pub fn rewind(&mut self) -> Result<(), AudioError> {
        if let Some(lease) = self.lease.as_mut() {
            lease.codec_mut()?.flush();
        }
        self.container.seek_to_start()?;
        self.input = InputState::Continue;
        self.retries = 0;
        self.first_poll = true;
        self.finished = false;
        trace!(target: LOG_TARGET, "Pipeline rewound.");
        Ok(())
    }
}
