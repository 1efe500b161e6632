use crate::audio::error::AudioError;
use crate::audio::format::{Encoding, MediaFormat};
use std::fs::File;
use std::io;
use std::path::Path;
use symphonia::core::codecs::{CODEC_TYPE_NULL, CODEC_TYPE_PCM_S16LE};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, trace, warn};

const LOG_TARGET: &str = "soundboard_engine::audio::container";

/// One demuxed unit of audio data, in the track's own encoding.
#[derive(Debug, Clone)]
pub struct EncodedSample {
    pub track_id: u32,
    pub ts: u64,
    pub dur: u64,
    pub data: Vec<u8>,
}

/// A demuxer positioned on a single audio track.
pub trait Container: Send {
    fn format(&self) -> &MediaFormat;

    /// Reads the next sample of the selected track, `None` once exhausted.
    fn read_sample(&mut self) -> Result<Option<EncodedSample>, AudioError>;

    /// Repositions the container at the first sample.
    fn seek_to_start(&mut self) -> Result<(), AudioError>;
}

/// Opens containers for file paths. Called from a blocking task.
pub trait ContainerOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn Container>, AudioError>;
}

/// Container backed by a symphonia format reader.
pub struct SymphoniaContainer {
    format_reader: Box<dyn FormatReader>,
    track_id: u32,
    format: MediaFormat,
}

impl SymphoniaContainer {
    /// Probes the file and selects its first audio track.
    pub fn open(path: &Path) -> Result<Self, AudioError> {
        debug!(target: LOG_TARGET, "Probing container: {}", path.display());
        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        let meta_opts: MetadataOptions = Default::default();
        let fmt_opts: FormatOptions = Default::default();

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &fmt_opts, &meta_opts)
            .map_err(|e| match e {
                SymphoniaError::Unsupported(s) => AudioError::UnknownEncoding(s.to_string()),
                other => AudioError::SymphoniaError(other),
            })?;
        let format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(AudioError::NoAudioTrack)?
            .clone();

        let params = track.codec_params;
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| AudioError::UnknownEncoding("missing sample rate".to_string()))?;
        let channels = params
            .channels
            .map(|c| c.count())
            .ok_or_else(|| AudioError::UnknownEncoding("missing channel layout".to_string()))?;

        let encoding = if params.codec == CODEC_TYPE_PCM_S16LE {
            Encoding::RawPcm16
        } else {
            Encoding::Encoded(params.codec)
        };
        let duration_ms = params.n_frames.map(|frames| frames * 1000 / sample_rate as u64);

        debug!(
            target: LOG_TARGET,
            "Selected track {}: encoding={:?}, rate={}, channels={}, duration_ms={:?}",
            track.id, encoding, sample_rate, channels, duration_ms
        );

        Ok(Self {
            format_reader,
            track_id: track.id,
            format: MediaFormat {
                encoding,
                sample_rate,
                channels,
                duration_ms,
                codec_params: Some(params),
            },
        })
    }
}

impl Container for SymphoniaContainer {
    fn format(&self) -> &MediaFormat {
        &self.format
    }

    fn read_sample(&mut self) -> Result<Option<EncodedSample>, AudioError> {
        loop {
            match self.format_reader.next_packet() {
                Ok(packet) => {
                    if packet.track_id() != self.track_id {
                        trace!(target: LOG_TARGET, "Skipping packet for track {}", packet.track_id());
                        continue;
                    }
                    return Ok(Some(EncodedSample {
                        track_id: packet.track_id(),
                        ts: packet.ts(),
                        dur: packet.dur(),
                        data: packet.data.into_vec(),
                    }));
                }
                Err(SymphoniaError::IoError(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    trace!(target: LOG_TARGET, "Container exhausted.");
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    warn!(target: LOG_TARGET, "Stream discontinuity, treating as end of stream.");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn seek_to_start(&mut self) -> Result<(), AudioError> {
        self.format_reader.seek(
            SeekMode::Accurate,
            SeekTo::TimeStamp {
                ts: 0,
                track_id: self.track_id,
            },
        )?;
        trace!(target: LOG_TARGET, "Seeked track {} to start.", self.track_id);
        Ok(())
    }
}

/// Default opener using symphonia's probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaOpener;

impl ContainerOpener for SymphoniaOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Container>, AudioError> {
        Ok(Box::new(SymphoniaContainer::open(path)?))
    }
}
