//! Output sink: owns the device for one controller and implements the
//! write protocol (slicing, overrun detection, head tracking across rebuilds).

use crate::audio::device::{DeviceFactory, PcmDevice};
use crate::audio::error::{AudioError, DeviceError, EngineWarning};
use crate::audio::format::OutputFormat;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, info, instrument, trace, warn};

const LOG_TARGET: &str = "soundboard_engine::audio::output_sink";

/// Bound on any single device call.
pub const DEVICE_CALL_TIMEOUT: Duration = Duration::from_secs(2);
/// Retries of a short write while the head is not moving.
pub const MAX_WRITE_RETRIES: u32 = 5;
pub const WRITE_RETRY_DELAY: Duration = Duration::from_millis(10);
/// Largest slice handed to the device between cancellation checks.
pub const WRITE_SLICE_BYTES: usize = 16 * 1024;

/// Result of writing one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Ok(usize),
    /// The device took only `written` bytes but is still playing; the rest
    /// belongs to the next write.
    Overshoot { written: usize },
    /// The device reported an error; the buffer is dropped.
    Error(EngineWarning),
    /// The device stopped consuming audio.
    Fail,
    /// The writer was cancelled after `written` bytes.
    Interrupted { written: usize },
}

/// Returns true once the shutdown sender has fired or gone away.
pub fn shutdown_signalled(shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
    !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty))
}

async fn bounded<T, F>(what: &str, limit: Duration, call: F) -> Result<T, AudioError>
where
    F: Future<Output = Result<T, DeviceError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(AudioError::Device(e)),
        Err(_) => Err(AudioError::Timeout(format!("device {} exceeded {:?}", what, limit))),
    }
}

pub struct OutputSink {
    factory: Arc<dyn DeviceFactory>,
    device: Option<Box<dyn PcmDevice>>,
    format: OutputFormat,
    buffer_size: usize,
    /// Resize requested while paused, applied at the next flush.
    pending_buffer_size: Option<usize>,
    volume: u8,
    /// Frames played by devices replaced since the last flush.
    head_offset: u64,
    bytes_since_flush: usize,
    playing: bool,
}

impl OutputSink {
    /// Builds the sink and opens its device. `volume` is a percentage.
    pub fn build(
        factory: Arc<dyn DeviceFactory>,
        format: OutputFormat,
        buffer_size: usize,
        volume: u8,
    ) -> Result<Self, AudioError> {
        let volume = volume.min(100);
        let device = factory.open(&format, buffer_size, gain_for(volume))?;
        debug!(
            target: LOG_TARGET,
            "Sink built: rate={}, channels={}, buffer={} bytes",
            format.sample_rate,
            format.channel_count(),
            buffer_size
        );
        Ok(Self {
            factory,
            device: Some(device),
            format,
            buffer_size,
            pending_buffer_size: None,
            volume,
            head_offset: 0,
            bytes_since_flush: 0,
            playing: false,
        })
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn buffer_size(&self) -> usize {
        self.pending_buffer_size.unwrap_or(self.buffer_size)
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    fn device(&mut self) -> Result<&mut Box<dyn PcmDevice>, AudioError> {
        self.device.as_mut().ok_or(AudioError::Released)
    }

    /// Frames played since the last flush, across device rebuilds.
    pub fn playback_head_position(&self) -> u64 {
        self.head_offset
            + self
                .device
                .as_ref()
                .map(|d| d.playback_head_position())
                .unwrap_or(0)
    }

    pub fn position_ms(&self) -> u64 {
        self.format.frames_to_ms(self.playback_head_position())
    }

    /// Duration of audio accepted since the last flush.
    pub fn written_ms(&self) -> u64 {
        self.format.bytes_to_ms(self.bytes_since_flush)
    }

    fn slice_len(&self) -> usize {
        let frame_size = self.format.frame_size();
        let len = WRITE_SLICE_BYTES.min(self.buffer_size);
        (len - len % frame_size).max(frame_size)
    }

    /// Writes `data`, checking `shutdown_rx` between slices.
    pub async fn write(
        &mut self,
        data: &[u8],
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<WriteOutcome, AudioError> {
        let frame_size = self.format.frame_size();
        let usable = data.len() - data.len() % frame_size;
        if usable < data.len() {
            trace!(target: LOG_TARGET, "Dropping {} trailing bytes of a partial frame.", data.len() - usable);
        }
        let slice_len = self.slice_len();
        let mut written = 0usize;

        while written < usable {
            if shutdown_signalled(shutdown_rx) {
                debug!(target: LOG_TARGET, "Write interrupted after {} of {} bytes.", written, usable);
                return Ok(WriteOutcome::Interrupted { written });
            }
            let end = (written + slice_len).min(usable);
            let head_before = self.playback_head_position();

            let accepted = match self.device_write(&data[written..end]).await {
                Ok(n) => n,
                Err(AudioError::Device(e)) => {
                    warn!(target: LOG_TARGET, "Device write error: {}", e);
                    return Ok(WriteOutcome::Error(EngineWarning::from(&e)));
                }
                Err(AudioError::Timeout(msg)) => {
                    warn!(target: LOG_TARGET, "Device write stalled: {}", msg);
                    return Ok(WriteOutcome::Fail);
                }
                Err(e) => return Err(e),
            };
            written += accepted;
            self.bytes_since_flush += accepted;
            if written >= end {
                continue;
            }

            if self.playback_head_position() > head_before {
                trace!(target: LOG_TARGET, "Short write of {} bytes, head still moving.", accepted);
                return Ok(WriteOutcome::Overshoot { written });
            }

            let mut recovered = false;
            for attempt in 1..=MAX_WRITE_RETRIES {
                tokio::time::sleep(WRITE_RETRY_DELAY).await;
                if shutdown_signalled(shutdown_rx) {
                    return Ok(WriteOutcome::Interrupted { written });
                }
                let accepted = match self.device_write(&data[written..end]).await {
                    Ok(n) => n,
                    Err(AudioError::Device(e)) => return Ok(WriteOutcome::Error(EngineWarning::from(&e))),
                    Err(AudioError::Timeout(_)) => return Ok(WriteOutcome::Fail),
                    Err(e) => return Err(e),
                };
                written += accepted;
                self.bytes_since_flush += accepted;
                trace!(target: LOG_TARGET, "Write retry {} accepted {} bytes.", attempt, accepted);
                if accepted > 0 || self.playback_head_position() > head_before {
                    recovered = true;
                    break;
                }
            }
            if !recovered {
                warn!(
                    target: LOG_TARGET,
                    "Device head stuck at {} after {} retries.",
                    head_before, MAX_WRITE_RETRIES
                );
                return Ok(WriteOutcome::Fail);
            }
        }
        Ok(WriteOutcome::Ok(written))
    }

    async fn device_write(&mut self, slice: &[u8]) -> Result<usize, AudioError> {
        let device = self.device()?;
        bounded("write", DEVICE_CALL_TIMEOUT, device.write(slice)).await
    }

    pub async fn play(&mut self) -> Result<(), AudioError> {
        let device = self.device()?;
        bounded("play", DEVICE_CALL_TIMEOUT, device.play()).await?;
        self.playing = true;
        Ok(())
    }

    pub async fn pause(&mut self) -> Result<(), AudioError> {
        let device = self.device()?;
        bounded("pause", DEVICE_CALL_TIMEOUT, device.pause()).await?;
        self.playing = false;
        Ok(())
    }

    pub async fn resume(&mut self) -> Result<(), AudioError> {
        self.play().await
    }

    /// Drops queued audio and resets the head. Applies a deferred resize.
    pub async fn flush(&mut self) -> Result<(), AudioError> {
        let device = self.device()?;
        bounded("flush", DEVICE_CALL_TIMEOUT, device.flush()).await?;
        self.head_offset = 0;
        self.bytes_since_flush = 0;
        if let Some(size) = self.pending_buffer_size.take() {
            debug!(target: LOG_TARGET, "Applying deferred buffer size {}", size);
            self.buffer_size = size;
            self.reopen(false).await?;
        }
        Ok(())
    }

    /// Pauses and flushes. The flush runs even if the pause fails, so a
    /// device that cannot pause still ends up empty.
    pub async fn stop(&mut self) -> Result<(), AudioError> {
        let paused = self.pause().await;
        self.playing = false;
        self.flush().await?;
        paused
    }

    /// Rebuilds the device for `format` if it differs from the current one.
    /// Returns whether a rebuild happened.
    #[instrument(skip(self), fields(rate = format.sample_rate, channels = format.channel_count()))]
    pub async fn rebuild(&mut self, format: OutputFormat) -> Result<bool, AudioError> {
        if format == self.format {
            return Ok(false);
        }
        info!(target: LOG_TARGET, "Output format changed, rebuilding device.");
        self.format = format;
        self.reopen(true).await?;
        Ok(true)
    }

    /// Replaces the device after a stall, keeping format and buffer size.
    pub async fn reset_device(&mut self) -> Result<(), AudioError> {
        self.head_offset = 0;
        self.bytes_since_flush = 0;
        if let Some(size) = self.pending_buffer_size.take() {
            self.buffer_size = size;
        }
        self.reopen(false).await
    }

    /// Changes the device buffer size. While paused the change waits for the
    /// next flush; while playing the old device is drained first so no
    /// queued audio is lost.
    pub async fn set_buffer_size(&mut self, buffer_size: usize, paused: bool) -> Result<bool, AudioError> {
        if buffer_size == self.buffer_size() {
            return Ok(false);
        }
        if paused {
            debug!(target: LOG_TARGET, "Deferring buffer size {} until flush.", buffer_size);
            self.pending_buffer_size = Some(buffer_size);
            return Ok(true);
        }
        self.pending_buffer_size = None;
        self.buffer_size = buffer_size;
        self.reopen(true).await?;
        Ok(true)
    }

    /// Closes the current device and opens a new one with the current
    /// settings, optionally draining it first and carrying its head over.
    async fn reopen(&mut self, keep_head: bool) -> Result<(), AudioError> {
        let was_playing = self.playing;
        if let Some(mut old) = self.device.take() {
            if keep_head {
                if was_playing {
                    let limit = DEVICE_CALL_TIMEOUT + self.drain_bound();
                    if let Err(e) = bounded("drain", limit, old.drain()).await {
                        warn!(target: LOG_TARGET, "Drain before rebuild failed: {}", e);
                    }
                }
                self.head_offset += old.playback_head_position();
            }
            old.release().await;
        }

        let device = self
            .factory
            .open(&self.format, self.buffer_size, gain_for(self.volume))?;
        self.device = Some(device);
        if was_playing {
            self.play().await?;
        }
        debug!(target: LOG_TARGET, "Device reopened with buffer {} bytes.", self.buffer_size);
        Ok(())
    }

    fn drain_bound(&self) -> Duration {
        Duration::from_millis(self.format.bytes_to_ms(self.buffer_size))
    }

    /// Sets the volume as a percentage (0..=100).
    pub fn set_volume(&mut self, volume: u8) -> Result<(), AudioError> {
        self.volume = volume.min(100);
        let gain = gain_for(self.volume);
        self.device()?.set_volume(gain)?;
        Ok(())
    }

    pub async fn release(&mut self) {
        if let Some(mut device) = self.device.take() {
            if tokio::time::timeout(DEVICE_CALL_TIMEOUT, device.release()).await.is_err() {
                warn!(target: LOG_TARGET, "Device release timed out.");
            }
        }
        self.playing = false;
    }

    pub fn is_released(&self) -> bool {
        self.device.is_none()
    }
}

/// Percentage to linear gain.
pub fn gain_for(volume: u8) -> f32 {
    volume.min(100) as f32 / 100.0
}
