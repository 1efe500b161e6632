//! Output device abstraction and the clock-driven null device.

use crate::audio::error::{AudioError, DeviceError};
use crate::audio::format::OutputFormat;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

const LOG_TARGET: &str = "soundboard_engine::audio::device";

/// A PCM output device accepting interleaved S16LE bytes.
#[async_trait]
pub trait PcmDevice: Send {
    /// Queues bytes for playback and returns how many were accepted.
    async fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError>;

    /// Frames played since the device was built or last flushed.
    fn playback_head_position(&self) -> u64;

    async fn play(&mut self) -> Result<(), DeviceError>;

    async fn pause(&mut self) -> Result<(), DeviceError>;

    /// Drops queued audio and resets the head to zero.
    async fn flush(&mut self) -> Result<(), DeviceError>;

    /// Waits until all queued audio has played.
    async fn drain(&mut self) -> Result<(), DeviceError>;

    /// Linear gain, 0.0 to 1.0.
    fn set_volume(&mut self, gain: f32) -> Result<(), DeviceError>;

    async fn release(&mut self);
}

/// Opens output devices for a given format and buffer size in bytes.
pub trait DeviceFactory: Send + Sync {
    fn open(
        &self,
        format: &OutputFormat,
        buffer_size: usize,
        gain: f32,
    ) -> Result<Box<dyn PcmDevice>, AudioError>;
}

/// Device that discards audio while consuming it at the format's real-time
/// rate, with a bounded buffer like a hardware device.
pub struct NullDevice {
    format: OutputFormat,
    capacity_frames: u64,
    written_frames: u64,
    /// Frames played up to `started_at`.
    played_base: u64,
    /// Set while playing.
    started_at: Option<Instant>,
    gain: f32,
    released: bool,
}

impl NullDevice {
    pub fn new(format: OutputFormat, buffer_size: usize, gain: f32) -> Self {
        let capacity_frames = format.bytes_to_frames(buffer_size).max(1);
        debug!(
            target: LOG_TARGET,
            "Null device opened: rate={}, channels={}, capacity_frames={}",
            format.sample_rate,
            format.channel_count(),
            capacity_frames
        );
        Self {
            format,
            capacity_frames,
            written_frames: 0,
            played_base: 0,
            started_at: None,
            gain,
            released: false,
        }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn is_playing(&self) -> bool {
        self.started_at.is_some()
    }

    fn head_at(&self, now: Instant) -> u64 {
        let played = match self.started_at {
            Some(start) => {
                let elapsed = now.saturating_duration_since(start);
                self.played_base + (elapsed.as_micros() as u64 * self.format.sample_rate as u64 / 1_000_000)
            }
            None => self.played_base,
        };
        played.min(self.written_frames)
    }

    fn frames_to_duration(&self, frames: u64) -> Duration {
        if self.format.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(frames * 1_000_000 / self.format.sample_rate as u64)
    }

    /// Restarts the clock from the current head so an underrun does not
    /// let the head jump ahead once new audio arrives.
    fn rebase(&mut self) {
        let now = Instant::now();
        self.played_base = self.head_at(now);
        if self.started_at.is_some() {
            self.started_at = Some(now);
        }
    }
}

#[async_trait]
impl PcmDevice for NullDevice {
    async fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError> {
        if self.released {
            return Err(DeviceError::DeadObject);
        }
        let frame_size = self.format.frame_size();
        let offered = (data.len() / frame_size) as u64;
        if offered == 0 {
            return Ok(0);
        }

        if self.head_at(Instant::now()) >= self.written_frames {
            self.rebase();
        }

        let wanted = offered.min(self.capacity_frames);
        loop {
            let queued = self.written_frames - self.head_at(Instant::now());
            let free = self.capacity_frames.saturating_sub(queued);
            if free >= wanted || (free > 0 && !self.is_playing()) {
                let accepted = free.min(offered);
                self.written_frames += accepted;
                trace!(target: LOG_TARGET, "Accepted {} frames ({} queued)", accepted, queued + accepted);
                return Ok(accepted as usize * frame_size);
            }
            if !self.is_playing() {
                // Full and not consuming: a blocking write would never return.
                return Ok(0);
            }
            tokio::time::sleep(self.frames_to_duration(wanted - free).max(Duration::from_millis(1))).await;
        }
    }

    fn playback_head_position(&self) -> u64 {
        self.head_at(Instant::now())
    }

    async fn play(&mut self) -> Result<(), DeviceError> {
        if self.released {
            return Err(DeviceError::DeadObject);
        }
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), DeviceError> {
        if self.released {
            return Err(DeviceError::DeadObject);
        }
        self.played_base = self.head_at(Instant::now());
        self.started_at = None;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), DeviceError> {
        if self.released {
            return Err(DeviceError::DeadObject);
        }
        self.written_frames = 0;
        self.played_base = 0;
        if self.started_at.is_some() {
            self.started_at = Some(Instant::now());
        }
        Ok(())
    }

    async fn drain(&mut self) -> Result<(), DeviceError> {
        if self.released {
            return Err(DeviceError::DeadObject);
        }
        if !self.is_playing() {
            return Ok(());
        }
        let remaining = self.written_frames - self.head_at(Instant::now());
        if remaining > 0 {
            tokio::time::sleep(self.frames_to_duration(remaining)).await;
        }
        self.played_base = self.written_frames;
        self.started_at = Some(Instant::now());
        Ok(())
    }

    fn set_volume(&mut self, gain: f32) -> Result<(), DeviceError> {
        if !(0.0..=1.0).contains(&gain) {
            return Err(DeviceError::BadValue);
        }
        self.gain = gain;
        Ok(())
    }

    async fn release(&mut self) {
        self.released = true;
        self.started_at = None;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullDeviceFactory;

impl DeviceFactory for NullDeviceFactory {
    fn open(
        &self,
        format: &OutputFormat,
        buffer_size: usize,
        gain: f32,
    ) -> Result<Box<dyn PcmDevice>, AudioError> {
        if format.sample_rate == 0 {
            return Err(AudioError::OutputBuild("sample rate is zero".to_string()));
        }
        if buffer_size < format.frame_size() {
            return Err(AudioError::OutputBuild(format!(
                "buffer of {} bytes holds no frames",
                buffer_size
            )));
        }
        Ok(Box::new(NullDevice::new(*format, buffer_size, gain)))
    }
}
