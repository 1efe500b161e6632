use crate::audio::error::DeviceError;
use crate::audio::format::OutputFormat;
use alsa::nix::errno::Errno;
use alsa::pcm::{Access, Format, HwParams, State as PcmState, PCM};
use alsa::{Direction, ValueOr};
use std::ffi::CString;
use tracing::instrument;
use tracing::{debug, error, info, warn};

const LOG_TARGET: &str = "soundboard_engine::audio::alsa_handler";

impl From<alsa::Error> for DeviceError {
    fn from(e: alsa::Error) -> Self {
        match e.errno() {
            Errno::EINVAL => DeviceError::BadValue,
            Errno::ENODEV | Errno::EBADFD | Errno::ESTRPIPE => DeviceError::DeadObject,
            _ => DeviceError::Other(e.to_string()),
        }
    }
}

/// Owns one ALSA PCM playback handle configured for a single output format.
pub struct AlsaPcmHandler {
    device_name: String,
    pcm: Option<PCM>,
    format: Option<OutputFormat>,
    frames_written: u64,
}

impl AlsaPcmHandler {
    pub fn new(device_name: &str) -> Self {
        info!(target: LOG_TARGET, "Creating new AlsaPcmHandler for device: {}", device_name);
        AlsaPcmHandler {
            device_name: device_name.to_string(),
            pcm: None,
            format: None,
            frames_written: 0,
        }
    }

    /// Opens the device for `format` with a ring buffer of about
    /// `buffer_frames` frames.
    #[instrument(skip(self, format), fields(device = %self.device_name, rate = format.sample_rate, channels = format.channel_count()))]
    pub fn initialize(&mut self, format: &OutputFormat, buffer_frames: u64) -> Result<(), DeviceError> {
        self.close();

        let device = CString::new(self.device_name.clone())
            .map_err(|e| DeviceError::Other(format!("Invalid device name: {}", e)))?;
        let pcm = PCM::open(&device, Direction::Playback, false)?;

        {
            let hwp = HwParams::any(&pcm)?;
            hwp.set_access(Access::RWInterleaved)?;
            hwp.set_format(Format::s16())?;
            hwp.set_channels(format.channel_count() as u32)?;
            hwp.set_rate_near(format.sample_rate, ValueOr::Nearest)?;
            let actual_rate = hwp.get_rate()?;
            if actual_rate != format.sample_rate {
                warn!(
                    target: LOG_TARGET,
                    "ALSA rate negotiation: requested={}, actual={}",
                    format.sample_rate, actual_rate
                );
            }
            let granted = hwp.set_buffer_size_near(buffer_frames as alsa::pcm::Frames)?;
            debug!(target: LOG_TARGET, "ALSA buffer: requested={} frames, granted={}", buffer_frames, granted);
            pcm.hw_params(&hwp)?;

            // Start as soon as one period is queued; short clips never fill the buffer.
            let swp = pcm.sw_params_current()?;
            let period_size = hwp.get_period_size()?;
            swp.set_start_threshold(period_size)?;
            pcm.sw_params(&swp)?;
        }

        self.pcm = Some(pcm);
        self.format = Some(*format);
        self.frames_written = 0;
        info!(target: LOG_TARGET, "ALSA initialized successfully.");
        Ok(())
    }

    /// Writes interleaved samples. Returns `Ok(0)` after a recovered underrun.
    pub fn write_s16_buffer(&mut self, buffer: &[i16]) -> Result<usize, DeviceError> {
        let pcm = self.pcm.as_ref().ok_or(DeviceError::NotInitialized)?;
        let io = pcm.io_i16()?;

        match io.writei(buffer) {
            Ok(frames) => {
                self.frames_written += frames as u64;
                Ok(frames)
            }
            Err(e) if e.errno() == Errno::EPIPE => {
                warn!(target: LOG_TARGET, "ALSA buffer underrun (EPIPE), recovering...");
                pcm.recover(libc::EPIPE, false)?;
                Ok(0)
            }
            Err(e) => {
                error!(target: LOG_TARGET, "ALSA write error: {}", e);
                Err(e.into())
            }
        }
    }

    /// Frames actually played: everything written minus what is still queued.
    pub fn head_position(&self) -> u64 {
        let queued = self
            .pcm
            .as_ref()
            .and_then(|pcm| pcm.delay().ok())
            .unwrap_or(0)
            .max(0) as u64;
        self.frames_written.saturating_sub(queued)
    }

    pub fn drain(&self) -> Result<(), DeviceError> {
        let pcm = self.pcm.as_ref().ok_or(DeviceError::NotInitialized)?;
        if pcm.state() == PcmState::Running || pcm.state() == PcmState::Prepared {
            debug!(target: LOG_TARGET, "Draining ALSA buffer.");
            pcm.drain()?;
            // A drained PCM has to be prepared before it accepts writes again.
            pcm.prepare()?;
        }
        Ok(())
    }

    /// Drops queued frames and resets the write counter.
    pub fn flush(&mut self) -> Result<(), DeviceError> {
        let pcm = self.pcm.as_ref().ok_or(DeviceError::NotInitialized)?;
        pcm.drop()?;
        pcm.prepare()?;
        self.frames_written = 0;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn pause(&self) -> Result<(), DeviceError> {
        let pcm = self.pcm.as_ref().ok_or(DeviceError::NotInitialized)?;
        match pcm.state() {
            PcmState::Running => {
                debug!(target: LOG_TARGET, "Pausing ALSA PCM device.");
                pcm.pause(true)?;
                Ok(())
            }
            other_state => {
                debug!(target: LOG_TARGET, "ALSA in state {:?}, nothing to pause.", other_state);
                Ok(())
            }
        }
    }

    #[instrument(skip(self))]
    pub fn resume(&self) -> Result<(), DeviceError> {
        let pcm = self.pcm.as_ref().ok_or(DeviceError::NotInitialized)?;
        match pcm.state() {
            PcmState::Paused => {
                debug!(target: LOG_TARGET, "Resuming ALSA PCM device.");
                pcm.pause(false)?;
                Ok(())
            }
            other_state => {
                debug!(target: LOG_TARGET, "ALSA in state {:?}, nothing to resume.", other_state);
                Ok(())
            }
        }
    }

    pub fn close(&mut self) {
        if let Some(pcm) = self.pcm.take() {
            debug!(target: LOG_TARGET, "Closing ALSA PCM device (state: {:?})...", pcm.state());
            if let Err(e) = pcm.drop() {
                warn!(target: LOG_TARGET, "Error dropping ALSA buffer during close (ignored): {}", e);
            }
        }
        self.format = None;
        self.frames_written = 0;
    }

    pub fn format(&self) -> Option<OutputFormat> {
        self.format
    }
}

impl Drop for AlsaPcmHandler {
    fn drop(&mut self) {
        debug!(target: LOG_TARGET, "Dropping AlsaPcmHandler.");
        self.close();
    }
}
