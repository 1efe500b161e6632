use crate::audio::alsa_handler::AlsaPcmHandler;
use crate::audio::device::{DeviceFactory, PcmDevice};
use crate::audio::error::{AudioError, DeviceError};
use crate::audio::format::OutputFormat;
use crate::audio::sample_converter;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::task;
use tracing::{debug, error, instrument, trace, warn};

const LOG_TARGET: &str = "soundboard_engine::audio::alsa_writer";

/// [`PcmDevice`] over an ALSA handle. Blocking ALSA calls run on the blocking pool.
pub struct AlsaDevice {
    alsa_handler: Arc<Mutex<AlsaPcmHandler>>,
    format: OutputFormat,
    gain: f32,
    paused: bool,
}

impl AlsaDevice {
    pub fn new(alsa_handler: Arc<Mutex<AlsaPcmHandler>>, format: OutputFormat, gain: f32) -> Self {
        Self {
            alsa_handler,
            format,
            gain,
            paused: true,
        }
    }

    async fn with_handler<T, F>(&self, op: &'static str, f: F) -> Result<T, DeviceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut AlsaPcmHandler) -> Result<T, DeviceError> + Send + 'static,
    {
        let handler_clone = Arc::clone(&self.alsa_handler);
        task::spawn_blocking(move || match handler_clone.lock() {
            Ok(mut handler_guard) => f(&mut handler_guard),
            Err(poisoned) => {
                error!(target: LOG_TARGET, "ALSA handler mutex poisoned during {}: {}", op, poisoned);
                Err(DeviceError::NotInitialized)
            }
        })
        .await
        .map_err(|e| DeviceError::Other(format!("ALSA {} task failed: {}", op, e)))?
    }
}

#[async_trait]
impl PcmDevice for AlsaDevice {
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    async fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError> {
        let frame_size = self.format.frame_size();
        let channels = self.format.channel_count();
        let mut bytes = data[..data.len() - data.len() % frame_size].to_vec();
        if bytes.is_empty() {
            return Ok(0);
        }
        sample_converter::apply_gain_s16le(&mut bytes, self.gain);
        let samples = sample_converter::le_bytes_to_samples(&bytes);

        let frames = self
            .with_handler("write", move |handler| handler.write_s16_buffer(&samples))
            .await?;
        if frames == 0 {
            warn!(target: LOG_TARGET, "ALSA underrun recovered, nothing written this attempt.");
        }
        trace!(target: LOG_TARGET, "Wrote {} frames to ALSA", frames);
        Ok(frames * channels * 2)
    }

    fn playback_head_position(&self) -> u64 {
        match self.alsa_handler.lock() {
            Ok(handler) => handler.head_position(),
            Err(_) => 0,
        }
    }

    async fn play(&mut self) -> Result<(), DeviceError> {
        if self.paused {
            self.with_handler("resume", |handler| handler.resume()).await?;
            self.paused = false;
        }
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), DeviceError> {
        self.with_handler("pause", |handler| handler.pause()).await?;
        self.paused = true;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), DeviceError> {
        self.with_handler("flush", |handler| handler.flush()).await
    }

    async fn drain(&mut self) -> Result<(), DeviceError> {
        debug!(target: LOG_TARGET, "Requesting ALSA drain.");
        self.with_handler("drain", |handler| handler.drain()).await
    }

    fn set_volume(&mut self, gain: f32) -> Result<(), DeviceError> {
        if !(0.0..=1.0).contains(&gain) {
            return Err(DeviceError::BadValue);
        }
        self.gain = gain;
        Ok(())
    }

    async fn release(&mut self) {
        if let Err(e) = self
            .with_handler("close", |handler| {
                handler.close();
                Ok(())
            })
            .await
        {
            warn!(target: LOG_TARGET, "Error closing ALSA device: {}", e);
        }
    }
}

/// Opens one ALSA handle per output device.
#[derive(Debug, Clone)]
pub struct AlsaDeviceFactory {
    device_name: String,
}

impl AlsaDeviceFactory {
    pub fn new(device_name: &str) -> Self {
        Self {
            device_name: device_name.to_string(),
        }
    }
}

impl DeviceFactory for AlsaDeviceFactory {
    fn open(
        &self,
        format: &OutputFormat,
        buffer_size: usize,
        gain: f32,
    ) -> Result<Box<dyn PcmDevice>, AudioError> {
        let mut handler = AlsaPcmHandler::new(&self.device_name);
        handler
            .initialize(format, format.bytes_to_frames(buffer_size))
            .map_err(|e| AudioError::OutputBuild(e.to_string()))?;
        Ok(Box::new(AlsaDevice::new(Arc::new(Mutex::new(handler)), *format, gain)))
    }
}
