//! Engine facade: a registry of voices addressed by handle.

use crate::audio::codec::{DecoderFactory, SymphoniaDecoderFactory};
use crate::audio::container::{ContainerOpener, SymphoniaOpener};
use crate::audio::decoder_pool::DecoderPool;
use crate::audio::device::DeviceFactory;
use crate::audio::error::AudioError;
use crate::config::Settings;
use crate::player::lock_unpoisoned;
use crate::player::state::{PlaybackState, RepressMode, VoiceEvent};
use crate::player::voice::SoundPlayer;
use crate::sound::Sound;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

const LOG_TARGET: &str = "soundboard_engine::engine";

/// Deadline applied to a play request that does not bring its own.
pub const SOUND_PLAY_TIMEOUT: Duration = Duration::from_millis(500);

/// Collaborators shared by every controller. Only the decoder pool carries
/// state across controllers.
#[derive(Clone)]
pub struct EngineContext {
    pub pool: DecoderPool,
    pub opener: Arc<dyn ContainerOpener>,
    pub devices: Arc<dyn DeviceFactory>,
}

impl EngineContext {
    pub fn new(
        decoders: Arc<dyn DecoderFactory>,
        opener: Arc<dyn ContainerOpener>,
        devices: Arc<dyn DeviceFactory>,
    ) -> Self {
        Self {
            pool: DecoderPool::new(decoders),
            opener,
            devices,
        }
    }

    /// Symphonia demuxing and decoding into the given output devices.
    pub fn with_devices(devices: Arc<dyn DeviceFactory>) -> Self {
        Self::new(Arc::new(SymphoniaDecoderFactory), Arc::new(SymphoniaOpener), devices)
    }
}

/// Opaque voice identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceHandle(u64);

impl VoiceHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VoiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct Engine {
    ctx: EngineContext,
    voices: StdMutex<BTreeMap<VoiceHandle, SoundPlayer>>,
    /// Handles whose voice has been dropped. Locked after `voices`.
    released: StdMutex<BTreeSet<VoiceHandle>>,
    next_handle: AtomicU64,
    play_timeout: Duration,
    default_repress_mode: RepressMode,
}

impl Engine {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            voices: StdMutex::new(BTreeMap::new()),
            released: StdMutex::new(BTreeSet::new()),
            next_handle: AtomicU64::new(1),
            play_timeout: SOUND_PLAY_TIMEOUT,
            default_repress_mode: RepressMode::default(),
        }
    }

    /// Takes the play timeout and initial repress mode from settings.
    pub fn from_settings(ctx: EngineContext, settings: &Settings) -> Self {
        Self {
            play_timeout: Duration::from_millis(settings.play_timeout_ms),
            default_repress_mode: settings.repress_mode,
            ..Self::new(ctx)
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn play_timeout(&self) -> Duration {
        self.play_timeout
    }

    /// Creates a voice for `sound` with a per-channel buffer size in bytes.
    pub async fn create_voice(&self, sound: Sound, buffer_size: usize) -> Result<VoiceHandle, AudioError> {
        let handle = VoiceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        info!(target: LOG_TARGET, "Creating voice {} for {}", handle, sound.path.display());
        let voice = SoundPlayer::new(sound, buffer_size, self.default_repress_mode, self.ctx.clone()).await;
        lock_unpoisoned(&self.voices).insert(handle, voice);
        Ok(handle)
    }

    /// The voice behind `handle`, if it exists and is not released.
    pub fn voice(&self, handle: VoiceHandle) -> Result<SoundPlayer, AudioError> {
        let voices = lock_unpoisoned(&self.voices);
        if lock_unpoisoned(&self.released).contains(&handle) {
            return Err(AudioError::Released);
        }
        let voice = voices.get(&handle).cloned().ok_or(AudioError::UnknownVoice(handle.0))?;
        if voice.is_released() {
            return Err(AudioError::Released);
        }
        Ok(voice)
    }

    /// Handles of live voices, in creation order.
    pub fn handles(&self) -> Vec<VoiceHandle> {
        lock_unpoisoned(&self.voices).keys().copied().collect()
    }

    /// Uses the configured play timeout when `deadline` is `None`.
    pub async fn toggle_play(&self, handle: VoiceHandle, deadline: Option<Instant>) -> Result<(), AudioError> {
        let voice = self.voice(handle)?;
        let deadline = deadline.unwrap_or_else(|| Instant::now() + self.play_timeout);
        voice.toggle_play(deadline).await
    }

    pub async fn set_volume(&self, handle: VoiceHandle, volume: u8) -> Result<(), AudioError> {
        self.voice(handle)?.set_volume(volume).await
    }

    pub async fn set_repress_mode(&self, handle: VoiceHandle, mode: RepressMode) -> Result<(), AudioError> {
        self.voice(handle)?.set_repress_mode(mode).await
    }

    pub async fn change_buffer_size(&self, handle: VoiceHandle, buffer_size: usize) -> Result<(), AudioError> {
        self.voice(handle)?.set_buffer_size(buffer_size).await
    }

    pub fn state(&self, handle: VoiceHandle) -> Result<PlaybackState, AudioError> {
        Ok(self.voice(handle)?.state())
    }

    pub fn subscribe(&self, handle: VoiceHandle) -> Result<broadcast::Receiver<VoiceEvent>, AudioError> {
        Ok(self.voice(handle)?.subscribe())
    }

    /// Releases the voice and drops it from the registry. Later calls with
    /// the handle fail with `Released`; releasing it again is a no-op.
    pub async fn release(&self, handle: VoiceHandle) -> Result<(), AudioError> {
        let voice = {
            let mut voices = lock_unpoisoned(&self.voices);
            let mut released = lock_unpoisoned(&self.released);
            match voices.remove(&handle) {
                Some(voice) => {
                    released.insert(handle);
                    voice
                }
                None if released.contains(&handle) => return Ok(()),
                None => return Err(AudioError::UnknownVoice(handle.0)),
            }
        };
        voice.release().await;
        debug!(target: LOG_TARGET, "Voice {} released.", handle);
        Ok(())
    }

    /// Releases every voice.
    pub async fn shutdown(&self) {
        let voices: Vec<SoundPlayer> = {
            let mut voices = lock_unpoisoned(&self.voices);
            lock_unpoisoned(&self.released).extend(voices.keys().copied());
            std::mem::take(&mut *voices).into_values().collect()
        };
        futures::future::join_all(voices.iter().map(|v| v.release())).await;
        info!(target: LOG_TARGET, "Engine shut down, {} voices released.", voices.len());
    }
}
