//! `SoundPlayer`: one logical voice per sound. Owns the primary controller,
//! any overlapping one-shot controllers, and the repress policy.

use crate::audio::error::AudioError;
use crate::engine::EngineContext;
use crate::player::controller::{ControllerConfig, PlaybackController};
use crate::player::lock_unpoisoned;
use crate::player::state::{ControllerEvent, PlaybackState, RepressMode, VoiceEvent};
use crate::player::task_manager::TaskManager;
use crate::sound::Sound;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

const LOG_TARGET: &str = "soundboard_engine::player::voice";

const VOICE_EVENT_CAPACITY: usize = 64;

struct VoiceInner {
    sound: Sound,
    ctx: EngineContext,
    primary: PlaybackController,
    overlaps: StdMutex<Vec<PlaybackController>>,
    repress_mode: StdMutex<RepressMode>,
    /// Per channel.
    buffer_size: AtomicUsize,
    volume: AtomicU8,
    state: StdMutex<PlaybackState>,
    duration_ms: StdMutex<Option<u64>>,
    error_message: StdMutex<Option<String>>,
    events_tx: broadcast::Sender<VoiceEvent>,
    controller_tx: mpsc::UnboundedSender<ControllerEvent>,
    run_loop: StdMutex<Option<TaskManager>>,
    op_lock: Mutex<()>,
    released: AtomicBool,
}

/// Cloneable handle to a voice.
#[derive(Clone)]
pub struct SoundPlayer {
    inner: Arc<VoiceInner>,
}

/// Treats operations that do not apply in the current state as no-ops.
fn settle<T>(result: Result<T, AudioError>) -> Result<(), AudioError> {
    match result {
        Ok(_) => Ok(()),
        Err(AudioError::InvalidState(msg)) => {
            debug!(target: LOG_TARGET, "Ignored: {}", msg);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

impl SoundPlayer {
    /// Creates the voice and prepares its primary controller. Priming
    /// continues in the background; setup failures leave the voice in
    /// `Error` with [`error_message`](Self::error_message) set.
    #[instrument(skip(sound, ctx), fields(sound_id = sound.id))]
    pub async fn new(
        sound: Sound,
        buffer_size: usize,
        repress_mode: RepressMode,
        ctx: EngineContext,
    ) -> Self {
        let (controller_tx, controller_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(VOICE_EVENT_CAPACITY);
        let primary = PlaybackController::new(
            ControllerConfig {
                label: sound.name.clone(),
                path: sound.path.clone(),
                buffer_size,
                volume: sound.volume,
                one_shot: false,
            },
            ctx.clone(),
            controller_tx.clone(),
        );

        let inner = Arc::new(VoiceInner {
            volume: AtomicU8::new(sound.volume.min(100)),
            sound,
            ctx,
            primary,
            overlaps: StdMutex::new(Vec::new()),
            repress_mode: StdMutex::new(repress_mode),
            buffer_size: AtomicUsize::new(buffer_size),
            state: StdMutex::new(PlaybackState::Initializing),
            duration_ms: StdMutex::new(None),
            error_message: StdMutex::new(None),
            events_tx,
            controller_tx,
            run_loop: StdMutex::new(None),
            op_lock: Mutex::new(()),
            released: AtomicBool::new(false),
        });

        let loop_inner = Arc::clone(&inner);
        let run_loop = TaskManager::spawn(format!("voice-{}", inner.sound.id), move |shutdown_rx| async move {
            run_voice_loop(loop_inner, controller_rx, shutdown_rx).await;
        });
        *lock_unpoisoned(&inner.run_loop) = Some(run_loop);

        if let Err(e) = inner.primary.prepare().await {
            inner.record_error(&e.to_string(), true);
        }
        info!(target: LOG_TARGET, sound_id = inner.sound.id, "Voice created for {}", inner.sound.name);
        Self { inner }
    }

    pub fn sound(&self) -> &Sound {
        &self.inner.sound
    }

    /// Aggregated state: `Playing` if any controller is playing, otherwise
    /// the primary's state.
    pub fn state(&self) -> PlaybackState {
        *lock_unpoisoned(&self.inner.state)
    }

    pub fn primary_state(&self) -> PlaybackState {
        self.inner.primary.state()
    }

    pub fn primary(&self) -> &PlaybackController {
        &self.inner.primary
    }

    pub fn duration_ms(&self) -> Option<u64> {
        *lock_unpoisoned(&self.inner.duration_ms)
    }

    /// Last setup error, kept until the voice is released.
    pub fn error_message(&self) -> Option<String> {
        lock_unpoisoned(&self.inner.error_message).clone()
    }

    pub fn repress_mode(&self) -> RepressMode {
        *lock_unpoisoned(&self.inner.repress_mode)
    }

    pub fn volume(&self) -> u8 {
        self.inner.volume.load(Ordering::Acquire)
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size.load(Ordering::Acquire)
    }

    /// Overlap controllers not yet released.
    pub fn overlap_count(&self) -> usize {
        lock_unpoisoned(&self.inner.overlaps)
            .iter()
            .filter(|c| c.state() != PlaybackState::Released)
            .count()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.inner.events_tx.subscribe()
    }

    fn ensure_live(&self) -> Result<(), AudioError> {
        if self.is_released() {
            Err(AudioError::Released)
        } else {
            Ok(())
        }
    }

    /// Plays, resumes, or applies the repress mode if already playing.
    #[instrument(skip(self), fields(sound_id = self.inner.sound.id))]
    pub async fn toggle_play(&self, deadline: Instant) -> Result<(), AudioError> {
        self.ensure_live()?;
        let _op = self.inner.op_lock.lock().await;
        let primary = &self.inner.primary;
        let primary_state = primary.state();

        if primary_state == PlaybackState::Paused {
            return settle(primary.resume().await);
        }
        let playing = primary_state.is_active() || self.inner.any_overlap_active();
        if !playing {
            return settle(primary.play(deadline).await);
        }

        let mode = self.repress_mode();
        debug!(target: LOG_TARGET, sound_id = self.inner.sound.id, "Repress while playing: {}", mode);
        match mode {
            RepressMode::Stop => {
                if primary_state.is_active() {
                    settle(primary.stop().await)?;
                }
                self.inner.stop_overlaps().await;
                Ok(())
            }
            RepressMode::Restart => settle(primary.restart(deadline).await),
            RepressMode::Overlap => self.inner.start_overlap(deadline).await,
            RepressMode::Pause => {
                if primary_state == PlaybackState::Playing {
                    settle(primary.pause().await)?;
                }
                self.inner.stop_overlaps().await;
                Ok(())
            }
        }
    }

    /// Applies to the primary only; overlaps keep the volume they started with.
    pub async fn set_volume(&self, volume: u8) -> Result<(), AudioError> {
        self.ensure_live()?;
        let _op = self.inner.op_lock.lock().await;
        let volume = volume.min(100);
        self.inner.volume.store(volume, Ordering::Release);
        settle(self.inner.primary.set_volume(volume).await)
    }

    /// Leaving `Pause` while paused puts the primary back to `Ready`.
    pub async fn set_repress_mode(&self, mode: RepressMode) -> Result<(), AudioError> {
        self.ensure_live()?;
        let _op = self.inner.op_lock.lock().await;
        let old = std::mem::replace(&mut *lock_unpoisoned(&self.inner.repress_mode), mode);
        if old == RepressMode::Pause
            && mode != RepressMode::Pause
            && self.inner.primary.state() == PlaybackState::Paused
        {
            debug!(target: LOG_TARGET, sound_id = self.inner.sound.id, "Leaving pause mode while paused, re-preparing.");
            settle(self.inner.primary.prepare_and_prime().await)?;
        }
        Ok(())
    }

    /// Changes the per-channel buffer size of the primary.
    pub async fn set_buffer_size(&self, buffer_size: usize) -> Result<(), AudioError> {
        self.ensure_live()?;
        let _op = self.inner.op_lock.lock().await;
        if self.inner.buffer_size.swap(buffer_size, Ordering::AcqRel) == buffer_size {
            return Ok(());
        }
        settle(self.inner.primary.change_buffer_size(buffer_size).await)
    }

    /// Releases every controller. Safe to call more than once.
    #[instrument(skip(self), fields(sound_id = self.inner.sound.id))]
    pub async fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let _op = self.inner.op_lock.lock().await;
        let overlaps: Vec<PlaybackController> = lock_unpoisoned(&self.inner.overlaps).drain(..).collect();
        futures::future::join_all(overlaps.iter().map(|c| c.release())).await;
        self.inner.primary.release().await;

        let run_loop = lock_unpoisoned(&self.inner.run_loop).take();
        if let Some(run_loop) = run_loop {
            run_loop.stop_task().await;
        }
        info!(target: LOG_TARGET, sound_id = self.inner.sound.id, "Voice released.");
    }
}

impl std::fmt::Debug for SoundPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundPlayer")
            .field("sound", &self.inner.sound.name)
            .field("state", &self.state())
            .field("overlaps", &self.overlap_count())
            .finish()
    }
}

impl VoiceInner {
    fn any_overlap_active(&self) -> bool {
        lock_unpoisoned(&self.overlaps)
            .iter()
            .any(|c| c.state().is_active())
    }

    async fn stop_overlaps(&self) {
        let overlaps: Vec<PlaybackController> = lock_unpoisoned(&self.overlaps).clone();
        for overlap in overlaps.iter().filter(|c| c.state().is_active()) {
            if let Err(e) = settle(overlap.stop().await) {
                debug!(target: LOG_TARGET, "Stopping overlap failed: {}", e);
            }
        }
        lock_unpoisoned(&self.overlaps).retain(|c| c.state() != PlaybackState::Released);
    }

    /// Starts an independent one-shot copy of the sound.
    async fn start_overlap(&self, deadline: Instant) -> Result<(), AudioError> {
        let overlap = PlaybackController::new(
            ControllerConfig {
                label: self.sound.name.clone(),
                path: self.sound.path.clone(),
                buffer_size: self.buffer_size.load(Ordering::Acquire),
                volume: self.volume.load(Ordering::Acquire),
                one_shot: true,
            },
            self.ctx.clone(),
            self.controller_tx.clone(),
        );
        lock_unpoisoned(&self.overlaps).push(overlap.clone());
        debug!(target: LOG_TARGET, sound_id = self.sound.id, controller_id = %overlap.id(), "Starting overlap.");

        let started = match overlap.prepare().await {
            Ok(()) => overlap.play(deadline).await,
            Err(e) => Err(e),
        };
        match started {
            Ok(true) => Ok(()),
            Ok(false) => {
                overlap.release().await;
                Ok(())
            }
            Err(e) => {
                warn!(target: LOG_TARGET, sound_id = self.sound.id, "Overlap could not start: {}", e);
                overlap.release().await;
                Ok(())
            }
        }
    }

    fn broadcast(&self, event: VoiceEvent) {
        trace!(target: LOG_TARGET, sound_id = self.sound.id, "Broadcasting {:?}", event);
        if self.events_tx.send(event).is_err() {
            trace!(target: LOG_TARGET, sound_id = self.sound.id, "No listeners.");
        }
    }

    fn record_error(&self, reason: &str, setup: bool) {
        let message = if setup {
            format!("Error initializing {}: {}", self.sound.name, reason)
        } else {
            format!("Error playing {}: {}", self.sound.name, reason)
        };
        let mut stored = lock_unpoisoned(&self.error_message);
        if stored.as_deref() == Some(message.as_str()) {
            return;
        }
        *stored = Some(message.clone());
        drop(stored);
        self.set_aggregate(PlaybackState::Error, self.primary.position_ms());
        self.broadcast(VoiceEvent::Error(message));
    }

    fn set_aggregate(&self, state: PlaybackState, position_ms: u64) {
        let mut current = lock_unpoisoned(&self.state);
        if *current == state || *current == PlaybackState::Released {
            return;
        }
        *current = state;
        drop(current);
        self.broadcast(VoiceEvent::StateChanged { state, position_ms });
    }

    fn handle_event(&self, event: ControllerEvent, states: &mut HashMap<Uuid, PlaybackState>) {
        let primary_id = self.primary.id();
        match event {
            ControllerEvent::StateChanged {
                controller,
                state,
                position_ms,
            } => {
                if controller != primary_id && state == PlaybackState::Released {
                    states.remove(&controller);
                    lock_unpoisoned(&self.overlaps).retain(|c| c.id() != controller);
                    trace!(target: LOG_TARGET, controller_id = %controller, "Overlap finished.");
                } else {
                    states.insert(controller, state);
                }

                let primary_state = states
                    .get(&primary_id)
                    .copied()
                    .unwrap_or_else(|| self.primary.state());
                let overlap_active = states
                    .iter()
                    .any(|(id, s)| *id != primary_id && s.is_active());
                let aggregate = if primary_state.is_active() || overlap_active {
                    PlaybackState::Playing
                } else {
                    primary_state
                };
                let position = if controller == primary_id {
                    position_ms
                } else {
                    self.primary.position_ms()
                };
                self.set_aggregate(aggregate, position);
            }
            ControllerEvent::Warning { message, .. } => self.broadcast(VoiceEvent::Warning(message)),
            ControllerEvent::Error {
                controller,
                message,
                setup,
            } => {
                if controller == primary_id {
                    self.record_error(&message, setup);
                } else {
                    self.broadcast(VoiceEvent::Warning(format!(
                        "Overlapping copy of {} failed: {}",
                        self.sound.name, message
                    )));
                    let overlap = lock_unpoisoned(&self.overlaps)
                        .iter()
                        .find(|c| c.id() == controller)
                        .cloned();
                    if let Some(overlap) = overlap {
                        tokio::spawn(async move { overlap.release().await });
                    }
                }
            }
            ControllerEvent::Prepared {
                controller,
                duration_ms,
            } => {
                if controller != primary_id {
                    return;
                }
                let duration = duration_ms.or(self.sound.duration_ms);
                if let Some(duration) = duration {
                    *lock_unpoisoned(&self.duration_ms) = Some(duration);
                    self.broadcast(VoiceEvent::DurationChanged(duration));
                }
            }
        }
    }
}

/// Folds controller events into the voice's state and re-broadcasts them.
async fn run_voice_loop(
    inner: Arc<VoiceInner>,
    mut controller_rx: mpsc::UnboundedReceiver<ControllerEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut states: HashMap<Uuid, PlaybackState> = HashMap::new();
    loop {
        tokio::select! {
            biased;
            event = controller_rx.recv() => match event {
                Some(event) => inner.handle_event(event, &mut states),
                None => break,
            },
            _ = shutdown_rx.recv() => {
                // Deliver what the released controllers sent on the way out.
                while let Ok(event) = controller_rx.try_recv() {
                    inner.handle_event(event, &mut states);
                }
                break;
            }
        }
    }
    trace!(target: LOG_TARGET, sound_id = inner.sound.id, "Voice loop finished.");
}
