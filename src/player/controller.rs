//! Playback controller: the per-stream state machine tying a decode
//! pipeline to an output sink.
//!
//! Public operations are serialized by an operation lock. Background work
//! (priming, extraction, soft stop, failure recovery) runs in tasks owned by
//! [`TaskManager`] slots and is cancelled by sending shutdown and joining.
//! The extraction task only ever takes the core lock, one iteration at a
//! time, so an operation holding the operation lock can always cancel it.

use crate::audio::error::{AudioError, DeviceError, EngineWarning};
use crate::audio::output_sink::{shutdown_signalled, OutputSink, WriteOutcome};
use crate::audio::pipeline::{DecodePipeline, Extracted};
use crate::engine::EngineContext;
use crate::player::soft_stop::{self, SoftStopTarget};
use crate::player::state::{ControllerEvent, PlaybackState};
use crate::player::task_manager::TaskManager;
use crate::player::lock_unpoisoned;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

const LOG_TARGET: &str = "soundboard_engine::player::controller";

/// Consecutive empty decoder rounds before the stream is treated as ended.
const MAX_CONSECUTIVE_STALLS: u32 = 50;

/// Which background task is running an operation, so it never joins itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Caller {
    External,
    SoftStop,
    Recovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskSlot {
    Extract,
    SoftStop,
    Prime,
    Recovery,
}

enum ReadyWait {
    Ready,
    TimedOut,
    Failed(PlaybackState),
}

/// Decode and output state, guarded by the core lock.
struct Core {
    pipeline: DecodePipeline,
    sink: OutputSink,
    /// Output of priming, consumed by the first write.
    primed: Option<Vec<u8>>,
    /// Bytes a short or interrupted write left behind.
    pending: Vec<u8>,
    eos_reached: bool,
    soft_stop_armed: bool,
}

impl Core {
    fn clear_stream(&mut self) {
        self.primed = None;
        self.pending.clear();
        self.eos_reached = false;
        self.soft_stop_armed = false;
    }
}

struct Shared {
    id: Uuid,
    label: String,
    path: PathBuf,
    ctx: EngineContext,
    one_shot: bool,
    state_tx: watch::Sender<PlaybackState>,
    events: StdMutex<Option<mpsc::UnboundedSender<ControllerEvent>>>,
    op_lock: Mutex<()>,
    core: Mutex<Option<Core>>,
    extract_task: StdMutex<Option<TaskManager>>,
    soft_stop_task: StdMutex<Option<TaskManager>>,
    prime_task: StdMutex<Option<TaskManager>>,
    recovery_task: StdMutex<Option<TaskManager>>,
    epoch: AtomicU64,
    fail_streak: AtomicU32,
    elapsed_at_pause_ms: AtomicU64,
    position_ms: AtomicU64,
    volume: AtomicU8,
    /// Per channel.
    buffer_size: AtomicUsize,
    duration_ms: StdMutex<Option<u64>>,
    error_message: StdMutex<Option<String>>,
}

/// Handle to one playback controller. Clones share the same controller.
#[derive(Clone)]
pub struct PlaybackController {
    shared: Arc<Shared>,
}

/// Construction parameters for a controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub label: String,
    pub path: PathBuf,
    /// Bytes per channel; multiplied by the stream's channel count.
    pub buffer_size: usize,
    pub volume: u8,
    /// Released after its first stop instead of re-priming.
    pub one_shot: bool,
}

impl PlaybackController {
    pub fn new(
        config: ControllerConfig,
        ctx: EngineContext,
        events: mpsc::UnboundedSender<ControllerEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(PlaybackState::Initializing);
        let id = Uuid::new_v4();
        debug!(target: LOG_TARGET, controller_id = %id, "Creating controller for {}", config.path.display());
        Self {
            shared: Arc::new(Shared {
                id,
                label: config.label,
                path: config.path,
                ctx,
                one_shot: config.one_shot,
                state_tx,
                events: StdMutex::new(Some(events)),
                op_lock: Mutex::new(()),
                core: Mutex::new(None),
                extract_task: StdMutex::new(None),
                soft_stop_task: StdMutex::new(None),
                prime_task: StdMutex::new(None),
                recovery_task: StdMutex::new(None),
                epoch: AtomicU64::new(0),
                fail_streak: AtomicU32::new(0),
                elapsed_at_pause_ms: AtomicU64::new(0),
                position_ms: AtomicU64::new(0),
                volume: AtomicU8::new(config.volume.min(100)),
                buffer_size: AtomicUsize::new(config.buffer_size),
                duration_ms: StdMutex::new(None),
                error_message: StdMutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlaybackState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_one_shot(&self) -> bool {
        self.shared.one_shot
    }

    /// Clip length reported by the container, once known.
    pub fn duration_ms(&self) -> Option<u64> {
        *lock_unpoisoned(&self.shared.duration_ms)
    }

    pub fn error_message(&self) -> Option<String> {
        lock_unpoisoned(&self.shared.error_message).clone()
    }

    /// Last known playback position.
    pub fn position_ms(&self) -> u64 {
        self.shared.position_ms.load(Ordering::Acquire)
    }

    pub fn volume(&self) -> u8 {
        self.shared.volume.load(Ordering::Acquire)
    }

    /// Opens the stream and starts priming in the background.
    #[instrument(skip(self), fields(controller_id = %self.shared.id))]
    pub async fn prepare(&self) -> Result<(), AudioError> {
        let _op = self.shared.op_lock.lock().await;
        self.shared.prepare_locked(false).await
    }

    /// Opens the stream and primes it, ending in `Ready`.
    #[instrument(skip(self), fields(controller_id = %self.shared.id))]
    pub async fn prepare_and_prime(&self) -> Result<(), AudioError> {
        let _op = self.shared.op_lock.lock().await;
        self.shared.prepare_locked(true).await
    }

    /// Starts playback, waiting for priming until `deadline`. Returns whether
    /// playback started.
    #[instrument(skip(self), fields(controller_id = %self.shared.id))]
    pub async fn play(&self, deadline: Instant) -> Result<bool, AudioError> {
        let _op = self.shared.op_lock.lock().await;
        self.shared.play_locked(deadline).await
    }

    #[instrument(skip(self), fields(controller_id = %self.shared.id))]
    pub async fn pause(&self) -> Result<(), AudioError> {
        let _op = self.shared.op_lock.lock().await;
        self.shared.pause_locked().await
    }

    #[instrument(skip(self), fields(controller_id = %self.shared.id))]
    pub async fn resume(&self) -> Result<(), AudioError> {
        let _op = self.shared.op_lock.lock().await;
        self.shared.resume_locked().await
    }

    #[instrument(skip(self), fields(controller_id = %self.shared.id))]
    pub async fn stop(&self) -> Result<(), AudioError> {
        let _op = self.shared.op_lock.lock().await;
        self.shared.stop_locked(Caller::External).await
    }

    /// Streams again from the start. Behaves like [`play`](Self::play) when
    /// not playing.
    #[instrument(skip(self), fields(controller_id = %self.shared.id))]
    pub async fn restart(&self, deadline: Instant) -> Result<bool, AudioError> {
        let _op = self.shared.op_lock.lock().await;
        self.shared.restart_locked(deadline).await
    }

    /// Sets the volume as a percentage.
    pub async fn set_volume(&self, volume: u8) -> Result<(), AudioError> {
        let _op = self.shared.op_lock.lock().await;
        let volume = volume.min(100);
        self.shared.volume.store(volume, Ordering::Release);
        if let Some(core) = self.shared.core.lock().await.as_mut() {
            core.sink.set_volume(volume)?;
        }
        Ok(())
    }

    /// Changes the per-channel buffer size without losing decoded audio.
    #[instrument(skip(self), fields(controller_id = %self.shared.id))]
    pub async fn change_buffer_size(&self, buffer_size: usize) -> Result<(), AudioError> {
        let _op = self.shared.op_lock.lock().await;
        self.shared.change_buffer_size_locked(buffer_size).await
    }

    /// Releases every resource. Safe to call more than once.
    #[instrument(skip(self), fields(controller_id = %self.shared.id))]
    pub async fn release(&self) {
        let _op = self.shared.op_lock.lock().await;
        self.shared.release_locked(Caller::External).await;
    }
}

impl std::fmt::Debug for PlaybackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackController")
            .field("id", &self.shared.id)
            .field("path", &self.shared.path)
            .field("state", &self.state())
            .finish()
    }
}

impl Shared {
    fn state(&self) -> PlaybackState {
        *self.state_tx.borrow()
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The only way the state changes. Emits one event per actual change.
    /// `Released` is final and `Error` only gives way to `Released`.
    fn set_state(&self, new: PlaybackState) -> bool {
        let events = lock_unpoisoned(&self.events).clone();
        let position_ms = self.position_ms.load(Ordering::Acquire);
        let id = self.id;
        let changed = self.state_tx.send_if_modified(|state| {
            let old = *state;
            if old == new || old == PlaybackState::Released {
                return false;
            }
            if old == PlaybackState::Error && new != PlaybackState::Released {
                return false;
            }
            *state = new;
            if let Some(tx) = &events {
                let _ = tx.send(ControllerEvent::StateChanged {
                    controller: id,
                    state: new,
                    position_ms,
                });
            }
            true
        });
        if changed {
            debug!(target: LOG_TARGET, controller_id = %self.id, "State -> {}", new);
        }
        changed
    }

    fn emit(&self, event: ControllerEvent) {
        if let Some(tx) = lock_unpoisoned(&self.events).as_ref() {
            if tx.send(event).is_err() {
                trace!(target: LOG_TARGET, controller_id = %self.id, "Event listener gone.");
            }
        }
    }

    fn warn(&self, warning: EngineWarning) {
        warn!(target: LOG_TARGET, controller_id = %self.id, "{}", warning);
        self.emit(ControllerEvent::Warning {
            controller: self.id,
            message: warning.to_string(),
        });
    }

    /// Moves to `Error` and reports why.
    fn fail(&self, err: &AudioError, setup: bool) {
        let message = err.to_string();
        error!(target: LOG_TARGET, controller_id = %self.id, "{} failed: {}", self.label, message);
        *lock_unpoisoned(&self.error_message) = Some(message.clone());
        if self.set_state(PlaybackState::Error) {
            self.emit(ControllerEvent::Error {
                controller: self.id,
                message,
                setup,
            });
        }
    }

    fn slot(&self, slot: TaskSlot) -> &StdMutex<Option<TaskManager>> {
        match slot {
            TaskSlot::Extract => &self.extract_task,
            TaskSlot::SoftStop => &self.soft_stop_task,
            TaskSlot::Prime => &self.prime_task,
            TaskSlot::Recovery => &self.recovery_task,
        }
    }

    /// Stores a task, cancelling whatever was left in the slot.
    fn install_task(&self, slot: TaskSlot, task: TaskManager) {
        if let Some(old) = lock_unpoisoned(self.slot(slot)).replace(task) {
            old.signal_shutdown();
            old.detach();
        }
    }

    /// Cancel-then-join. A task cancelling its own slot only detaches.
    async fn cancel_task(&self, slot: TaskSlot, caller: Caller) {
        let task = lock_unpoisoned(self.slot(slot)).take();
        let Some(task) = task else { return };
        let own = matches!(
            (slot, caller),
            (TaskSlot::SoftStop, Caller::SoftStop) | (TaskSlot::Recovery, Caller::Recovery)
        );
        if own {
            task.detach();
        } else {
            task.stop_task().await;
        }
    }

    async fn cancel_playback_tasks(&self, caller: Caller) {
        self.cancel_task(TaskSlot::Extract, caller).await;
        self.cancel_task(TaskSlot::SoftStop, caller).await;
    }

    // --- preparation ---

    async fn prepare_locked(self: &Arc<Self>, wait_for_priming: bool) -> Result<(), AudioError> {
        match self.state() {
            PlaybackState::Initializing => {
                if lock_unpoisoned(&self.prime_task).is_some() {
                    trace!(target: LOG_TARGET, controller_id = %self.id, "Already priming.");
                    return Ok(());
                }
                if self.core.lock().await.is_none() {
                    self.open_stream().await?;
                }
            }
            PlaybackState::Stopped | PlaybackState::Paused => {
                self.bump_epoch();
                self.cancel_playback_tasks(Caller::External).await;
                let mut guard = self.core.lock().await;
                let core = guard
                    .as_mut()
                    .ok_or_else(|| AudioError::InvalidState("controller has no stream".to_string()))?;
                if let Err(e) = core.sink.stop().await {
                    warn!(target: LOG_TARGET, controller_id = %self.id, "Sink stop before re-prime failed: {}", e);
                }
                core.pipeline.rewind()?;
                core.clear_stream();
                self.position_ms.store(0, Ordering::Release);
            }
            PlaybackState::Released => return Err(AudioError::Released),
            other => {
                return Err(AudioError::InvalidState(format!("cannot prepare while {}", other)));
            }
        }

        if wait_for_priming {
            self.prime_now().await
        } else {
            self.spawn_priming();
            Ok(())
        }
    }

    /// Opens the container, leases a decoder and builds the sink.
    async fn open_stream(&self) -> Result<(), AudioError> {
        let opener = Arc::clone(&self.ctx.opener);
        let path = self.path.clone();
        let opened = tokio::task::spawn_blocking(move || opener.open(&path))
            .await
            .map_err(AudioError::from)
            .and_then(|r| r);
        let container = match opened {
            Ok(container) => container,
            Err(e) => {
                self.fail(&e, true);
                return Err(e);
            }
        };

        let format = container.format().clone();
        let lease = if format.is_raw() {
            None
        } else {
            match self.ctx.pool.acquire(&format) {
                Some(lease) => Some(lease),
                None => {
                    let e = AudioError::NoSuitableDecoder(format!("{:?}", format.encoding));
                    self.fail(&e, true);
                    return Err(e);
                }
            }
        };

        let buffer_bytes = self.buffer_size.load(Ordering::Acquire) * format.channels.max(1);
        let sink = match OutputSink::build(
            Arc::clone(&self.ctx.devices),
            format.initial_output_format(),
            buffer_bytes,
            self.volume.load(Ordering::Acquire),
        ) {
            Ok(sink) => sink,
            Err(e) => {
                let e = match e {
                    AudioError::OutputBuild(_) => e,
                    other => AudioError::OutputBuild(other.to_string()),
                };
                self.fail(&e, true);
                return Err(e);
            }
        };

        let pipeline = match DecodePipeline::new(container, lease, buffer_bytes) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.fail(&e, true);
                return Err(e);
            }
        };

        *lock_unpoisoned(&self.duration_ms) = format.duration_ms;
        *self.core.lock().await = Some(Core {
            pipeline,
            sink,
            primed: None,
            pending: Vec::new(),
            eos_reached: false,
            soft_stop_armed: false,
        });
        info!(
            target: LOG_TARGET,
            controller_id = %self.id,
            "Opened {} ({} Hz, {} ch, {:?} ms)",
            self.label, format.sample_rate, format.channels, format.duration_ms
        );
        self.emit(ControllerEvent::Prepared {
            controller: self.id,
            duration_ms: format.duration_ms,
        });
        Ok(())
    }

    /// Primes with one retry after a rewind if the decoder times out.
    async fn prime_core(&self, core: &mut Core, shutdown_rx: &mut broadcast::Receiver<()>) -> Result<(), AudioError> {
        let primed = match core.pipeline.prime(&mut core.sink, shutdown_rx).await {
            Err(AudioError::Timeout(msg)) => {
                warn!(target: LOG_TARGET, controller_id = %self.id, "Priming timed out ({}), retrying once.", msg);
                self.warn(EngineWarning::DecoderStalled);
                core.pipeline.rewind()?;
                core.pipeline.prime(&mut core.sink, shutdown_rx).await?
            }
            other => other?,
        };
        core.eos_reached = core.pipeline.is_finished();
        core.primed = Some(primed);
        Ok(())
    }

    async fn prime_now(&self) -> Result<(), AudioError> {
        // Nothing cancels priming done under the operation lock.
        let (_keep_alive, mut shutdown_rx) = broadcast::channel::<()>(1);
        let result = {
            let mut guard = self.core.lock().await;
            match guard.as_mut() {
                Some(core) => self.prime_core(core, &mut shutdown_rx).await,
                None => Err(AudioError::InvalidState("controller has no stream".to_string())),
            }
        };
        match result {
            Ok(()) => {
                self.position_ms.store(0, Ordering::Release);
                self.set_state(PlaybackState::Ready);
                Ok(())
            }
            Err(e) => {
                self.fail(&e, true);
                Err(e)
            }
        }
    }

    fn spawn_priming(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        let epoch = self.current_epoch();
        let task = TaskManager::spawn(format!("prime-{}", self.id), move |mut shutdown_rx| async move {
            let mut guard = tokio::select! {
                _ = shutdown_rx.recv() => return,
                guard = shared.core.lock() => guard,
            };
            let Some(core) = guard.as_mut() else { return };
            let result = shared.prime_core(core, &mut shutdown_rx).await;
            drop(guard);
            if shared.current_epoch() != epoch {
                return;
            }
            match result {
                Ok(()) => {
                    shared.position_ms.store(0, Ordering::Release);
                    shared.set_state(PlaybackState::Ready);
                }
                Err(AudioError::ShutdownRequested) => {}
                Err(e) => shared.fail(&e, true),
            }
            lock_unpoisoned(&shared.prime_task).take();
        });
        self.install_task(TaskSlot::Prime, task);
    }

    async fn wait_until_ready(&self, deadline: Instant) -> ReadyWait {
        let mut state_rx = self.state_tx.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                PlaybackState::Ready => return ReadyWait::Ready,
                PlaybackState::Initializing => {}
                other => return ReadyWait::Failed(other),
            }
            match tokio::time::timeout_at(deadline, state_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return ReadyWait::Failed(self.state()),
                Err(_) => return ReadyWait::TimedOut,
            }
        }
    }

    // --- playback ---

    async fn play_locked(self: &Arc<Self>, deadline: Instant) -> Result<bool, AudioError> {
        if Instant::now() >= deadline {
            self.warn(EngineWarning::Timeout);
            return Ok(false);
        }
        match self.state() {
            PlaybackState::Ready => {}
            PlaybackState::Initializing => match self.wait_until_ready(deadline).await {
                ReadyWait::Ready => {}
                ReadyWait::TimedOut => {
                    self.warn(EngineWarning::Timeout);
                    return Ok(false);
                }
                ReadyWait::Failed(PlaybackState::Released) => return Err(AudioError::Released),
                ReadyWait::Failed(state) => {
                    return Err(AudioError::InvalidState(format!("cannot play while {}", state)));
                }
            },
            PlaybackState::Released => return Err(AudioError::Released),
            other => return Err(AudioError::InvalidState(format!("cannot play while {}", other))),
        }
        self.start_playback().await?;
        Ok(true)
    }

    /// `Ready` -> `InitPlay`, then hands the stream to a new extraction task.
    async fn start_playback(self: &Arc<Self>) -> Result<(), AudioError> {
        let epoch = self.bump_epoch();
        self.set_state(PlaybackState::InitPlay);
        let started = {
            let mut guard = self.core.lock().await;
            match guard.as_mut() {
                Some(core) => {
                    core.soft_stop_armed = false;
                    core.sink.play().await
                }
                None => Err(AudioError::InvalidState("controller has no stream".to_string())),
            }
        };
        if let Err(e) = started {
            self.fail(&e, false);
            return Err(e);
        }
        self.spawn_extraction(epoch);
        Ok(())
    }

    fn spawn_extraction(self: &Arc<Self>, epoch: u64) {
        let shared = Arc::clone(self);
        let task = TaskManager::spawn(format!("extract-{}", self.id), move |shutdown_rx| async move {
            shared.run_extraction(epoch, shutdown_rx).await;
        });
        self.install_task(TaskSlot::Extract, task);
    }

    async fn run_extraction(self: Arc<Self>, epoch: u64, mut shutdown_rx: broadcast::Receiver<()>) {
        trace!(target: LOG_TARGET, controller_id = %self.id, "Extraction started.");
        let mut stalls = 0u32;
        loop {
            if shutdown_signalled(&mut shutdown_rx) {
                break;
            }
            let mut guard = tokio::select! {
                _ = shutdown_rx.recv() => break,
                guard = self.core.lock() => guard,
            };
            let Some(core) = guard.as_mut() else { break };

            let data = if !core.pending.is_empty() {
                std::mem::take(&mut core.pending)
            } else if let Some(primed) = core.primed.take() {
                primed
            } else if core.eos_reached {
                let written_ms = core.sink.written_ms();
                let position_ms = core.sink.position_ms();
                let armed = core.soft_stop_armed;
                core.soft_stop_armed = true;
                drop(guard);
                if !armed || self.duration().is_none() {
                    self.arm_soft_stop_at_end(epoch, written_ms, position_ms);
                }
                break;
            } else {
                match core.pipeline.extract_next_buffer(&mut core.sink, &mut shutdown_rx).await {
                    Ok(Extracted::Chunk(bytes)) => {
                        stalls = 0;
                        bytes
                    }
                    Ok(Extracted::EndOfStream(bytes)) => {
                        core.eos_reached = true;
                        bytes
                    }
                    Ok(Extracted::Stalled) => {
                        stalls += 1;
                        if stalls >= MAX_CONSECUTIVE_STALLS {
                            self.warn(EngineWarning::DecoderStalled);
                            core.eos_reached = true;
                        }
                        continue;
                    }
                    Err(AudioError::ShutdownRequested) => break,
                    Err(e) => {
                        drop(guard);
                        self.fail(&e, false);
                        break;
                    }
                }
            };
            if data.is_empty() {
                continue;
            }

            let outcome = core.sink.write(&data, &mut shutdown_rx).await;
            self.position_ms.store(core.sink.position_ms(), Ordering::Release);
            match outcome {
                Ok(WriteOutcome::Ok(written)) => {
                    if written > 0 {
                        self.fail_streak.store(0, Ordering::Release);
                        self.on_audio_written(core, epoch);
                    }
                }
                Ok(WriteOutcome::Overshoot { written }) => {
                    core.pending = data[written..].to_vec();
                    if written > 0 {
                        self.fail_streak.store(0, Ordering::Release);
                        self.on_audio_written(core, epoch);
                    }
                }
                Ok(WriteOutcome::Interrupted { written }) => {
                    core.pending = data[written..].to_vec();
                    break;
                }
                Ok(WriteOutcome::Error(warning)) => self.warn(warning),
                Ok(WriteOutcome::Fail) => {
                    drop(guard);
                    self.on_write_failed(epoch);
                    break;
                }
                Err(e) => {
                    warn!(target: LOG_TARGET, controller_id = %self.id, "Write failed: {}", e);
                    drop(guard);
                    self.on_write_failed(epoch);
                    break;
                }
            }
        }
        trace!(target: LOG_TARGET, controller_id = %self.id, "Extraction finished.");
    }

    fn duration(&self) -> Option<u64> {
        *lock_unpoisoned(&self.duration_ms)
    }

    /// The first confirmed write starts the clock: `InitPlay` becomes
    /// `Playing` and the soft stop is armed.
    fn on_audio_written(self: &Arc<Self>, core: &mut Core, epoch: u64) {
        if self.current_epoch() != epoch {
            return;
        }
        if self.state() == PlaybackState::InitPlay {
            self.set_state(PlaybackState::Playing);
        }
        if !core.soft_stop_armed {
            if let Some(duration_ms) = self.duration() {
                core.soft_stop_armed = true;
                self.arm_soft_stop(epoch, Duration::from_millis(duration_ms), duration_ms);
            }
        }
    }

    /// Soft stop for a stream whose length was only known at its end.
    fn arm_soft_stop_at_end(self: &Arc<Self>, epoch: u64, written_ms: u64, position_ms: u64) {
        if self.current_epoch() != epoch {
            return;
        }
        let target_ms = self.duration().unwrap_or(written_ms);
        let delay = Duration::from_millis(target_ms.saturating_sub(position_ms));
        self.arm_soft_stop(epoch, delay, target_ms);
    }

    fn arm_soft_stop(self: &Arc<Self>, epoch: u64, delay: Duration, target_ms: u64) {
        let shared = Arc::clone(self);
        let task = TaskManager::spawn(format!("soft-stop-{}", self.id), move |shutdown_rx| async move {
            soft_stop::run(shared, epoch, delay, target_ms, shutdown_rx).await;
        });
        self.install_task(TaskSlot::SoftStop, task);
    }

    fn on_write_failed(self: &Arc<Self>, epoch: u64) {
        let streak = self.fail_streak.fetch_add(1, Ordering::AcqRel) + 1;
        self.warn(EngineWarning::OutputStalled);
        if streak > 1 {
            self.fail(&AudioError::Device(DeviceError::Other("output stalled again after reset".to_string())), false);
            return;
        }
        let shared = Arc::clone(self);
        let task = TaskManager::spawn(format!("recover-{}", self.id), move |shutdown_rx| async move {
            shared.run_recovery(epoch, shutdown_rx).await;
        });
        self.install_task(TaskSlot::Recovery, task);
    }

    /// Rebuilds the device and plays again from the start.
    async fn run_recovery(self: Arc<Self>, epoch: u64, mut shutdown_rx: broadcast::Receiver<()>) {
        let _op = tokio::select! {
            _ = shutdown_rx.recv() => return,
            guard = self.op_lock.lock() => guard,
        };
        if self.current_epoch() != epoch || !self.state().is_active() {
            return;
        }
        info!(target: LOG_TARGET, controller_id = %self.id, "Resetting {} after output failure.", self.label);
        self.bump_epoch();
        self.cancel_playback_tasks(Caller::Recovery).await;

        let reset = {
            let mut guard = self.core.lock().await;
            match guard.as_mut() {
                Some(core) => {
                    if let Err(e) = core.sink.stop().await {
                        debug!(target: LOG_TARGET, controller_id = %self.id, "Stopping stalled sink failed: {}", e);
                    }
                    core.clear_stream();
                    match core.sink.reset_device().await {
                        Ok(()) => core.pipeline.rewind(),
                        Err(e) => Err(e),
                    }
                }
                None => Err(AudioError::InvalidState("controller has no stream".to_string())),
            }
        };
        if let Err(e) = reset {
            self.fail(&e, false);
            return;
        }
        self.position_ms.store(0, Ordering::Release);
        self.set_state(PlaybackState::Stopped);
        if self.prime_now().await.is_err() {
            return;
        }
        if let Err(e) = self.start_playback().await {
            warn!(target: LOG_TARGET, controller_id = %self.id, "Replay after reset failed: {}", e);
        }
    }

    /// A device that refuses to pause is stopped instead, ending in `Ready`.
    async fn pause_locked(&self) -> Result<(), AudioError> {
        match self.state() {
            PlaybackState::Playing => {}
            PlaybackState::Released => return Err(AudioError::Released),
            other => return Err(AudioError::InvalidState(format!("cannot pause while {}", other))),
        }
        self.bump_epoch();
        self.cancel_playback_tasks(Caller::External).await;
        let paused = {
            let mut guard = self.core.lock().await;
            let core = guard
                .as_mut()
                .ok_or_else(|| AudioError::InvalidState("controller has no stream".to_string()))?;
            core.sink.pause().await.map(|()| core.sink.position_ms())
        };
        let elapsed = match paused {
            Ok(elapsed) => elapsed,
            Err(e) => {
                warn!(target: LOG_TARGET, controller_id = %self.id, "Pause failed, stopping instead: {}", e);
                self.warn(EngineWarning::from(&e));
                return self.stop_locked(Caller::External).await;
            }
        };
        self.elapsed_at_pause_ms.store(elapsed, Ordering::Release);
        self.position_ms.store(elapsed, Ordering::Release);
        self.set_state(PlaybackState::Paused);
        Ok(())
    }

    async fn resume_locked(self: &Arc<Self>) -> Result<(), AudioError> {
        match self.state() {
            PlaybackState::Paused => {}
            PlaybackState::Released => return Err(AudioError::Released),
            other => return Err(AudioError::InvalidState(format!("cannot resume while {}", other))),
        }
        let epoch = self.bump_epoch();
        let elapsed = self.elapsed_at_pause_ms.load(Ordering::Acquire);
        let stream_written = {
            let mut guard = self.core.lock().await;
            let core = guard
                .as_mut()
                .ok_or_else(|| AudioError::InvalidState("controller has no stream".to_string()))?;
            match core.sink.resume().await {
                Ok(()) => {
                    core.soft_stop_armed = true;
                    Ok(core.eos_reached && core.pending.is_empty() && core.primed.is_none())
                }
                Err(e) => Err(e),
            }
        };
        let stream_written = match stream_written {
            Ok(written) => written,
            Err(e) => {
                warn!(target: LOG_TARGET, controller_id = %self.id, "Resume failed, rewinding: {}", e);
                self.warn(EngineWarning::from(&e));
                return self.prepare_locked(true).await;
            }
        };
        self.set_state(PlaybackState::Playing);

        match self.duration() {
            Some(duration_ms) => {
                let remaining = Duration::from_millis(duration_ms.saturating_sub(elapsed));
                self.arm_soft_stop(epoch, remaining, duration_ms);
            }
            None if stream_written => {
                let (written_ms, position_ms) = match self.core.lock().await.as_ref() {
                    Some(core) => (core.sink.written_ms(), core.sink.position_ms()),
                    None => (elapsed, elapsed),
                };
                self.arm_soft_stop_at_end(epoch, written_ms, position_ms);
            }
            // Extraction arms it at end of stream.
            None => {
                if let Some(core) = self.core.lock().await.as_mut() {
                    core.soft_stop_armed = false;
                }
            }
        }
        self.spawn_extraction(epoch);
        Ok(())
    }

    async fn stop_locked(&self, caller: Caller) -> Result<(), AudioError> {
        match self.state() {
            PlaybackState::Playing | PlaybackState::InitPlay => {}
            PlaybackState::Released => return Err(AudioError::Released),
            other => return Err(AudioError::InvalidState(format!("cannot stop while {}", other))),
        }
        self.bump_epoch();
        self.cancel_playback_tasks(caller).await;
        self.cancel_task(TaskSlot::Recovery, caller).await;
        self.fail_streak.store(0, Ordering::Release);

        {
            let mut guard = self.core.lock().await;
            if let Some(core) = guard.as_mut() {
                self.position_ms.store(core.sink.position_ms(), Ordering::Release);
                if let Err(e) = core.sink.stop().await {
                    warn!(target: LOG_TARGET, controller_id = %self.id, "Sink stop failed: {}", e);
                }
            }
        }
        self.set_state(PlaybackState::Stopped);

        if self.one_shot {
            self.release_locked(caller).await;
            return Ok(());
        }

        {
            let mut guard = self.core.lock().await;
            let core = guard
                .as_mut()
                .ok_or_else(|| AudioError::InvalidState("controller has no stream".to_string()))?;
            core.clear_stream();
            if let Err(e) = core.pipeline.rewind() {
                drop(guard);
                self.fail(&e, false);
                return Err(e);
            }
        }
        self.prime_now().await
    }

    async fn restart_locked(self: &Arc<Self>, deadline: Instant) -> Result<bool, AudioError> {
        if !self.state().is_active() {
            return self.play_locked(deadline).await;
        }
        let epoch = self.bump_epoch();
        self.cancel_playback_tasks(Caller::External).await;
        let replayed = {
            let mut guard = self.core.lock().await;
            let core = guard
                .as_mut()
                .ok_or_else(|| AudioError::InvalidState("controller has no stream".to_string()))?;
            if let Err(e) = core.sink.stop().await {
                warn!(target: LOG_TARGET, controller_id = %self.id, "Sink stop before restart failed: {}", e);
                self.warn(EngineWarning::from(&e));
            }
            core.clear_stream();
            if let Err(e) = core.pipeline.rewind() {
                drop(guard);
                self.fail(&e, false);
                return Err(e);
            }
            core.sink.play().await
        };
        self.position_ms.store(0, Ordering::Release);
        if let Err(e) = replayed {
            warn!(target: LOG_TARGET, controller_id = %self.id, "Restart could not start output: {}", e);
            self.on_write_failed(epoch);
            return Ok(false);
        }
        debug!(target: LOG_TARGET, controller_id = %self.id, "Restarted from the beginning.");
        self.spawn_extraction(epoch);
        Ok(true)
    }

    async fn change_buffer_size_locked(&self, buffer_size: usize) -> Result<(), AudioError> {
        if self.buffer_size.swap(buffer_size, Ordering::AcqRel) == buffer_size {
            return Ok(());
        }
        let paused = self.state() == PlaybackState::Paused;
        let mut guard = self.core.lock().await;
        if let Some(core) = guard.as_mut() {
            let total = buffer_size * core.pipeline.format().channels.max(1);
            core.pipeline.set_buffer_size(total);
            core.sink.set_buffer_size(total, paused).await?;
            info!(target: LOG_TARGET, controller_id = %self.id, "Buffer size now {} bytes.", total);
        }
        Ok(())
    }

    async fn release_locked(&self, caller: Caller) {
        if self.state() == PlaybackState::Released {
            return;
        }
        self.bump_epoch();
        self.cancel_playback_tasks(caller).await;
        self.cancel_task(TaskSlot::Prime, caller).await;
        self.cancel_task(TaskSlot::Recovery, caller).await;

        let core = self.core.lock().await.take();
        if let Some(mut core) = core {
            core.sink.release().await;
            // Dropping the pipeline returns the decoder lease.
            drop(core);
        }
        self.set_state(PlaybackState::Released);
        lock_unpoisoned(&self.events).take();
        debug!(target: LOG_TARGET, controller_id = %self.id, "Released.");
    }
}

#[async_trait]
impl SoftStopTarget for Shared {
    fn current_epoch(&self) -> u64 {
        Shared::current_epoch(self)
    }

    async fn head(&self, shutdown_rx: &mut broadcast::Receiver<()>) -> Option<(u64, u64)> {
        let guard = tokio::select! {
            _ = shutdown_rx.recv() => return None,
            guard = self.core.lock() => guard,
        };
        guard
            .as_ref()
            .map(|core| (core.sink.playback_head_position(), core.sink.position_ms()))
    }

    async fn stop_for_soft_stop(&self, epoch: u64, shutdown_rx: &mut broadcast::Receiver<()>) {
        let _op = tokio::select! {
            _ = shutdown_rx.recv() => return,
            guard = self.op_lock.lock() => guard,
        };
        if Shared::current_epoch(self) != epoch {
            return;
        }
        debug!(target: LOG_TARGET, controller_id = %self.id, "Soft stop reached end of clip.");
        if let Err(e) = self.stop_locked(Caller::SoftStop).await {
            debug!(target: LOG_TARGET, controller_id = %self.id, "Soft stop ignored: {}", e);
        }
    }
}
