//! Playback control: per-stream controllers and the voices built on them.

pub mod controller;
pub mod soft_stop;
pub mod state;
pub mod task_manager;
pub mod voice;


pub use controller::{ControllerConfig, PlaybackController};
pub use state::{ControllerEvent, PlaybackState, RepressMode, VoiceEvent};
pub use task_manager::TaskManager;
pub use voice::SoundPlayer;

use std::sync::{Mutex, MutexGuard};

/// Locks a std mutex, ignoring poisoning. Guarded values here are plain
/// data that stays valid if a holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
