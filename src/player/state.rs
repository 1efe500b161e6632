use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a playback controller, and the aggregated state of a voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Initializing,
    Ready,
    /// Playback requested; the first chunk has not reached the device yet.
    InitPlay,
    Playing,
    Paused,
    Stopped,
    Released,
    Error,
}

impl PlaybackState {
    /// Playing for the purpose of repress handling.
    pub fn is_active(self) -> bool {
        matches!(self, PlaybackState::Playing | PlaybackState::InitPlay)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlaybackState::Initializing => "initializing",
            PlaybackState::Ready => "ready",
            PlaybackState::InitPlay => "init_play",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Stopped => "stopped",
            PlaybackState::Released => "released",
            PlaybackState::Error => "error",
        };
        f.write_str(s)
    }
}

/// What pressing an already playing sound does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepressMode {
    #[default]
    Stop,
    Restart,
    Overlap,
    Pause,
}

impl fmt::Display for RepressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RepressMode::Stop => "stop",
            RepressMode::Restart => "restart",
            RepressMode::Overlap => "overlap",
            RepressMode::Pause => "pause",
        };
        f.write_str(s)
    }
}

impl FromStr for RepressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop" => Ok(RepressMode::Stop),
            "restart" => Ok(RepressMode::Restart),
            "overlap" => Ok(RepressMode::Overlap),
            "pause" => Ok(RepressMode::Pause),
            other => Err(format!(
                "unknown repress mode '{}' (expected stop, restart, overlap or pause)",
                other
            )),
        }
    }
}

/// Events a controller sends to the voice that owns it.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    StateChanged {
        controller: Uuid,
        state: PlaybackState,
        position_ms: u64,
    },
    Warning { controller: Uuid, message: String },
    /// `setup` is true when the controller never got as far as playing.
    Error {
        controller: Uuid,
        message: String,
        setup: bool,
    },
    Prepared {
        controller: Uuid,
        duration_ms: Option<u64>,
    },
}

/// Events a voice broadcasts to its subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    StateChanged { state: PlaybackState, position_ms: u64 },
    Warning(String),
    Error(String),
    DurationChanged(u64),
}
