use std::error::Error;
use std::io;
use symphonia::core::errors::Error as SymphoniaError;

/// Error types raised by the replay engine.
#[derive(Debug)]
pub enum AudioError {
    /// The container holds no audio track.
    NoAudioTrack,
    /// The audio track's encoding could not be determined.
    UnknownEncoding(String),
    /// No decoder could be constructed for the track's codec.
    NoSuitableDecoder(String),
    /// The output device could not be built for the requested format.
    OutputBuild(String),
    /// An output device call failed.
    Device(DeviceError),
    DecodingError(String),
    SymphoniaError(SymphoniaError),
    IoError(io::Error),
    /// A device or decoder call, or a play attempt, ran past its time bound.
    Timeout(String),
    InvalidState(String),
    /// The voice or controller has been released.
    Released,
    /// No voice is registered under the given handle.
    UnknownVoice(u64),
    TaskJoinError(String),
    /// The running task was asked to shut down.
    ShutdownRequested,
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoAudioTrack => write!(f, "No audio track found"),
            AudioError::UnknownEncoding(s) => write!(f, "Could not determine encoding: {}", s),
            AudioError::NoSuitableDecoder(s) => write!(f, "No suitable decoder: {}", s),
            AudioError::OutputBuild(s) => write!(f, "Could not build audio output: {}", s),
            AudioError::Device(e) => write!(f, "Audio output error: {}", e),
            AudioError::DecodingError(s) => write!(f, "Decoding error: {}", s),
            AudioError::SymphoniaError(e) => write!(f, "Symphonia error: {}", e),
            AudioError::IoError(e) => write!(f, "I/O error: {}", e),
            AudioError::Timeout(s) => write!(f, "Timed out: {}", s),
            AudioError::InvalidState(s) => write!(f, "Invalid state: {}", s),
            AudioError::Released => write!(f, "Voice has been released"),
            AudioError::UnknownVoice(id) => write!(f, "Unknown voice handle: {}", id),
            AudioError::TaskJoinError(e) => write!(f, "Async task join error: {}", e),
            AudioError::ShutdownRequested => write!(f, "Shutdown requested"),
        }
    }
}

impl Error for AudioError {}

impl AudioError {
    /// Setup errors are fatal for a controller and are never retried.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            AudioError::NoAudioTrack
                | AudioError::UnknownEncoding(_)
                | AudioError::NoSuitableDecoder(_)
                | AudioError::OutputBuild(_)
                | AudioError::SymphoniaError(_)
                | AudioError::IoError(_)
        )
    }
}

// --- From Implementations for AudioError ---

impl From<SymphoniaError> for AudioError {
    fn from(e: SymphoniaError) -> Self {
        AudioError::SymphoniaError(e)
    }
}

impl From<io::Error> for AudioError {
    fn from(e: io::Error) -> Self {
        AudioError::IoError(e)
    }
}

impl From<tokio::task::JoinError> for AudioError {
    fn from(e: tokio::task::JoinError) -> Self {
        AudioError::TaskJoinError(e.to_string())
    }
}

impl From<DeviceError> for AudioError {
    fn from(e: DeviceError) -> Self {
        AudioError::Device(e)
    }
}

/// Error codes an output device can report for a single call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    BadValue,
    DeadObject,
    NotInitialized,
    Other(String),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::BadValue => write!(f, "bad value"),
            DeviceError::DeadObject => write!(f, "dead object"),
            DeviceError::NotInitialized => write!(f, "not properly initialized"),
            DeviceError::Other(s) => write!(f, "{}", s),
        }
    }
}

impl Error for DeviceError {}

/// Non-fatal conditions reported to listeners as warning messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineWarning {
    OutputBadValue,
    OutputDeadObject,
    OutputNotInitialized,
    Output(String),
    /// The device stopped consuming audio; the voice is being reset.
    OutputStalled,
    /// A play attempt was abandoned because its deadline passed.
    Timeout,
    /// The decoder produced nothing within its poll budget.
    DecoderStalled,
}

impl From<&DeviceError> for EngineWarning {
    fn from(e: &DeviceError) -> Self {
        match e {
            DeviceError::BadValue => EngineWarning::OutputBadValue,
            DeviceError::DeadObject => EngineWarning::OutputDeadObject,
            DeviceError::NotInitialized => EngineWarning::OutputNotInitialized,
            DeviceError::Other(s) => EngineWarning::Output(s.clone()),
        }
    }
}

/// Warning for a device call that failed outside the write path.
impl From<&AudioError> for EngineWarning {
    fn from(e: &AudioError) -> Self {
        match e {
            AudioError::Device(device) => EngineWarning::from(device),
            other => EngineWarning::Output(other.to_string()),
        }
    }
}

impl std::fmt::Display for EngineWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineWarning::OutputBadValue => write!(f, "Audio output: bad value"),
            EngineWarning::OutputDeadObject => write!(f, "Audio output: dead object"),
            EngineWarning::OutputNotInitialized => write!(f, "Audio output: not properly initialized"),
            EngineWarning::Output(s) => write!(f, "Error outputting audio: {}", s),
            EngineWarning::OutputStalled => write!(f, "Audio output stalled, resetting sound"),
            EngineWarning::Timeout => write!(f, "Sound took too long to start"),
            EngineWarning::DecoderStalled => write!(f, "Decoder stalled"),
        }
    }
}
