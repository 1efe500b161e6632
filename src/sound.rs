use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A playable clip as the rest of the application describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sound {
    pub id: u64,
    pub name: String,
    pub path: PathBuf,
    /// Percentage, 0 to 100.
    #[serde(default = "default_volume")]
    pub volume: u8,
    /// Known clip length, used when the container does not report one.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub checksum: Option<String>,
}

fn default_volume() -> u8 {
    100
}

impl Sound {
    pub fn new(id: u64, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            path: path.into(),
            volume: default_volume(),
            duration_ms: None,
            checksum: None,
        }
    }

    /// Names the sound after its file stem.
    pub fn from_path(id: u64, path: &Path) -> Self {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::new(id, name, path)
    }

    pub fn with_volume(mut self, volume: u8) -> Self {
        self.volume = volume.min(100);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}
