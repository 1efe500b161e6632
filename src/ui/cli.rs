//! Command-line interface implementation

use clap::Parser;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;

use crate::config::{OutputBackend, Settings};
use crate::engine::VoiceHandle;
use crate::player::state::{PlaybackState, RepressMode};

/// Command-line arguments for soundboard-engine
#[derive(Parser, Debug)]
#[command(author, version, about = "Low-latency soundboard player", long_about = None)]
pub struct Args {
    /// Audio files to load, one voice each
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Config file path
    #[arg(short, long, env = "SOUNDBOARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output buffer size in bytes per channel
    #[arg(short, long, env = "SOUNDBOARD_BUFFER_SIZE")]
    pub buffer_size: Option<usize>,

    /// Repress mode applied to every voice: stop, overlap, restart or pause
    #[arg(short, long, env = "SOUNDBOARD_REPRESS_MODE")]
    pub repress_mode: Option<RepressMode>,

    /// Output backend: null or alsa
    #[arg(long, env = "SOUNDBOARD_BACKEND")]
    pub backend: Option<OutputBackend>,

    /// ALSA device to use
    #[arg(short = 'd', long, env = "SOUNDBOARD_ALSA_DEVICE")]
    pub alsa_device: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

impl Args {
    /// Overrides file settings with whatever was given on the command line.
    pub fn apply_to(&self, settings: &mut Settings) {
        if let Some(size) = self.buffer_size {
            settings.buffer_size = size;
        }
        if let Some(mode) = self.repress_mode {
            settings.repress_mode = mode;
        }
        if let Some(backend) = self.backend {
            settings.output_backend = backend;
        }
        if let Some(device) = &self.alsa_device {
            settings.alsa_device = device.clone();
        }
    }
}

/// One line of interactive input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Toggle(usize),
    Mode(usize, RepressMode),
    Volume(usize, u8),
    Buffer(usize, usize),
    Release(usize),
    List,
    Quit,
}

#[derive(Debug, PartialEq, Eq)]
pub struct CommandError(String);

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for CommandError {}

fn index(arg: Option<&str>) -> Result<usize, CommandError> {
    let raw = arg.ok_or_else(|| CommandError("missing voice number".to_string()))?;
    match raw.parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(CommandError(format!("invalid voice number '{}'", raw))),
    }
}

impl std::str::FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let head = parts
            .next()
            .ok_or_else(|| CommandError("empty command".to_string()))?
            .to_ascii_lowercase();

        let command = match head.as_str() {
            "q" | "quit" => Command::Quit,
            "l" | "list" => Command::List,
            "m" | "mode" => {
                let n = index(parts.next())?;
                let mode = parts
                    .next()
                    .ok_or_else(|| CommandError("missing repress mode".to_string()))?
                    .parse::<RepressMode>()
                    .map_err(|e| CommandError(e.to_string()))?;
                Command::Mode(n, mode)
            }
            "v" | "volume" => {
                let n = index(parts.next())?;
                let raw = parts.next().ok_or_else(|| CommandError("missing volume".to_string()))?;
                let volume = raw
                    .parse::<u8>()
                    .ok()
                    .filter(|v| *v <= 100)
                    .ok_or_else(|| CommandError(format!("volume must be 0-100, got '{}'", raw)))?;
                Command::Volume(n, volume)
            }
            "b" | "buffer" => {
                let n = index(parts.next())?;
                let raw = parts.next().ok_or_else(|| CommandError("missing buffer size".to_string()))?;
                let size = raw
                    .parse::<usize>()
                    .map_err(|_| CommandError(format!("invalid buffer size '{}'", raw)))?;
                Command::Buffer(n, size)
            }
            "r" | "release" => Command::Release(index(parts.next())?),
            _ => Command::Toggle(index(Some(head.as_str()))?),
        };

        if parts.next().is_some() {
            return Err(CommandError("too many arguments".to_string()));
        }
        Ok(command)
    }
}

/// What the voice listing shows for one voice.
#[derive(Debug, Clone)]
pub struct VoiceRow {
    pub handle: VoiceHandle,
    pub name: String,
    pub state: PlaybackState,
    pub mode: RepressMode,
    pub duration_ms: Option<u64>,
}

/// CLI user interface for interacting with the engine
pub struct Cli {
    pub args: Args,
}

impl Cli {
    /// Create a new CLI instance
    pub fn new() -> Self {
        Cli { args: Args::parse() }
    }

    pub fn display_help(&self) {
        println!("\nCommands:");
        println!("  <n>               toggle voice n");
        println!("  m <n> <mode>      set repress mode (stop, overlap, restart, pause)");
        println!("  v <n> <0-100>     set volume");
        println!("  b <n> <bytes>     change buffer size");
        println!("  r <n>             release voice n");
        println!("  l                 list voices");
        println!("  q                 quit\n");
    }

    /// Display the loaded voices
    pub fn display_voices(&self, voices: &[VoiceRow]) {
        println!("\nVoices:");
        println!("{:<5} {:<30} {:<10} {:<10} {}", "#", "Name", "State", "Mode", "Duration");
        println!("{}", "-".repeat(70));

        for (index, row) in voices.iter().enumerate() {
            let name = if row.name.len() > 28 {
                format!("{:.25}...", row.name)
            } else {
                row.name.clone()
            };
            let duration = row
                .duration_ms
                .map(|ms| format!("{}.{:03}s", ms / 1000, ms % 1000))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<5} {:<30} {:<10} {:<10} {}",
                index + 1,
                name,
                row.state.to_string(),
                row.mode.to_string(),
                duration
            );
        }
        println!();
    }

    /// Display error messages
    pub fn display_error(&self, error: &dyn Error) {
        eprintln!("Error: {}", error);
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self::new()
    }
}
