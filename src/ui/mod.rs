//! User interface module

mod cli;

pub use cli::{Args, Cli, Command, CommandError, VoiceRow};
