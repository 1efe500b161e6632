//! Configuration management

mod settings;

pub use settings::{ConfigError, OutputBackend, Settings, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
