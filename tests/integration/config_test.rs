//! Integration tests for configuration management
//!
//! These tests verify that settings flow from disk into the engine.

use soundboard_engine::config::{OutputBackend, Settings};
use soundboard_engine::player::RepressMode;
use soundboard_engine::{Engine, EngineContext};
use soundboard_engine::audio::device::NullDeviceFactory;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

#[cfg(test)]
mod config_integration_tests {
    use super::*;

    /// Test complete configuration workflow
    #[test]
    fn test_config_lifecycle() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let config_path = dir.path().join("soundboard").join("config.json");

        let mut settings = Settings::default();
        settings.buffer_size = 16_384;
        settings.repress_mode = RepressMode::Restart;
        settings.output_backend = OutputBackend::Alsa;
        settings.alsa_device = "plughw:0,0".to_string();

        settings.validate()?;
        settings.save(&config_path)?;

        let loaded = Settings::load(&config_path)?;
        assert_eq!(loaded, settings);

        let mut updated = loaded;
        updated.play_timeout_ms = 1200;
        updated.save(&config_path)?;

        let reloaded = Settings::load(&config_path)?;
        assert_eq!(reloaded.play_timeout_ms, 1200);
        assert_eq!(reloaded.repress_mode, RepressMode::Restart);
        Ok(())
    }

    /// Test invalid configuration handling
    #[test]
    fn test_invalid_config_validation() {
        let too_small = Settings {
            buffer_size: 16,
            ..Settings::default()
        };
        let result = too_small.validate();
        assert!(result.is_err());
        if let Err(e) = result {
            assert!(e.to_string().contains("Buffer size 16"));
        }

        let no_timeout = Settings {
            play_timeout_ms: 0,
            ..Settings::default()
        };
        assert!(no_timeout.validate().is_err());
    }

    #[test]
    fn test_engine_takes_settings() {
        let settings = Settings {
            play_timeout_ms: 750,
            ..Settings::default()
        };
        let engine = Engine::from_settings(EngineContext::with_devices(Arc::new(NullDeviceFactory)), &settings);
        assert_eq!(engine.play_timeout(), Duration::from_millis(750));
        assert!(engine.handles().is_empty());
    }
}
