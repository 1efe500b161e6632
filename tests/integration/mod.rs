//! Integration tests module
//!
//! This module organizes all integration tests for the soundboard engine.

pub mod audio_test;
pub mod config_test;
pub mod controller_test;
pub mod engine_test;
pub mod voice_test;
