//! Integration tests for the `Engine` facade

use crate::test_utils::{next_event, recording_context, wait_for_voice, write_s16_wav};
use soundboard_engine::audio::error::AudioError;
use soundboard_engine::config::Settings;
use soundboard_engine::player::{PlaybackState, RepressMode, VoiceEvent};
use soundboard_engine::{Engine, Sound};
use std::error::Error;
use std::time::Duration;
use tempfile::tempdir;

#[cfg(test)]
mod engine_integration_tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(3);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_voices_get_distinct_handles() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let first = dir.path().join("first.wav");
        let second = dir.path().join("second.wav");
        write_s16_wav(&first, 1, 250)?;
        write_s16_wav(&second, 2, 250)?;
        let (ctx, _recording) = recording_context();
        let engine = Engine::new(ctx);

        let a = engine.create_voice(Sound::from_path(1, &first), 4096).await?;
        let b = engine.create_voice(Sound::from_path(2, &second), 4096).await?;
        assert_ne!(a, b);
        assert_eq!(engine.handles(), vec![a, b]);
        assert_eq!(engine.voice(b)?.sound().name, "second");

        engine.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_toggle_without_deadline_uses_play_timeout() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        write_s16_wav(&path, 2, 250)?;
        let (ctx, recording) = recording_context();
        let engine = Engine::new(ctx);
        assert_eq!(engine.play_timeout(), Duration::from_millis(500));

        let handle = engine.create_voice(Sound::from_path(1, &path), 4096).await?;
        let mut events = engine.subscribe(handle)?;
        engine.toggle_play(handle, None).await?;

        let playing = next_event(&mut events, WAIT, |e| {
            matches!(e, VoiceEvent::StateChanged { state: PlaybackState::Playing, .. })
        })
        .await;
        assert!(playing.is_some());

        let voice = engine.voice(handle)?;
        assert!(wait_for_voice(&voice, PlaybackState::Ready, WAIT).await);
        assert_eq!(recording.segments().len(), 1);

        engine.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_settings_choose_the_initial_repress_mode() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        write_s16_wav(&path, 1, 250)?;
        let (ctx, _recording) = recording_context();
        let settings = Settings {
            repress_mode: RepressMode::Overlap,
            ..Settings::default()
        };
        let engine = Engine::from_settings(ctx, &settings);

        let handle = engine.create_voice(Sound::from_path(1, &path), 4096).await?;
        assert_eq!(engine.voice(handle)?.repress_mode(), RepressMode::Overlap);

        engine.set_repress_mode(handle, RepressMode::Restart).await?;
        engine.set_volume(handle, 55).await?;
        engine.change_buffer_size(handle, 8192).await?;
        let voice = engine.voice(handle)?;
        assert_eq!(voice.repress_mode(), RepressMode::Restart);
        assert_eq!(voice.volume(), 55);
        assert_eq!(voice.buffer_size(), 8192);

        engine.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_handle_is_rejected() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        write_s16_wav(&path, 1, 250)?;
        let (ctx, _recording) = recording_context();
        let engine = Engine::new(ctx);
        let handle = engine.create_voice(Sound::from_path(1, &path), 4096).await?;

        let other = Engine::new(recording_context().0);
        assert!(matches!(other.toggle_play(handle, None).await, Err(AudioError::UnknownVoice(_))));
        assert!(matches!(other.release(handle).await, Err(AudioError::UnknownVoice(_))));
        assert!(matches!(other.state(handle), Err(AudioError::UnknownVoice(_))));

        engine.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_released_handle_stays_released() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        write_s16_wav(&path, 1, 250)?;
        let (ctx, _recording) = recording_context();
        let engine = Engine::new(ctx);
        let handle = engine.create_voice(Sound::from_path(1, &path), 4096).await?;
        let kept = engine.create_voice(Sound::from_path(2, &path), 4096).await?;
        assert!(wait_for_voice(&engine.voice(handle)?, PlaybackState::Ready, WAIT).await);

        engine.release(handle).await?;
        engine.release(handle).await?;

        assert!(matches!(engine.state(handle), Err(AudioError::Released)));
        assert!(matches!(engine.toggle_play(handle, None).await, Err(AudioError::Released)));
        assert!(matches!(engine.set_volume(handle, 10).await, Err(AudioError::Released)));
        assert!(matches!(engine.subscribe(handle), Err(AudioError::Released)));
        // The voice is dropped from the registry; the other one is untouched.
        assert_eq!(engine.handles(), vec![kept]);
        assert!(engine.voice(kept).is_ok());
        engine.toggle_play(kept, None).await?;

        engine.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_releases_every_voice() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        write_s16_wav(&path, 1, 1000)?;
        let (ctx, _recording) = recording_context();
        let engine = Engine::new(ctx);
        let a = engine.create_voice(Sound::from_path(1, &path), 4096).await?;
        let b = engine.create_voice(Sound::from_path(2, &path), 4096).await?;
        let voice_a = engine.voice(a)?;
        let voice_b = engine.voice(b)?;
        engine.toggle_play(a, None).await?;

        engine.shutdown().await;
        assert!(voice_a.is_released());
        assert!(voice_b.is_released());
        assert_eq!(voice_a.state(), PlaybackState::Released);
        assert!(matches!(engine.state(b), Err(AudioError::Released)));
        assert!(engine.handles().is_empty());
        assert!(engine.release(a).await.is_ok());
        Ok(())
    }
}
