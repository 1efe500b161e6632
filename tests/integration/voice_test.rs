//! Integration tests for `SoundPlayer` repress modes and lifecycle

use crate::test_utils::{
    deadline, next_event, recording_context, to_le_bytes, wait_for_voice, write_garbage, write_s16_wav, PinnedFactory,
};
use soundboard_engine::audio::error::AudioError;
use soundboard_engine::player::{PlaybackState, RepressMode, SoundPlayer, VoiceEvent};
use soundboard_engine::{EngineContext, Sound};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

#[cfg(test)]
mod voice_integration_tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(3);

    async fn voice_for(path: &std::path::Path, mode: RepressMode, ctx: EngineContext) -> SoundPlayer {
        SoundPlayer::new(Sound::from_path(1, path), 4096, mode, ctx).await
    }

    async fn wait_for_primary(voice: &SoundPlayer, want: PlaybackState) -> bool {
        for _ in 0..600 {
            if voice.primary_state() == want {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    async fn wait_for_overlaps_gone(voice: &SoundPlayer) -> bool {
        for _ in 0..600 {
            if voice.overlap_count() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_voice_reports_duration_once_prepared() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        write_s16_wav(&path, 2, 250)?;
        let (ctx, _recording) = recording_context();

        let voice = voice_for(&path, RepressMode::Stop, ctx).await;
        assert!(wait_for_voice(&voice, PlaybackState::Ready, WAIT).await);
        assert_eq!(voice.duration_ms(), Some(250));
        assert_eq!(voice.sound().name, "clip");

        voice.release().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlap_mode_plays_a_second_copy() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        write_s16_wav(&path, 1, 400)?;
        let (ctx, recording) = recording_context();
        let voice = voice_for(&path, RepressMode::Overlap, ctx).await;
        assert!(wait_for_voice(&voice, PlaybackState::Ready, WAIT).await);

        voice.toggle_play(deadline()).await?;
        assert!(wait_for_voice(&voice, PlaybackState::Playing, WAIT).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        voice.toggle_play(deadline()).await?;
        assert_eq!(voice.overlap_count(), 1);
        voice.toggle_play(deadline()).await?;
        assert_eq!(voice.overlap_count(), 2);
        assert!(voice.primary_state().is_active());

        assert!(wait_for_voice(&voice, PlaybackState::Ready, WAIT).await);
        assert!(wait_for_overlaps_gone(&voice).await);
        assert!(recording.devices_opened() >= 3);

        voice.release().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_mode_stops_everything() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        write_s16_wav(&path, 1, 2000)?;
        let (ctx, _recording) = recording_context();
        let voice = voice_for(&path, RepressMode::Overlap, ctx).await;
        assert!(wait_for_voice(&voice, PlaybackState::Ready, WAIT).await);

        voice.toggle_play(deadline()).await?;
        voice.toggle_play(deadline()).await?;
        assert_eq!(voice.overlap_count(), 1);

        voice.set_repress_mode(RepressMode::Stop).await?;
        voice.toggle_play(deadline()).await?;
        assert!(wait_for_overlaps_gone(&voice).await);
        assert!(wait_for_voice(&voice, PlaybackState::Ready, WAIT).await);
        assert_eq!(voice.primary_state(), PlaybackState::Ready);

        voice.release().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_mode_toggles_between_paused_and_playing() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        write_s16_wav(&path, 2, 2000)?;
        let (ctx, _recording) = recording_context();
        let voice = voice_for(&path, RepressMode::Pause, ctx).await;
        assert!(wait_for_voice(&voice, PlaybackState::Ready, WAIT).await);

        voice.toggle_play(deadline()).await?;
        assert!(wait_for_primary(&voice, PlaybackState::Playing).await);

        voice.toggle_play(deadline()).await?;
        assert_eq!(voice.primary_state(), PlaybackState::Paused);

        voice.toggle_play(deadline()).await?;
        assert_eq!(voice.primary_state(), PlaybackState::Playing);

        voice.toggle_play(deadline()).await?;
        assert_eq!(voice.primary_state(), PlaybackState::Paused);

        // Leaving pause mode while paused rewinds to the start.
        voice.set_repress_mode(RepressMode::Stop).await?;
        assert_eq!(voice.repress_mode(), RepressMode::Stop);
        assert_eq!(voice.primary_state(), PlaybackState::Ready);
        assert_eq!(voice.primary().position_ms(), 0);

        voice.release().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_mode_replays_from_the_top() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        let expected = to_le_bytes(&write_s16_wav(&path, 1, 300)?);
        let (ctx, recording) = recording_context();
        let voice = voice_for(&path, RepressMode::Restart, ctx).await;
        assert!(wait_for_voice(&voice, PlaybackState::Ready, WAIT).await);

        voice.toggle_play(deadline()).await?;
        assert!(wait_for_voice(&voice, PlaybackState::Playing, WAIT).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        voice.toggle_play(deadline()).await?;
        assert_eq!(voice.overlap_count(), 0);
        assert!(wait_for_voice(&voice, PlaybackState::Ready, WAIT).await);

        let segments = recording.segments();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1], expected);

        voice.release().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_buffer_change_mid_play_is_seamless() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        let expected = to_le_bytes(&write_s16_wav(&path, 2, 400)?);
        let (ctx, recording) = recording_context();
        let voice = voice_for(&path, RepressMode::Stop, ctx).await;
        assert!(wait_for_voice(&voice, PlaybackState::Ready, WAIT).await);

        voice.toggle_play(deadline()).await?;
        assert!(wait_for_voice(&voice, PlaybackState::Playing, WAIT).await);
        tokio::time::sleep(Duration::from_millis(80)).await;

        voice.set_buffer_size(8192).await?;
        assert_eq!(voice.buffer_size(), 8192);
        assert!(wait_for_voice(&voice, PlaybackState::Ready, WAIT).await);

        let segments = recording.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0], expected);

        voice.release().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_volume_is_clamped_and_applied() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        write_s16_wav(&path, 1, 250)?;
        let (ctx, _recording) = recording_context();
        let voice = voice_for(&path, RepressMode::Stop, ctx).await;
        assert!(wait_for_voice(&voice, PlaybackState::Ready, WAIT).await);

        voice.set_volume(40).await?;
        assert_eq!(voice.volume(), 40);
        assert_eq!(voice.primary().volume(), 40);

        voice.set_volume(250).await?;
        assert_eq!(voice.volume(), 100);

        voice.release().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unreadable_file_puts_voice_in_error() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("bad.wav");
        write_garbage(&path)?;
        let (ctx, _recording) = recording_context();

        let voice = voice_for(&path, RepressMode::Stop, ctx).await;
        assert!(wait_for_voice(&voice, PlaybackState::Error, WAIT).await);
        let message = voice.error_message().ok_or("no error message")?;
        assert!(message.starts_with("Error initializing bad"), "{}", message);

        // Toggling a broken voice is not an error for the caller.
        voice.toggle_play(deadline()).await?;
        assert_eq!(voice.state(), PlaybackState::Error);

        voice.release().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_output_is_reported() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        write_s16_wav(&path, 2, 250)?;
        let voice = voice_for(&path, RepressMode::Stop, EngineContext::with_devices(Arc::new(PinnedFactory))).await;
        assert!(wait_for_voice(&voice, PlaybackState::Ready, WAIT).await);

        let mut events = voice.subscribe();
        voice.toggle_play(deadline()).await?;

        let warning = next_event(&mut events, Duration::from_secs(5), |e| matches!(e, VoiceEvent::Warning(_))).await;
        assert_eq!(
            warning,
            Some(VoiceEvent::Warning("Audio output stalled, resetting sound".to_string()))
        );
        let error = next_event(&mut events, Duration::from_secs(5), |e| matches!(e, VoiceEvent::Error(_))).await;
        match error {
            Some(VoiceEvent::Error(message)) => assert!(message.starts_with("Error playing clip"), "{}", message),
            other => panic!("expected an error event, got {:?}", other),
        }
        assert_eq!(voice.state(), PlaybackState::Error);

        voice.release().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_release_is_idempotent_and_final() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        write_s16_wav(&path, 1, 1000)?;
        let (ctx, _recording) = recording_context();
        let voice = voice_for(&path, RepressMode::Overlap, ctx).await;
        assert!(wait_for_voice(&voice, PlaybackState::Ready, WAIT).await);

        voice.toggle_play(deadline()).await?;
        voice.toggle_play(deadline()).await?;

        let mut events = voice.subscribe();
        voice.release().await;
        while events.try_recv().is_ok() {}
        voice.release().await;
        assert!(matches!(events.try_recv(), Err(tokio::sync::broadcast::error::TryRecvError::Empty)));
        assert!(voice.is_released());
        assert_eq!(voice.state(), PlaybackState::Released);
        assert_eq!(voice.primary_state(), PlaybackState::Released);
        assert_eq!(voice.overlap_count(), 0);

        assert!(matches!(voice.toggle_play(deadline()).await, Err(AudioError::Released)));
        assert!(matches!(voice.set_volume(10).await, Err(AudioError::Released)));
        Ok(())
    }
}
