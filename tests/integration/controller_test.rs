//! Integration tests for the playback controller
//!
//! Controllers play real WAV files into recording devices so the exact
//! bytes reaching the output can be checked.

use crate::test_utils::{deadline, recording_context, to_le_bytes, write_f32_wav, write_s16_wav, PinnedFactory};
use soundboard_engine::player::{ControllerConfig, ControllerEvent, PlaybackController, PlaybackState};
use soundboard_engine::EngineContext;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

#[cfg(test)]
mod controller_integration_tests {
    use super::*;

    const CLIP_MS: u64 = 250;
    /// Lets the soft stop land a little early or late.
    const JITTER: Duration = Duration::from_millis(60);

    fn controller(path: &Path, ctx: EngineContext) -> (PlaybackController, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = PlaybackController::new(
            ControllerConfig {
                label: "clip".to_string(),
                path: path.to_path_buf(),
                buffer_size: 4096,
                volume: 100,
                one_shot: false,
            },
            ctx,
            tx,
        );
        (controller, rx)
    }

    async fn wait_for(rx: &mut watch::Receiver<PlaybackState>, want: PlaybackState, limit: Duration) -> bool {
        let end = Instant::now() + limit;
        loop {
            if *rx.borrow_and_update() == want {
                return true;
            }
            if tokio::time::timeout_at(end, rx.changed()).await.is_err() {
                return false;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_play_reaches_ready_within_clip_length() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        let samples = write_s16_wav(&path, 2, CLIP_MS)?;
        let (ctx, recording) = recording_context();
        let (controller, _events) = controller(&path, ctx);
        let mut state_rx = controller.subscribe_state();

        controller.prepare().await?;
        assert!(wait_for(&mut state_rx, PlaybackState::Ready, Duration::from_secs(2)).await);

        let started = Instant::now();
        assert!(controller.play(deadline()).await?);
        assert!(wait_for(&mut state_rx, PlaybackState::Playing, Duration::from_secs(1)).await);
        assert!(wait_for(&mut state_rx, PlaybackState::Ready, Duration::from_secs(3)).await);

        let elapsed = started.elapsed();
        assert!(elapsed + JITTER >= Duration::from_millis(CLIP_MS), "stopped early: {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(CLIP_MS) + Duration::from_secs(1), "stopped late: {:?}", elapsed);

        let segments = recording.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0], to_le_bytes(&samples));

        controller.release().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_replays_identical_audio() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        let expected = to_le_bytes(&write_s16_wav(&path, 1, CLIP_MS)?);
        let (ctx, recording) = recording_context();
        let (controller, _events) = controller(&path, ctx);
        let mut state_rx = controller.subscribe_state();

        controller.prepare_and_prime().await?;
        controller.play(deadline()).await?;
        assert!(wait_for(&mut state_rx, PlaybackState::Playing, Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(controller.restart(deadline()).await?);
        assert!(wait_for(&mut state_rx, PlaybackState::Ready, Duration::from_secs(3)).await);

        let segments = recording.segments();
        assert_eq!(segments.len(), 2);
        assert!(!segments[0].is_empty());
        assert!(expected.starts_with(&segments[0]));
        assert_eq!(segments[1], expected);

        controller.release().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_holds_position_until_resume() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        let expected = to_le_bytes(&write_s16_wav(&path, 2, CLIP_MS)?);
        let (ctx, recording) = recording_context();
        let (controller, _events) = controller(&path, ctx);
        let mut state_rx = controller.subscribe_state();

        controller.prepare_and_prime().await?;
        controller.play(deadline()).await?;
        assert!(wait_for(&mut state_rx, PlaybackState::Playing, Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(80)).await;

        controller.pause().await?;
        let paused_at = controller.position_ms();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(controller.state(), PlaybackState::Paused);
        assert_eq!(controller.position_ms(), paused_at);

        controller.resume().await?;
        assert!(wait_for(&mut state_rx, PlaybackState::Ready, Duration::from_secs(3)).await);

        let segments = recording.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0], expected);

        controller.release().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resume_stops_after_the_remaining_time() -> Result<(), Box<dyn Error>> {
        const LONG_CLIP_MS: u64 = 1200;
        let dir = tempdir()?;
        let path = dir.path().join("long.wav");
        write_s16_wav(&path, 2, LONG_CLIP_MS)?;
        let (ctx, _recording) = recording_context();
        let (controller, _events) = controller(&path, ctx);
        let mut state_rx = controller.subscribe_state();

        controller.prepare_and_prime().await?;
        controller.play(deadline()).await?;
        assert!(wait_for(&mut state_rx, PlaybackState::Playing, Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(700)).await;

        controller.pause().await?;
        let paused_at = controller.position_ms();
        assert!(paused_at >= 500 && paused_at < LONG_CLIP_MS, "paused at {}", paused_at);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let resumed = Instant::now();
        controller.resume().await?;
        assert!(wait_for(&mut state_rx, PlaybackState::Ready, Duration::from_secs(3)).await);
        let took = resumed.elapsed();

        let remaining = Duration::from_millis(LONG_CLIP_MS - paused_at);
        assert!(took + JITTER >= remaining, "stopped early: {:?} of {:?}", took, remaining);
        assert!(took <= remaining + Duration::from_millis(250), "stopped late: {:?} of {:?}", took, remaining);
        // Far short of a full-length timer.
        assert!(took < Duration::from_millis(LONG_CLIP_MS - 400));

        controller.release().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_buffer_change_while_playing_keeps_every_byte() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        let expected = to_le_bytes(&write_s16_wav(&path, 2, 400)?);
        let (ctx, recording) = recording_context();
        let (controller, _events) = controller(&path, ctx);
        let mut state_rx = controller.subscribe_state();

        controller.prepare_and_prime().await?;
        controller.play(deadline()).await?;
        assert!(wait_for(&mut state_rx, PlaybackState::Playing, Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(100)).await;

        controller.change_buffer_size(16_384).await?;
        assert!(recording.devices_opened() >= 2);
        assert!(wait_for(&mut state_rx, PlaybackState::Ready, Duration::from_secs(3)).await);

        let segments = recording.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].len(), expected.len());
        assert_eq!(segments[0], expected);

        controller.release().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_decoded_stream_plays_to_end() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("float.wav");
        write_f32_wav(&path, 2, CLIP_MS)?;
        let (ctx, recording) = recording_context();
        let (controller, _events) = controller(&path, ctx);
        let mut state_rx = controller.subscribe_state();

        controller.prepare_and_prime().await?;
        assert_eq!(controller.duration_ms(), Some(CLIP_MS));
        controller.play(deadline()).await?;
        assert!(wait_for(&mut state_rx, PlaybackState::Ready, Duration::from_secs(3)).await);

        let audio_bytes = (44_100 * CLIP_MS / 1000) as usize * 4;
        let segments = recording.segments();
        assert_eq!(segments.len(), 1);
        assert!(segments[0].len() >= audio_bytes);

        controller.release().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pinned_output_ends_in_error() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.wav");
        write_s16_wav(&path, 2, CLIP_MS)?;
        let (controller, mut events) = controller(&path, EngineContext::with_devices(Arc::new(PinnedFactory)));
        let mut state_rx = controller.subscribe_state();

        controller.prepare_and_prime().await?;
        controller.play(deadline()).await?;
        assert!(wait_for(&mut state_rx, PlaybackState::Error, Duration::from_secs(5)).await);

        let message = controller.error_message().ok_or("no error message")?;
        assert!(message.contains("output stalled again after reset"), "{}", message);

        let mut states = Vec::new();
        let mut stall_warnings = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                ControllerEvent::StateChanged { state, .. } => states.push(state),
                ControllerEvent::Warning { message, .. } if message == "Audio output stalled, resetting sound" => {
                    stall_warnings += 1
                }
                ControllerEvent::Error { setup, .. } => assert!(!setup),
                _ => {}
            }
        }
        assert_eq!(stall_warnings, 2);
        assert!(states.contains(&PlaybackState::Stopped));
        assert_eq!(states.last(), Some(&PlaybackState::Error));

        controller.release().await;
        assert_eq!(controller.state(), PlaybackState::Released);
        Ok(())
    }
}
