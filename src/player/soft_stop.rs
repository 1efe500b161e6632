//! Soft stop: ends a clip once the device has actually played all of it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace};

const LOG_TARGET: &str = "soundboard_engine::player::soft_stop";

/// What the soft stop does once its timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftStopDecision {
    StopNow,
    /// The device is behind the clip length; wait this long first.
    WaitThenStop(Duration),
}

/// Decides from the device head whether the clip is done. A head still at
/// zero means the device never started, so waiting longer will not help.
pub fn decide(head_frames: u64, head_ms: u64, target_ms: u64) -> SoftStopDecision {
    if head_frames == 0 || head_ms >= target_ms {
        SoftStopDecision::StopNow
    } else {
        SoftStopDecision::WaitThenStop(Duration::from_millis(target_ms - head_ms))
    }
}

/// The controller side of a soft stop.
#[async_trait]
pub trait SoftStopTarget: Send + Sync + 'static {
    fn current_epoch(&self) -> u64;

    /// Current head as (frames, milliseconds), `None` once released.
    async fn head(&self, shutdown_rx: &mut broadcast::Receiver<()>) -> Option<(u64, u64)>;

    /// Stops playback if `epoch` is still current.
    async fn stop_for_soft_stop(&self, epoch: u64, shutdown_rx: &mut broadcast::Receiver<()>);
}

/// Body of the soft stop task.
pub async fn run<T: SoftStopTarget>(
    target: Arc<T>,
    epoch: u64,
    delay: Duration,
    target_ms: u64,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    trace!(target: LOG_TARGET, "Soft stop armed: delay={:?}, clip={} ms", delay, target_ms);
    tokio::select! {
        _ = shutdown_rx.recv() => return,
        _ = tokio::time::sleep(delay) => {}
    }
    if target.current_epoch() != epoch {
        trace!(target: LOG_TARGET, "Soft stop is stale, ignoring.");
        return;
    }

    let (head_frames, head_ms) = match target.head(&mut shutdown_rx).await {
        Some(head) => head,
        None => return,
    };
    match decide(head_frames, head_ms, target_ms) {
        SoftStopDecision::StopNow => {}
        SoftStopDecision::WaitThenStop(shortfall) => {
            debug!(target: LOG_TARGET, "Device {} ms behind, waiting before stop.", shortfall.as_millis());
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(shortfall) => {}
            }
        }
    }
    target.stop_for_soft_stop(epoch, &mut shutdown_rx).await;
}
