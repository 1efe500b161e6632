use std::future::Future;
use std::time::Duration as StdDuration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, trace};

const LOG_TARGET: &str = "soundboard_engine::player::task_manager";

/// How long a cancelled task gets to finish before it is aborted.
pub const TASK_JOIN_TIMEOUT: StdDuration = StdDuration::from_secs(5);

/// Owns one background task and its shutdown channel.
#[derive(Debug)]
pub struct TaskManager {
    task_handle: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
    label: String,
}

impl TaskManager {
    /// Spawns `make_task`, handing it the shutdown receiver.
    pub fn spawn<F, Fut>(label: impl Into<String>, make_task: F) -> Self
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        trace!(target: LOG_TARGET, task = %label, "Spawning task.");
        let task_handle = tokio::spawn(make_task(shutdown_rx));
        Self {
            task_handle,
            shutdown_tx,
            label,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_finished(&self) -> bool {
        self.task_handle.is_finished()
    }

    /// Sends the shutdown signal to the managed task.
    pub fn signal_shutdown(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            // The task already finished and dropped its receiver.
            trace!(target: LOG_TARGET, task = %self.label, "Shutdown signal not delivered: {}", e);
        }
    }

    /// Waits for the task to finish, aborting it after [`TASK_JOIN_TIMEOUT`].
    #[instrument(skip(self), fields(task = %self.label))]
    pub async fn await_completion(mut self) {
        tokio::select! {
            biased;
            result = &mut self.task_handle => {
                match result {
                    Ok(()) => trace!(target: LOG_TARGET, "Task finished."),
                    Err(e) if e.is_panic() => error!(target: LOG_TARGET, "Task panicked: {:?}", e),
                    Err(e) if e.is_cancelled() => debug!(target: LOG_TARGET, "Task was cancelled."),
                    Err(e) => error!(target: LOG_TARGET, "Task join error: {:?}", e),
                }
            }
            _ = tokio::time::sleep(TASK_JOIN_TIMEOUT) => {
                error!(target: LOG_TARGET, "Task did not finish within {:?}. Aborting.", TASK_JOIN_TIMEOUT);
                self.task_handle.abort();
            }
        }
    }

    /// Cancels the task and waits for it.
    pub async fn stop_task(self) {
        self.signal_shutdown();
        self.await_completion().await;
    }

    /// Lets the task run on without a handle. Used when a task ends its
    /// own slot and must not join itself.
    pub fn detach(self) {
        trace!(target: LOG_TARGET, task = %self.label, "Detaching task.");
    }
}
