//! Background work polled from the control loop
//!
//! The engine tick is synchronous and must never wait. Long operations
//! are spawned onto the tokio runtime and the tick checks each slot with
//! [`BackgroundTask::try_take`], which returns immediately.

use futures::FutureExt;
use std::future::Future;
use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

pub struct BackgroundTask<T> {
    label: &'static str,
    started: Instant,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> BackgroundTask<T> {
    pub fn spawn<F>(runtime: &Handle, label: &'static str, future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        tracing::debug!("Spawning background task: {}", label);
        Self {
            label,
            started: Instant::now(),
            handle: runtime.spawn(future),
        }
    }
}

impl<T> BackgroundTask<T> {
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Take the output if the task has completed; `None` if still running.
    pub fn try_take(&mut self) -> Option<Result<T, JoinError>> {
        if !self.handle.is_finished() {
            return None;
        }
        (&mut self.handle).now_or_never()
    }
}

/// Take a finished task's output out of an optional slot, emptying it.
pub fn take_finished<T>(slot: &mut Option<BackgroundTask<T>>) -> Option<Result<T, JoinError>> {
    let output = slot.as_mut()?.try_take()?;
    if let Some(task) = slot.take() {
        tracing::debug!(
            "Background task '{}' finished after {:.2}s",
            task.label,
            task.started.elapsed().as_secs_f64()
        );
    }
    Some(output)
}
