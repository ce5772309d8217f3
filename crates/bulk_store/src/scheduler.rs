//! Delayed and periodic task submission on a tokio runtime.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{BulkError, Result};

/// Submits tasks to the runtime the store was created on.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    handle: Handle,
}

impl TaskScheduler {
    /// Scheduler on the runtime of the calling task.
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| BulkError::Config(format!("no tokio runtime: {}", e)))?;
        Ok(Self { handle })
    }

    /// Run `task` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        })
    }

    /// Run `task` after `initial_delay`, then again `period` after each run
    /// finishes. Runs never overlap.
    pub fn schedule_with_fixed_delay<F, Fut>(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: F,
    ) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(async move {
            tokio::time::sleep(initial_delay).await;
            loop {
                task().await;
                tokio::time::sleep(period).await;
            }
        })
    }
}
