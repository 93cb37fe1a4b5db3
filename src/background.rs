//! Background task scheduling
//!
//! Cache writes happen after the client response has been handed off. The
//! host decides how such work runs by supplying a [`TaskScheduler`]; the
//! bundled [`BackgroundTasks`] keeps every task in a `JoinSet` so shutdown can
//! wait for pending writes.

use futures::future::BoxFuture;
use std::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Runs fire-and-forget work outside the request path
pub trait TaskScheduler: Send + Sync {
    fn schedule(&self, name: &'static str, task: BoxFuture<'static, ()>);
}

/// [`TaskScheduler`] on the tokio runtime with drain support
#[derive(Default)]
pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<&'static str>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks not yet reaped
    pub fn pending(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Wait for every scheduled task, including ones scheduled while draining
    pub async fn drain(&self) {
        loop {
            let mut batch = match self.tasks.lock() {
                Ok(mut tasks) => std::mem::take(&mut *tasks),
                Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
            };
            if batch.is_empty() {
                return;
            }

            while let Some(joined) = batch.join_next().await {
                match joined {
                    Ok(name) => debug!("Background task {} finished", name),
                    Err(e) => warn!("Background task failed: {}", e),
                }
            }
        }
    }
}

impl TaskScheduler for BackgroundTasks {
    fn schedule(&self, name: &'static str, task: BoxFuture<'static, ()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        // Reap finished tasks so the set does not grow without bound
        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                warn!("Background task failed: {}", e);
            }
        }
        tasks.spawn(async move {
            task.await;
            name
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drain_waits_for_tasks() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = done.clone();
            tasks.schedule(
                "test",
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                }
                .boxed(),
            );
        }

        tasks.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(tasks.pending(), 0);
    }

    #[tokio::test]
    async fn test_drain_survives_panicking_task() {
        let tasks = BackgroundTasks::new();
        tasks.schedule("boom", async { panic!("boom") }.boxed());
        tasks.drain().await;
        assert_eq!(tasks.pending(), 0);
    }
}
