//! Periodic background tasks.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Owns the engine's periodic tasks and stops them together.
pub struct BackgroundTasks {
    shutdown: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Run `tick` every `period` until shutdown.
    ///
    /// Ticks never overlap; a slow tick delays the next one.
    pub fn spawn_periodic<F, Fut>(&mut self, name: impl Into<String>, period: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let name = name.into();
        let shutdown = self.shutdown.child_token();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            info!("Background task '{}' started", task_name);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Background task '{}' shutting down", task_name);
                        break;
                    }
                    _ = ticker.tick() => {
                        debug!("Background task '{}' tick", task_name);
                        tick().await;
                    }
                }
            }
        });

        self.handles.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Signal every task and wait for them to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for (name, handle) in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!("Background task '{}' ended abnormally: {}", name, e);
            }
        }
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_periodic_runs_until_shutdown() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut tasks = BackgroundTasks::new();

        let c = counter.clone();
        tasks.spawn_periodic("count", Duration::from_millis(5), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(tasks.len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        tasks.shutdown().await;

        let after_shutdown = counter.load(Ordering::SeqCst);
        assert!(after_shutdown >= 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_shutdown);
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let counter = Arc::new(AtomicU32::new(0));
        {
            let mut tasks = BackgroundTasks::new();
            let c = counter.clone();
            tasks.spawn_periodic("count", Duration::from_millis(5), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        let settled = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), settled);
    }
}
