//! Periodic background work with explicit cancellation handles.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::ConfidenceEngine;

/// A spawned task plus the channel that stops it.
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `body` with a shutdown receiver; it should return once the receiver changes.
    pub fn spawn_with_shutdown<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(body(rx));
        Self { name, shutdown, handle }
    }

    /// Call `tick` every `period` until cancelled. The first tick fires after one period.
    pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let period = period.max(Duration::from_millis(10));
        Self::spawn_with_shutdown(name, move |mut shutdown| async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        tick().await;
                        counter!("scheduler_ticks_total", "task" => name).increment(1);
                    }
                }
            }
            tracing::debug!(target: "scheduler", task = name, "stopped");
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and wait for the task to exit.
    pub async fn shutdown(self) {
        self.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(target: "scheduler", task = self.name, error = %e, "task ended abnormally");
        }
    }
}

/// Close due stream windows and collect stale buffers once per hop.
pub fn spawn_window_ticker(engine: Arc<ConfidenceEngine>) -> ScheduledTask {
    let period = engine.config().stream.window.hop();
    ScheduledTask::spawn_periodic("window-ticker", period, move || {
        let engine = engine.clone();
        async move {
            let closed = engine.tick_windows(chrono::Utc::now());
            if closed > 0 {
                tracing::debug!(target: "stream", closed, "window tick");
            }
        }
    })
}

/// Apply partially filled feedback batches every `flush_interval_secs`.
pub fn spawn_feedback_flusher(engine: Arc<ConfidenceEngine>) -> ScheduledTask {
    let period = Duration::from_secs(engine.config().optimizer.flush_interval_secs.max(1));
    ScheduledTask::spawn_periodic("feedback-flusher", period, move || {
        let engine = engine.clone();
        async move {
            if let Some(v) = engine.flush_feedback() {
                tracing::info!(target: "optimizer", version = v.version, "periodic feedback flush applied");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn periodic_task_ticks_until_cancelled() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = ScheduledTask::spawn_periodic("test", Duration::from_secs(1), move || {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        task.shutdown().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
