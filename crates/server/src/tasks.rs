//! Periodic background work
//!
//! Each task owns its timer and a stop channel. Tasks only talk to the rest
//! of the panel through the store and the control plane.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hopwire_control::ReconnectHandler;
use hopwire_store::MemoryStore;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct PeriodicTask {
    name: &'static str,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Run `tick` every `period`, first after one full period
    pub fn start<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.tick() => tick().await,
                    _ = &mut stop_rx => break,
                }
            }
            debug!("Task {} stopped", name);
        });
        info!("Started task {} (every {:?})", name, period);

        Self {
            name,
            stop: Some(stop_tx),
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the task and wait for the current tick to finish
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            warn!("Task {} ended abnormally: {}", self.name, e);
        }
    }
}

/// Flip nodes that are persisted online but have no live socket
pub fn offline_sweep(reconnect: Arc<ReconnectHandler>, period: Duration) -> PeriodicTask {
    PeriodicTask::start("offline-sweep", period, move || {
        let reconnect = reconnect.clone();
        async move {
            match reconnect.sweep_offline().await {
                Ok(0) => {}
                Ok(n) => info!("Offline sweep flipped {} node(s)", n),
                Err(e) => warn!("Offline sweep failed: {}", e),
            }
        }
    })
}

/// Write the state file whenever the store is dirty
pub fn store_flush(store: Arc<MemoryStore>, period: Duration) -> PeriodicTask {
    PeriodicTask::start("store-flush", period, move || {
        let store = store.clone();
        async move {
            match store.flush() {
                Ok(true) => debug!("Flushed state"),
                Ok(false) => {}
                Err(e) => warn!("State flush failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_task_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let task = PeriodicTask::start("count", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        task.stop().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_store_flush_writes_dirty_state() {
        use hopwire_store::Store;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = Arc::new(MemoryStore::open(&path).unwrap());
        store.set_config("k", "v".into()).await.unwrap();
        assert!(store.is_dirty());

        let task = store_flush(store.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.stop().await;

        assert!(!store.is_dirty());
        assert!(path.exists());
    }
}
