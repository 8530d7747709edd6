//! Periodic trigger with register/unregister semantics.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Runs a job on a fixed cadence until unregistered. Runs never overlap: the
/// next tick is awaited only after the previous job finishes.
pub struct PeriodicScheduler {
    cadence: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicScheduler {
    #[must_use]
    pub fn new(cadence: Duration) -> Self {
        Self { cadence, task: Mutex::new(None) }
    }

    /// Start the job loop. The first run happens one cadence from now.
    /// Returns `false` when a job is already registered or the first run
    /// cannot be placed on the clock. Must be called from within a Tokio runtime.
    pub fn register<F, Fut>(&self, job: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(mut task) = self.task.lock() else {
            tracing::error!("scheduler state lock poisoned; refusing to register");
            return false;
        };
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let cadence = self.cadence;
        let Some(first_run) = Instant::now().checked_add(cadence) else {
            tracing::error!(
                cadence_secs = cadence.as_secs(),
                "cadence overflows the clock; refusing to register"
            );
            return false;
        };
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(first_run, cadence);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                job().await;
            }
        }));
        tracing::info!(cadence_secs = cadence.as_secs(), "periodic check registered");
        true
    }

    /// Stop future runs. Returns `false` when nothing was registered.
    pub fn unregister(&self) -> bool {
        let handle = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        match handle {
            Some(handle) => {
                handle.abort();
                tracing::info!("periodic check unregistered");
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for PeriodicScheduler {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}
