//! Background evaluation loop
//!
//! One tokio task visits the due alarms every tick:
//!
//! ```text
//! loop {
//!     stopped?            -> exit
//!     find due alarms     -> run_alarms (sequential)
//!     panicked?           -> log, sleep cooldown
//!     sleep interval | wake on stop
//! }
//! ```
//!
//! `start`/`stop` are idempotent. `stop` only keeps the next iteration from
//! starting; a pass already in flight runs to completion.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument};

use crate::error::{AlarmError, AlarmResult};
use crate::runner::{AlarmRunner, RunSummary};

/// Smallest accepted global interval
pub const MIN_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Lifecycle {
    running: bool,

    /// Bumped on every start so a loop outliving a stop/start pair exits
    generation: u64,
}

struct Inner {
    runner: AlarmRunner,
    interval: Duration,
    cooldown: Duration,
    lifecycle: Mutex<Lifecycle>,
    wake: Notify,
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        let lifecycle = self.lifecycle();
        lifecycle.running && lifecycle.generation == generation
    }

    async fn run_once(&self) -> AlarmResult<RunSummary> {
        let alarms = self
            .runner
            .repository()
            .find_due_alarms(self.interval, Utc::now())
            .await?;

        if alarms.is_empty() {
            debug!("no alarms due");
            return Ok(RunSummary::default());
        }

        debug!("running {} due alarms", alarms.len());
        Ok(self.runner.run_alarms(alarms).await)
    }

    /// Sleep for `duration` unless woken by `stop`
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wake.notified() => {}
        }
    }

    async fn run(self: Arc<Self>, generation: u64) {
        info!("alarm scheduler started with interval of {:?}", self.interval);

        while self.is_current(generation) {
            match AssertUnwindSafe(self.run_once()).catch_unwind().await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("failed to load due alarms: {e}"),
                Err(panic) => {
                    error!(
                        "alarm run panicked: {}, resuming in {:?}",
                        panic_message(panic.as_ref()),
                        self.cooldown
                    );
                    self.pause(self.cooldown).await;
                    continue;
                }
            }

            if !self.is_current(generation) {
                break;
            }
            self.pause(self.interval).await;
        }

        info!("alarm scheduler stopped");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Owns the evaluation loop's lifecycle
#[derive(Clone)]
pub struct AlarmScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AlarmScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmScheduler")
            .field("interval", &self.inner.interval)
            .field("cooldown", &self.inner.cooldown)
            .finish_non_exhaustive()
    }
}

impl AlarmScheduler {
    /// Fails when `interval` is below [`MIN_INTERVAL`]
    pub fn new(runner: AlarmRunner, interval: Duration, cooldown: Duration) -> AlarmResult<Self> {
        if interval < MIN_INTERVAL {
            return Err(AlarmError::Validation(format!(
                "alarm interval must be at least {:?}, got {:?}",
                MIN_INTERVAL, interval
            )));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                runner,
                interval,
                cooldown,
                lifecycle: Mutex::new(Lifecycle::default()),
                wake: Notify::new(),
            }),
        })
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Spawn the loop. Returns `false` if it was already running.
    #[instrument(skip(self))]
    pub fn start(&self) -> bool {
        let generation = {
            let mut lifecycle = self.inner.lifecycle();
            if lifecycle.running {
                debug!("scheduler already running");
                return false;
            }
            lifecycle.running = true;
            lifecycle.generation += 1;
            lifecycle.generation
        };

        tokio::spawn(self.inner.clone().run(generation));
        true
    }

    /// Stop after the current pass. Returns `false` if it was not running.
    #[instrument(skip(self))]
    pub fn stop(&self) -> bool {
        {
            let mut lifecycle = self.inner.lifecycle();
            if !lifecycle.running {
                return false;
            }
            lifecycle.running = false;
        }

        self.inner.wake.notify_waiters();
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle().running
    }

    /// One pass over the currently due alarms, independent of the loop
    pub async fn run_once(&self) -> AlarmResult<RunSummary> {
        self.inner.run_once().await
    }
}
