//! Periodic auto-sync timer.
//!
//! The timer is a dedicated thread parked on a condition variable. `start`,
//! `stop` and shutdown wake it, so a stop takes effect immediately instead of
//! after the current interval elapses.

use crate::config::EngineConfig;
use crate::error::SyncResult;
use crate::queue::{Enqueued, RunQueue};
use crate::state::StateStore;
use crate::worker::RunListener;
use chrono::{DateTime, Utc};
use edgesync_protocol::{AutoSyncConfig, RunStatus, SyncRequest, SyncRun, Trigger};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Timer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No ticks will fire.
    Stopped,
    /// The next tick fires at the given time.
    Armed(DateTime<Utc>),
}

#[derive(Debug)]
struct Timer {
    config: AutoSyncConfig,
    shutdown: bool,
}

struct Inner {
    queue: Arc<RunQueue>,
    store: Arc<dyn StateStore>,
    engine: EngineConfig,
    timer: Mutex<Timer>,
    wake: Condvar,
}

impl Inner {
    fn persist(&self, config: &AutoSyncConfig) -> SyncResult<()> {
        self.store.save_auto_sync(config)
    }

    fn tick_loop(&self) {
        let mut timer = self.timer.lock();
        loop {
            if timer.shutdown {
                return;
            }
            let next = match (timer.config.enabled, timer.config.next_run_at) {
                (true, Some(next)) => next,
                _ => {
                    self.wake.wait(&mut timer);
                    continue;
                }
            };

            let now = Utc::now();
            if now < next {
                let remaining = (next - now).to_std().unwrap_or(Duration::ZERO);
                let _ = self.wake.wait_for(&mut timer, remaining);
                continue;
            }

            match self.queue.push(SyncRequest::scheduled()) {
                Ok(Enqueued::New(run_id)) => info!(%run_id, "auto-sync tick"),
                Ok(Enqueued::Coalesced(run_id)) => {
                    debug!(%run_id, "auto-sync tick merged into queued run")
                }
                Err(e) => warn!(error = %e, "auto-sync tick dropped"),
            }
            timer.config.reschedule(Utc::now());
            if let Err(e) = self.persist(&timer.config) {
                error!(error = %e, "cannot persist auto-sync config");
            }
        }
    }
}

/// Enqueues a bidirectional run every `interval_ms` while armed.
pub struct Scheduler {
    inner: Arc<Inner>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawns the timer thread in the stopped state.
    pub fn spawn(
        queue: Arc<RunQueue>,
        store: Arc<dyn StateStore>,
        engine: EngineConfig,
    ) -> SyncResult<Self> {
        let inner = Arc::new(Inner {
            queue,
            store,
            engine,
            timer: Mutex::new(Timer {
                config: AutoSyncConfig::default(),
                shutdown: false,
            }),
            wake: Condvar::new(),
        });
        let handle = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("edgesync-scheduler".into())
                .spawn(move || inner.tick_loop())?
        };
        Ok(Self {
            inner,
            handle: Some(handle),
        })
    }

    /// Loads the persisted config and re-arms if it was enabled.
    ///
    /// Ticks missed while the process was down are not replayed; the next
    /// tick is one interval from now unless the persisted one is still ahead.
    /// An interval outside the configured bounds is clamped into them.
    pub fn restore(&self) -> SyncResult<AutoSyncConfig> {
        let Some(mut config) = self.inner.store.load_auto_sync()? else {
            return Ok(self.config());
        };
        let mut changed = false;
        if self.inner.engine.validate_interval(config.interval_ms).is_err() {
            let clamped = self.inner.engine.clamp_interval(config.interval_ms);
            warn!(
                persisted = config.interval_ms,
                clamped, "persisted auto-sync interval out of bounds"
            );
            config.interval_ms = clamped;
            changed = true;
        }

        let now = Utc::now();
        let horizon = i64::try_from(config.interval_ms).unwrap_or(0);
        let latest = now + chrono::Duration::milliseconds(horizon);
        let stale = |next: DateTime<Utc>| next <= now || next > latest;
        if config.enabled && config.next_run_at.map_or(true, stale) {
            config.reschedule(now);
            changed = true;
        }
        if changed {
            self.inner.persist(&config)?;
        }
        if config.enabled {
            info!(
                interval_ms = config.interval_ms,
                next_run_at = ?config.next_run_at,
                "auto-sync restored"
            );
        }

        let mut timer = self.inner.timer.lock();
        timer.config = config.clone();
        self.inner.wake.notify_all();
        Ok(config)
    }

    /// Arms the timer, or re-arms it with a new interval.
    pub fn start(&self, interval_ms: u64) -> SyncResult<AutoSyncConfig> {
        self.inner.engine.validate_interval(interval_ms)?;

        let mut timer = self.inner.timer.lock();
        let mut config = timer.config.clone();
        config.arm(interval_ms, Utc::now());
        self.inner.persist(&config)?;
        timer.config = config.clone();
        self.inner.wake.notify_all();

        info!(interval_ms, next_run_at = ?config.next_run_at, "auto-sync started");
        Ok(config)
    }

    /// Disarms the timer.
    pub fn stop(&self) -> SyncResult<AutoSyncConfig> {
        let mut timer = self.inner.timer.lock();
        let mut config = timer.config.clone();
        config.disarm();
        self.inner.persist(&config)?;
        timer.config = config.clone();
        self.inner.wake.notify_all();

        info!("auto-sync stopped");
        Ok(config)
    }

    /// Current config and counters.
    pub fn config(&self) -> AutoSyncConfig {
        self.inner.timer.lock().config.clone()
    }

    /// Current timer state.
    pub fn state(&self) -> SchedulerState {
        let timer = self.inner.timer.lock();
        match (timer.config.enabled, timer.config.next_run_at) {
            (true, Some(next)) => SchedulerState::Armed(next),
            _ => SchedulerState::Stopped,
        }
    }

    /// Stops the timer thread without changing the persisted config.
    pub fn shutdown(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        {
            let mut timer = self.inner.timer.lock();
            timer.shutdown = true;
            self.inner.wake.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl RunListener for Scheduler {
    fn run_finished(&self, run: &SyncRun) {
        if run.trigger != Trigger::Scheduler {
            return;
        }
        let error = match run.status {
            RunStatus::Succeeded => None,
            status => Some(
                run.errors
                    .first()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| status.to_string()),
            ),
        };

        let mut timer = self.inner.timer.lock();
        timer
            .config
            .record_outcome(run.finished_at.unwrap_or_else(Utc::now), error);
        debug!(
            total_runs = timer.config.total_runs,
            total_errors = timer.config.total_errors,
            "auto-sync outcome recorded"
        );
        if let Err(e) = self.inner.persist(&timer.config) {
            error!(error = %e, "cannot persist auto-sync counters");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.halt();
        }
    }
}
