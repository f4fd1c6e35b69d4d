//! Persisted auto-sync configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default auto-sync interval (5 minutes).
pub const DEFAULT_INTERVAL_MS: u64 = 5 * 60 * 1000;

/// Auto-sync configuration and counters.
///
/// Owned by the scheduler. Persisted so a restart re-arms the timer instead of
/// silently disabling auto-sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoSyncConfig {
    /// Whether the timer is armed.
    pub enabled: bool,
    /// Interval between runs in milliseconds.
    pub interval_ms: u64,
    /// Next tick; `None` while stopped.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Finished scheduler-triggered runs.
    pub total_runs: u64,
    /// Scheduler-triggered runs that did not succeed.
    pub total_errors: u64,
    /// When the last scheduler-triggered run finished.
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Error summary of the last failed scheduler-triggered run.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Default for AutoSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: DEFAULT_INTERVAL_MS,
            next_run_at: None,
            total_runs: 0,
            total_errors: 0,
            last_run_at: None,
            last_error: None,
        }
    }
}

impl AutoSyncConfig {
    /// Arms the timer: `next_run_at = now + interval_ms`.
    pub fn arm(&mut self, interval_ms: u64, now: DateTime<Utc>) {
        self.enabled = true;
        self.interval_ms = interval_ms;
        self.next_run_at = Some(tick_after(now, interval_ms));
    }

    /// Disarms the timer and clears `next_run_at`.
    pub fn disarm(&mut self) {
        self.enabled = false;
        self.next_run_at = None;
    }

    /// Reschedules the next tick after one fired.
    pub fn reschedule(&mut self, now: DateTime<Utc>) {
        if self.enabled {
            self.next_run_at = Some(tick_after(now, self.interval_ms));
        }
    }

    /// Folds the outcome of a finished scheduler-triggered run into the counters.
    pub fn record_outcome(&mut self, finished_at: DateTime<Utc>, error: Option<String>) {
        self.total_runs += 1;
        self.last_run_at = Some(finished_at);
        if let Some(error) = error {
            self.total_errors += 1;
            self.last_error = Some(error);
        }
    }
}

/// `now + interval_ms`, saturating at the largest representable time.
fn tick_after(now: DateTime<Utc>, interval_ms: u64) -> DateTime<Utc> {
    let ms = i64::try_from(interval_ms).unwrap_or(i64::MAX);
    now.checked_add_signed(chrono::Duration::milliseconds(ms))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
