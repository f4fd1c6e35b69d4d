//! Process-level facade wiring the queue, worker, scheduler and stats.

use crate::config::EngineConfig;
use crate::connector::StoreConnector;
use crate::error::{SyncError, SyncResult};
use crate::history::HistoryLog;
use crate::orchestrator::SyncOrchestrator;
use crate::queue::{Enqueued, RunQueue};
use crate::scheduler::{Scheduler, SchedulerState};
use crate::state::StateStore;
use crate::stats::{HealthReport, StatsCollector};
use crate::worker::{ActiveSlot, RunListener, Worker};
use chrono::Utc;
use edgesync_protocol::{
    AutoSyncConfig, EntityType, SyncConflict, SyncRequest, SyncRun, Trigger,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Everything the service needs to start.
pub struct ServiceParts {
    /// Connector to the primary store.
    pub primary: Arc<dyn StoreConnector>,
    /// Connector to the replica store.
    pub replica: Arc<dyn StoreConnector>,
    /// Engine state storage.
    pub state: Arc<dyn StateStore>,
    /// Run ledger.
    pub history: Arc<dyn HistoryLog>,
    /// Engine configuration.
    pub config: EngineConfig,
}

/// The sync engine as seen by the HTTP layer and the CLI.
///
/// Triggers only enqueue; a single worker thread executes runs one at a time.
/// Status reads go straight to the connectors and the history log.
pub struct SyncService {
    orchestrator: Arc<SyncOrchestrator>,
    queue: Arc<RunQueue>,
    active: Arc<ActiveSlot>,
    scheduler: Arc<Scheduler>,
    stats: StatsCollector,
    state: Arc<dyn StateStore>,
    history: Arc<dyn HistoryLog>,
    recent_runs_limit: usize,
    worker: Mutex<Option<Worker>>,
}

impl SyncService {
    /// Starts the worker and the scheduler.
    ///
    /// A persisted auto-sync config is restored and an interrupted run is
    /// re-enqueued ahead of everything else.
    pub fn start(parts: ServiceParts) -> SyncResult<Self> {
        let ServiceParts {
            primary,
            replica,
            state,
            history,
            config,
        } = parts;

        let stats = StatsCollector::new(
            primary.clone(),
            replica.clone(),
            config.entity_types.clone(),
        );
        let recent_runs_limit = config.recent_runs_limit;
        let queue = Arc::new(RunQueue::new());
        let active = Arc::new(ActiveSlot::default());
        let scheduler = Arc::new(Scheduler::spawn(
            queue.clone(),
            state.clone(),
            config.clone(),
        )?);
        scheduler.restore()?;

        if let Some(checkpoint) = state.load_checkpoint()? {
            let run = &checkpoint.run;
            info!(run_id = %run.id, "re-enqueueing interrupted run");
            queue.push_front(SyncRequest {
                run_id: run.id,
                direction: run.direction,
                dry_run: run.dry_run,
                scope: run.scope.clone(),
                trigger: Trigger::Resume,
                triggered_by: run.triggered_by.clone(),
                requested_at: run.created_at,
            })?;
        }

        let orchestrator = Arc::new(SyncOrchestrator::new(
            primary,
            replica,
            state.clone(),
            history.clone(),
            config,
        ));
        let listener: Arc<dyn RunListener> = scheduler.clone();
        let worker = Worker::spawn(queue.clone(), orchestrator.clone(), active.clone(), listener)?;

        Ok(Self {
            orchestrator,
            queue,
            active,
            scheduler,
            stats,
            state,
            history,
            recent_runs_limit,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueues a request.
    pub fn trigger(&self, request: SyncRequest) -> SyncResult<Enqueued> {
        let enqueued = self.queue.push(request.clone())?;
        match enqueued {
            Enqueued::New(run_id) => info!(
                %run_id,
                direction = %request.direction,
                dry_run = request.dry_run,
                trigger = ?request.trigger,
                queue_len = self.queue.len(),
                "sync run queued"
            ),
            Enqueued::Coalesced(run_id) => info!(
                %run_id,
                trigger = ?request.trigger,
                "request coalesced into pending run"
            ),
        }
        Ok(enqueued)
    }

    /// Enqueues the targeted run a verified replica webhook asks for.
    pub fn webhook(&self, entity_type: EntityType) -> SyncResult<Enqueued> {
        self.trigger(SyncRequest::webhook(entity_type))
    }

    /// Looks up a run wherever it currently is.
    ///
    /// Queued runs are reported `pending`; the active run reports its last
    /// checkpoint, or `running` with no progress before the first type ends.
    ///
    /// The queue is checked before the active slot: the worker moves a request
    /// from one to the other under the queue lock, so the run is always seen.
    pub fn find_run(&self, run_id: Uuid) -> Option<SyncRun> {
        if let Some(request) = self.queue.find(run_id) {
            return Some(SyncRun::pending(&request));
        }
        if let Some(active) = self.active.find(run_id) {
            if let Ok(Some(checkpoint)) = self.state.load_checkpoint() {
                if checkpoint.run.id == run_id {
                    return Some(checkpoint.run);
                }
            }
            let mut run = SyncRun::pending(&active.request);
            if let Err(e) = run.start(Utc::now()) {
                warn!(%run_id, error = %e, "cannot build run view");
            }
            return Some(run);
        }
        // The worker appends to history before clearing the slot.
        self.history.find_run(run_id)
    }

    /// Cancels a queued or running run.
    ///
    /// A queued run is removed and recorded `cancelled` at once. A running run
    /// is flagged and stops before its next entity type; its current state is
    /// returned. Finished runs are returned unchanged.
    pub fn cancel(&self, run_id: Uuid) -> SyncResult<SyncRun> {
        if let Some(request) = self.queue.remove(run_id) {
            info!(%run_id, "cancelled queued run");
            return Ok(self.orchestrator.record_cancelled(&request));
        }
        if self.active.cancel(run_id) {
            info!(%run_id, "cancellation requested for running run");
        }
        self.find_run(run_id).ok_or(SyncError::RunNotFound(run_id))
    }

    /// Conflicts recorded by a run.
    pub fn conflicts_for(&self, run_id: Uuid) -> SyncResult<Vec<SyncConflict>> {
        if self.find_run(run_id).is_none() {
            return Err(SyncError::RunNotFound(run_id));
        }
        Ok(self.history.conflicts_for(run_id))
    }

    /// Most recent finished runs, newest first.
    pub fn recent_runs(&self) -> Vec<SyncRun> {
        self.history.recent_runs(self.recent_runs_limit)
    }

    /// Probes both stores and gathers their counts.
    ///
    /// Blocks on connector calls but never on the run lock.
    pub fn health(&self) -> HealthReport {
        HealthReport::new(self.stats.primary(), self.stats.replica(), self.recent_runs())
    }

    /// Arms (or re-arms) auto-sync.
    pub fn start_auto_sync(&self, interval_ms: u64) -> SyncResult<AutoSyncConfig> {
        self.scheduler.start(interval_ms)
    }

    /// Disarms auto-sync.
    pub fn stop_auto_sync(&self) -> SyncResult<AutoSyncConfig> {
        self.scheduler.stop()
    }

    /// Current auto-sync config and counters.
    pub fn auto_sync(&self) -> AutoSyncConfig {
        self.scheduler.config()
    }

    /// Current scheduler state.
    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// Number of requests waiting for the worker.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Returns the ID of the run being executed, if any.
    pub fn active_run(&self) -> Option<Uuid> {
        self.active.get().map(|a| a.request.run_id)
    }

    /// Stops accepting work, cancels the active run and joins the worker.
    ///
    /// Requests still queued are dropped. The active run stops before its next
    /// entity type and is recorded `cancelled`; only a crash leaves a
    /// checkpoint behind for the next start to resume.
    pub fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let abandoned = worker.shutdown();
            if !abandoned.is_empty() {
                warn!(count = abandoned.len(), "dropping queued runs on shutdown");
            }
            info!("sync service stopped");
        }
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
