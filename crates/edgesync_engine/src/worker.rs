//! The single consumer of the run queue.

use crate::error::SyncResult;
use crate::orchestrator::{CancelToken, SyncOrchestrator};
use crate::queue::RunQueue;
use edgesync_protocol::{SyncRequest, SyncRun};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};
use uuid::Uuid;

/// Notified after every run the worker finishes.
pub trait RunListener: Send + Sync {
    /// Called with the terminal run.
    fn run_finished(&self, run: &SyncRun);
}

/// The run the worker is executing right now.
#[derive(Debug, Clone)]
pub struct ActiveRun {
    /// Request being executed.
    pub request: SyncRequest,
    /// Token that cancels it.
    pub cancel: CancelToken,
}

/// Slot holding the active run, shared between the worker and readers.
#[derive(Debug, Default)]
pub struct ActiveSlot(Mutex<Option<ActiveRun>>);

impl ActiveSlot {
    /// Returns the active run, if any.
    pub fn get(&self) -> Option<ActiveRun> {
        self.0.lock().clone()
    }

    /// Returns the active run if it has the given ID.
    pub fn find(&self, run_id: Uuid) -> Option<ActiveRun> {
        self.0
            .lock()
            .as_ref()
            .filter(|a| a.request.run_id == run_id)
            .cloned()
    }

    /// Requests cancellation of the active run if it has the given ID.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.find(run_id) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn set(&self, active: Option<ActiveRun>) {
        *self.0.lock() = active;
    }
}

/// Background thread that drains the queue one run at a time.
pub struct Worker {
    queue: Arc<RunQueue>,
    active: Arc<ActiveSlot>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns the worker thread.
    pub fn spawn(
        queue: Arc<RunQueue>,
        orchestrator: Arc<SyncOrchestrator>,
        active: Arc<ActiveSlot>,
        listener: Arc<dyn RunListener>,
    ) -> SyncResult<Self> {
        let handle = {
            let queue = queue.clone();
            let active = active.clone();
            thread::Builder::new()
                .name("edgesync-worker".into())
                .spawn(move || {
                    debug!("worker started");
                    while let Some(ActiveRun { request, cancel }) = queue.pop_into(&active) {
                        let run = orchestrator.run(&request, &cancel);
                        active.set(None);
                        listener.run_finished(&run);
                    }
                    debug!("worker stopped");
                })?
        };
        Ok(Self {
            queue,
            active,
            handle: Some(handle),
        })
    }

    /// Closes the queue, cancels the active run and waits for the thread.
    ///
    /// Returns the requests that never started.
    pub fn shutdown(mut self) -> Vec<SyncRequest> {
        self.stop()
    }

    fn stop(&mut self) -> Vec<SyncRequest> {
        let abandoned = self.queue.close();
        if let Some(active) = self.active.get() {
            info!(run_id = %active.request.run_id, "cancelling active run for shutdown");
            active.cancel.cancel();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        abandoned
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, RetryConfig};
    use crate::connector::MemoryConnector;
    use crate::history::{HistoryLog, MemoryHistoryLog};
    use crate::state::MemoryStateStore;
    use chrono::Utc;
    use edgesync_protocol::{Direction, Entity, EntityType, Payload, RunStatus, Side};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SyncRun>>);

    impl RunListener for Recorder {
        fn run_finished(&self, run: &SyncRun) {
            self.0.lock().push(run.clone());
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn runs_queued_requests_in_order() {
        let primary = Arc::new(MemoryConnector::new(Side::Primary));
        primary.insert(&Entity::new(EntityType::User, "u1", Utc::now(), Payload::new()));
        let replica = Arc::new(MemoryConnector::new(Side::Replica));
        replica.set_apply_latency(Duration::from_millis(10));
        let history = Arc::new(MemoryHistoryLog::new());
        let orchestrator = Arc::new(SyncOrchestrator::new(
            primary,
            replica.clone(),
            Arc::new(MemoryStateStore::new()),
            history.clone(),
            EngineConfig::new().with_retry(RetryConfig::no_retry()),
        ));

        let queue = Arc::new(RunQueue::new());
        let active = Arc::new(ActiveSlot::default());
        let recorder = Arc::new(Recorder::default());
        let worker =
            Worker::spawn(queue.clone(), orchestrator, active, recorder.clone()).unwrap();

        let first = SyncRequest::manual(Direction::ToReplica, false, None);
        let second = SyncRequest::manual(Direction::Bidirectional, false, None);
        queue.push(first.clone()).unwrap();
        queue.push(second.clone()).unwrap();

        wait_for(|| recorder.0.lock().len() == 2);
        let runs = recorder.0.lock().clone();
        assert_eq!(runs[0].id, first.run_id);
        assert_eq!(runs[1].id, second.run_id);
        assert!(runs.iter().all(|r| r.status == RunStatus::Succeeded));
        assert_eq!(history.run_count(), 2);
        assert_eq!(replica.max_concurrent_applies(), 1);

        assert!(worker.shutdown().is_empty());
    }
}
