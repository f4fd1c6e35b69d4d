//! FIFO queue of sync requests waiting for the worker.

use crate::error::{SyncError, SyncResult};
use crate::orchestrator::CancelToken;
use crate::worker::{ActiveRun, ActiveSlot};
use edgesync_protocol::{SyncRequest, Trigger};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<SyncRequest>,
    closed: bool,
}

/// Outcome of [`RunQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The request was queued under its own run ID.
    New(Uuid),
    /// An identical webhook or scheduled request was already waiting; its run
    /// ID is returned.
    Coalesced(Uuid),
}

impl Enqueued {
    /// Run ID the caller should track.
    pub fn run_id(&self) -> Uuid {
        match self {
            Enqueued::New(id) | Enqueued::Coalesced(id) => *id,
        }
    }
}

/// Requests waiting to run, oldest first.
///
/// Producers are the HTTP handlers, the scheduler and the webhook ingress;
/// the single consumer is the worker.
#[derive(Debug, Default)]
pub struct RunQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl RunQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a request.
    ///
    /// A webhook or scheduled request identical to one still waiting is
    /// coalesced into it, so bursts and ticks during a slow run do not pile up.
    pub fn push(&self, request: SyncRequest) -> SyncResult<Enqueued> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SyncError::QueueClosed);
        }
        if matches!(request.trigger, Trigger::Webhook | Trigger::Scheduler) {
            if let Some(existing) = state.pending.iter().find(|r| same_work(r, &request)) {
                return Ok(Enqueued::Coalesced(existing.run_id));
            }
        }
        let run_id = request.run_id;
        state.pending.push_back(request);
        self.ready.notify_one();
        Ok(Enqueued::New(run_id))
    }

    /// Puts a request ahead of everything else. Used for resumed runs.
    pub fn push_front(&self, request: SyncRequest) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SyncError::QueueClosed);
        }
        state.pending.push_front(request);
        self.ready.notify_one();
        Ok(())
    }

    /// Blocks until a request is available or the queue is closed.
    pub fn pop(&self) -> Option<SyncRequest> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(request) = state.pending.pop_front() {
                return Some(request);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Blocks like [`pop`](Self::pop) and installs the request in `active`
    /// before the queue lock is released.
    ///
    /// A reader that checks the queue and then the slot always finds the run.
    pub(crate) fn pop_into(&self, active: &ActiveSlot) -> Option<ActiveRun> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(request) = state.pending.pop_front() {
                let run = ActiveRun {
                    request,
                    cancel: CancelToken::new(),
                };
                active.set(Some(run.clone()));
                return Some(run);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<SyncRequest> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        if state.pending.is_empty() {
            let _ = self.ready.wait_for(&mut state, timeout);
        }
        if state.closed {
            return None;
        }
        state.pending.pop_front()
    }

    /// Removes a waiting request.
    pub fn remove(&self, run_id: Uuid) -> Option<SyncRequest> {
        let mut state = self.state.lock();
        let index = state.pending.iter().position(|r| r.run_id == run_id)?;
        state.pending.remove(index)
    }

    /// Returns a waiting request without removing it.
    pub fn find(&self, run_id: Uuid) -> Option<SyncRequest> {
        self.state
            .lock()
            .pending
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned()
    }

    /// Snapshot of the waiting requests, oldest first.
    pub fn pending(&self) -> Vec<SyncRequest> {
        self.state.lock().pending.iter().cloned().collect()
    }

    /// Number of waiting requests.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Returns true if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rejects further pushes and wakes the consumer.
    ///
    /// Returns the requests that were still waiting.
    pub fn close(&self) -> Vec<SyncRequest> {
        let mut state = self.state.lock();
        state.closed = true;
        self.ready.notify_all();
        state.pending.drain(..).collect()
    }

    /// Returns true once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

fn same_work(a: &SyncRequest, b: &SyncRequest) -> bool {
    a.trigger == b.trigger
        && a.direction == b.direction
        && a.dry_run == b.dry_run
        && a.scope == b.scope
}
