//! Build session state machine.
//!
//! ```text
//! Queued -> Dispatched -> Running -> Succeeded | Failed | Cancelled | Lost
//! ```
//!
//! `Lost` never persists: it resolves to a fresh `Queued` attempt while
//! retries remain, otherwise to `Failed`. Every operation returns what the
//! coordinator has to do next (release a slot, requeue, notify a worker);
//! this module only touches session records.

use buildit_core::{
    BuildId, BuildRequest, BuildSession, FailureReason, RetryCause, SessionState, WorkerId,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::AdmissionError;

/// Resolution of a session that lost its worker.
#[derive(Debug, Clone, PartialEq)]
pub enum LostOutcome {
    /// Back in state `Queued`; the request must be requeued.
    Requeued(Arc<BuildRequest>),
    /// Retries exhausted, now `Failed`.
    Failed,
}

/// What a terminal `BuildStatus` resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutcome {
    /// The build finished; release the worker's slot.
    Finished { worker: WorkerId },
    /// A cancelled or timed-out build confirmed it stopped.
    CleanupConfirmed { worker: WorkerId },
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Unknown,
    AlreadyTerminal,
    /// Was queued; remove it from the queue.
    Dequeue,
    /// Was on a worker; tell it to stop.
    StopWorker { worker: WorkerId, epoch: u32 },
}

/// Owns every live session and a short history of finished ones.
#[derive(Debug)]
pub struct SessionManager {
    live: HashMap<BuildId, BuildSession>,
    recent: VecDeque<BuildSession>,
    history_limit: usize,
    max_retries: u32,
}

impl SessionManager {
    pub fn new(max_retries: u32, history_limit: usize) -> Self {
        Self {
            live: HashMap::new(),
            recent: VecDeque::new(),
            history_limit,
            max_retries,
        }
    }

    /// Create the `Queued` session for an admitted request.
    pub fn admit(&mut self, request: Arc<BuildRequest>) -> Result<&BuildSession, AdmissionError> {
        let id = request.id;
        if self.live.contains_key(&id) {
            return Err(AdmissionError::Duplicate(id));
        }
        Ok(self
            .live
            .entry(id)
            .or_insert_with(|| BuildSession::queued(request)))
    }

    /// `Queued -> Dispatched`. Returns the new dispatch epoch.
    pub fn dispatch(&mut self, id: &BuildId, worker: &WorkerId, now: DateTime<Utc>) -> Option<u32> {
        let session = self.live.get_mut(id)?;
        if session.state != SessionState::Queued {
            warn!(build_id = %id, state = %session.state, "Refusing to dispatch non-queued build");
            return None;
        }
        session.state = SessionState::Dispatched;
        session.assigned_worker = Some(worker.clone());
        session.dispatched_at = Some(now);
        session.started_at = None;
        session.deadline_expired = false;
        session.epoch += 1;
        Some(session.epoch)
    }

    /// `Dispatched -> Running` once the worker acknowledges.
    pub fn on_worker_ack(&mut self, id: &BuildId, worker: &WorkerId, now: DateTime<Utc>) -> bool {
        let Some(session) = self.live.get_mut(id) else {
            return false;
        };
        if session.state != SessionState::Dispatched
            || session.assigned_worker.as_ref() != Some(worker)
        {
            return false;
        }
        session.state = SessionState::Running;
        session.started_at = Some(now);
        true
    }

    /// Account for relayed log output. A status update on a dispatched
    /// build counts as its acknowledgement. Returns true if the build was
    /// on this worker.
    pub fn on_status_update(
        &mut self,
        id: &BuildId,
        worker: &WorkerId,
        chunk_len: usize,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(session) = self.live.get_mut(id) else {
            return false;
        };
        let on_this_worker = session.assigned_worker.as_ref() == Some(worker)
            || session.cleanup_worker.as_ref() == Some(worker);
        if !on_this_worker {
            return false;
        }
        if session.state == SessionState::Dispatched {
            session.state = SessionState::Running;
            session.started_at = Some(now);
        }
        session.log_offset += chunk_len as u64;
        true
    }

    /// Final status from the worker.
    pub fn on_terminal(
        &mut self,
        id: &BuildId,
        worker: &WorkerId,
        exit_code: i32,
        now: DateTime<Utc>,
    ) -> TerminalOutcome {
        let Some(session) = self.live.get_mut(id) else {
            return TerminalOutcome::Ignored;
        };

        if session.state.is_on_worker() && session.assigned_worker.as_ref() == Some(worker) {
            session.exit_code = Some(exit_code);
            session.completed_at = Some(now);
            session.assigned_worker = None;
            if exit_code == 0 {
                session.state = SessionState::Succeeded;
            } else {
                session.state = SessionState::Failed;
                session.failure = Some(FailureReason::ExitCode { code: exit_code });
            }
            info!(build_id = %id, worker_id = %worker, exit_code, state = %session.state, "Build finished");
            return TerminalOutcome::Finished {
                worker: worker.clone(),
            };
        }

        if session.cleanup_worker.as_ref() == Some(worker) {
            session.cleanup_worker = None;
            debug!(build_id = %id, worker_id = %worker, exit_code, "Worker confirmed stop");
            return TerminalOutcome::CleanupConfirmed {
                worker: worker.clone(),
            };
        }

        TerminalOutcome::Ignored
    }

    /// Ack timeout or rejection of a dispatched build.
    pub fn on_dispatch_failed(
        &mut self,
        id: &BuildId,
        epoch: Option<u32>,
        cause: RetryCause,
        now: DateTime<Utc>,
    ) -> Option<LostOutcome> {
        let max_retries = self.max_retries;
        let session = self.live.get_mut(id)?;
        if session.state != SessionState::Dispatched {
            return None;
        }
        if epoch.is_some_and(|e| e != session.epoch) {
            return None;
        }
        Some(resolve_lost(session, cause, max_retries, now))
    }

    /// The worker holding these builds was lost. Builds on the worker go
    /// through `Lost`; pending cancellations are considered confirmed.
    pub fn on_worker_lost(
        &mut self,
        ids: &[BuildId],
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Vec<(BuildId, Option<LostOutcome>)> {
        let max_retries = self.max_retries;
        let mut outcomes = Vec::new();
        for id in ids {
            let Some(session) = self.live.get_mut(id) else {
                continue;
            };
            if session.state.is_on_worker() && session.assigned_worker.as_ref() == Some(worker) {
                if session.deadline_expired {
                    // Already out of time, a retry would only time out again
                    session.state = SessionState::Failed;
                    session.failure = Some(FailureReason::TimedOut);
                    session.assigned_worker = None;
                    session.completed_at = Some(now);
                    outcomes.push((*id, Some(LostOutcome::Failed)));
                    continue;
                }
                let cause = RetryCause::WorkerLost {
                    worker_id: worker.clone(),
                };
                outcomes.push((*id, Some(resolve_lost(session, cause, max_retries, now))));
            } else if session.cleanup_worker.as_ref() == Some(worker) {
                session.cleanup_worker = None;
                outcomes.push((*id, None));
            }
        }
        outcomes
    }

    /// Cancel from any non-terminal state. The session is `Cancelled` as
    /// soon as this returns, even when the worker has yet to confirm.
    pub fn cancel(&mut self, id: &BuildId, now: DateTime<Utc>) -> CancelOutcome {
        let Some(session) = self.live.get_mut(id) else {
            return CancelOutcome::Unknown;
        };
        if session.is_terminal() {
            return CancelOutcome::AlreadyTerminal;
        }

        let previous = session.state;
        session.state = SessionState::Cancelled;
        session.completed_at = Some(now);
        info!(build_id = %id, from = %previous, "Build cancelled");

        match session.assigned_worker.take() {
            Some(worker) => {
                session.cleanup_worker = Some(worker.clone());
                CancelOutcome::StopWorker {
                    worker,
                    epoch: session.epoch,
                }
            }
            None => CancelOutcome::Dequeue,
        }
    }

    /// The maximum build duration expired. Returns the worker to send a
    /// kill to.
    pub fn on_deadline(&mut self, id: &BuildId, epoch: u32) -> Option<WorkerId> {
        let session = self.live.get_mut(id)?;
        if !session.state.is_on_worker() || session.epoch != epoch {
            return None;
        }
        session.deadline_expired = true;
        warn!(build_id = %id, "Build exceeded maximum duration");
        session.assigned_worker.clone()
    }

    /// No terminal report arrived after the kill. Fails the build and
    /// returns the worker whose slot to release.
    pub fn on_termination_grace(
        &mut self,
        id: &BuildId,
        epoch: u32,
        now: DateTime<Utc>,
    ) -> Option<WorkerId> {
        let session = self.live.get_mut(id)?;
        if !session.state.is_on_worker() || session.epoch != epoch || !session.deadline_expired {
            return None;
        }
        session.state = SessionState::Failed;
        session.failure = Some(FailureReason::TimedOut);
        session.completed_at = Some(now);
        warn!(build_id = %id, "Build timed out");
        session.assigned_worker.take()
    }

    /// The worker acknowledged a cancellation.
    pub fn on_cleanup_confirmed(&mut self, id: &BuildId, worker: &WorkerId) -> bool {
        match self.live.get_mut(id) {
            Some(session) if session.cleanup_worker.as_ref() == Some(worker) => {
                session.cleanup_worker = None;
                true
            }
            _ => false,
        }
    }

    /// The worker never confirmed a cancellation. Returns the worker whose
    /// slot to release.
    pub fn on_cleanup_timeout(&mut self, id: &BuildId, epoch: u32) -> Option<WorkerId> {
        let session = self.live.get_mut(id)?;
        if session.epoch != epoch {
            return None;
        }
        let worker = session.cleanup_worker.take()?;
        warn!(build_id = %id, worker_id = %worker, "Worker did not confirm cancellation");
        Some(worker)
    }

    /// Move a terminal session with no pending cleanup out of live tracking.
    pub fn evict(&mut self, id: &BuildId) -> Option<BuildSession> {
        match self.live.get(id) {
            Some(session) if session.is_terminal() && session.cleanup_worker.is_none() => {}
            _ => return None,
        }
        let session = self.live.remove(id)?;
        if self.history_limit > 0 {
            if self.recent.len() >= self.history_limit {
                self.recent.pop_front();
            }
            self.recent.push_back(session.clone());
        }
        Some(session)
    }

    /// Live session, or a recently finished one.
    pub fn get(&self, id: &BuildId) -> Option<&BuildSession> {
        self.live
            .get(id)
            .or_else(|| self.recent.iter().rev().find(|s| s.id == *id))
    }

    pub fn is_live(&self, id: &BuildId) -> bool {
        self.live.contains_key(id)
    }

    pub fn live(&self) -> impl Iterator<Item = &BuildSession> {
        self.live.values()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

fn resolve_lost(
    session: &mut BuildSession,
    cause: RetryCause,
    max_retries: u32,
    now: DateTime<Utc>,
) -> LostOutcome {
    session.state = SessionState::Lost;
    session.assigned_worker = None;
    session.started_at = None;

    if session.retry_count < max_retries {
        session.retry_count += 1;
        session.state = SessionState::Queued;
        info!(
            build_id = %session.id,
            retry = session.retry_count,
            cause = %cause,
            "Requeueing build"
        );
        LostOutcome::Requeued(session.request.clone())
    } else {
        session.state = SessionState::Failed;
        session.completed_at = Some(now);
        warn!(build_id = %session.id, cause = %cause, "Build failed, retries exhausted");
        session.failure = Some(FailureReason::RetriesExhausted { last: cause });
        LostOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_retries: u32) -> SessionManager {
        SessionManager::new(max_retries, 8)
    }

    fn admit(manager: &mut SessionManager) -> BuildId {
        let request = Arc::new(BuildRequest::new("acme/app", "abc", 0, "test"));
        manager.admit(request).unwrap().id
    }

    fn assert_invariants(manager: &SessionManager) {
        for session in manager.live() {
            assert_eq!(
                session.assigned_worker.is_some(),
                session.state.is_on_worker(),
                "{session:?}"
            );
            assert!(session.retry_count <= manager.max_retries);
            assert_ne!(session.state, SessionState::Lost);
        }
    }

    #[test]
    fn test_happy_path() {
        let mut m = manager(1);
        let w = WorkerId::new("w1");
        let id = admit(&mut m);
        let now = Utc::now();

        assert_eq!(m.dispatch(&id, &w, now), Some(1));
        assert_eq!(m.get(&id).unwrap().state, SessionState::Dispatched);
        assert!(m.on_worker_ack(&id, &w, now));
        assert_eq!(m.get(&id).unwrap().state, SessionState::Running);
        assert!(m.on_status_update(&id, &w, 12, now));
        assert_eq!(m.get(&id).unwrap().log_offset, 12);
        assert_invariants(&m);

        assert_eq!(
            m.on_terminal(&id, &w, 0, now),
            TerminalOutcome::Finished { worker: w.clone() }
        );
        let session = m.get(&id).unwrap();
        assert_eq!(session.state, SessionState::Succeeded);
        assert_eq!(session.exit_code, Some(0));
        assert_invariants(&m);
    }

    #[test]
    fn test_non_zero_exit_fails_without_retry() {
        let mut m = manager(3);
        let w = WorkerId::new("w1");
        let id = admit(&mut m);
        let now = Utc::now();
        m.dispatch(&id, &w, now);
        m.on_worker_ack(&id, &w, now);
        m.on_terminal(&id, &w, 2, now);

        let session = m.get(&id).unwrap();
        assert_eq!(session.state, SessionState::Failed);
        assert_eq!(session.failure, Some(FailureReason::ExitCode { code: 2 }));
        assert_eq!(session.retry_count, 0);
    }

    #[test]
    fn test_duplicate_admission_rejected() {
        let mut m = manager(0);
        let request = Arc::new(BuildRequest::new("acme/app", "abc", 0, "test"));
        m.admit(request.clone()).unwrap();
        assert_eq!(
            m.admit(request.clone()).unwrap_err(),
            AdmissionError::Duplicate(request.id)
        );
    }

    #[test]
    fn test_status_update_counts_as_ack() {
        let mut m = manager(0);
        let w = WorkerId::new("w1");
        let id = admit(&mut m);
        let now = Utc::now();
        m.dispatch(&id, &w, now);
        assert!(m.on_status_update(&id, &w, 0, now));
        assert_eq!(m.get(&id).unwrap().state, SessionState::Running);
    }

    #[test]
    fn test_messages_from_other_worker_ignored() {
        let mut m = manager(0);
        let (w1, w2) = (WorkerId::new("w1"), WorkerId::new("w2"));
        let id = admit(&mut m);
        let now = Utc::now();
        m.dispatch(&id, &w1, now);

        assert!(!m.on_worker_ack(&id, &w2, now));
        assert!(!m.on_status_update(&id, &w2, 5, now));
        assert_eq!(m.on_terminal(&id, &w2, 0, now), TerminalOutcome::Ignored);
        assert_eq!(m.get(&id).unwrap().state, SessionState::Dispatched);
    }

    #[test]
    fn test_lost_requeues_while_retries_remain() {
        let mut m = manager(1);
        let w = WorkerId::new("w1");
        let id = admit(&mut m);
        let now = Utc::now();
        m.dispatch(&id, &w, now);
        m.on_worker_ack(&id, &w, now);

        let outcomes = m.on_worker_lost(&[id], &w, now);
        assert!(matches!(
            outcomes.as_slice(),
            [(lost, Some(LostOutcome::Requeued(_)))] if *lost == id
        ));
        let session = m.get(&id).unwrap();
        assert_eq!(session.state, SessionState::Queued);
        assert_eq!(session.retry_count, 1);
        assert!(session.assigned_worker.is_none());
        assert_invariants(&m);

        // Second loss exhausts the single retry
        assert_eq!(m.dispatch(&id, &w, now), Some(2));
        let outcomes = m.on_worker_lost(&[id], &w, now);
        assert!(matches!(outcomes.as_slice(), [(_, Some(LostOutcome::Failed))]));
        let session = m.get(&id).unwrap();
        assert_eq!(session.state, SessionState::Failed);
        assert!(matches!(
            session.failure,
            Some(FailureReason::RetriesExhausted {
                last: RetryCause::WorkerLost { .. }
            })
        ));
        assert_invariants(&m);
    }

    #[test]
    fn test_lost_with_no_retries_fails() {
        let mut m = manager(0);
        let w = WorkerId::new("w1");
        let id = admit(&mut m);
        m.dispatch(&id, &w, Utc::now());
        let outcomes = m.on_worker_lost(&[id], &w, Utc::now());
        assert!(matches!(outcomes.as_slice(), [(_, Some(LostOutcome::Failed))]));
    }

    #[test]
    fn test_dispatch_failure_respects_epoch() {
        let mut m = manager(2);
        let w = WorkerId::new("w1");
        let id = admit(&mut m);
        let epoch = m.dispatch(&id, &w, Utc::now()).unwrap();

        let cause = RetryCause::AckTimeout {
            worker_id: w.clone(),
        };
        assert!(
            m.on_dispatch_failed(&id, Some(epoch + 1), cause.clone(), Utc::now())
                .is_none()
        );
        assert!(matches!(
            m.on_dispatch_failed(&id, Some(epoch), cause.clone(), Utc::now()),
            Some(LostOutcome::Requeued(_))
        ));
        // Already back in the queue
        assert!(
            m.on_dispatch_failed(&id, Some(epoch), cause, Utc::now())
                .is_none()
        );
    }

    #[test]
    fn test_ack_after_running_does_not_fail_dispatch() {
        let mut m = manager(2);
        let w = WorkerId::new("w1");
        let id = admit(&mut m);
        let epoch = m.dispatch(&id, &w, Utc::now()).unwrap();
        m.on_worker_ack(&id, &w, Utc::now());

        let cause = RetryCause::AckTimeout { worker_id: w };
        assert!(
            m.on_dispatch_failed(&id, Some(epoch), cause, Utc::now())
                .is_none()
        );
        assert_eq!(m.get(&id).unwrap().state, SessionState::Running);
    }

    #[test]
    fn test_cancel_queued() {
        let mut m = manager(0);
        let id = admit(&mut m);
        assert_eq!(m.cancel(&id, Utc::now()), CancelOutcome::Dequeue);
        assert_eq!(m.get(&id).unwrap().state, SessionState::Cancelled);
        assert_eq!(m.cancel(&id, Utc::now()), CancelOutcome::AlreadyTerminal);
        assert_eq!(m.cancel(&BuildId::new(), Utc::now()), CancelOutcome::Unknown);
        assert!(m.evict(&id).is_some());
    }

    #[test]
    fn test_cancel_running_waits_for_cleanup() {
        let mut m = manager(0);
        let w = WorkerId::new("w1");
        let id = admit(&mut m);
        let now = Utc::now();
        let epoch = m.dispatch(&id, &w, now).unwrap();
        m.on_worker_ack(&id, &w, now);

        assert_eq!(
            m.cancel(&id, now),
            CancelOutcome::StopWorker {
                worker: w.clone(),
                epoch
            }
        );
        let session = m.get(&id).unwrap();
        assert_eq!(session.state, SessionState::Cancelled);
        assert!(session.assigned_worker.is_none());
        assert_eq!(session.cleanup_worker, Some(w.clone()));
        assert_invariants(&m);

        // Not evictable until the worker confirms
        assert!(m.evict(&id).is_none());

        // A late terminal report confirms the stop but keeps Cancelled
        assert_eq!(
            m.on_terminal(&id, &w, 137, now),
            TerminalOutcome::CleanupConfirmed { worker: w.clone() }
        );
        assert_eq!(m.get(&id).unwrap().state, SessionState::Cancelled);
        assert!(m.evict(&id).is_some());
        assert!(!m.is_live(&id));
        assert_eq!(m.get(&id).unwrap().state, SessionState::Cancelled);
    }

    #[test]
    fn test_cleanup_timeout_releases_worker() {
        let mut m = manager(0);
        let w = WorkerId::new("w1");
        let id = admit(&mut m);
        let epoch = m.dispatch(&id, &w, Utc::now()).unwrap();
        m.cancel(&id, Utc::now());

        assert_eq!(m.on_cleanup_timeout(&id, epoch), Some(w.clone()));
        assert_eq!(m.on_cleanup_timeout(&id, epoch), None);
        assert!(!m.on_cleanup_confirmed(&id, &w));
        assert_eq!(m.get(&id).unwrap().state, SessionState::Cancelled);
    }

    #[test]
    fn test_deadline_then_grace_fails_with_timeout() {
        let mut m = manager(3);
        let w = WorkerId::new("w1");
        let id = admit(&mut m);
        let now = Utc::now();
        let epoch = m.dispatch(&id, &w, now).unwrap();
        m.on_worker_ack(&id, &w, now);

        // Grace without deadline does nothing
        assert!(m.on_termination_grace(&id, epoch, now).is_none());
        assert_eq!(m.on_deadline(&id, epoch), Some(w.clone()));
        assert_eq!(m.on_termination_grace(&id, epoch, now), Some(w));

        let session = m.get(&id).unwrap();
        assert_eq!(session.state, SessionState::Failed);
        assert_eq!(session.failure, Some(FailureReason::TimedOut));
        assert_eq!(session.retry_count, 0);
        assert_invariants(&m);
    }

    #[test]
    fn test_terminal_within_grace_wins() {
        let mut m = manager(0);
        let w = WorkerId::new("w1");
        let id = admit(&mut m);
        let now = Utc::now();
        let epoch = m.dispatch(&id, &w, now).unwrap();
        m.on_worker_ack(&id, &w, now);
        m.on_deadline(&id, epoch);

        assert_eq!(
            m.on_terminal(&id, &w, 0, now),
            TerminalOutcome::Finished { worker: w }
        );
        assert!(m.on_termination_grace(&id, epoch, now).is_none());
        assert_eq!(m.get(&id).unwrap().state, SessionState::Succeeded);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut m = SessionManager::new(0, 2);
        let ids: Vec<_> = (0..3).map(|_| admit(&mut m)).collect();
        for id in &ids {
            m.cancel(id, Utc::now());
            m.evict(id);
        }
        assert!(m.get(&ids[0]).is_none());
        assert!(m.get(&ids[1]).is_some());
        assert!(m.get(&ids[2]).is_some());
    }
}
