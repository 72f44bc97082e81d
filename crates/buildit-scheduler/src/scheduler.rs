//! Placement of queued requests onto workers.

use buildit_core::{BuildId, BuildRequest, WorkerId};
use chrono::Utc;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::queue::JobQueue;
use crate::registry::{WorkerRecord, WorkerRegistry};
use crate::session::SessionManager;

/// A request that was moved from the queue onto a worker.
#[derive(Debug, Clone)]
pub struct Placement {
    pub build_id: BuildId,
    pub worker_id: WorkerId,
    /// Dispatch epoch of the session, carried by its timers.
    pub epoch: u32,
    pub request: Arc<BuildRequest>,
}

/// The only component that reserves and releases worker slots.
#[derive(Debug, Default)]
pub struct Scheduler {
    placed: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total placements made so far.
    pub fn placed(&self) -> u64 {
        self.placed
    }

    /// Place queued requests until the queue is empty or no worker is
    /// eligible. The slot reservation, dequeue and session transition of a
    /// placement happen together.
    pub fn schedule(
        &mut self,
        queue: &mut JobQueue,
        registry: &mut WorkerRegistry,
        sessions: &mut SessionManager,
        now: Instant,
    ) -> Vec<Placement> {
        let mut placements = Vec::new();

        while let Some(head) = queue.peek() {
            let build_id = head.id;
            let Some(worker_id) = select_worker(registry) else {
                debug!(queued = queue.size(), "No eligible worker, waiting");
                break;
            };

            if !registry.reserve_slot(&worker_id, build_id, now) {
                warn!(worker_id = %worker_id, build_id = %build_id, "Selected worker refused slot");
                break;
            }
            let Some(request) = queue.dequeue() else {
                registry.release_slot(&worker_id, &build_id);
                break;
            };

            match sessions.dispatch(&build_id, &worker_id, Utc::now()) {
                Some(epoch) => {
                    self.placed += 1;
                    info!(
                        build_id = %build_id,
                        worker_id = %worker_id,
                        priority = request.priority,
                        epoch,
                        "Build placed"
                    );
                    placements.push(Placement {
                        build_id,
                        worker_id,
                        epoch,
                        request,
                    });
                }
                None => {
                    // Queue entry without a queued session; drop it
                    warn!(build_id = %build_id, "Dropping queue entry with no queued session");
                    registry.release_slot(&worker_id, &build_id);
                }
            }
        }

        placements
    }

    /// Give a build's slot back to its worker.
    pub fn release(&self, registry: &mut WorkerRegistry, worker_id: &WorkerId, build_id: &BuildId) -> bool {
        let released = registry.release_slot(worker_id, build_id);
        if released {
            debug!(worker_id = %worker_id, build_id = %build_id, "Slot released");
        }
        released
    }
}

/// Most free slots wins; ties go to the worker assigned least recently,
/// with never-assigned workers first and the worker id as a last resort.
pub fn select_worker(registry: &WorkerRegistry) -> Option<WorkerId> {
    registry
        .workers()
        .filter(|w| w.is_eligible())
        .min_by(|a, b| placement_order(a, b))
        .map(|w| w.id.clone())
}

fn placement_order(a: &WorkerRecord, b: &WorkerRecord) -> Ordering {
    b.free_slots
        .cmp(&a.free_slots)
        .then_with(|| match (a.last_assigned, b.last_assigned) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y),
        })
        .then_with(|| a.id.cmp(&b.id))
}
