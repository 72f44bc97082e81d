//! Worker registry: capacity, slot accounting and heartbeat liveness.
//!
//! Slot counts are owned by the master. Heartbeats carry the worker's own
//! view of its free slots, which is kept for diagnostics but never changes
//! the accounting used for placement.

use buildit_config::HeartbeatConfig;
use buildit_core::{BuildId, ConnectionId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Connected,
    /// Finishing current builds, accepts no new ones.
    Draining,
    Disconnected,
}

/// Registry-side record of a worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub address: SocketAddr,
    pub capacity: u32,
    pub free_slots: u32,
    /// Free slots the worker last claimed in a heartbeat.
    pub reported_free_slots: Option<u32>,
    pub status: WorkerStatus,
    /// Local receive time of the last heartbeat (or registration).
    pub last_heartbeat: Instant,
    /// Worker clock of the last accepted heartbeat.
    pub last_timestamp: Option<DateTime<Utc>>,
    pub missed_heartbeats: u32,
    pub last_assigned: Option<Instant>,
    pub assigned: BTreeSet<BuildId>,
    /// Live connection, `None` while the stream is down.
    pub conn_id: Option<ConnectionId>,
    pub registered_at: DateTime<Utc>,
    pub disconnected_at: Option<Instant>,
}

impl WorkerRecord {
    fn new(
        id: WorkerId,
        capacity: u32,
        address: SocketAddr,
        conn_id: ConnectionId,
        now: Instant,
    ) -> Self {
        Self {
            id,
            address,
            capacity,
            free_slots: capacity,
            reported_free_slots: None,
            status: WorkerStatus::Connected,
            last_heartbeat: now,
            last_timestamp: None,
            missed_heartbeats: 0,
            last_assigned: None,
            assigned: BTreeSet::new(),
            conn_id: Some(conn_id),
            registered_at: Utc::now(),
            disconnected_at: None,
        }
    }

    /// Connected, attached and with a free slot.
    pub fn is_eligible(&self) -> bool {
        self.status == WorkerStatus::Connected && self.conn_id.is_some() && self.free_slots > 0
    }

    fn recompute_free(&mut self) {
        let used = u32::try_from(self.assigned.len()).unwrap_or(u32::MAX);
        self.free_slots = self.capacity.saturating_sub(used);
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.clone(),
            address: self.address,
            capacity: self.capacity,
            free_slots: self.free_slots,
            reported_free_slots: self.reported_free_slots,
            status: self.status,
            attached: self.conn_id.is_some(),
            missed_heartbeats: self.missed_heartbeats,
            assigned: self.assigned.iter().copied().collect(),
            registered_at: self.registered_at,
        }
    }
}

/// Point-in-time view of a worker for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub address: SocketAddr,
    pub capacity: u32,
    pub free_slots: u32,
    pub reported_free_slots: Option<u32>,
    pub status: WorkerStatus,
    pub attached: bool,
    pub missed_heartbeats: u32,
    pub assigned: Vec<BuildId>,
    pub registered_at: DateTime<Utc>,
}

/// Returned by [`WorkerRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub worker_id: WorkerId,
    pub conn_id: ConnectionId,
    pub capacity: u32,
    /// The worker was already known and kept its assigned builds.
    pub reattached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Accepted,
    /// Same timestamp as the last one; only the liveness clock moved.
    Duplicate,
    /// Older than the last accepted heartbeat; ignored.
    Stale,
    /// Unknown or disconnected worker; it must register again.
    Unknown,
}

/// Membership changes the coordinator reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    WorkerJoined {
        worker_id: WorkerId,
    },
    WorkerLeft {
        worker_id: WorkerId,
    },
    /// Builds the worker held when it was declared disconnected, and the
    /// connection it was attached through at that point, if any.
    WorkerLost {
        worker_id: WorkerId,
        conn_id: Option<ConnectionId>,
        sessions: Vec<BuildId>,
    },
}

/// Tracks connected workers.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, WorkerRecord>,
    heartbeat: HeartbeatConfig,
    pending: Vec<RegistryEvent>,
}

impl WorkerRegistry {
    pub fn new(heartbeat: HeartbeatConfig) -> Self {
        Self {
            workers: HashMap::new(),
            heartbeat,
            pending: Vec::new(),
        }
    }

    /// Register a worker, or re-attach one whose stream dropped.
    pub fn register(
        &mut self,
        worker_id: WorkerId,
        capacity: u32,
        address: SocketAddr,
        conn_id: ConnectionId,
        now: Instant,
    ) -> WorkerHandle {
        let reattached = match self.workers.get_mut(&worker_id) {
            Some(record) if record.status != WorkerStatus::Disconnected => {
                record.capacity = capacity;
                record.address = address;
                record.conn_id = Some(conn_id);
                record.last_heartbeat = now;
                record.missed_heartbeats = 0;
                record.recompute_free();
                info!(
                    worker_id = %worker_id,
                    capacity,
                    assigned = record.assigned.len(),
                    "Worker re-attached"
                );
                true
            }
            _ => {
                self.workers.insert(
                    worker_id.clone(),
                    WorkerRecord::new(worker_id.clone(), capacity, address, conn_id, now),
                );
                info!(worker_id = %worker_id, capacity, %address, "Worker registered");
                false
            }
        };

        self.pending.push(RegistryEvent::WorkerJoined {
            worker_id: worker_id.clone(),
        });

        WorkerHandle {
            worker_id,
            conn_id,
            capacity,
            reattached,
        }
    }

    /// Record a heartbeat. Never changes slot accounting.
    pub fn heartbeat(
        &mut self,
        worker_id: &WorkerId,
        reported_free: u32,
        timestamp: DateTime<Utc>,
        now: Instant,
    ) -> HeartbeatOutcome {
        let Some(record) = self.workers.get_mut(worker_id) else {
            return HeartbeatOutcome::Unknown;
        };
        if record.status == WorkerStatus::Disconnected {
            return HeartbeatOutcome::Unknown;
        }

        if let Some(last) = record.last_timestamp {
            if timestamp < last {
                debug!(worker_id = %worker_id, %timestamp, %last, "Ignoring stale heartbeat");
                return HeartbeatOutcome::Stale;
            }
        }

        record.last_heartbeat = now;
        record.missed_heartbeats = 0;

        if record.last_timestamp == Some(timestamp) {
            return HeartbeatOutcome::Duplicate;
        }

        record.last_timestamp = Some(timestamp);
        record.reported_free_slots = Some(reported_free);
        if reported_free != record.free_slots {
            debug!(
                worker_id = %worker_id,
                reported = reported_free,
                tracked = record.free_slots,
                "Worker slot report differs from master accounting"
            );
        }
        HeartbeatOutcome::Accepted
    }

    /// Claim a slot on the worker for a build. Fails if the worker is not
    /// eligible or has no free slot.
    pub fn reserve_slot(&mut self, worker_id: &WorkerId, build_id: BuildId, now: Instant) -> bool {
        let Some(record) = self.workers.get_mut(worker_id) else {
            return false;
        };
        if !record.is_eligible() || record.assigned.contains(&build_id) {
            return false;
        }
        record.assigned.insert(build_id);
        record.last_assigned = Some(now);
        record.recompute_free();
        true
    }

    /// Give a build's slot back. Returns false if the worker did not hold it.
    pub fn release_slot(&mut self, worker_id: &WorkerId, build_id: &BuildId) -> bool {
        let Some(record) = self.workers.get_mut(worker_id) else {
            return false;
        };
        let released = record.assigned.remove(build_id);
        record.recompute_free();
        released
    }

    /// Declare a worker gone. Returns the builds it held, or `None` if it was
    /// unknown or already disconnected.
    pub fn mark_disconnected(&mut self, worker_id: &WorkerId, now: Instant) -> Option<Vec<BuildId>> {
        let record = self.workers.get_mut(worker_id)?;
        if record.status == WorkerStatus::Disconnected {
            return None;
        }

        record.status = WorkerStatus::Disconnected;
        record.disconnected_at = Some(now);
        let conn_id = record.conn_id.take();
        let sessions: Vec<BuildId> = std::mem::take(&mut record.assigned).into_iter().collect();
        record.recompute_free();

        warn!(
            worker_id = %worker_id,
            sessions = sessions.len(),
            missed = record.missed_heartbeats,
            "Worker disconnected"
        );

        self.pending.push(RegistryEvent::WorkerLost {
            worker_id: worker_id.clone(),
            conn_id,
            sessions: sessions.clone(),
        });
        self.pending.push(RegistryEvent::WorkerLeft {
            worker_id: worker_id.clone(),
        });
        Some(sessions)
    }

    /// The stream for `conn_id` dropped. The worker keeps its builds and
    /// is only disconnected once heartbeats stay missing.
    pub fn detach(&mut self, worker_id: &WorkerId, conn_id: ConnectionId) -> bool {
        match self.workers.get_mut(worker_id) {
            Some(record) if record.conn_id == Some(conn_id) => {
                record.conn_id = None;
                true
            }
            _ => false,
        }
    }

    /// Stop placing new builds on a worker.
    pub fn drain(&mut self, worker_id: &WorkerId) -> bool {
        match self.workers.get_mut(worker_id) {
            Some(record) if record.status == WorkerStatus::Connected => {
                record.status = WorkerStatus::Draining;
                info!(worker_id = %worker_id, "Worker draining");
                true
            }
            _ => false,
        }
    }

    /// Count missed heartbeats, disconnect workers past the threshold and
    /// forget workers that stayed disconnected past the grace period.
    /// Returns the workers disconnected by this check.
    pub fn check_liveness(&mut self, now: Instant) -> Vec<WorkerId> {
        let interval = self.heartbeat.interval.as_nanos().max(1);
        let threshold = self.heartbeat.miss_threshold;
        let mut expired = Vec::new();

        for record in self.workers.values_mut() {
            if record.status == WorkerStatus::Disconnected {
                continue;
            }
            let elapsed = now.saturating_duration_since(record.last_heartbeat).as_nanos();
            let missed = u32::try_from(elapsed / interval).unwrap_or(u32::MAX);
            if missed > record.missed_heartbeats {
                debug!(worker_id = %record.id, missed, "Heartbeat missed");
            }
            record.missed_heartbeats = missed;
            if missed >= threshold {
                expired.push(record.id.clone());
            }
        }

        for worker_id in &expired {
            self.mark_disconnected(worker_id, now);
        }

        let grace = self.heartbeat.disconnect_grace;
        self.workers.retain(|id, record| {
            let keep = record
                .disconnected_at
                .is_none_or(|at| now.saturating_duration_since(at) < grace);
            if !keep {
                info!(worker_id = %id, "Removing disconnected worker");
            }
            keep
        });

        expired
    }

    /// Membership events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<RegistryEvent> {
        std::mem::take(&mut self.pending)
    }

    pub fn get(&self, worker_id: &WorkerId) -> Option<&WorkerRecord> {
        self.workers.get(worker_id)
    }

    /// The live connection of a worker that is not disconnected.
    pub fn current_connection(&self, worker_id: &WorkerId) -> Option<ConnectionId> {
        self.workers
            .get(worker_id)
            .filter(|r| r.status != WorkerStatus::Disconnected)
            .and_then(|r| r.conn_id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut workers: Vec<_> = self.workers.values().map(WorkerRecord::snapshot).collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(5),
            miss_threshold: 3,
            disconnect_grace: Duration::from_secs(30),
        }
    }

    fn addr() -> SocketAddr {
        "10.0.0.1:40000".parse().unwrap()
    }

    fn registry_with(worker: &str, capacity: u32, now: Instant) -> WorkerRegistry {
        let mut registry = WorkerRegistry::new(config());
        registry.register(WorkerId::new(worker), capacity, addr(), ConnectionId(1), now);
        registry
    }

    fn assert_slot_bounds(registry: &WorkerRegistry) {
        for record in registry.workers() {
            assert!(record.free_slots <= record.capacity, "{record:?}");
        }
    }

    #[test]
    fn test_register_emits_joined() {
        let now = Instant::now();
        let mut registry = registry_with("w1", 2, now);
        let events = registry.drain_events();
        assert_eq!(
            events,
            vec![RegistryEvent::WorkerJoined {
                worker_id: WorkerId::new("w1")
            }]
        );
        assert_eq!(registry.get(&WorkerId::new("w1")).unwrap().free_slots, 2);
    }

    #[test]
    fn test_reserve_and_release_stay_in_bounds() {
        let now = Instant::now();
        let w1 = WorkerId::new("w1");
        let mut registry = registry_with("w1", 2, now);
        let (a, b, c) = (BuildId::new(), BuildId::new(), BuildId::new());

        assert!(registry.reserve_slot(&w1, a, now));
        assert!(registry.reserve_slot(&w1, b, now));
        assert!(!registry.reserve_slot(&w1, c, now));
        assert_eq!(registry.get(&w1).unwrap().free_slots, 0);

        assert!(registry.release_slot(&w1, &a));
        assert!(!registry.release_slot(&w1, &a));
        assert_eq!(registry.get(&w1).unwrap().free_slots, 1);

        assert!(registry.release_slot(&w1, &b));
        assert_eq!(registry.get(&w1).unwrap().free_slots, 2);
        assert_slot_bounds(&registry);
    }

    #[test]
    fn test_duplicate_heartbeat_only_refreshes_liveness() {
        let start = Instant::now();
        let w1 = WorkerId::new("w1");
        let mut registry = registry_with("w1", 2, start);
        registry.reserve_slot(&w1, BuildId::new(), start);
        let ts = Utc::now();

        let later = start + Duration::from_secs(4);
        assert_eq!(
            registry.heartbeat(&w1, 1, ts, later),
            HeartbeatOutcome::Accepted
        );
        let even_later = start + Duration::from_secs(8);
        assert_eq!(
            registry.heartbeat(&w1, 2, ts, even_later),
            HeartbeatOutcome::Duplicate
        );

        let record = registry.get(&w1).unwrap();
        assert_eq!(record.free_slots, 1);
        assert_eq!(record.reported_free_slots, Some(1));
        assert_eq!(record.last_heartbeat, even_later);
    }

    #[test]
    fn test_stale_heartbeat_ignored() {
        let now = Instant::now();
        let w1 = WorkerId::new("w1");
        let mut registry = registry_with("w1", 1, now);
        let ts = Utc::now();
        registry.heartbeat(&w1, 1, ts, now);
        let earlier = ts - chrono::Duration::seconds(10);
        assert_eq!(
            registry.heartbeat(&w1, 0, earlier, now),
            HeartbeatOutcome::Stale
        );
        assert_eq!(registry.get(&w1).unwrap().reported_free_slots, Some(1));
    }

    #[test]
    fn test_heartbeats_do_not_change_slots() {
        let now = Instant::now();
        let w1 = WorkerId::new("w1");
        let mut registry = registry_with("w1", 3, now);
        registry.heartbeat(&w1, 0, Utc::now(), now);
        assert_eq!(registry.get(&w1).unwrap().free_slots, 3);
    }

    #[test]
    fn test_missed_heartbeats_disconnect_and_report_sessions() {
        let start = Instant::now();
        let w1 = WorkerId::new("w1");
        let mut registry = registry_with("w1", 1, start);
        let build = BuildId::new();
        registry.reserve_slot(&w1, build, start);
        registry.drain_events();

        // Two intervals missed: still connected
        assert!(registry.check_liveness(start + Duration::from_secs(11)).is_empty());
        assert_eq!(registry.get(&w1).unwrap().missed_heartbeats, 2);
        assert_eq!(registry.get(&w1).unwrap().status, WorkerStatus::Connected);

        let lost = registry.check_liveness(start + Duration::from_secs(15));
        assert_eq!(lost, vec![w1.clone()]);
        let record = registry.get(&w1).unwrap();
        assert_eq!(record.status, WorkerStatus::Disconnected);
        assert!(record.assigned.is_empty());
        assert_slot_bounds(&registry);

        let events = registry.drain_events();
        assert!(events.contains(&RegistryEvent::WorkerLost {
            worker_id: w1.clone(),
            conn_id: Some(ConnectionId(1)),
            sessions: vec![build],
        }));
        assert!(events.contains(&RegistryEvent::WorkerLeft { worker_id: w1 }));
    }

    #[test]
    fn test_disconnected_worker_removed_after_grace() {
        let start = Instant::now();
        let w1 = WorkerId::new("w1");
        let mut registry = registry_with("w1", 1, start);
        registry.mark_disconnected(&w1, start);

        registry.check_liveness(start + Duration::from_secs(29));
        assert!(registry.get(&w1).is_some());
        registry.check_liveness(start + Duration::from_secs(31));
        assert!(registry.get(&w1).is_none());
    }

    #[test]
    fn test_detached_worker_not_eligible_until_reregistered() {
        let now = Instant::now();
        let w1 = WorkerId::new("w1");
        let mut registry = registry_with("w1", 2, now);
        let held = BuildId::new();
        registry.reserve_slot(&w1, held, now);

        assert!(!registry.detach(&w1, ConnectionId(99)));
        assert!(registry.detach(&w1, ConnectionId(1)));
        assert!(!registry.reserve_slot(&w1, BuildId::new(), now));
        assert_eq!(registry.get(&w1).unwrap().status, WorkerStatus::Connected);

        let handle = registry.register(w1.clone(), 2, addr(), ConnectionId(2), now);
        assert!(handle.reattached);
        let record = registry.get(&w1).unwrap();
        assert!(record.assigned.contains(&held));
        assert_eq!(record.free_slots, 1);
        assert_eq!(registry.current_connection(&w1), Some(ConnectionId(2)));
    }

    #[test]
    fn test_reattach_with_smaller_capacity_clamps() {
        let now = Instant::now();
        let w1 = WorkerId::new("w1");
        let mut registry = registry_with("w1", 2, now);
        registry.reserve_slot(&w1, BuildId::new(), now);
        registry.reserve_slot(&w1, BuildId::new(), now);

        registry.register(w1.clone(), 1, addr(), ConnectionId(2), now);
        assert_eq!(registry.get(&w1).unwrap().free_slots, 0);
        assert_slot_bounds(&registry);
    }

    #[test]
    fn test_register_after_disconnect_starts_fresh() {
        let now = Instant::now();
        let w1 = WorkerId::new("w1");
        let mut registry = registry_with("w1", 2, now);
        registry.mark_disconnected(&w1, now);
        assert!(registry.mark_disconnected(&w1, now).is_none());

        let handle = registry.register(w1.clone(), 4, addr(), ConnectionId(2), now);
        assert!(!handle.reattached);
        let record = registry.get(&w1).unwrap();
        assert_eq!(record.status, WorkerStatus::Connected);
        assert_eq!(record.free_slots, 4);
    }

    #[test]
    fn test_draining_worker_not_eligible() {
        let now = Instant::now();
        let w1 = WorkerId::new("w1");
        let mut registry = registry_with("w1", 2, now);
        assert!(registry.drain(&w1));
        assert!(!registry.drain(&w1));
        assert!(!registry.reserve_slot(&w1, BuildId::new(), now));
        assert_eq!(registry.snapshot()[0].status, WorkerStatus::Draining);
    }
}
