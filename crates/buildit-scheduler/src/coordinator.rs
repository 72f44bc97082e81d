//! The serialized coordination loop.
//!
//! One task owns the queue, registry, sessions and scheduler. Worker
//! events, gateway commands, timer firings and the liveness tick are all
//! processed here one at a time, so a slot reservation and the session
//! transition that goes with it can never interleave with another event.

use buildit_config::{DispatchConfig, HeartbeatConfig, MasterConfig};
use buildit_core::{
    BuildId, BuildRequest, BuildSession, BuildSpec, ChannelEvent, ConnectionId, MasterMessage,
    Outbound, RemoteBuildState, RetryCause, SessionState, WebhookAdapter, WorkerId, WorkerMessage,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AdmissionError, CoordinatorError};
use crate::queue::JobQueue;
use crate::registry::{
    HeartbeatOutcome, RegistryEvent, WorkerRegistry, WorkerSnapshot, WorkerStatus,
};
use crate::scheduler::{Placement, Scheduler};
use crate::session::{CancelOutcome, LostOutcome, SessionManager, TerminalOutcome};

/// Limits the coordinator runs with.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub heartbeat: HeartbeatConfig,
    pub dispatch: DispatchConfig,
    pub max_queue_depth: usize,
    pub history_limit: usize,
    /// Pending gateway commands before `submit` and friends wait.
    pub command_buffer: usize,
    /// Build events buffered per subscriber before it lags.
    pub event_buffer: usize,
}

impl CoordinatorSettings {
    pub fn from_config(config: &MasterConfig) -> Self {
        Self {
            heartbeat: config.heartbeat.clone(),
            dispatch: config.dispatch.clone(),
            max_queue_depth: config.queue.max_depth,
            history_limit: config.history_limit,
            command_buffer: 256,
            event_buffer: 1024,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&MasterConfig::default())
    }
}

/// Build lifecycle notifications for observers (dashboards, storage).
#[derive(Debug, Clone)]
pub enum BuildEvent {
    Admitted {
        build_id: BuildId,
        priority: i32,
    },
    Dispatched {
        build_id: BuildId,
        worker_id: WorkerId,
        attempt: u32,
    },
    Started {
        build_id: BuildId,
        worker_id: WorkerId,
    },
    Log {
        build_id: BuildId,
        chunk: String,
    },
    Requeued {
        build_id: BuildId,
        retry: u32,
        cause: RetryCause,
    },
    /// Final snapshot of a session leaving live tracking.
    Finished(BuildSession),
}

/// Operator-facing counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub queued: usize,
    pub max_queue_depth: usize,
    pub oldest_queued_secs: Option<i64>,
    pub live_sessions: usize,
    pub workers: usize,
    pub eligible_workers: usize,
    pub free_slots: u32,
    pub placed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    AckTimeout,
    Deadline,
    TerminationGrace,
    CancelCleanup,
}

/// A session timer expired. Firings from an older dispatch are ignored.
#[derive(Debug, Clone, Copy)]
pub struct TimerFired {
    pub build_id: BuildId,
    pub epoch: u32,
    pub kind: TimerKind,
}

enum Command {
    Submit {
        request: BuildRequest,
        reply: oneshot::Sender<Result<BuildId, AdmissionError>>,
    },
    Status {
        build_id: BuildId,
        reply: oneshot::Sender<Option<BuildSession>>,
    },
    Cancel {
        build_id: BuildId,
        reply: oneshot::Sender<bool>,
    },
    DrainWorker {
        worker_id: WorkerId,
        reply: oneshot::Sender<bool>,
    },
    Workers {
        reply: oneshot::Sender<Vec<WorkerSnapshot>>,
    },
    Stats {
        reply: oneshot::Sender<CoordinatorStats>,
    },
}

pub struct Coordinator {
    settings: CoordinatorSettings,
    queue: JobQueue,
    registry: WorkerRegistry,
    sessions: SessionManager,
    scheduler: Scheduler,
    outbound: Arc<dyn Outbound>,
    channel_events: mpsc::Receiver<ChannelEvent>,
    commands: mpsc::Receiver<Command>,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    /// Pending timer tasks per session, aborted on redispatch and eviction.
    timers: HashMap<BuildId, Vec<AbortHandle>>,
    events: broadcast::Sender<BuildEvent>,
    shutdown: CancellationToken,
    needs_schedule: bool,
    finished: Vec<BuildId>,
}

impl Coordinator {
    pub fn new(
        settings: CoordinatorSettings,
        outbound: Arc<dyn Outbound>,
        channel_events: mpsc::Receiver<ChannelEvent>,
        shutdown: CancellationToken,
    ) -> (Self, CoordinatorHandle) {
        let (command_tx, commands) = mpsc::channel(settings.command_buffer.max(1));
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));

        let handle = CoordinatorHandle {
            commands: command_tx,
            events: events.clone(),
        };

        let coordinator = Self {
            queue: JobQueue::new(settings.max_queue_depth),
            registry: WorkerRegistry::new(settings.heartbeat.clone()),
            sessions: SessionManager::new(settings.dispatch.max_retries, settings.history_limit),
            scheduler: Scheduler::new(),
            settings,
            outbound,
            channel_events,
            commands,
            timer_tx,
            timer_rx,
            timers: HashMap::new(),
            events,
            shutdown,
            needs_schedule: false,
            finished: Vec::new(),
        };

        (coordinator, handle)
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run(mut self) {
        let mut liveness = tokio::time::interval(self.settings.heartbeat.interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            max_queue_depth = self.settings.max_queue_depth,
            max_retries = self.settings.dispatch.max_retries,
            "Coordinator started"
        );

        // Unbiased: sustained worker traffic must not starve timers,
        // gateway commands or the liveness check.
        while !self.shutdown.is_cancelled() {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(event) = self.channel_events.recv() => self.handle_channel_event(event),
                Some(timer) = self.timer_rx.recv() => self.handle_timer(timer),
                Some(command) = self.commands.recv() => self.handle_command(command),
                _ = liveness.tick() => self.check_liveness(),
            };
            self.settle();
        }

        info!(
            queued = self.queue.size(),
            live_sessions = self.sessions.live_count(),
            "Coordinator stopped"
        );
    }

    /// Apply follow-ups of the last event: registry membership changes,
    /// placements and evictions.
    fn settle(&mut self) {
        for event in self.registry.drain_events() {
            match event {
                RegistryEvent::WorkerJoined { .. } => self.needs_schedule = true,
                RegistryEvent::WorkerLeft { worker_id } => {
                    debug!(worker_id = %worker_id, "Worker left");
                }
                RegistryEvent::WorkerLost {
                    worker_id,
                    conn_id,
                    sessions,
                } => self.handle_worker_lost(&worker_id, conn_id, &sessions),
            }
        }

        if std::mem::take(&mut self.needs_schedule) {
            let placements = self.scheduler.schedule(
                &mut self.queue,
                &mut self.registry,
                &mut self.sessions,
                Instant::now(),
            );
            for placement in placements {
                self.send_dispatch(placement);
            }
        }

        for build_id in std::mem::take(&mut self.finished) {
            if let Some(session) = self.sessions.evict(&build_id) {
                self.cancel_timers(&build_id);
                debug!(build_id = %build_id, state = %session.state, "Session evicted");
                self.publish(BuildEvent::Finished(session));
            }
        }
    }

    fn send_dispatch(&mut self, placement: Placement) {
        let Placement {
            build_id,
            worker_id,
            epoch,
            request,
        } = placement;
        let attempt = self
            .sessions
            .get(&build_id)
            .map(|s| s.retry_count)
            .unwrap_or_default();
        let spec = BuildSpec::for_request(&request, attempt, self.settings.dispatch.max_build_duration);

        self.cancel_timers(&build_id);

        // A failed send is resolved by the ack timeout
        if let Err(e) = self
            .outbound
            .send(&worker_id, MasterMessage::DispatchBuild { build_id, spec })
        {
            warn!(build_id = %build_id, worker_id = %worker_id, error = %e, "Dispatch send failed");
        }

        self.arm_timer(build_id, epoch, TimerKind::AckTimeout, self.settings.dispatch.ack_timeout);
        self.arm_timer(
            build_id,
            epoch,
            TimerKind::Deadline,
            self.settings.dispatch.max_build_duration,
        );
        self.publish(BuildEvent::Dispatched {
            build_id,
            worker_id,
            attempt,
        });
    }

    fn arm_timer(&mut self, build_id: BuildId, epoch: u32, kind: TimerKind, after: Duration) {
        let tx = self.timer_tx.clone();
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    let _ = tx.send(TimerFired { build_id, epoch, kind });
                }
            }
        });
        self.timers
            .entry(build_id)
            .or_default()
            .push(task.abort_handle());
    }

    fn cancel_timers(&mut self, build_id: &BuildId) {
        for timer in self.timers.remove(build_id).unwrap_or_default() {
            timer.abort();
        }
    }

    fn publish(&self, event: BuildEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn send(&self, worker_id: &WorkerId, message: MasterMessage) {
        if let Err(e) = self.outbound.send(worker_id, message) {
            debug!(worker_id = %worker_id, error = %e, "Send to worker failed");
        }
    }

    fn release(&mut self, worker_id: &WorkerId, build_id: &BuildId) {
        if self.scheduler.release(&mut self.registry, worker_id, build_id) {
            self.needs_schedule = true;
        }
    }

    fn resolve_lost(&mut self, build_id: BuildId, outcome: LostOutcome, cause: RetryCause) {
        match outcome {
            LostOutcome::Requeued(request) => {
                self.queue.requeue(request);
                self.needs_schedule = true;
                let retry = self
                    .sessions
                    .get(&build_id)
                    .map(|s| s.retry_count)
                    .unwrap_or_default();
                self.publish(BuildEvent::Requeued {
                    build_id,
                    retry,
                    cause,
                });
            }
            LostOutcome::Failed => self.finished.push(build_id),
        }
    }

    /// Ack timeout or rejection: free the slot and retry or fail.
    fn fail_dispatch(
        &mut self,
        build_id: BuildId,
        worker_id: &WorkerId,
        epoch: Option<u32>,
        cause: RetryCause,
    ) {
        let outcome = self
            .sessions
            .on_dispatch_failed(&build_id, epoch, cause.clone(), Utc::now());
        let Some(outcome) = outcome else {
            return;
        };
        self.release(worker_id, &build_id);
        self.resolve_lost(build_id, outcome, cause);
    }

    fn handle_worker_lost(
        &mut self,
        worker_id: &WorkerId,
        conn_id: Option<ConnectionId>,
        build_ids: &[BuildId],
    ) {
        // Only the connection judged lost; a redialed one may already be attached
        if let Some(conn_id) = conn_id {
            self.outbound.disconnect(worker_id, conn_id);
        }
        let outcomes = self
            .sessions
            .on_worker_lost(build_ids, worker_id, Utc::now());
        for (build_id, outcome) in outcomes {
            match outcome {
                Some(outcome) => {
                    let cause = RetryCause::WorkerLost {
                        worker_id: worker_id.clone(),
                    };
                    self.resolve_lost(build_id, outcome, cause);
                }
                // Pending cancellation, settled by the worker going away
                None => self.finished.push(build_id),
            }
        }
    }

    fn check_liveness(&mut self) {
        let lost = self.registry.check_liveness(Instant::now());
        if !lost.is_empty() {
            debug!(count = lost.len(), "Liveness check disconnected workers");
        }
    }

    /// The link is closed when the resulting `WorkerLost` is settled.
    fn protocol_violation(&mut self, worker_id: &WorkerId, reason: &str) {
        warn!(worker_id = %worker_id, reason, "Protocol violation, dropping worker");
        self.registry.mark_disconnected(worker_id, Instant::now());
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Registered {
                worker_id,
                conn_id,
                capacity,
                address,
            } => {
                if capacity == 0 {
                    warn!(worker_id = %worker_id, %conn_id, "Rejecting worker with zero capacity");
                    self.outbound.disconnect(&worker_id, conn_id);
                    return;
                }
                self.registry
                    .register(worker_id.clone(), capacity, address, conn_id, Instant::now());
                self.send(
                    &worker_id,
                    MasterMessage::RegisterAck {
                        worker_id: worker_id.clone(),
                    },
                );
            }
            ChannelEvent::Message {
                worker_id,
                conn_id,
                message,
            } => {
                if self.registry.current_connection(&worker_id) != Some(conn_id) {
                    debug!(
                        worker_id = %worker_id,
                        %conn_id,
                        kind = message.kind(),
                        "Ignoring message from stale connection"
                    );
                    return;
                }
                self.handle_message(worker_id, message);
            }
            ChannelEvent::LinkDown { worker_id, conn_id } => {
                if self.registry.detach(&worker_id, conn_id) {
                    info!(worker_id = %worker_id, %conn_id, "Worker stream dropped");
                }
            }
            ChannelEvent::ProtocolViolation {
                worker_id,
                conn_id,
                reason,
            } => match worker_id {
                Some(worker_id) if self.registry.current_connection(&worker_id) == Some(conn_id) => {
                    self.protocol_violation(&worker_id, &reason);
                }
                _ => debug!(%conn_id, reason = %reason, "Protocol violation before registration"),
            },
        }
    }

    fn handle_message(&mut self, worker_id: WorkerId, message: WorkerMessage) {
        match message {
            WorkerMessage::RegisterWorker {
                worker_id: claimed,
                capacity,
            } => {
                if claimed != worker_id || capacity == 0 {
                    self.protocol_violation(&worker_id, "invalid re-registration");
                    return;
                }
                let current = self
                    .registry
                    .get(&worker_id)
                    .and_then(|r| r.conn_id.map(|conn_id| (conn_id, r.address)));
                if let Some((conn_id, address)) = current {
                    self.registry
                        .register(worker_id.clone(), capacity, address, conn_id, Instant::now());
                    self.send(&worker_id, MasterMessage::RegisterAck { worker_id: claimed });
                }
            }
            WorkerMessage::Heartbeat {
                worker_id: claimed,
                free_slots,
                timestamp,
            } => {
                if claimed != worker_id {
                    self.protocol_violation(&worker_id, "heartbeat for another worker");
                    return;
                }
                match self
                    .registry
                    .heartbeat(&worker_id, free_slots, timestamp, Instant::now())
                {
                    HeartbeatOutcome::Accepted | HeartbeatOutcome::Duplicate => {
                        self.send(&worker_id, MasterMessage::HeartbeatAck { timestamp });
                    }
                    HeartbeatOutcome::Stale | HeartbeatOutcome::Unknown => {}
                }
            }
            WorkerMessage::DispatchAck { build_id } => {
                if self.sessions.on_worker_ack(&build_id, &worker_id, Utc::now()) {
                    debug!(build_id = %build_id, worker_id = %worker_id, "Dispatch acknowledged");
                    self.publish(BuildEvent::Started {
                        build_id,
                        worker_id,
                    });
                } else if !self.is_held_by(&build_id, &worker_id) {
                    // The build moved on; make the worker drop it
                    info!(build_id = %build_id, worker_id = %worker_id, "Late dispatch ack, cancelling");
                    self.send(&worker_id, MasterMessage::CancelBuild { build_id });
                }
            }
            WorkerMessage::DispatchReject { build_id, reason } => {
                let dispatched_here = self.sessions.get(&build_id).is_some_and(|s| {
                    s.state == SessionState::Dispatched
                        && s.assigned_worker.as_ref() == Some(&worker_id)
                });
                if dispatched_here {
                    warn!(build_id = %build_id, worker_id = %worker_id, reason = %reason, "Dispatch rejected");
                    let cause = RetryCause::Rejected {
                        worker_id: worker_id.clone(),
                        reason,
                    };
                    self.fail_dispatch(build_id, &worker_id, None, cause);
                } else if self.sessions.on_cleanup_confirmed(&build_id, &worker_id) {
                    self.release(&worker_id, &build_id);
                    self.finished.push(build_id);
                }
            }
            WorkerMessage::BuildStatus {
                build_id,
                state,
                log_chunk,
                exit_code,
            } => self.handle_status(worker_id, build_id, state, log_chunk, exit_code),
            WorkerMessage::CancelAck { build_id } => {
                if self.sessions.on_cleanup_confirmed(&build_id, &worker_id) {
                    debug!(build_id = %build_id, worker_id = %worker_id, "Cancellation confirmed");
                    self.release(&worker_id, &build_id);
                    self.finished.push(build_id);
                }
            }
        }
    }

    fn handle_status(
        &mut self,
        worker_id: WorkerId,
        build_id: BuildId,
        state: RemoteBuildState,
        log_chunk: Option<String>,
        exit_code: Option<i32>,
    ) {
        if !self.sessions.is_live(&build_id) {
            debug!(build_id = %build_id, worker_id = %worker_id, "Status for unknown build ignored");
            return;
        }
        let Some(session) = self.sessions.get(&build_id) else {
            return;
        };
        let assigned_here = session.assigned_worker.as_ref() == Some(&worker_id);
        let cleanup_here = session.cleanup_worker.as_ref() == Some(&worker_id);
        let starting = assigned_here && session.state == SessionState::Dispatched;
        let assigned_elsewhere = session.assigned_worker.is_some() && !assigned_here;

        if !assigned_here && !cleanup_here {
            if assigned_elsewhere {
                self.protocol_violation(&worker_id, "status for a build assigned to another worker");
            } else {
                debug!(build_id = %build_id, worker_id = %worker_id, "Status for build not on this worker");
            }
            return;
        }

        let chunk_len = log_chunk.as_ref().map_or(0, String::len);
        self.sessions
            .on_status_update(&build_id, &worker_id, chunk_len, Utc::now());
        if starting {
            self.publish(BuildEvent::Started {
                build_id,
                worker_id: worker_id.clone(),
            });
        }
        if let Some(chunk) = log_chunk {
            self.publish(BuildEvent::Log { build_id, chunk });
        }

        match exit_code {
            Some(code) => match self
                .sessions
                .on_terminal(&build_id, &worker_id, code, Utc::now())
            {
                TerminalOutcome::Finished { worker } | TerminalOutcome::CleanupConfirmed { worker } => {
                    self.release(&worker, &build_id);
                    self.finished.push(build_id);
                }
                TerminalOutcome::Ignored => {}
            },
            None if state == RemoteBuildState::Finished => {
                warn!(build_id = %build_id, worker_id = %worker_id, "Finished status without exit code");
            }
            None => {}
        }
    }

    fn is_held_by(&self, build_id: &BuildId, worker_id: &WorkerId) -> bool {
        self.sessions.get(build_id).is_some_and(|s| {
            s.assigned_worker.as_ref() == Some(worker_id)
                || s.cleanup_worker.as_ref() == Some(worker_id)
        })
    }

    fn handle_timer(&mut self, timer: TimerFired) {
        let TimerFired {
            build_id,
            epoch,
            kind,
        } = timer;

        match kind {
            TimerKind::AckTimeout => {
                let Some(worker_id) = self
                    .sessions
                    .get(&build_id)
                    .filter(|s| s.state == SessionState::Dispatched && s.epoch == epoch)
                    .and_then(|s| s.assigned_worker.clone())
                else {
                    return;
                };
                warn!(build_id = %build_id, worker_id = %worker_id, "Dispatch not acknowledged in time");
                self.send(&worker_id, MasterMessage::CancelBuild { build_id });
                let cause = RetryCause::AckTimeout {
                    worker_id: worker_id.clone(),
                };
                self.fail_dispatch(build_id, &worker_id, Some(epoch), cause);
            }
            TimerKind::Deadline => {
                if let Some(worker_id) = self.sessions.on_deadline(&build_id, epoch) {
                    self.send(&worker_id, MasterMessage::CancelBuild { build_id });
                    self.arm_timer(
                        build_id,
                        epoch,
                        TimerKind::TerminationGrace,
                        self.settings.dispatch.termination_grace,
                    );
                }
            }
            TimerKind::TerminationGrace => {
                if let Some(worker_id) =
                    self.sessions
                        .on_termination_grace(&build_id, epoch, Utc::now())
                {
                    self.release(&worker_id, &build_id);
                    self.finished.push(build_id);
                }
            }
            TimerKind::CancelCleanup => {
                if let Some(worker_id) = self.sessions.on_cleanup_timeout(&build_id, epoch) {
                    self.release(&worker_id, &build_id);
                    self.finished.push(build_id);
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        // A dropped reply receiver means the caller gave up
        match command {
            Command::Submit { request, reply } => {
                let _ = reply.send(self.admit(request));
            }
            Command::Status { build_id, reply } => {
                let _ = reply.send(self.sessions.get(&build_id).cloned());
            }
            Command::Cancel { build_id, reply } => {
                let _ = reply.send(self.cancel(build_id));
            }
            Command::DrainWorker { worker_id, reply } => {
                let _ = reply.send(self.registry.drain(&worker_id));
            }
            Command::Workers { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn admit(&mut self, request: BuildRequest) -> Result<BuildId, AdmissionError> {
        let request = Arc::new(request);
        let build_id = request.id;
        if self.sessions.get(&build_id).is_some() {
            return Err(AdmissionError::Duplicate(build_id));
        }
        if let Err(e) = self.queue.enqueue(request.clone()) {
            info!(build_id = %build_id, error = %e, "Build not admitted");
            return Err(e);
        }
        if let Err(e) = self.sessions.admit(request.clone()) {
            self.queue.cancel(&build_id);
            return Err(e);
        }

        info!(
            build_id = %build_id,
            repository = %request.repository,
            commit = %request.commit,
            priority = request.priority,
            source = %request.source,
            "Build admitted"
        );
        self.publish(BuildEvent::Admitted {
            build_id,
            priority: request.priority,
        });
        self.needs_schedule = true;
        Ok(build_id)
    }

    fn cancel(&mut self, build_id: BuildId) -> bool {
        match self.sessions.cancel(&build_id, Utc::now()) {
            CancelOutcome::Unknown | CancelOutcome::AlreadyTerminal => false,
            CancelOutcome::Dequeue => {
                self.queue.cancel(&build_id);
                self.finished.push(build_id);
                true
            }
            CancelOutcome::StopWorker { worker, epoch } => {
                self.send(&worker, MasterMessage::CancelBuild { build_id });
                self.arm_timer(
                    build_id,
                    epoch,
                    TimerKind::CancelCleanup,
                    self.settings.dispatch.cancel_grace,
                );
                true
            }
        }
    }

    fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            queued: self.queue.size(),
            max_queue_depth: self.queue.max_depth(),
            oldest_queued_secs: self
                .queue
                .oldest_age(Utc::now())
                .map(|age| age.num_seconds()),
            live_sessions: self.sessions.live_count(),
            workers: self.registry.len(),
            eligible_workers: self.registry.workers().filter(|w| w.is_eligible()).count(),
            free_slots: self
                .registry
                .workers()
                .filter(|w| w.status == WorkerStatus::Connected)
                .map(|w| w.free_slots)
                .sum(),
            placed: self.scheduler.placed(),
        }
    }
}

/// Cloneable client of a running [`Coordinator`].
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<BuildEvent>,
}

impl CoordinatorHandle {
    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    /// Admit a build request. Backpressure is returned as an error for the
    /// caller to retry later.
    pub async fn submit(&self, request: BuildRequest) -> Result<BuildId, CoordinatorError> {
        self.call(|reply| Command::Submit { request, reply })
            .await?
            .map_err(CoordinatorError::from)
    }

    /// Parse a provider payload with `adapter` and admit the result.
    pub async fn submit_webhook(
        &self,
        adapter: &dyn WebhookAdapter,
        payload: &[u8],
    ) -> Result<BuildId, CoordinatorError> {
        let request = adapter.to_build_request(payload).await?;
        self.submit(request).await
    }

    /// Snapshot of a live or recently finished session.
    pub async fn status(&self, build_id: BuildId) -> Result<Option<BuildSession>, CoordinatorError> {
        self.call(|reply| Command::Status { build_id, reply }).await
    }

    /// Returns true if the build was cancelled by this call.
    pub async fn cancel(&self, build_id: BuildId) -> Result<bool, CoordinatorError> {
        self.call(|reply| Command::Cancel { build_id, reply }).await
    }

    pub async fn drain_worker(&self, worker_id: WorkerId) -> Result<bool, CoordinatorError> {
        self.call(|reply| Command::DrainWorker { worker_id, reply })
            .await
    }

    pub async fn workers(&self) -> Result<Vec<WorkerSnapshot>, CoordinatorError> {
        self.call(|reply| Command::Workers { reply }).await
    }

    pub async fn stats(&self) -> Result<CoordinatorStats, CoordinatorError> {
        self.call(|reply| Command::Stats { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.events.subscribe()
    }
}
