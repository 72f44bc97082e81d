//! Worker protocol messages and the seam between the channel and the
//! coordinator.
//!
//! Messages travel as JSON frames over the mutually authenticated worker
//! stream. Per connection they are delivered in order; across workers there
//! is no ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::{BuildId, BuildRequest, ConnectionId, WorkerId};

/// What a worker needs to run a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub repository: String,
    pub commit: String,
    pub git_ref: Option<String>,
    /// Zero for the first attempt.
    pub attempt: u32,
    /// Hard limit the master enforces; workers may enforce it too.
    pub timeout_secs: u64,
}

impl BuildSpec {
    pub fn for_request(request: &BuildRequest, attempt: u32, timeout: Duration) -> Self {
        Self {
            repository: request.repository.clone(),
            commit: request.commit.clone(),
            git_ref: request.git_ref.clone(),
            attempt,
            timeout_secs: timeout.as_secs(),
        }
    }
}

/// Build progress as reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteBuildState {
    Running,
    Finished,
}

/// Worker to master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    RegisterWorker {
        worker_id: WorkerId,
        capacity: u32,
    },
    Heartbeat {
        worker_id: WorkerId,
        free_slots: u32,
        timestamp: DateTime<Utc>,
    },
    DispatchAck {
        build_id: BuildId,
    },
    DispatchReject {
        build_id: BuildId,
        reason: String,
    },
    /// Repeated until a final status carrying `exit_code`.
    BuildStatus {
        build_id: BuildId,
        state: RemoteBuildState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_chunk: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    CancelAck {
        build_id: BuildId,
    },
}

impl WorkerMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::RegisterWorker { .. } => "register_worker",
            WorkerMessage::Heartbeat { .. } => "heartbeat",
            WorkerMessage::DispatchAck { .. } => "dispatch_ack",
            WorkerMessage::DispatchReject { .. } => "dispatch_reject",
            WorkerMessage::BuildStatus { .. } => "build_status",
            WorkerMessage::CancelAck { .. } => "cancel_ack",
        }
    }
}

/// Master to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterMessage {
    RegisterAck {
        worker_id: WorkerId,
    },
    HeartbeatAck {
        timestamp: DateTime<Utc>,
    },
    DispatchBuild {
        build_id: BuildId,
        spec: BuildSpec,
    },
    CancelBuild {
        build_id: BuildId,
    },
}

/// Events the channel delivers to the coordinator.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A worker completed the TLS handshake and sent `RegisterWorker`.
    Registered {
        worker_id: WorkerId,
        conn_id: ConnectionId,
        capacity: u32,
        address: SocketAddr,
    },
    /// Any message after registration.
    Message {
        worker_id: WorkerId,
        conn_id: ConnectionId,
        message: WorkerMessage,
    },
    /// The stream closed or failed.
    LinkDown {
        worker_id: WorkerId,
        conn_id: ConnectionId,
    },
    /// Malformed or out-of-sequence traffic; the connection has been dropped.
    ProtocolViolation {
        worker_id: Option<WorkerId>,
        conn_id: ConnectionId,
        reason: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("no live connection for worker {0}")]
    UnknownWorker(WorkerId),

    #[error("connection to worker {0} is closed")]
    Closed(WorkerId),

    #[error("send buffer for worker {0} is full")]
    Full(WorkerId),
}

/// Outbound half of the worker channel.
///
/// Sends never block: the coordinator must not stall on a slow worker.
pub trait Outbound: Send + Sync {
    /// Queue a message on the worker's current connection.
    fn send(&self, worker_id: &WorkerId, message: MasterMessage) -> Result<(), LinkError>;

    /// Drop the worker's link if it is still `conn_id`. A newer connection
    /// of the same worker is left alone.
    fn disconnect(&self, worker_id: &WorkerId, conn_id: ConnectionId);
}
