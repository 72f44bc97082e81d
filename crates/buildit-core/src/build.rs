//! Build requests and the session records that track them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::{BuildId, Result, WorkerId};

/// A canonical, provider-independent request to run a build.
///
/// Immutable once created. The queue and the session share it through an
/// `Arc` rather than copying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Unique identifier, also the identity of the build session.
    pub id: BuildId,
    /// Repository URL or slug.
    pub repository: String,
    /// Commit SHA to build.
    pub commit: String,
    /// Branch or tag the commit was pushed to.
    pub git_ref: Option<String>,
    /// Higher values are scheduled first.
    pub priority: i32,
    /// When the master admitted the request.
    pub received_at: DateTime<Utc>,
    /// What produced the request (e.g. "github", "gitlab", "api").
    pub source: String,
}

impl BuildRequest {
    pub fn new(
        repository: impl Into<String>,
        commit: impl Into<String>,
        priority: i32,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: BuildId::new(),
            repository: repository.into(),
            commit: commit.into(),
            git_ref: None,
            priority,
            received_at: Utc::now(),
            source: source.into(),
        }
    }

    /// Set the branch or tag.
    pub fn with_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.git_ref = Some(git_ref.into());
        self
    }

    /// Override the admission timestamp.
    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }
}

/// Turns a provider-specific webhook payload into a [`BuildRequest`].
///
/// Implementations live outside the master (one per VCS provider).
#[async_trait]
pub trait WebhookAdapter: Send + Sync {
    /// Provider name, used as the request source tag.
    fn provider(&self) -> &'static str;

    /// Parse the payload. Payloads that should not trigger a build return
    /// [`crate::Error::UnsupportedPayload`].
    async fn to_build_request(&self, payload: &[u8]) -> Result<BuildRequest>;
}

/// Lifecycle state of a build session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Queued,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Transient: resolved to `Queued` or `Failed` in the same step.
    Lost,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Succeeded | SessionState::Failed | SessionState::Cancelled
        )
    }

    /// States in which a worker holds the build.
    pub fn is_on_worker(&self) -> bool {
        matches!(self, SessionState::Dispatched | SessionState::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Queued => "queued",
            SessionState::Dispatched => "dispatched",
            SessionState::Running => "running",
            SessionState::Succeeded => "succeeded",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
            SessionState::Lost => "lost",
        };
        f.write_str(s)
    }
}

/// Why a build had to go back to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryCause {
    /// The worker stopped heartbeating or broke protocol.
    WorkerLost { worker_id: WorkerId },
    /// The worker never acknowledged the dispatch.
    AckTimeout { worker_id: WorkerId },
    /// The worker refused the dispatch.
    Rejected { worker_id: WorkerId, reason: String },
}

impl fmt::Display for RetryCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryCause::WorkerLost { worker_id } => write!(f, "worker {worker_id} lost"),
            RetryCause::AckTimeout { worker_id } => {
                write!(f, "worker {worker_id} did not acknowledge dispatch")
            }
            RetryCause::Rejected { worker_id, reason } => {
                write!(f, "worker {worker_id} rejected dispatch: {reason}")
            }
        }
    }
}

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The build ran and exited non-zero.
    ExitCode { code: i32 },
    /// The build exceeded the maximum duration.
    TimedOut,
    /// Every allowed attempt was lost, timed out or rejected.
    RetriesExhausted { last: RetryCause },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ExitCode { code } => write!(f, "exited with code {code}"),
            FailureReason::TimedOut => f.write_str("exceeded maximum build duration"),
            FailureReason::RetriesExhausted { last } => write!(f, "retries exhausted: {last}"),
        }
    }
}

/// The tracking record for one build.
///
/// Instances handed out of the coordinator are snapshots; the live record is
/// only ever mutated by the session manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSession {
    pub id: BuildId,
    pub request: Arc<BuildRequest>,
    pub state: SessionState,
    /// Set iff the state is `Dispatched` or `Running`.
    pub assigned_worker: Option<WorkerId>,
    /// Worker still expected to confirm a cancellation or timeout kill.
    pub cleanup_worker: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Bytes of log output relayed so far.
    pub log_offset: u64,
    pub retry_count: u32,
    /// Incremented on every dispatch; timers carry it to detect staleness.
    pub epoch: u32,
    pub failure: Option<FailureReason>,
    /// The maximum duration expired and a kill was sent.
    pub deadline_expired: bool,
}

impl BuildSession {
    /// Create a queued session for a freshly admitted request.
    pub fn queued(request: Arc<BuildRequest>) -> Self {
        Self {
            id: request.id,
            request,
            state: SessionState::Queued,
            assigned_worker: None,
            cleanup_worker: None,
            created_at: Utc::now(),
            dispatched_at: None,
            started_at: None,
            completed_at: None,
            exit_code: None,
            log_offset: 0,
            retry_count: 0,
            epoch: 0,
            failure: None,
            deadline_expired: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
