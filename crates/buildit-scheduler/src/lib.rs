//! Admission, scheduling and worker coordination for the BuildIt master.
//!
//! The [`Coordinator`] owns the [`JobQueue`], [`WorkerRegistry`],
//! [`SessionManager`] and [`Scheduler`] and runs them inside a single task.
//! Everything else talks to it through a [`CoordinatorHandle`].

pub mod coordinator;
pub mod error;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod session;

pub use coordinator::{
    BuildEvent, Coordinator, CoordinatorHandle, CoordinatorSettings, CoordinatorStats, TimerFired,
    TimerKind,
};
pub use error::{AdmissionError, CoordinatorError};
pub use queue::JobQueue;
pub use registry::{
    HeartbeatOutcome, RegistryEvent, WorkerHandle, WorkerRecord, WorkerRegistry, WorkerSnapshot,
    WorkerStatus,
};
pub use scheduler::{Placement, Scheduler, select_worker};
pub use session::{CancelOutcome, LostOutcome, SessionManager, TerminalOutcome};
