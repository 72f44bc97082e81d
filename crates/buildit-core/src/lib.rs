//! Core domain types for the BuildIt master.
//!
//! This crate contains:
//! - Build, worker and connection identifiers
//! - Build requests and session records
//! - The worker wire protocol
//! - The webhook adapter seam

pub mod build;
pub mod error;
pub mod id;
pub mod protocol;

pub use build::{
    BuildRequest, BuildSession, FailureReason, RetryCause, SessionState, WebhookAdapter,
};
pub use error::{Error, Result};
pub use id::{BuildId, ConnectionId, WorkerId};
pub use protocol::{
    BuildSpec, ChannelEvent, LinkError, MasterMessage, Outbound, RemoteBuildState, WorkerMessage,
};
