//! KDL configuration parsing for the BuildIt master.
//!
//! This crate handles parsing of:
//! - Master configuration (master.kdl)
//! - Defaults and validation of timing and capacity limits

pub mod error;
pub mod master;

pub use error::{ConfigError, ConfigResult};
pub use master::{
    ChannelConfig, DispatchConfig, HeartbeatConfig, MasterConfig, QueueConfig, TlsPaths,
    default_config_kdl, load_master_config, parse_master_config,
};
