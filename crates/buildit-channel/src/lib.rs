//! Worker channel for the BuildIt master.
//!
//! A mutually authenticated TLS listener carrying length-prefixed JSON
//! frames. Inbound traffic is delivered as a single ordered stream of
//! [`buildit_core::ChannelEvent`]s; outbound sends go through the
//! [`LinkTable`], which implements [`buildit_core::Outbound`].

pub mod client;
pub mod codec;
pub mod error;
pub mod links;
pub mod server;
pub mod tls;

#[cfg(test)]
mod test_support;

pub use client::WorkerConnection;
pub use codec::MAX_FRAME_LENGTH;
pub use error::ChannelError;
pub use links::LinkTable;
pub use server::{ChannelManager, ChannelSettings, ListenHandle};
pub use tls::TlsMaterial;
