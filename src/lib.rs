//! # matrix-bridge-core
//!
//! Portal core for bridging Matrix rooms with conversations on a remote
//! chat network. The crate owns the per-conversation state machine: it
//! serializes all events touching one conversation through a single worker,
//! translates between the two sides, and keeps the persisted mapping of
//! messages, reactions and memberships consistent across crashes and
//! duplicate deliveries.
//!
//! The surrounding bridge supplies the outside world:
//!
//! - a [`matrix::MatrixApi`] implementation talking to the homeserver,
//! - a [`network::NetworkClient`] per login talking to the remote network,
//! - [`bridge::UserLoginRegistry`] / [`bridge::GhostDirectory`] lookups,
//! - a [`disappearing::DisappearingScheduler`] that deletes expiring
//!   messages.
//!
//! Events enter through [`portal::Portal::queue_matrix_event`] and
//! [`portal::Portal::queue_remote_event`]; portals are obtained from the
//! [`portal::PortalRegistry`].

pub mod bridge;
pub mod config;
pub mod database;
pub mod disappearing;
pub mod error;
pub mod ids;
pub mod matrix;
pub mod network;
pub mod observability;
pub mod portal;
pub mod storage;

pub use bridge::{BridgeContext, Ghost, GhostDirectory, UserLogin, UserLoginRegistry};
pub use config::BridgeConfig;
pub use database::{DatabaseConfig, DatabaseConnection};
pub use error::{BridgeError, Capability, MessageStatus, StatusClass};
pub use portal::{Portal, PortalRegistry};
pub use storage::Database;
