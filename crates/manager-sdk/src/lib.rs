//! Shared pieces of the MCP session manager cluster.
//!
//! * [`protocol`]: wire types of the manager RPC surface.
//! * [`registry`]: registry records, the coordination-store trait and an
//!   in-memory store.
//! * [`client`]: async client for a manager, also used manager-to-manager.

pub mod client;
pub mod protocol;
pub mod registry;

pub use client::{ClientError, FrameStream, ManagerClient};
