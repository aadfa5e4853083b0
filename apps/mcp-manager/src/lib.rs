//! MCP session manager: routes MCP sessions across a cluster of managers and
//! runs them on container, remote and launcher workers.

pub mod audit;
pub mod audit_redis;
pub mod config;
pub mod error;
pub mod log_throttle;
pub mod manager;
pub mod mcp;
pub mod metrics;
pub mod registry;
pub mod registry_redis;
pub mod routes;
pub mod session;
pub mod state;
pub mod telemetry;
pub mod workers;

pub use error::{ManagerError, ManagerResult};
pub use manager::Manager;
