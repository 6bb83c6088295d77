//! dscpd - DSCP Policy Daemon
//!
//! Control plane for DSCP-based traffic classification on small
//! routers. The daemon owns a TTL-aware policy store fed from policy
//! files, admin requests and resolved DNS answers, and mirrors
//! effective rules into the shared classification maps consumed by the
//! packet path in the `dscp-dataplane` crate.

pub mod admin;
pub mod config;
pub mod daemon;
pub mod error;
pub mod map_sync;
pub mod policy;

mod dns;
mod loader;

pub use admin::{AdminRequest, AdminResponse};
pub use config::GlobalConfig;
pub use daemon::{channel, Command, Daemon, DaemonHandle};
pub use error::{PolicyError, Result};
pub use map_sync::MapSync;
pub use policy::{PolicyEntry, PolicyStore, Provenance, Ttl};
