//! Data-plane side of the dscpd classification daemon.
//!
//! This crate implements the per-packet decision path that runs on the
//! traffic-control hooks of each interface:
//!
//! - [`maps`]: the shared classification maps published by the control
//!   plane (port DSCP tables, address tables with activity bits, and
//!   the single data-plane config record)
//! - [`packet`]: bounded, allocation-free packet header parsing and
//!   DS-field rewriting with IPv4 checksum maintenance
//! - [`flow`]: the bounded per-flow statistics table backing the
//!   bulk/priority heuristic
//! - [`engine`]: the [`Classifier`](engine::Classifier) tying the
//!   pieces together
//!
//! The control plane is the sole writer of the maps and config; the
//! data plane is the sole writer of flow records and per-address
//! activity bits. Per-key publishes are atomic, and nothing here takes
//! a lock across more than one key.

pub mod engine;
pub mod flow;
pub mod maps;
pub mod packet;

pub use engine::{ClassifyOutcome, Classifier, ClassifierOptions};
pub use flow::FlowTracker;
pub use maps::{ClassMaps, DataplaneConfig, IpClassRecord};
