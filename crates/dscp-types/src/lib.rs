//! Shared types for the dscpd classification daemon.
//!
//! This crate holds the leaf types used by both the control plane
//! (`dscpd`) and the data plane (`dscp-dataplane`):
//!
//! - [`Dscp`]: a DSCP value with the two policy modifier flags
//!   (fallback and default) and symbolic codepoint parsing/display
//! - [`RuleCategory`] / [`RuleKey`]: the tagged key space of the policy
//!   store (TCP/UDP ports, IPv4/IPv6 addresses, DNS patterns)
//! - [`PortRange`]: validated port range parsing for policy files and
//!   administrative requests
//! - [`ParseError`]: parse failures for all of the above

pub mod dscp;
pub mod error;
pub mod key;

pub use dscp::{Dscp, DSCP_DEFAULT_FLAG, DSCP_FALLBACK_FLAG, DSCP_VALUE_MASK};
pub use error::ParseError;
pub use key::{KeySpec, PortProto, PortRange, RuleCategory, RuleKey};
