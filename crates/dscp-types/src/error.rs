//! Parse error types for policy values and keys.

use thiserror::Error;

/// Errors raised while parsing DSCP tokens, keys and addresses.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The DSCP token is neither a number in 0..64 nor a known codepoint.
    #[error("Invalid DSCP value '{0}'")]
    InvalidDscp(String),

    /// A port or port range is out of the accepted 1..=65534 window.
    #[error("Invalid port range '{0}'")]
    InvalidPortRange(String),

    /// An address literal did not parse for the expected family.
    #[error("Invalid IP address '{0}'")]
    InvalidIpAddress(String),

    /// A policy file key matched none of the known key forms.
    #[error("Invalid rule key '{0}'")]
    InvalidKey(String),
}
