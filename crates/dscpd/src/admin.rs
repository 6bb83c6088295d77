//! Admin interface request and response types.
//!
//! The daemon exposes a small set of administrative operations; the
//! types here are transport-agnostic and (de)serialize with serde so
//! any local RPC surface can carry them.

use serde::{Deserialize, Serialize};

/// Rule lists shared by add and remove requests. Port fields accept
/// single ports or `start-end` ranges.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleSelector {
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub ipv6: Vec<String>,
    #[serde(default)]
    pub tcp_port: Vec<String>,
    #[serde(default)]
    pub udp_port: Vec<String>,
    #[serde(default)]
    pub dns: Vec<String>,
}

/// Adds dynamic entries for every listed rule.
#[derive(Debug, Clone, Deserialize)]
pub struct AddRequest {
    /// DSCP token: codepoint name, decimal or hex, optionally prefixed
    /// with `+` for fallback semantics.
    pub dscp: String,
    /// TTL in seconds; omitted means the configured default.
    #[serde(default)]
    pub timeout: Option<u32>,
    #[serde(flatten)]
    pub rules: RuleSelector,
}

/// Removes the dynamic provenance of every listed rule.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoveRequest {
    #[serde(flatten)]
    pub rules: RuleSelector,
}

/// Updates global configuration. Absent fields keep their current
/// value; `reset` restores all defaults first.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigRequest {
    #[serde(default)]
    pub reset: bool,
    #[serde(default)]
    pub files: Option<Vec<String>>,
    #[serde(default)]
    pub timeout: Option<u32>,
    #[serde(default)]
    pub active_timeout: Option<u32>,
    #[serde(default)]
    pub dscp_default_tcp: Option<String>,
    #[serde(default)]
    pub dscp_default_udp: Option<String>,
    #[serde(default)]
    pub dscp_prio: Option<String>,
    #[serde(default)]
    pub dscp_bulk: Option<String>,
    #[serde(default)]
    pub dscp_icmp: Option<String>,
    #[serde(default)]
    pub bulk_trigger_timeout: Option<u32>,
    #[serde(default)]
    pub bulk_trigger_pps: Option<u32>,
    #[serde(default)]
    pub prio_max_avg_pkt_len: Option<u32>,
}

/// One resolved DNS answer from the local resolver.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsHostRequest {
    pub name: String,
    pub address: String,
    #[serde(rename = "type")]
    pub rtype: String,
    #[serde(default)]
    pub ttl: u32,
}

/// An administrative operation.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum AdminRequest {
    Reload,
    Add(AddRequest),
    Remove(RemoveRequest),
    Config(ConfigRequest),
    Dump,
    Status,
    AddDnsHost(DnsHostRequest),
}

/// One store entry in dump output.
#[derive(Debug, Serialize)]
pub struct DumpEntry {
    #[serde(rename = "type")]
    pub rule_type: &'static str,
    pub addr: String,
    pub dscp: String,
    pub file: bool,
    pub dynamic: bool,
    /// Remaining TTL in seconds; absent for entries without expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct DumpResponse {
    pub entries: Vec<DumpEntry>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub entries: usize,
    pub dynamic_entries: usize,
    pub dns_patterns: usize,
    pub files: Vec<String>,
    /// Per-interface data supplied by an external collaborator;
    /// reported verbatim.
    pub interfaces: serde_json::Value,
}

/// Reply to an admin request.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum AdminResponse {
    Empty,
    Dump(DumpResponse),
    Status(StatusResponse),
}
