//! Daemon-global configuration.

use dscp_dataplane::DataplaneConfig;
use dscp_types::Dscp;

/// Default TTL for dynamic entries, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u32 = 3600;

/// TTL granted to an address entry whose activity bit was set at
/// expiry, in seconds.
pub const DEFAULT_ACTIVE_TIMEOUT_SECS: u32 = 300;

/// Global classification knobs outside the per-rule store.
///
/// `None` DSCP fields disable the corresponding treatment. The flow
/// heuristic runs only when `bulk_trigger_pps` or
/// `prio_max_avg_pkt_len` is non-zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfig {
    pub dscp_prio: Option<Dscp>,
    pub dscp_bulk: Option<Dscp>,
    pub dscp_icmp: Option<Dscp>,
    pub bulk_trigger_timeout: u32,
    pub bulk_trigger_pps: u32,
    pub prio_max_avg_pkt_len: u32,
}

impl GlobalConfig {
    /// Converts to the record published to the data plane.
    pub fn to_dataplane(&self) -> DataplaneConfig {
        fn raw(d: Option<Dscp>) -> u8 {
            d.map_or(dscp_dataplane::maps::DSCP_UNSET, |d| d.raw())
        }

        DataplaneConfig {
            dscp_prio: raw(self.dscp_prio),
            dscp_bulk: raw(self.dscp_bulk),
            dscp_icmp: raw(self.dscp_icmp),
            bulk_trigger_timeout: self.bulk_trigger_timeout,
            bulk_trigger_pps: self.bulk_trigger_pps,
            prio_max_avg_pkt_len: self.prio_max_avg_pkt_len,
        }
    }
}
