//! Bridge between the policy store and the shared classification maps.
//!
//! The store is the single writer; every mutation here is atomic per
//! key. No operation spans more than one map slot, so readers on the
//! packet path never observe a torn record.

use std::sync::Arc;

use tracing::debug;

use dscp_dataplane::{ClassMaps, DataplaneConfig};
use dscp_types::{PortProto, RuleCategory, RuleKey};

/// Publisher handle owned by the policy store.
#[derive(Clone)]
pub struct MapSync {
    maps: Arc<ClassMaps>,
}

impl MapSync {
    pub fn new(maps: Arc<ClassMaps>) -> Self {
        MapSync { maps }
    }

    pub fn maps(&self) -> &Arc<ClassMaps> {
        &self.maps
    }

    /// Publishes the effective DSCP for one entry. DNS patterns have no
    /// map slot; their effect is applied through the address tables.
    pub fn publish(&self, category: RuleCategory, key: &RuleKey, dscp: u8) {
        match (category, key) {
            (RuleCategory::TcpPort, RuleKey::Port(p)) => {
                self.maps.set_port(PortProto::Tcp, *p, dscp)
            }
            (RuleCategory::UdpPort, RuleKey::Port(p)) => {
                self.maps.set_port(PortProto::Udp, *p, dscp)
            }
            (RuleCategory::Ipv4, RuleKey::Ipv4(a)) => self.maps.set_ipv4(a.octets(), dscp),
            (RuleCategory::Ipv6, RuleKey::Ipv6(a)) => self.maps.set_ipv6(a.octets(), dscp),
            (RuleCategory::Dns, _) => {}
            _ => debug!("mismatched category/key, not published"),
        }
    }

    /// Removes the map slot for one entry.
    pub fn unpublish(&self, category: RuleCategory, key: &RuleKey) {
        match (category, key) {
            (RuleCategory::TcpPort, RuleKey::Port(p)) => self.maps.del_port(PortProto::Tcp, *p),
            (RuleCategory::UdpPort, RuleKey::Port(p)) => self.maps.del_port(PortProto::Udp, *p),
            (RuleCategory::Ipv4, RuleKey::Ipv4(a)) => self.maps.del_ipv4(a.octets()),
            (RuleCategory::Ipv6, RuleKey::Ipv6(a)) => self.maps.del_ipv6(a.octets()),
            _ => {}
        }
    }

    /// Reads and clears the activity bit of an address entry.
    pub fn take_seen(&self, category: RuleCategory, key: &RuleKey) -> bool {
        match (category, key) {
            (RuleCategory::Ipv4, RuleKey::Ipv4(a)) => self.maps.take_seen_ipv4(a.octets()),
            (RuleCategory::Ipv6, RuleKey::Ipv6(a)) => self.maps.take_seen_ipv6(a.octets()),
            _ => false,
        }
    }

    /// Rewrites every port slot of `proto` to the default-flagged value,
    /// skipping slots covered by explicit rules. Per-key atomic only.
    pub fn fill_port_defaults<F>(&self, proto: PortProto, dscp: u8, skip: F)
    where
        F: FnMut(u16) -> bool,
    {
        self.maps.fill_port_defaults(proto, dscp, skip);
    }

    /// Drops all address entries. Used at startup so a restarted daemon
    /// never inherits stale dynamic state.
    pub fn clear_addrs(&self) {
        self.maps.clear_addrs();
    }

    pub fn publish_config(&self, config: DataplaneConfig) {
        self.maps.set_config(config);
    }
}
