//! Shared classification maps.
//!
//! These are the key/value stores the classification engine reads on
//! every packet and the control plane updates on policy changes. Each
//! key's publish is atomic; bulk operations (such as rewriting the
//! protocol-wide default for every port) are sequences of per-key
//! writes with no cross-key atomicity. Packets classified mid-update
//! may observe a mix of old and new defaults; this window is accepted
//! and documented, not worked around.
//!
//! # Wire layout
//!
//! To stay binary-stable against a kernel-resident classifier, the
//! records use fixed layouts: port keys are 16-bit values in network
//! byte order, address keys are 4-/16-byte raw addresses, port values
//! are a single DSCP byte, and address values are a `(dscp, seen)`
//! byte pair. The config record is one fixed-layout struct.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use dscp_types::key::PortProto;
use dscp_types::DSCP_DEFAULT_FLAG;

/// Sentinel for unset DSCP config fields, matching the wire encoding.
pub const DSCP_UNSET: u8 = 0xff;

/// Hasher for the shared maps; fixed seeds keep lookups reproducible.
type MapHasher = ahash::RandomState;

fn map_hasher() -> MapHasher {
    ahash::RandomState::with_seeds(0x5125, 0x7b5c, 0x91d2, 0x30ae)
}

/// Value record for address map entries.
///
/// `dscp` is written only by the control plane. `seen` is set by the
/// data plane whenever the address matches a packet and cleared by the
/// control plane's read-and-clear during GC, implementing idle-based
/// expiry for dynamic address rules.
#[derive(Debug)]
#[repr(C)]
pub struct IpClassRecord {
    dscp: u8,
    seen: AtomicU8,
}

impl IpClassRecord {
    /// A freshly published record starts with the seen bit primed so
    /// it survives the first GC check interval.
    pub fn new(dscp: u8) -> Self {
        IpClassRecord {
            dscp,
            seen: AtomicU8::new(1),
        }
    }

    pub fn dscp(&self) -> u8 {
        self.dscp
    }

    /// Marks the address as active. Data-plane side.
    pub fn mark_seen(&self) {
        self.seen.store(1, Ordering::Relaxed);
    }

    /// Reads and clears the seen bit. Control-plane side.
    pub fn take_seen(&self) -> bool {
        self.seen.swap(0, Ordering::Relaxed) != 0
    }
}

/// Fixed-layout data-plane configuration record.
///
/// DSCP fields use [`DSCP_UNSET`] for "not configured". The flow
/// heuristic is inert while both `bulk_trigger_pps` and
/// `prio_max_avg_pkt_len` are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DataplaneConfig {
    pub dscp_prio: u8,
    pub dscp_bulk: u8,
    pub dscp_icmp: u8,
    pub bulk_trigger_timeout: u32,
    pub bulk_trigger_pps: u32,
    pub prio_max_avg_pkt_len: u32,
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        DataplaneConfig {
            dscp_prio: DSCP_UNSET,
            dscp_bulk: DSCP_UNSET,
            dscp_icmp: DSCP_UNSET,
            bulk_trigger_timeout: 0,
            bulk_trigger_pps: 0,
            prio_max_avg_pkt_len: 0,
        }
    }
}

impl DataplaneConfig {
    /// True when at least one flow-heuristic knob is configured.
    pub fn heuristic_enabled(&self) -> bool {
        self.bulk_trigger_pps != 0 || self.prio_max_avg_pkt_len != 0
    }
}

/// The full set of shared classification maps.
pub struct ClassMaps {
    tcp_ports: DashMap<u16, u8, MapHasher>,
    udp_ports: DashMap<u16, u8, MapHasher>,
    ipv4: DashMap<[u8; 4], Arc<IpClassRecord>, MapHasher>,
    ipv6: DashMap<[u8; 16], Arc<IpClassRecord>, MapHasher>,
    config: ArcSwap<DataplaneConfig>,
}

impl ClassMaps {
    pub fn new() -> Self {
        ClassMaps {
            tcp_ports: DashMap::with_hasher(map_hasher()),
            udp_ports: DashMap::with_hasher(map_hasher()),
            ipv4: DashMap::with_hasher(map_hasher()),
            ipv6: DashMap::with_hasher(map_hasher()),
            config: ArcSwap::from_pointee(DataplaneConfig::default()),
        }
    }

    fn port_map(&self, proto: PortProto) -> &DashMap<u16, u8, MapHasher> {
        match proto {
            PortProto::Tcp => &self.tcp_ports,
            PortProto::Udp => &self.udp_ports,
        }
    }

    /// Port map keys are stored in network byte order.
    #[inline]
    pub fn port_key(port: u16) -> u16 {
        port.to_be()
    }

    /// Publishes one port slot. Atomic per key.
    pub fn set_port(&self, proto: PortProto, port: u16, dscp: u8) {
        self.port_map(proto).insert(Self::port_key(port), dscp);
    }

    /// Deletes one port slot (the slot reverts to "no rule", not to the
    /// protocol default; defaults are refilled only by a default
    /// rewrite pass).
    pub fn del_port(&self, proto: PortProto, port: u16) {
        self.port_map(proto).remove(&Self::port_key(port));
    }

    /// Data-plane port lookup.
    #[inline]
    pub fn get_port(&self, proto: PortProto, port: u16) -> Option<u8> {
        self.port_map(proto)
            .get(&Self::port_key(port))
            .map(|v| *v.value())
    }

    /// Fills every port slot not listed in `skip` with the
    /// default-flagged value. Per-key atomic, no cross-key atomicity.
    pub fn fill_port_defaults<F>(&self, proto: PortProto, dscp: u8, mut skip: F)
    where
        F: FnMut(u16) -> bool,
    {
        let val = dscp | DSCP_DEFAULT_FLAG;
        let map = self.port_map(proto);
        for port in 0..=u16::MAX {
            if skip(port) {
                continue;
            }
            map.insert(Self::port_key(port), val);
        }
    }

    /// Publishes one IPv4 address record. Replacing a record re-primes
    /// its seen bit.
    pub fn set_ipv4(&self, addr: [u8; 4], dscp: u8) {
        self.ipv4.insert(addr, Arc::new(IpClassRecord::new(dscp)));
    }

    pub fn del_ipv4(&self, addr: [u8; 4]) {
        self.ipv4.remove(&addr);
    }

    #[inline]
    pub fn get_ipv4(&self, addr: [u8; 4]) -> Option<Arc<IpClassRecord>> {
        self.ipv4.get(&addr).map(|v| Arc::clone(v.value()))
    }

    pub fn set_ipv6(&self, addr: [u8; 16], dscp: u8) {
        self.ipv6.insert(addr, Arc::new(IpClassRecord::new(dscp)));
    }

    pub fn del_ipv6(&self, addr: [u8; 16]) {
        self.ipv6.remove(&addr);
    }

    #[inline]
    pub fn get_ipv6(&self, addr: [u8; 16]) -> Option<Arc<IpClassRecord>> {
        self.ipv6.get(&addr).map(|v| Arc::clone(v.value()))
    }

    /// Reads and clears the seen bit for an IPv4 address. Returns
    /// false when the address has no record.
    pub fn take_seen_ipv4(&self, addr: [u8; 4]) -> bool {
        self.ipv4
            .get(&addr)
            .map(|v| v.value().take_seen())
            .unwrap_or(false)
    }

    pub fn take_seen_ipv6(&self, addr: [u8; 16]) -> bool {
        self.ipv6
            .get(&addr)
            .map(|v| v.value().take_seen())
            .unwrap_or(false)
    }

    /// Removes all address entries. Used at startup so stale state
    /// from a previous run never drives classification.
    pub fn clear_addrs(&self) {
        self.ipv4.clear();
        self.ipv6.clear();
    }

    /// Publishes the config record as one atomic swap.
    pub fn set_config(&self, config: DataplaneConfig) {
        self.config.store(Arc::new(config));
    }

    /// Data-plane config snapshot. Lock-free.
    #[inline]
    pub fn config(&self) -> Arc<DataplaneConfig> {
        self.config.load_full()
    }
}

impl Default for ClassMaps {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_publish_and_lookup() {
        let maps = ClassMaps::new();
        maps.set_port(PortProto::Tcp, 443, 46);
        assert_eq!(maps.get_port(PortProto::Tcp, 443), Some(46));
        assert_eq!(maps.get_port(PortProto::Udp, 443), None);

        maps.del_port(PortProto::Tcp, 443);
        assert_eq!(maps.get_port(PortProto::Tcp, 443), None);
    }

    #[test]
    fn test_port_keys_network_byte_order() {
        assert_eq!(ClassMaps::port_key(0x1234), 0x1234u16.to_be());
    }

    #[test]
    fn test_fill_port_defaults_skips_explicit() {
        let maps = ClassMaps::new();
        maps.set_port(PortProto::Udp, 53, 40);
        maps.fill_port_defaults(PortProto::Udp, 0, |p| p == 53);

        assert_eq!(maps.get_port(PortProto::Udp, 53), Some(40));
        assert_eq!(maps.get_port(PortProto::Udp, 0), Some(DSCP_DEFAULT_FLAG));
        assert_eq!(
            maps.get_port(PortProto::Udp, 65535),
            Some(DSCP_DEFAULT_FLAG)
        );
    }

    #[test]
    fn test_seen_bit_lifecycle() {
        let maps = ClassMaps::new();
        let addr = [203, 0, 113, 5];
        maps.set_ipv4(addr, 10);

        // Freshly published records start seen.
        assert!(maps.take_seen_ipv4(addr));
        assert!(!maps.take_seen_ipv4(addr));

        // The data plane re-arms it on a hit.
        maps.get_ipv4(addr).unwrap().mark_seen();
        assert!(maps.take_seen_ipv4(addr));
    }

    #[test]
    fn test_take_seen_missing_addr() {
        let maps = ClassMaps::new();
        assert!(!maps.take_seen_ipv4([1, 2, 3, 4]));
        assert!(!maps.take_seen_ipv6([0; 16]));
    }

    #[test]
    fn test_config_swap() {
        let maps = ClassMaps::new();
        assert_eq!(maps.config().dscp_bulk, DSCP_UNSET);

        maps.set_config(DataplaneConfig {
            dscp_bulk: 8,
            bulk_trigger_pps: 100,
            ..Default::default()
        });
        let cfg = maps.config();
        assert_eq!(cfg.dscp_bulk, 8);
        assert!(cfg.heuristic_enabled());
    }
}
