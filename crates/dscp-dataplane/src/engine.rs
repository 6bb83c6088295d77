//! The per-packet classification engine.
//!
//! [`Classifier::classify`] is the decision function attached to each
//! interface's traffic-control hook. It resolves a DSCP for the packet
//! from the shared maps, applies the bulk/priority flow heuristic for
//! unclassified traffic, and rewrites the DS field in place.
//!
//! Performance contract: bounded work per packet, no heap allocation
//! on the lookup/rewrite path. The only allocating step is the
//! insertion of a new flow record, and the flow table is capacity
//! bounded.

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use dscp_types::{DSCP_DEFAULT_FLAG, DSCP_FALLBACK_FLAG, DSCP_VALUE_MASK};
use dscp_types::key::PortProto;

use crate::flow::FlowTracker;
use crate::maps::{ClassMaps, DSCP_UNSET};
use crate::packet::{self, IpAddrs, ParsedPacket, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};

/// How the classifier treated a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifyOutcome {
    /// Not IP (or malformed); passed through untouched.
    PassThrough,
    /// No rule resolved for this packet.
    NoRule,
    /// DS field rewritten to this 6-bit code.
    Marked(u8),
    /// A fallback rule matched but the packet already carried a mark.
    AlreadyMarked,
}

/// Per-attachment options.
#[derive(Debug, Clone, Copy)]
pub struct ClassifierOptions {
    /// Ingress mode: classify by source port/address instead of
    /// destination.
    pub ingress: bool,
    /// Frames start with an Ethernet header (false for raw-IP
    /// interfaces such as tunnels).
    pub eth: bool,
}

impl Default for ClassifierOptions {
    fn default() -> Self {
        ClassifierOptions {
            ingress: false,
            eth: true,
        }
    }
}

/// The packet classifier for one attachment direction.
pub struct Classifier {
    maps: Arc<ClassMaps>,
    flows: FlowTracker,
    opts: ClassifierOptions,
    hasher: ahash::RandomState,
}

impl Classifier {
    pub fn new(maps: Arc<ClassMaps>, opts: ClassifierOptions) -> Self {
        Classifier {
            maps,
            flows: FlowTracker::new(),
            opts,
            // Fixed seeds: the flow hash must be stable across packets
            // of the same flow for the lifetime of the classifier.
            hasher: ahash::RandomState::with_seeds(0x9e37, 0x79b9, 0x7f4a, 0x7c15),
        }
    }

    /// Classifies one packet and rewrites its DS field in place.
    pub fn classify(&self, frame: &mut [u8]) -> ClassifyOutcome {
        let Some(pkt) = packet::parse(frame, self.opts.eth) else {
            return ClassifyOutcome::PassThrough;
        };

        let config = self.maps.config();

        // ICMP short-circuits to the configured ICMP class.
        if pkt.proto == IPPROTO_ICMP || pkt.proto == IPPROTO_ICMPV6 {
            if config.dscp_icmp == DSCP_UNSET {
                return ClassifyOutcome::NoRule;
            }
            return self.apply(frame, &pkt, config.dscp_icmp);
        }

        // Port rule for the direction-relative port.
        let port = if self.opts.ingress {
            pkt.src_port
        } else {
            pkt.dst_port
        };
        let mut dscp = match (pkt.proto, port) {
            (IPPROTO_TCP, Some(p)) => self.maps.get_port(PortProto::Tcp, p),
            (IPPROTO_UDP, Some(p)) => self.maps.get_port(PortProto::Udp, p),
            _ => None,
        };

        // An address rule overrides the port-derived value and feeds
        // the activity bit consumed by control-plane GC.
        match self.lookup_addr(&pkt) {
            Some(addr_dscp) => dscp = Some(addr_dscp),
            None => {
                if dscp.is_none() {
                    // Catch-all for protocols without ports.
                    dscp = self.maps.get_port(PortProto::Udp, 0);
                }
            }
        }

        let Some(mut dscp) = dscp else {
            return ClassifyOutcome::NoRule;
        };

        // Only genuinely unclassified traffic runs the flow heuristic.
        if dscp & DSCP_DEFAULT_FLAG != 0 && config.heuristic_enabled() {
            let hash = self.flow_hash(&pkt);
            let override_dscp = self.flows.update(hash, frame.len() as u32, &config);
            if override_dscp != DSCP_UNSET {
                dscp = override_dscp;
            }
        }

        self.apply(frame, &pkt, dscp)
    }

    fn apply(&self, frame: &mut [u8], pkt: &ParsedPacket, dscp: u8) -> ClassifyOutcome {
        let force = dscp & DSCP_FALLBACK_FLAG == 0;
        let code = dscp & DSCP_VALUE_MASK;
        if packet::write_dscp(frame, pkt, code, force) {
            ClassifyOutcome::Marked(code)
        } else if packet::read_dscp(frame, pkt) == Some(code) {
            ClassifyOutcome::Marked(code)
        } else {
            ClassifyOutcome::AlreadyMarked
        }
    }

    fn lookup_addr(&self, pkt: &ParsedPacket) -> Option<u8> {
        match pkt.addrs {
            IpAddrs::V4 { src, dst } => {
                let key = if self.opts.ingress { src } else { dst };
                let rec = self.maps.get_ipv4(key)?;
                rec.mark_seen();
                Some(rec.dscp())
            }
            IpAddrs::V6 { src, dst } => {
                let key = if self.opts.ingress { src } else { dst };
                let rec = self.maps.get_ipv6(key)?;
                rec.mark_seen();
                Some(rec.dscp())
            }
        }
    }

    /// 5-tuple hash identifying the flow. Endpoints are hashed in
    /// packet order, so each direction tracks its own flow record;
    /// a classifier only ever sees one direction of traffic.
    fn flow_hash(&self, pkt: &ParsedPacket) -> u32 {
        let mut h = self.hasher.build_hasher();
        pkt.proto.hash(&mut h);
        match pkt.addrs {
            IpAddrs::V4 { src, dst } => {
                src.hash(&mut h);
                dst.hash(&mut h);
            }
            IpAddrs::V6 { src, dst } => {
                src.hash(&mut h);
                dst.hash(&mut h);
            }
        }
        pkt.src_port.unwrap_or(0).hash(&mut h);
        pkt.dst_port.unwrap_or(0).hash(&mut h);
        h.finish() as u32
    }
}
