//! Bounded packet header parsing and DS-field rewriting.
//!
//! Everything here runs on the per-packet path: single pass, no heap
//! allocation, no unbounded loops. Truncated or malformed packets
//! simply fail to parse and pass through unmodified.

use byteorder::{ByteOrder, NetworkEndian};

pub const ETH_HDR_LEN: usize = 14;
pub const VLAN_HDR_LEN: usize = 4;
/// At most two stacked VLAN tags are unwrapped.
pub const VLAN_MAX_DEPTH: usize = 2;

pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_QINQ: u16 = 0x88a8;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

const IPV4_MIN_HDR_LEN: usize = 20;
const IPV6_HDR_LEN: usize = 40;

/// Addresses of a parsed IP packet, raw network-order bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpAddrs {
    V4 { src: [u8; 4], dst: [u8; 4] },
    V6 { src: [u8; 16], dst: [u8; 16] },
}

/// The header fields classification needs, extracted in one pass.
///
/// `src_port`/`dst_port` are `None` when the transport header is not
/// reachable (non-TCP/UDP protocol, IPv6 extension headers, or a
/// truncated packet); an IP-only decision is still possible then.
#[derive(Debug, Clone, Copy)]
pub struct ParsedPacket {
    /// Byte offset of the IP header within the frame.
    pub ip_offset: usize,
    pub addrs: IpAddrs,
    pub proto: u8,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

impl ParsedPacket {
    pub fn is_ipv4(&self) -> bool {
        matches!(self.addrs, IpAddrs::V4 { .. })
    }
}

/// Parses a frame far enough for classification.
///
/// With `eth` set the frame starts with an Ethernet header and up to
/// [`VLAN_MAX_DEPTH`] VLAN tags are unwrapped; otherwise the frame is
/// raw IP. Returns `None` for non-IP or truncated frames.
pub fn parse(frame: &[u8], eth: bool) -> Option<ParsedPacket> {
    let mut offset = 0;

    if eth {
        let mut ethertype = NetworkEndian::read_u16(frame.get(12..14)?);
        offset = ETH_HDR_LEN;

        for _ in 0..VLAN_MAX_DEPTH {
            if ethertype != ETHERTYPE_VLAN && ethertype != ETHERTYPE_QINQ {
                break;
            }
            ethertype = NetworkEndian::read_u16(frame.get(offset + 2..offset + 4)?);
            offset += VLAN_HDR_LEN;
        }

        match ethertype {
            ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => {}
            _ => return None,
        }
    }

    let version = frame.get(offset)? >> 4;
    match version {
        4 => parse_ipv4(frame, offset),
        6 => parse_ipv6(frame, offset),
        _ => None,
    }
}

fn parse_ipv4(frame: &[u8], offset: usize) -> Option<ParsedPacket> {
    let hdr = frame.get(offset..offset + IPV4_MIN_HDR_LEN)?;
    let ihl = ((hdr[0] & 0x0f) as usize) * 4;
    if ihl < IPV4_MIN_HDR_LEN {
        return None;
    }

    let proto = hdr[9];
    let mut src = [0u8; 4];
    let mut dst = [0u8; 4];
    src.copy_from_slice(&hdr[12..16]);
    dst.copy_from_slice(&hdr[16..20]);

    // Ports only from the first fragment.
    let frag_offset = NetworkEndian::read_u16(&hdr[6..8]) & 0x1fff;
    let (src_port, dst_port) = if frag_offset == 0 {
        transport_ports(frame, offset + ihl, proto)
    } else {
        (None, None)
    };

    Some(ParsedPacket {
        ip_offset: offset,
        addrs: IpAddrs::V4 { src, dst },
        proto,
        src_port,
        dst_port,
    })
}

fn parse_ipv6(frame: &[u8], offset: usize) -> Option<ParsedPacket> {
    let hdr = frame.get(offset..offset + IPV6_HDR_LEN)?;
    let proto = hdr[6];
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&hdr[8..24]);
    dst.copy_from_slice(&hdr[24..40]);

    // Extension headers are not walked; ports stay unknown then.
    let (src_port, dst_port) = transport_ports(frame, offset + IPV6_HDR_LEN, proto);

    Some(ParsedPacket {
        ip_offset: offset,
        addrs: IpAddrs::V6 { src, dst },
        proto,
        src_port,
        dst_port,
    })
}

fn transport_ports(frame: &[u8], offset: usize, proto: u8) -> (Option<u16>, Option<u16>) {
    match proto {
        IPPROTO_TCP | IPPROTO_UDP => match frame.get(offset..offset + 4) {
            Some(th) => (
                Some(NetworkEndian::read_u16(&th[0..2])),
                Some(NetworkEndian::read_u16(&th[2..4])),
            ),
            None => (None, None),
        },
        _ => (None, None),
    }
}

/// Reads the current 6-bit DSCP code of a parsed packet.
pub fn read_dscp(frame: &[u8], pkt: &ParsedPacket) -> Option<u8> {
    let off = pkt.ip_offset;
    match pkt.addrs {
        IpAddrs::V4 { .. } => Some(frame.get(off + 1)? >> 2),
        IpAddrs::V6 { .. } => {
            let b0 = *frame.get(off)?;
            let b1 = *frame.get(off + 1)?;
            let tc = (b0 << 4) | (b1 >> 4);
            Some(tc >> 2)
        }
    }
}

/// Rewrites the packet's 6-bit DS field to `dscp`.
///
/// When `force` is false the write happens only if the existing DSCP
/// code is zero. ECN bits are always preserved. For IPv4 the header
/// checksum is updated incrementally (RFC 1624); IPv6 has none.
/// Returns true when a write occurred.
pub fn write_dscp(frame: &mut [u8], pkt: &ParsedPacket, dscp: u8, force: bool) -> bool {
    let off = pkt.ip_offset;
    match pkt.addrs {
        IpAddrs::V4 { .. } => {
            if frame.len() < off + IPV4_MIN_HDR_LEN {
                return false;
            }
            let old_tos = frame[off + 1];
            if !force && old_tos >> 2 != 0 {
                return false;
            }
            let new_tos = (dscp << 2) | (old_tos & 0x03);
            if new_tos == old_tos {
                return false;
            }

            // The checksum covers 16-bit words; the TOS byte shares a
            // word with version/IHL.
            let old_word = NetworkEndian::read_u16(&frame[off..off + 2]);
            frame[off + 1] = new_tos;
            let new_word = NetworkEndian::read_u16(&frame[off..off + 2]);

            let check = NetworkEndian::read_u16(&frame[off + 10..off + 12]);
            let updated = csum_replace(check, old_word, new_word);
            NetworkEndian::write_u16(&mut frame[off + 10..off + 12], updated);
            true
        }
        IpAddrs::V6 { .. } => {
            if frame.len() < off + 2 {
                return false;
            }
            let tc = (frame[off] << 4) | (frame[off + 1] >> 4);
            if !force && tc >> 2 != 0 {
                return false;
            }
            let new_tc = (dscp << 2) | (tc & 0x03);
            if new_tc == tc {
                return false;
            }
            frame[off] = (frame[off] & 0xf0) | (new_tc >> 4);
            frame[off + 1] = (frame[off + 1] & 0x0f) | (new_tc << 4);
            true
        }
    }
}

/// Incremental checksum update per RFC 1624: HC' = ~(~HC + ~m + m').
fn csum_replace(check: u16, old: u16, new: u16) -> u16 {
    let mut sum = (!check) as u32;
    sum += (!old) as u32;
    sum += new as u32;
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Builds a minimal IPv4 frame: Ethernet + IPv4 + 4 transport bytes.
    pub fn ipv4_frame(
        proto: u8,
        src: [u8; 4],
        dst: [u8; 4],
        sport: u16,
        dport: u16,
        tos: u8,
        vlan_tags: usize,
    ) -> Vec<u8> {
        let mut f = vec![0u8; 12];
        for _ in 0..vlan_tags {
            f.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
            f.extend_from_slice(&[0x00, 0x01]);
        }
        f.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[1] = tos;
        NetworkEndian::write_u16(&mut ip[2..4], 20 + 4);
        ip[8] = 64;
        ip[9] = proto;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);
        let check = ipv4_checksum(&ip);
        NetworkEndian::write_u16(&mut ip[10..12], check);
        f.extend_from_slice(&ip);

        f.extend_from_slice(&sport.to_be_bytes());
        f.extend_from_slice(&dport.to_be_bytes());
        f
    }

    /// Builds a minimal IPv6 frame: Ethernet + IPv6 + 4 transport bytes.
    pub fn ipv6_frame(
        proto: u8,
        src: [u8; 16],
        dst: [u8; 16],
        sport: u16,
        dport: u16,
        tc: u8,
    ) -> Vec<u8> {
        let mut f = vec![0u8; 12];
        f.extend_from_slice(&ETHERTYPE_IPV6.to_be_bytes());

        let mut ip = [0u8; 40];
        ip[0] = 0x60 | (tc >> 4);
        ip[1] = tc << 4;
        NetworkEndian::write_u16(&mut ip[4..6], 4);
        ip[6] = proto;
        ip[7] = 64;
        ip[8..24].copy_from_slice(&src);
        ip[24..40].copy_from_slice(&dst);
        f.extend_from_slice(&ip);

        f.extend_from_slice(&sport.to_be_bytes());
        f.extend_from_slice(&dport.to_be_bytes());
        f
    }

    /// Full (non-incremental) IPv4 header checksum, for verification.
    pub fn ipv4_checksum(hdr: &[u8]) -> u16 {
        let mut sum = 0u32;
        for i in (0..hdr.len()).step_by(2) {
            if i == 10 {
                continue;
            }
            sum += NetworkEndian::read_u16(&hdr[i..i + 2]) as u32;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }
}
