//! Rule categories and category-specific keys.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Transport protocol selector for port rules and port maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortProto {
    Tcp,
    Udp,
}

/// The category of a classification rule.
///
/// Each category has its own key space; (category, key) uniquely
/// identifies a policy entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RuleCategory {
    TcpPort,
    UdpPort,
    Ipv4,
    Ipv6,
    Dns,
}

impl RuleCategory {
    /// Stable type name used in dump output.
    pub fn type_name(&self) -> &'static str {
        match self {
            RuleCategory::TcpPort => "tcp_port",
            RuleCategory::UdpPort => "udp_port",
            RuleCategory::Ipv4 => "ipv4_addr",
            RuleCategory::Ipv6 => "ipv6_addr",
            RuleCategory::Dns => "dns",
        }
    }

    pub fn is_port(&self) -> bool {
        matches!(self, RuleCategory::TcpPort | RuleCategory::UdpPort)
    }

    pub fn is_addr(&self) -> bool {
        matches!(self, RuleCategory::Ipv4 | RuleCategory::Ipv6)
    }

    /// The transport protocol for port categories.
    pub fn port_proto(&self) -> Option<PortProto> {
        match self {
            RuleCategory::TcpPort => Some(PortProto::Tcp),
            RuleCategory::UdpPort => Some(PortProto::Udp),
            _ => None,
        }
    }
}

/// Category-specific rule key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuleKey {
    Port(u16),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    /// DNS pattern source text; the compiled regex lives with the entry.
    Dns(String),
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKey::Port(p) => write!(f, "{}", p),
            RuleKey::Ipv4(a) => write!(f, "{}", a),
            RuleKey::Ipv6(a) => write!(f, "{}", a),
            RuleKey::Dns(p) => write!(f, "{}", p),
        }
    }
}

/// An inclusive, validated port range.
///
/// Accepted forms are a single port or `start-end`. Ports 0 and 65535
/// are rejected: 0 is reserved for the protocol-wide catch-all slot
/// and 65535 is excluded by the range validation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl FromStr for PortRange {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseError::InvalidPortRange(s.to_string());

        let (start_str, end_str) = match s.split_once('-') {
            Some((a, b)) => (a, b),
            None => (s, s),
        };

        let start: u32 = start_str.parse().map_err(|_| err())?;
        let end: u32 = end_str.parse().map_err(|_| err())?;

        if start == 0 || end < start || end >= 65535 {
            return Err(err());
        }

        Ok(PortRange {
            start: start as u16,
            end: end as u16,
        })
    }
}

/// A parsed policy key: either a port range (which expands into one
/// entry per port) or a single non-port key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySpec {
    Ports(PortProto, PortRange),
    Single(RuleCategory, RuleKey),
}

impl KeySpec {
    /// Parses a policy-file key.
    ///
    /// Key forms: `dns:<pattern>`, `tcp:<port[-port]>`, `udp:<port[-port]>`,
    /// a bare IPv6 literal (contains `:`), or a bare IPv4 literal
    /// (contains `.`).
    pub fn parse(key: &str) -> Result<KeySpec, ParseError> {
        if let Some(pattern) = key.strip_prefix("dns:") {
            return Ok(KeySpec::Single(
                RuleCategory::Dns,
                RuleKey::Dns(pattern.to_string()),
            ));
        }
        if let Some(ports) = key.strip_prefix("tcp:") {
            return Ok(KeySpec::Ports(PortProto::Tcp, ports.parse()?));
        }
        if let Some(ports) = key.strip_prefix("udp:") {
            return Ok(KeySpec::Ports(PortProto::Udp, ports.parse()?));
        }
        if key.contains(':') {
            let addr = key
                .parse::<Ipv6Addr>()
                .map_err(|_| ParseError::InvalidIpAddress(key.to_string()))?;
            return Ok(KeySpec::Single(RuleCategory::Ipv6, RuleKey::Ipv6(addr)));
        }
        if key.contains('.') {
            let addr = key
                .parse::<Ipv4Addr>()
                .map_err(|_| ParseError::InvalidIpAddress(key.to_string()))?;
            return Ok(KeySpec::Single(RuleCategory::Ipv4, RuleKey::Ipv4(addr)));
        }
        Err(ParseError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_range_single() {
        let r: PortRange = "443".parse().unwrap();
        assert_eq!(r.start, 443);
        assert_eq!(r.end, 443);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn test_port_range_span() {
        let r: PortRange = "6000-6010".parse().unwrap();
        assert_eq!(r.start, 6000);
        assert_eq!(r.end, 6010);
        assert_eq!(r.len(), 11);
        assert_eq!(r.iter().count(), 11);
    }

    #[test]
    fn test_port_range_rejects() {
        assert!("0".parse::<PortRange>().is_err());
        assert!("65535".parse::<PortRange>().is_err());
        assert!("100-65535".parse::<PortRange>().is_err());
        assert!("200-100".parse::<PortRange>().is_err());
        assert!("abc".parse::<PortRange>().is_err());
        assert!("1-2-3".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_key_spec_forms() {
        assert_eq!(
            KeySpec::parse("dns:.*\\.example\\.com").unwrap(),
            KeySpec::Single(
                RuleCategory::Dns,
                RuleKey::Dns(".*\\.example\\.com".to_string())
            )
        );
        assert!(matches!(
            KeySpec::parse("tcp:443").unwrap(),
            KeySpec::Ports(PortProto::Tcp, _)
        ));
        assert!(matches!(
            KeySpec::parse("udp:53").unwrap(),
            KeySpec::Ports(PortProto::Udp, _)
        ));
        assert_eq!(
            KeySpec::parse("192.0.2.1").unwrap(),
            KeySpec::Single(
                RuleCategory::Ipv4,
                RuleKey::Ipv4("192.0.2.1".parse().unwrap())
            )
        );
        assert_eq!(
            KeySpec::parse("2001:db8::5").unwrap(),
            KeySpec::Single(
                RuleCategory::Ipv6,
                RuleKey::Ipv6("2001:db8::5".parse().unwrap())
            )
        );
    }

    #[test]
    fn test_key_spec_rejects() {
        assert!(KeySpec::parse("not-a-key").is_err());
        assert!(KeySpec::parse("300.1.2.3").is_err());
        assert!(KeySpec::parse("tcp:0").is_err());
    }

    #[test]
    fn test_category_names() {
        assert_eq!(RuleCategory::TcpPort.type_name(), "tcp_port");
        assert_eq!(RuleCategory::Dns.type_name(), "dns");
        assert!(RuleCategory::TcpPort.is_port());
        assert!(RuleCategory::Ipv6.is_addr());
        assert_eq!(RuleCategory::UdpPort.port_proto(), Some(PortProto::Udp));
        assert_eq!(RuleCategory::Ipv4.port_proto(), None);
    }
}
