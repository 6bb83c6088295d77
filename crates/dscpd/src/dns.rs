//! DNS-driven address learning.
//!
//! Resolved names reported by the local resolver are matched against
//! the DNS rule patterns; each match adds a dynamic address entry
//! carrying the pattern's DSCP. Patterns are scanned in sorted order,
//! so when several match the same name the lexicographically last one
//! determines the final value.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Instant;

use tracing::debug;

use dscp_types::{Dscp, ParseError, RuleCategory, RuleKey};

use crate::error::Result;
use crate::policy::{PolicyStore, Provenance, Ttl};

impl PolicyStore {
    /// Records one resolved DNS answer.
    ///
    /// `rtype` is the record type as reported by the resolver; anything
    /// other than `A`/`AAAA` is accepted and ignored. A zero `ttl`
    /// falls back to the store default.
    pub fn add_dns_host(&mut self, name: &str, address: &str, rtype: &str, ttl: u32) -> Result<()> {
        self.add_dns_host_at(name, address, rtype, ttl, Instant::now())
    }

    pub(crate) fn add_dns_host_at(
        &mut self,
        name: &str,
        address: &str,
        rtype: &str,
        ttl: u32,
        now: Instant,
    ) -> Result<()> {
        if self.dns_patterns().is_empty() {
            return Ok(());
        }

        let (category, key) = match rtype {
            "A" => {
                let addr: Ipv4Addr = address
                    .parse()
                    .map_err(|_| ParseError::InvalidIpAddress(address.to_string()))?;
                (RuleCategory::Ipv4, RuleKey::Ipv4(addr))
            }
            "AAAA" => {
                let addr: Ipv6Addr = address
                    .parse()
                    .map_err(|_| ParseError::InvalidIpAddress(address.to_string()))?;
                (RuleCategory::Ipv6, RuleKey::Ipv6(addr))
            }
            _ => return Ok(()),
        };

        let matches: Vec<Dscp> = self
            .dns_patterns()
            .iter()
            .filter_map(|pattern| {
                self.get(RuleCategory::Dns, &RuleKey::Dns(pattern.clone()))
                    .filter(|entry| entry.matches_host(name))
                    .map(|entry| entry.dscp())
            })
            .collect();
        if matches.is_empty() {
            return Ok(());
        }

        let ttl = if ttl != 0 {
            Ttl::Secs(ttl)
        } else {
            self.default_ttl()
        };
        debug!(name, address, rtype, "dns answer matched {} pattern(s)", matches.len());
        for dscp in matches {
            self.set_at(category, key.clone(), Some(dscp), Provenance::Dynamic, ttl, now)?;
        }
        Ok(())
    }
}
