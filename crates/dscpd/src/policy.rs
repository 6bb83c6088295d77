//! The in-memory policy rule store.
//!
//! The store owns every classification rule keyed by (category, key),
//! merges values coming from policy files with dynamic runtime entries,
//! schedules expiry for the dynamic side, and mirrors effective values
//! into the shared classification maps through [`MapSync`].
//!
//! All mutation happens on the control-plane task; the store itself
//! takes no locks.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use regex::{Regex, RegexBuilder};
use tracing::debug;

use dscp_types::{Dscp, KeySpec, PortProto, PortRange, RuleCategory, RuleKey};

use crate::config::{DEFAULT_ACTIVE_TIMEOUT_SECS, DEFAULT_TIMEOUT_SECS};
use crate::error::{PolicyError, Result};
use crate::map_sync::MapSync;

/// Where a rule value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Loaded from a policy file; never expires on its own.
    File,
    /// Added at runtime (admin request or DNS answer); subject to TTL.
    Dynamic,
}

/// Lifetime of a dynamic entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Infinite,
    Secs(u32),
}

impl Ttl {
    fn deadline(self, now: Instant) -> Option<Instant> {
        match self {
            Ttl::Infinite => None,
            Ttl::Secs(secs) => Some(now + Duration::from_secs(secs as u64)),
        }
    }
}

/// One live rule. The effective `dscp` is the dynamic value while a
/// dynamic provenance is present, the file value otherwise.
pub struct PolicyEntry {
    dscp: Dscp,
    file_dscp: Option<Dscp>,
    from_file: bool,
    from_dynamic: bool,
    expires_at: Option<Instant>,
    regex: Option<Regex>,
}

impl PolicyEntry {
    pub fn dscp(&self) -> Dscp {
        self.dscp
    }

    pub fn from_file(&self) -> bool {
        self.from_file
    }

    pub fn from_dynamic(&self) -> bool {
        self.from_dynamic
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub(crate) fn matches_host(&self, name: &str) -> bool {
        self.regex.as_ref().is_some_and(|re| re.is_match(name))
    }
}

/// The policy store. Single writer, no internal locking.
pub struct PolicyStore {
    entries: HashMap<(RuleCategory, RuleKey), PolicyEntry>,
    /// DNS pattern source texts, kept sorted so host matching is
    /// deterministic (later patterns win on multiple matches).
    dns_patterns: BTreeSet<String>,
    files: Vec<PathBuf>,
    port_defaults: [Option<Dscp>; 2],
    timeout: u32,
    active_timeout: u32,
    sync: MapSync,
}

impl PolicyStore {
    pub fn new(sync: MapSync) -> Self {
        PolicyStore {
            entries: HashMap::new(),
            dns_patterns: BTreeSet::new(),
            files: Vec::new(),
            port_defaults: [None, None],
            timeout: DEFAULT_TIMEOUT_SECS,
            active_timeout: DEFAULT_ACTIVE_TIMEOUT_SECS,
            sync,
        }
    }

    pub fn sync(&self) -> &MapSync {
        &self.sync
    }

    /// Default TTL applied to dynamic entries that carry none.
    pub fn default_ttl(&self) -> Ttl {
        Ttl::Secs(self.timeout)
    }

    pub fn timeout(&self) -> u32 {
        self.timeout
    }

    pub fn set_timeout(&mut self, secs: u32) {
        self.timeout = secs;
    }

    pub fn active_timeout(&self) -> u32 {
        self.active_timeout
    }

    pub fn set_active_timeout(&mut self, secs: u32) {
        self.active_timeout = secs;
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Registers a policy file without loading it; callers follow up
    /// with [`reload`](Self::reload).
    pub fn add_file(&mut self, path: PathBuf) {
        self.files.push(path);
    }

    pub(crate) fn clear_file_list(&mut self) {
        self.files.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dynamic_len(&self) -> usize {
        self.entries.values().filter(|e| e.from_dynamic).count()
    }

    /// Exact-match lookup of the effective value for one rule.
    pub fn lookup(&self, category: RuleCategory, key: &RuleKey) -> Option<Dscp> {
        self.get(category, key).map(PolicyEntry::dscp)
    }

    pub fn get(&self, category: RuleCategory, key: &RuleKey) -> Option<&PolicyEntry> {
        self.entries.get(&(category, key.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(RuleCategory, RuleKey), &PolicyEntry)> {
        self.entries.iter()
    }

    pub(crate) fn dns_patterns(&self) -> &BTreeSet<String> {
        &self.dns_patterns
    }

    /// Inserts, updates or removes one provenance of one rule.
    ///
    /// `dscp == None` removes `provenance` from the entry: if the other
    /// provenance remains the entry reverts to its value, otherwise the
    /// entry is dropped and its map slot cleared.
    pub fn set(
        &mut self,
        category: RuleCategory,
        key: RuleKey,
        dscp: Option<Dscp>,
        provenance: Provenance,
        ttl: Ttl,
    ) -> Result<()> {
        self.set_at(category, key, dscp, provenance, ttl, Instant::now())
    }

    pub(crate) fn set_at(
        &mut self,
        category: RuleCategory,
        key: RuleKey,
        dscp: Option<Dscp>,
        provenance: Provenance,
        ttl: Ttl,
        now: Instant,
    ) -> Result<()> {
        let is_file = matches!(provenance, Provenance::File);

        let (prev, alive, effective) = match self.entries.get_mut(&(category, key.clone())) {
            None => {
                let Some(value) = dscp else {
                    return Ok(());
                };
                return self.insert_entry(category, key, value, is_file, ttl, now);
            }
            Some(entry) => {
                let prev = entry.dscp;

                if is_file {
                    entry.from_file = dscp.is_some();
                } else {
                    entry.from_dynamic = dscp.is_some();
                }

                match dscp {
                    Some(value) => {
                        if is_file {
                            entry.file_dscp = Some(value);
                            // A live dynamic override keeps both its
                            // value and its expiry across file updates.
                            if !entry.from_dynamic {
                                entry.dscp = value;
                                entry.expires_at = None;
                            }
                        } else {
                            entry.dscp = value;
                            entry.expires_at = ttl.deadline(now);
                        }
                    }
                    None => {
                        if entry.from_file && !is_file {
                            if let Some(file_value) = entry.file_dscp {
                                entry.dscp = file_value;
                            }
                            entry.expires_at = None;
                        }
                    }
                }

                (prev, entry.from_file || entry.from_dynamic, entry.dscp)
            }
        };

        if !alive {
            self.remove_entry(category, &key);
            return Ok(());
        }
        if effective != prev {
            self.sync.publish(category, &key, effective.raw());
        }
        Ok(())
    }

    fn insert_entry(
        &mut self,
        category: RuleCategory,
        key: RuleKey,
        value: Dscp,
        is_file: bool,
        ttl: Ttl,
        now: Instant,
    ) -> Result<()> {
        let regex = if let RuleKey::Dns(pattern) = &key {
            let re = compile_pattern(pattern)?;
            self.dns_patterns.insert(pattern.clone());
            Some(re)
        } else {
            None
        };
        debug!(category = category.type_name(), %key, dscp = %value, "rule added");
        self.sync.publish(category, &key, value.raw());
        self.entries.insert(
            (category, key),
            PolicyEntry {
                dscp: value,
                file_dscp: is_file.then_some(value),
                from_file: is_file,
                from_dynamic: !is_file,
                expires_at: if is_file { None } else { ttl.deadline(now) },
                regex,
            },
        );
        Ok(())
    }

    fn remove_entry(&mut self, category: RuleCategory, key: &RuleKey) {
        debug!(category = category.type_name(), %key, "rule removed");
        self.entries.remove(&(category, key.clone()));
        if let RuleKey::Dns(pattern) = key {
            self.dns_patterns.remove(pattern);
        }
        self.sync.unpublish(category, key);
    }

    /// Applies `set` to every port in a range.
    pub fn set_ports(
        &mut self,
        proto: PortProto,
        range: PortRange,
        dscp: Option<Dscp>,
        provenance: Provenance,
        ttl: Ttl,
    ) -> Result<()> {
        let category = match proto {
            PortProto::Tcp => RuleCategory::TcpPort,
            PortProto::Udp => RuleCategory::UdpPort,
        };
        let now = Instant::now();
        for port in range.iter() {
            self.set_at(category, RuleKey::Port(port), dscp, provenance, ttl, now)?;
        }
        Ok(())
    }

    /// Applies a parsed key spec, expanding port ranges.
    pub fn apply(
        &mut self,
        spec: KeySpec,
        dscp: Option<Dscp>,
        provenance: Provenance,
        ttl: Ttl,
    ) -> Result<()> {
        match spec {
            KeySpec::Ports(proto, range) => self.set_ports(proto, range, dscp, provenance, ttl),
            KeySpec::Single(category, key) => self.set(category, key, dscp, provenance, ttl),
        }
    }

    /// Sets the protocol-wide default DSCP by rewriting every port slot
    /// without an explicit rule to the default-flagged value.
    ///
    /// The rewrite is per-key atomic only; a concurrent reader can see
    /// a mix of old and new defaults for different ports while the pass
    /// runs.
    pub fn set_dscp_default(&mut self, proto: PortProto, dscp: Dscp) {
        let idx = match proto {
            PortProto::Tcp => 0,
            PortProto::Udp => 1,
        };
        if self.port_defaults[idx] == Some(dscp) {
            return;
        }
        self.port_defaults[idx] = Some(dscp);

        let category = match proto {
            PortProto::Tcp => RuleCategory::TcpPort,
            PortProto::Udp => RuleCategory::UdpPort,
        };
        debug!(?proto, dscp = %dscp, "rewriting port defaults");
        let entries = &self.entries;
        self.sync.fill_port_defaults(proto, dscp.raw(), |port| {
            entries.contains_key(&(category, RuleKey::Port(port)))
        });
    }

    /// Clears the file provenance of every entry. Callers reload files
    /// afterwards and let [`gc`](Self::gc) drop whatever was not
    /// re-added.
    pub(crate) fn reset_file_provenance(&mut self) {
        for entry in self.entries.values_mut() {
            entry.from_file = false;
        }
    }

    /// Drops the dynamic provenance of every entry at once. Entries
    /// also backed by a file revert to their file value; pure dynamic
    /// entries are removed.
    pub fn clear_dynamic(&mut self) {
        let mut reverted: Vec<((RuleCategory, RuleKey), u8)> = Vec::new();
        let mut dead: Vec<(RuleCategory, RuleKey)> = Vec::new();

        for (key, entry) in self.entries.iter_mut() {
            if !entry.from_dynamic {
                continue;
            }
            entry.from_dynamic = false;
            entry.expires_at = None;
            if entry.from_file {
                if let Some(file_value) = entry.file_dscp {
                    if file_value != entry.dscp {
                        entry.dscp = file_value;
                        reverted.push((key.clone(), file_value.raw()));
                    }
                }
            } else {
                dead.push(key.clone());
            }
        }

        for ((category, key), raw) in reverted {
            self.sync.publish(category, &key, raw);
        }
        for (category, key) in dead {
            self.remove_entry(category, &key);
        }
    }

    /// Restores the store-side defaults: no rules, no files, default
    /// timeouts, CS0 port defaults.
    pub fn reset(&mut self) {
        self.files.clear();
        self.reset_file_provenance();
        self.clear_dynamic();
        // Former file-only entries now carry no provenance; sweep them.
        self.gc();
        self.timeout = DEFAULT_TIMEOUT_SECS;
        self.active_timeout = DEFAULT_ACTIVE_TIMEOUT_SECS;
        self.set_dscp_default(PortProto::Tcp, Dscp::from_raw(0));
        self.set_dscp_default(PortProto::Udp, Dscp::from_raw(0));
    }

    /// The next instant at which some dynamic entry expires.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|e| e.from_dynamic)
            .filter_map(|e| e.expires_at)
            .min()
    }

    /// Expires dynamic entries whose deadline has passed.
    ///
    /// An expired address entry whose activity bit is set is granted
    /// the active timeout instead of expiring. Entries left with no
    /// provenance are dropped; entries that also came from a file
    /// revert to their file value. Returns the next expiry deadline.
    pub fn gc(&mut self) -> Option<Instant> {
        self.gc_at(Instant::now())
    }

    pub(crate) fn gc_at(&mut self, now: Instant) -> Option<Instant> {
        let grace = Duration::from_secs(self.active_timeout as u64);
        let mut next: Option<Instant> = None;
        let mut reverted: Vec<((RuleCategory, RuleKey), u8)> = Vec::new();
        let mut dead: Vec<(RuleCategory, RuleKey)> = Vec::new();

        for (key, entry) in self.entries.iter_mut() {
            if entry.from_dynamic {
                if let Some(deadline) = entry.expires_at {
                    if deadline <= now {
                        if key.0.is_addr() && self.sync.take_seen(key.0, &key.1) {
                            entry.expires_at = Some(now + grace);
                        } else {
                            entry.from_dynamic = false;
                            entry.expires_at = None;
                            if entry.from_file {
                                if let Some(file_value) = entry.file_dscp {
                                    if file_value != entry.dscp {
                                        entry.dscp = file_value;
                                        reverted.push((key.clone(), file_value.raw()));
                                    }
                                }
                            }
                        }
                    }
                }
            }

            if !entry.from_file && !entry.from_dynamic {
                dead.push(key.clone());
                continue;
            }
            if let Some(deadline) = entry.expires_at {
                next = Some(next.map_or(deadline, |n| n.min(deadline)));
            }
        }

        for ((category, key), raw) in reverted {
            self.sync.publish(category, &key, raw);
        }
        for (category, key) in dead {
            self.remove_entry(category, &key);
        }
        next
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|err| PolicyError::invalid_pattern(pattern, &err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use dscp_dataplane::ClassMaps;

    fn store() -> (PolicyStore, Arc<ClassMaps>) {
        let maps = Arc::new(ClassMaps::new());
        (PolicyStore::new(MapSync::new(maps.clone())), maps)
    }

    fn d(s: &str) -> Dscp {
        s.parse().unwrap()
    }

    #[test]
    fn test_set_publishes_port_rule() {
        let (mut store, maps) = store();
        store
            .set(
                RuleCategory::TcpPort,
                RuleKey::Port(443),
                Some(d("EF")),
                Provenance::File,
                Ttl::Infinite,
            )
            .unwrap();
        assert_eq!(maps.get_port(PortProto::Tcp, 443), Some(46));
        assert_eq!(store.len(), 1);
        assert!(store.next_deadline().is_none());
    }

    #[test]
    fn test_dynamic_overrides_file_and_reverts_on_expiry() {
        let (mut store, maps) = store();
        let now = Instant::now();
        let key = || RuleKey::Port(443);

        store
            .set_at(
                RuleCategory::TcpPort,
                key(),
                Some(d("AF21")),
                Provenance::File,
                Ttl::Infinite,
                now,
            )
            .unwrap();
        store
            .set_at(
                RuleCategory::TcpPort,
                key(),
                Some(d("EF")),
                Provenance::Dynamic,
                Ttl::Secs(10),
                now,
            )
            .unwrap();
        assert_eq!(maps.get_port(PortProto::Tcp, 443), Some(46));

        // A file re-add must not clobber the live dynamic override.
        store
            .set_at(
                RuleCategory::TcpPort,
                key(),
                Some(d("AF11")),
                Provenance::File,
                Ttl::Infinite,
                now,
            )
            .unwrap();
        assert_eq!(maps.get_port(PortProto::Tcp, 443), Some(46));

        // Expiry reverts to the latest file value.
        let next = store.gc_at(now + Duration::from_secs(11));
        assert!(next.is_none());
        assert_eq!(maps.get_port(PortProto::Tcp, 443), Some(10));
        let entry = store.get(RuleCategory::TcpPort, &key()).unwrap();
        assert!(entry.from_file());
        assert!(!entry.from_dynamic());
    }

    #[test]
    fn test_dynamic_removal_reverts_to_file_value() {
        let (mut store, maps) = store();
        store
            .set(
                RuleCategory::UdpPort,
                RuleKey::Port(53),
                Some(d("CS5")),
                Provenance::File,
                Ttl::Infinite,
            )
            .unwrap();
        store
            .set(
                RuleCategory::UdpPort,
                RuleKey::Port(53),
                Some(d("CS0")),
                Provenance::Dynamic,
                Ttl::Secs(60),
            )
            .unwrap();
        assert_eq!(maps.get_port(PortProto::Udp, 53), Some(0));

        store
            .set(
                RuleCategory::UdpPort,
                RuleKey::Port(53),
                None,
                Provenance::Dynamic,
                Ttl::Infinite,
            )
            .unwrap();
        assert_eq!(maps.get_port(PortProto::Udp, 53), Some(40));
    }

    #[test]
    fn test_removing_last_provenance_drops_entry() {
        let (mut store, maps) = store();
        store
            .set(
                RuleCategory::TcpPort,
                RuleKey::Port(22),
                Some(d("CS2")),
                Provenance::Dynamic,
                Ttl::Secs(60),
            )
            .unwrap();
        store
            .set(
                RuleCategory::TcpPort,
                RuleKey::Port(22),
                None,
                Provenance::Dynamic,
                Ttl::Infinite,
            )
            .unwrap();
        assert_eq!(store.len(), 0);
        assert_eq!(maps.get_port(PortProto::Tcp, 22), None);
    }

    #[test]
    fn test_dynamic_expiry_drops_pure_dynamic_entry() {
        let (mut store, maps) = store();
        let now = Instant::now();
        store
            .set_at(
                RuleCategory::TcpPort,
                RuleKey::Port(8080),
                Some(d("CS3")),
                Provenance::Dynamic,
                Ttl::Secs(5),
                now,
            )
            .unwrap();
        let next = store.gc_at(now + Duration::from_secs(3));
        assert!(next.is_some());
        assert_eq!(store.len(), 1);

        store.gc_at(now + Duration::from_secs(6));
        assert_eq!(store.len(), 0);
        assert_eq!(maps.get_port(PortProto::Tcp, 8080), None);
    }

    #[test]
    fn test_active_address_entry_gets_grace_period() {
        let (mut store, maps) = store();
        let now = Instant::now();
        let addr: std::net::Ipv4Addr = "203.0.113.5".parse().unwrap();
        store.set_active_timeout(30);
        store
            .set_at(
                RuleCategory::Ipv4,
                RuleKey::Ipv4(addr),
                Some(d("AF11")),
                Provenance::Dynamic,
                Ttl::Secs(10),
                now,
            )
            .unwrap();

        // The activity bit is primed on publish, so the first expiry
        // turns into a grace period.
        let next = store.gc_at(now + Duration::from_secs(11)).unwrap();
        assert_eq!(next, now + Duration::from_secs(11 + 30));
        assert!(maps.get_ipv4(addr.octets()).is_some());

        // No traffic since, so the grace deadline is final.
        store.gc_at(now + Duration::from_secs(45));
        assert_eq!(store.len(), 0);
        assert!(maps.get_ipv4(addr.octets()).is_none());
    }

    #[test]
    fn test_traffic_keeps_address_entry_alive() {
        let (mut store, maps) = store();
        let now = Instant::now();
        let addr: std::net::Ipv4Addr = "203.0.113.9".parse().unwrap();
        store.set_active_timeout(30);
        store
            .set_at(
                RuleCategory::Ipv4,
                RuleKey::Ipv4(addr),
                Some(d("AF11")),
                Provenance::Dynamic,
                Ttl::Secs(10),
                now,
            )
            .unwrap();
        store.gc_at(now + Duration::from_secs(11));

        // Packet-path hit between GC runs.
        maps.get_ipv4(addr.octets()).unwrap().mark_seen();

        store.gc_at(now + Duration::from_secs(45));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_port_default_rewrite_skips_explicit_rules() {
        let (mut store, maps) = store();
        store
            .set(
                RuleCategory::TcpPort,
                RuleKey::Port(443),
                Some(d("EF")),
                Provenance::File,
                Ttl::Infinite,
            )
            .unwrap();
        store.set_dscp_default(PortProto::Tcp, d("CS1"));

        assert_eq!(maps.get_port(PortProto::Tcp, 443), Some(46));
        let default = maps.get_port(PortProto::Tcp, 80).unwrap();
        assert_eq!(default & 0x3f, 8);
        assert_ne!(default & dscp_types::DSCP_DEFAULT_FLAG, 0);
        // Unchanged value is not rewritten again.
        store.set_dscp_default(PortProto::Tcp, d("CS1"));
    }

    #[test]
    fn test_invalid_dns_pattern_is_rejected() {
        let (mut store, _maps) = store();
        let err = store.set(
            RuleCategory::Dns,
            RuleKey::Dns("(unclosed".to_string()),
            Some(d("AF11")),
            Provenance::File,
            Ttl::Infinite,
        );
        assert!(matches!(err, Err(PolicyError::InvalidPattern { .. })));
        assert_eq!(store.len(), 0);
        assert!(store.dns_patterns().is_empty());
    }

    #[test]
    fn test_gc_reports_earliest_deadline() {
        let (mut store, _maps) = store();
        let now = Instant::now();
        for (port, secs) in [(1000u16, 50u64), (1001, 20), (1002, 80)] {
            store
                .set_at(
                    RuleCategory::TcpPort,
                    RuleKey::Port(port),
                    Some(d("CS4")),
                    Provenance::Dynamic,
                    Ttl::Secs(secs as u32),
                    now,
                )
                .unwrap();
        }
        let next = store.gc_at(now).unwrap();
        assert_eq!(next, now + Duration::from_secs(20));
        assert_eq!(store.next_deadline().unwrap(), next);
    }

    #[test]
    fn test_clear_dynamic_reverts_and_drops() {
        let (mut store, maps) = store();
        store
            .set(
                RuleCategory::TcpPort,
                RuleKey::Port(22),
                Some(d("CS2")),
                Provenance::File,
                Ttl::Infinite,
            )
            .unwrap();
        store
            .set(
                RuleCategory::TcpPort,
                RuleKey::Port(22),
                Some(d("EF")),
                Provenance::Dynamic,
                Ttl::Secs(600),
            )
            .unwrap();
        store
            .set(
                RuleCategory::UdpPort,
                RuleKey::Port(4500),
                Some(d("AF41")),
                Provenance::Dynamic,
                Ttl::Secs(600),
            )
            .unwrap();

        store.clear_dynamic();

        assert_eq!(maps.get_port(PortProto::Tcp, 22), Some(16));
        assert_eq!(maps.get_port(PortProto::Udp, 4500), None);
        assert_eq!(store.len(), 1);
        assert!(store.next_deadline().is_none());
    }

    #[test]
    fn test_reset_drops_all_rules() {
        let (mut store, maps) = store();
        store
            .set(
                RuleCategory::TcpPort,
                RuleKey::Port(443),
                Some(d("EF")),
                Provenance::File,
                Ttl::Infinite,
            )
            .unwrap();
        store
            .set(
                RuleCategory::Ipv4,
                RuleKey::Ipv4("192.0.2.9".parse().unwrap()),
                Some(d("AF21")),
                Provenance::Dynamic,
                Ttl::Secs(300),
            )
            .unwrap();

        store.reset();

        assert_eq!(store.len(), 0);
        assert_eq!(maps.get_port(PortProto::Tcp, 443), None);
        let addr: std::net::Ipv4Addr = "192.0.2.9".parse().unwrap();
        assert!(maps.get_ipv4(addr.octets()).is_none());
    }
}
