//! Policy file loading.
//!
//! Policy files are line oriented: `<key> <dscp>` per line, `#` starts
//! a comment, blank lines are ignored. A malformed line is logged and
//! skipped; the rest of the file still loads. An unreadable file is an
//! error for the caller to log, reloads continue with the remaining
//! files.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use dscp_types::{Dscp, KeySpec};

use crate::error::{PolicyError, Result};
use crate::policy::{PolicyStore, Provenance, Ttl};

impl PolicyStore {
    /// Loads one policy file, adding every valid line with file
    /// provenance.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|source| PolicyError::FileOpen {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "loading policy file");

        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| PolicyError::FileOpen {
                path: path.to_path_buf(),
                source,
            })?;
            let line = match line.split_once('#') {
                Some((before, _)) => before,
                None => &line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            if let Err(err) = self.load_line(line) {
                warn!(
                    path = %path.display(),
                    line = idx + 1,
                    %err,
                    "skipping malformed policy line"
                );
            }
        }
        Ok(())
    }

    fn load_line(&mut self, line: &str) -> Result<()> {
        let mut tokens = line.split_whitespace();
        let (key, value) = match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(key), Some(value), None) => (key, value),
            _ => {
                return Err(PolicyError::invalid_argument(format!(
                    "expected '<key> <dscp>', got '{}'",
                    line
                )))
            }
        };
        let spec = KeySpec::parse(key)?;
        let dscp: Dscp = value.parse()?;
        self.apply(spec, Some(dscp), Provenance::File, Ttl::Infinite)
    }

    /// Drops file provenance everywhere, re-reads every registered
    /// file, then garbage-collects entries that were not re-added.
    pub fn reload(&mut self) {
        self.reset_file_provenance();
        let files = self.files().to_vec();
        for path in &files {
            if let Err(err) = self.load_file(path) {
                warn!(%err, "failed to load policy file");
            }
        }
        self.gc();
    }

    /// Replaces the registered file list and reloads.
    pub fn set_files(&mut self, files: Vec<PathBuf>) {
        self.clear_file_list();
        for path in files {
            self.add_file(path);
        }
        self.reload();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    use tempfile::NamedTempFile;

    use dscp_dataplane::ClassMaps;
    use dscp_types::{PortProto, RuleCategory, RuleKey};

    use crate::map_sync::MapSync;

    fn store() -> (PolicyStore, Arc<ClassMaps>) {
        let maps = Arc::new(ClassMaps::new());
        (PolicyStore::new(MapSync::new(maps.clone())), maps)
    }

    fn policy_file(contents: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_load_file_mixed_lines() {
        let (mut store, maps) = store();
        let f = policy_file(
            "# interactive traffic\n\
             tcp:443 EF\n\
             udp:5000-5002 AF41  # range\n\
             192.0.2.7 CS3\n\
             dns:.*\\.cdn\\.example AF21\n\
             \n\
             bogus-line\n\
             tcp:80 not-a-dscp\n",
        );
        store.load_file(f.path()).unwrap();

        assert_eq!(maps.get_port(PortProto::Tcp, 443), Some(46));
        assert_eq!(maps.get_port(PortProto::Udp, 5001), Some(34));
        assert_eq!(
            maps.get_ipv4([192, 0, 2, 7]).map(|r| r.dscp()),
            Some(24)
        );
        assert!(store
            .get(
                RuleCategory::Dns,
                &RuleKey::Dns(".*\\.cdn\\.example".to_string())
            )
            .is_some());
        // Both malformed lines were skipped, :80 never landed.
        assert_eq!(maps.get_port(PortProto::Tcp, 80), None);
        assert_eq!(store.len(), 1 + 3 + 1 + 1);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let (mut store, _maps) = store();
        let err = store.load_file(Path::new("/nonexistent/rules.conf"));
        assert!(matches!(err, Err(PolicyError::FileOpen { .. })));
    }

    #[test]
    fn test_reload_drops_removed_lines() {
        let (mut store, maps) = store();
        let f = policy_file("tcp:443 EF\ntcp:22 CS2\n");
        store.add_file(f.path().to_path_buf());
        store.reload();
        assert_eq!(maps.get_port(PortProto::Tcp, 22), Some(16));

        // Rewrite the file without the ssh rule.
        std::fs::write(f.path(), "tcp:443 AF41\n").unwrap();
        store.reload();

        assert_eq!(maps.get_port(PortProto::Tcp, 443), Some(34));
        assert_eq!(maps.get_port(PortProto::Tcp, 22), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reload_keeps_dynamic_entries() {
        let (mut store, maps) = store();
        let f = policy_file("tcp:443 EF\n");
        store.add_file(f.path().to_path_buf());
        store.reload();

        store
            .set(
                RuleCategory::TcpPort,
                RuleKey::Port(443),
                Some("CS6".parse().unwrap()),
                Provenance::Dynamic,
                Ttl::Secs(600),
            )
            .unwrap();
        store.reload();

        // The dynamic override survives the reload.
        assert_eq!(maps.get_port(PortProto::Tcp, 443), Some(48));
        assert!(store.next_deadline().is_some());
    }

    #[test]
    fn test_set_files_replaces_previous_set() {
        let (mut store, maps) = store();
        let a = policy_file("tcp:25 CS1\n");
        let b = policy_file("udp:123 CS7\n");
        store.set_files(vec![a.path().to_path_buf()]);
        assert_eq!(maps.get_port(PortProto::Tcp, 25), Some(8));

        store.set_files(vec![b.path().to_path_buf()]);
        assert_eq!(maps.get_port(PortProto::Tcp, 25), None);
        assert_eq!(maps.get_port(PortProto::Udp, 123), Some(56));
        assert_eq!(store.files().len(), 1);
    }
}
