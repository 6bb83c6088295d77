//! The control-plane task.
//!
//! All store mutation funnels through one task that owns the
//! [`PolicyStore`] and the global config. The task multiplexes admin
//! requests with the store's expiry deadline; garbage collection runs
//! lazily when the earliest deadline passes, never on a fixed tick.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use dscp_dataplane::ClassMaps;
use dscp_types::{Dscp, ParseError, PortProto, PortRange, RuleCategory, RuleKey};

use crate::admin::{
    AdminRequest, AdminResponse, ConfigRequest, DumpEntry, DumpResponse, RuleSelector,
    StatusResponse,
};
use crate::config::GlobalConfig;
use crate::error::{PolicyError, Result};
use crate::map_sync::MapSync;
use crate::policy::{PolicyEntry, PolicyStore, Provenance, Ttl};

/// Message sent to the daemon task.
pub enum Command {
    Admin {
        request: AdminRequest,
        reply: oneshot::Sender<Result<AdminResponse>>,
    },
}

/// Cloneable client side of the daemon channel.
#[derive(Clone)]
pub struct DaemonHandle {
    tx: mpsc::Sender<Command>,
}

impl DaemonHandle {
    pub async fn request(&self, request: AdminRequest) -> Result<AdminResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Admin { request, reply })
            .await
            .map_err(|_| PolicyError::Shutdown)?;
        rx.await.map_err(|_| PolicyError::Shutdown)?
    }
}

/// Creates the command channel for a daemon task.
pub fn channel() -> (DaemonHandle, mpsc::Receiver<Command>) {
    let (tx, rx) = mpsc::channel(64);
    (DaemonHandle { tx }, rx)
}

/// The daemon state machine. Owns the store and the global config.
pub struct Daemon {
    store: PolicyStore,
    config: GlobalConfig,
    /// Opaque per-interface data reported through `status`.
    interfaces: serde_json::Value,
}

impl Daemon {
    /// Builds a daemon over fresh or inherited maps. Address tables are
    /// cleared so a restart never trusts stale dynamic state, then the
    /// default configuration is published.
    pub fn new(maps: Arc<ClassMaps>) -> Self {
        let sync = MapSync::new(maps);
        sync.clear_addrs();
        let mut daemon = Daemon {
            store: PolicyStore::new(sync),
            config: GlobalConfig::default(),
            interfaces: serde_json::Value::Object(Default::default()),
        };
        daemon.reset();
        daemon
    }

    pub fn store_mut(&mut self) -> &mut PolicyStore {
        &mut self.store
    }

    /// Replaces the interface data echoed by `status`.
    pub fn set_interface_status(&mut self, interfaces: serde_json::Value) {
        self.interfaces = interfaces;
    }

    fn reset(&mut self) {
        self.store.reset();
        self.config = GlobalConfig::default();
        self.publish_config();
    }

    fn publish_config(&self) {
        self.store.sync().publish_config(self.config.to_dataplane());
    }

    /// Serves one admin request.
    pub fn handle(&mut self, request: AdminRequest) -> Result<AdminResponse> {
        match request {
            AdminRequest::Reload => {
                self.store.reload();
                Ok(AdminResponse::Empty)
            }
            AdminRequest::Add(req) => {
                let dscp: Dscp = req.dscp.parse().map_err(PolicyError::Parse)?;
                let ttl = match req.timeout {
                    Some(secs) => Ttl::Secs(secs),
                    None => self.store.default_ttl(),
                };
                self.apply_selector(&req.rules, Some(dscp), ttl)?;
                Ok(AdminResponse::Empty)
            }
            AdminRequest::Remove(req) => {
                self.apply_selector(&req.rules, None, Ttl::Infinite)?;
                Ok(AdminResponse::Empty)
            }
            AdminRequest::Config(req) => {
                self.apply_config(req)?;
                Ok(AdminResponse::Empty)
            }
            AdminRequest::Dump => Ok(AdminResponse::Dump(self.dump())),
            AdminRequest::Status => Ok(AdminResponse::Status(self.status())),
            AdminRequest::AddDnsHost(req) => {
                self.store
                    .add_dns_host(&req.name, &req.address, &req.rtype, req.ttl)?;
                Ok(AdminResponse::Empty)
            }
        }
    }

    fn apply_selector(
        &mut self,
        rules: &RuleSelector,
        dscp: Option<Dscp>,
        ttl: Ttl,
    ) -> Result<()> {
        for addr in &rules.ipv4 {
            let addr: Ipv4Addr = addr
                .parse()
                .map_err(|_| ParseError::InvalidIpAddress(addr.clone()))?;
            self.store.set(
                RuleCategory::Ipv4,
                RuleKey::Ipv4(addr),
                dscp,
                Provenance::Dynamic,
                ttl,
            )?;
        }
        for addr in &rules.ipv6 {
            let addr: Ipv6Addr = addr
                .parse()
                .map_err(|_| ParseError::InvalidIpAddress(addr.clone()))?;
            self.store.set(
                RuleCategory::Ipv6,
                RuleKey::Ipv6(addr),
                dscp,
                Provenance::Dynamic,
                ttl,
            )?;
        }
        for ports in &rules.tcp_port {
            let range: PortRange = ports.parse()?;
            self.store
                .set_ports(PortProto::Tcp, range, dscp, Provenance::Dynamic, ttl)?;
        }
        for ports in &rules.udp_port {
            let range: PortRange = ports.parse()?;
            self.store
                .set_ports(PortProto::Udp, range, dscp, Provenance::Dynamic, ttl)?;
        }
        for pattern in &rules.dns {
            self.store.set(
                RuleCategory::Dns,
                RuleKey::Dns(pattern.clone()),
                dscp,
                Provenance::Dynamic,
                ttl,
            )?;
        }
        Ok(())
    }

    fn apply_config(&mut self, req: ConfigRequest) -> Result<()> {
        if req.reset {
            self.reset();
        }
        if let Some(secs) = req.timeout {
            self.store.set_timeout(secs);
        }
        if let Some(secs) = req.active_timeout {
            self.store.set_active_timeout(secs);
        }
        if let Some(files) = req.files {
            self.store
                .set_files(files.into_iter().map(PathBuf::from).collect());
        }
        if let Some(token) = &req.dscp_default_tcp {
            let dscp: Dscp = token.parse()?;
            self.store.set_dscp_default(PortProto::Tcp, dscp);
        }
        if let Some(token) = &req.dscp_default_udp {
            let dscp: Dscp = token.parse()?;
            self.store.set_dscp_default(PortProto::Udp, dscp);
        }
        if let Some(token) = &req.dscp_prio {
            self.config.dscp_prio = Some(token.parse()?);
        }
        if let Some(token) = &req.dscp_bulk {
            self.config.dscp_bulk = Some(token.parse()?);
        }
        if let Some(token) = &req.dscp_icmp {
            self.config.dscp_icmp = Some(token.parse()?);
        }
        if let Some(val) = req.bulk_trigger_timeout {
            self.config.bulk_trigger_timeout = val;
        }
        if let Some(val) = req.bulk_trigger_pps {
            self.config.bulk_trigger_pps = val;
        }
        if let Some(val) = req.prio_max_avg_pkt_len {
            self.config.prio_max_avg_pkt_len = val;
        }
        self.publish_config();
        Ok(())
    }

    fn dump(&self) -> DumpResponse {
        let now = Instant::now();
        let mut rules: Vec<(&(RuleCategory, RuleKey), &PolicyEntry)> = self.store.iter().collect();
        rules.sort_by(|a, b| a.0.cmp(b.0));

        let entries = rules
            .into_iter()
            .map(|((category, key), entry)| DumpEntry {
                rule_type: category.type_name(),
                addr: key.to_string(),
                dscp: entry.dscp().to_string(),
                file: entry.from_file(),
                dynamic: entry.from_dynamic(),
                timeout: entry
                    .expires_at()
                    .map(|t| t.saturating_duration_since(now).as_secs()),
            })
            .collect();
        DumpResponse { entries }
    }

    fn status(&self) -> StatusResponse {
        StatusResponse {
            entries: self.store.len(),
            dynamic_entries: self.store.dynamic_len(),
            dns_patterns: self.store.dns_patterns().len(),
            files: self
                .store
                .files()
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            interfaces: self.interfaces.clone(),
        }
    }

    /// Runs until every [`DaemonHandle`] is dropped.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            let deadline = self.store.next_deadline();
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Admin { request, reply }) => {
                        let result = self.handle(request);
                        if let Err(err) = &result {
                            warn!(%err, "admin request failed");
                        }
                        let _ = reply.send(result);
                    }
                    None => break,
                },
                _ = expiry(deadline) => {
                    self.store.gc();
                }
            }
        }
        info!("control task stopped");
    }
}

async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
