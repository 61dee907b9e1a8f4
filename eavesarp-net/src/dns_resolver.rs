//! PTR/A resolution with a global failure budget and depth-bounded
//! forward-resolution walk (spec.md §4.3).

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, warn};

use eavesarp_core::config::DnsResolverConfig;
use eavesarp_core::model::DnsRecordKind;
use eavesarp_core::store::Store;

use crate::error::{Error, Result};

/// Outstanding lookups the resolver itself issued, keyed so the sniffer
/// can avoid re-enqueuing a follow-up for something already in flight
/// (spec.md §3: "Active DNS").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActiveDnsKey {
    Ptr(Ipv4Addr),
    A(String),
}

pub type ActiveDnsMap = Arc<DashSet<ActiveDnsKey>>;

pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    store: Arc<Store>,
    config: DnsResolverConfig,
    failures: AtomicU32,
    active: ActiveDnsMap,
}

impl DnsResolver {
    pub fn new(config: DnsResolverConfig, store: Arc<Store>) -> Result<Self> {
        let mut opts = ResolverOpts::default();
        opts.timeout = config.timeout;
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), opts);
        Ok(Self {
            resolver,
            store,
            config,
            failures: AtomicU32::new(0),
            active: Arc::new(DashSet::new()),
        })
    }

    pub fn active_dns(&self) -> ActiveDnsMap {
        self.active.clone()
    }

    pub fn budget_exceeded(&self) -> bool {
        self.failures.load(Ordering::Relaxed) >= self.config.max_failures
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Resolves `ip`'s PTR name, if any, and walks forward resolution to
    /// the configured depth. `snac_target_ip` is the SNAC this walk
    /// originated from; every distinct IP discovered along the way is
    /// recorded as a candidate AITM opportunity against it.
    pub async fn resolve_ptr(&self, ip: Ipv4Addr, snac_target_ip: Ipv4Addr, depth: u32) {
        if self.budget_exceeded() {
            return;
        }
        let key = ActiveDnsKey::Ptr(ip);
        if !self.active.insert(key.clone()) {
            return; // already in flight
        }

        let name = match self.resolver.reverse_lookup(ip.into()).await {
            Ok(lookup) => lookup.iter().next().map(|n| n.to_utf8()),
            Err(e) => {
                if !e.is_no_records_found() {
                    self.record_failure();
                    warn!(error = %e, %ip, "ptr lookup failed");
                }
                None
            }
        };
        self.active.remove(&key);

        let Some(name) = name else { return };
        debug!(%ip, %name, "ptr resolved");

        let ip_id = match self.store.upsert_ip(ip, eavesarp_core::model::DiscoveryMethod::PassiveArp) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "store error recording ptr-resolved ip");
                return;
            }
        };
        let name_id = match self.store.ensure_dns_name(&name) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "store error ensuring dns name");
                return;
            }
        };
        if let Err(e) = self.store.insert_dns_record(ip_id, name_id, DnsRecordKind::Ptr) {
            warn!(error = %e, "store error inserting ptr record");
        }
        if let Err(e) = self.store.mark_ptr_resolved(ip_id) {
            warn!(error = %e, "store error marking ptr_resolved");
        }

        if depth < self.config.max_ptr_depth {
            self.resolve_forward(name, snac_target_ip, depth + 1).await;
        }
    }

    /// Forward-resolves `name` to its A records, each becoming a
    /// candidate downstream for `snac_target_ip`, then (depth
    /// permitting) continues the PTR walk from each new address.
    async fn resolve_forward(&self, name: String, snac_target_ip: Ipv4Addr, depth: u32) {
        if self.budget_exceeded() {
            return;
        }
        let key = ActiveDnsKey::A(name.clone());
        if !self.active.insert(key.clone()) {
            return;
        }

        let ips: Vec<Ipv4Addr> = match self.resolver.lookup_ip(name.as_str()).await {
            Ok(lookup) => lookup.iter().filter_map(|a| match a {
                std::net::IpAddr::V4(v4) => Some(v4),
                std::net::IpAddr::V6(_) => None,
            }).collect(),
            Err(e) => {
                if !e.is_no_records_found() {
                    self.record_failure();
                    warn!(error = %e, %name, "forward lookup failed");
                }
                Vec::new()
            }
        };
        self.active.remove(&key);

        let name_id = match self.store.ensure_dns_name(&name) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "store error ensuring dns name");
                return;
            }
        };

        for ip in ips {
            let ip_id = match self.store.upsert_ip(ip, eavesarp_core::model::DiscoveryMethod::ForwardDns) {
                Ok(id) => id,
                Err(e) => {
                    warn!(error = %e, "store error recording forward-resolved ip");
                    continue;
                }
            };
            if let Err(e) = self.store.insert_dns_record(ip_id, name_id, DnsRecordKind::A) {
                warn!(error = %e, "store error inserting a record");
            }

            if ip != snac_target_ip {
                let snac_id = match self.store.upsert_ip(snac_target_ip, eavesarp_core::model::DiscoveryMethod::PassiveArp) {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(error = %e, "store error resolving snac ip id");
                        continue;
                    }
                };
                if let Err(e) = self.store.insert_aitm_opportunity(snac_id, ip_id) {
                    warn!(error = %e, "store error inserting aitm opportunity");
                }
            }

            if depth < self.config.max_ptr_depth {
                Box::pin(self.resolve_ptr(ip, snac_target_ip, depth)).await;
            }
        }
    }
}

#[allow(dead_code)]
fn budget_error() -> Error {
    Error::Core(eavesarp_core::Error::BudgetExceeded)
}
