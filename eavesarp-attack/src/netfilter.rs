//! Programs a per-process NAT table with a spoofed-IP set and DNAT rules
//! pointing at the local proxies (spec.md §4.5).

use std::net::Ipv4Addr;
use std::sync::Mutex;

use nftables::expr::{Expression, NamedExpression, Payload, PayloadField};
use nftables::helper;
use nftables::schema::{Chain, NfListObject, NfObject, Nftables, Rule, Set, Table};
use nftables::stmt::{Counter, Match, Operator, Statement, NAT};
use nftables::types::{NfChainPolicy, NfChainType, NfFamily, NfHook, SetFlag};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{info, warn};

use crate::error::{Error, Result};

const PROJECT_PREFIX: &str = "eavesarp_";

/// A per-process nftables table: `spoofed_ips` (target IPs currently
/// being impersonated), `all_ports` (the full 16-bit port interval), a
/// `prerouting` chain at priority -100, and one DNAT rule per transport.
pub struct NetfilterPlane {
    table_name: String,
    proxy_ip: Ipv4Addr,
    tcp_proxy_port: u16,
    udp_proxy_port: u16,
    spoofed: Mutex<std::collections::HashSet<Ipv4Addr>>,
}

impl NetfilterPlane {
    /// Scans for stale tables carrying the project prefix and logs a
    /// warning for each, without touching them — "deletion of others'
    /// tables is explicitly avoided" (spec.md §4.5).
    pub fn warn_about_stale_tables() {
        match helper::get_current_ruleset(None, None) {
            Ok(current) => {
                for obj in current.objects {
                    if let NfObject::ListObject(NfListObject::Table(t)) = obj {
                        if t.name.starts_with(PROJECT_PREFIX) {
                            warn!(table = %t.name, "found a stale eavesarp nftables table from a prior run; leaving it in place");
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to read current nftables ruleset while scanning for stale tables"),
        }
    }

    /// Creates the NAT table, its sets, chain, and DNAT rules. Called
    /// once at least one proxy is up.
    pub fn create(proxy_ip: Ipv4Addr, tcp_proxy_port: u16, udp_proxy_port: u16) -> Result<Self> {
        let suffix: String = rand::thread_rng().sample_iter(&Alphanumeric).take(5).map(char::from).collect();
        let table_name = format!("{PROJECT_PREFIX}{}", suffix.to_lowercase());

        let mut batch = Vec::new();
        batch.push(NfListObject::Table(Table::new(NfFamily::IP, table_name.clone())));
        batch.push(NfListObject::Set(Set::new(
            NfFamily::IP,
            table_name.clone(),
            "spoofed_ips".into(),
            nftables::types::SetTypeValue::Single(nftables::types::SetType::Ipv4Addr),
        )));
        let mut all_ports = Set::new(
            NfFamily::IP,
            table_name.clone(),
            "all_ports".into(),
            nftables::types::SetTypeValue::Single(nftables::types::SetType::InetService),
        );
        all_ports.flags = Some(vec![SetFlag::Interval]);
        all_ports.elem = Some(vec![Expression::Range(Box::new(nftables::expr::Range {
            range: [Expression::Number(0), Expression::Number(65535)],
        }))]);
        batch.push(NfListObject::Set(all_ports));

        let mut prerouting = Chain::new(
            NfFamily::IP,
            table_name.clone(),
            "prerouting".into(),
            Some(NfChainType::NAT),
            Some(NfHook::Prerouting),
            Some(-100),
            None,
            Some(NfChainPolicy::Accept),
        );
        prerouting.dev = None;
        batch.push(NfListObject::Chain(prerouting));

        for (proto_name, proxy_port) in [("tcp", tcp_proxy_port), ("udp", udp_proxy_port)] {
            batch.push(NfListObject::Rule(dnat_rule(
                &table_name,
                proto_name,
                proxy_ip,
                proxy_port,
            )));
        }

        let ruleset = Nftables {
            objects: batch.into_iter().map(NfObject::ListObject).collect(),
        };
        helper::apply_ruleset(&ruleset, None, None).map_err(|e| Error::Netfilter(e.to_string()))?;

        info!(table = %table_name, "nftables NAT table created");
        Ok(Self {
            table_name,
            proxy_ip,
            tcp_proxy_port,
            udp_proxy_port,
            spoofed: Mutex::new(std::collections::HashSet::new()),
        })
    }

    /// Adds `ip` to `spoofed_ips`; a no-op if already present (spec.md
    /// §8: "Adding the same spoofed IP twice leaves the set unchanged").
    pub fn add_spoofed(&self, ip: Ipv4Addr) -> Result<()> {
        let mut set = self.spoofed.lock().expect("netfilter set mutex poisoned");
        if !set.insert(ip) {
            return Ok(());
        }
        drop(set);
        self.mutate_set_element(ip, true)
    }

    /// Removes `ip` from `spoofed_ips`, e.g. on attack cancellation.
    pub fn remove_spoofed(&self, ip: Ipv4Addr) -> Result<()> {
        let mut set = self.spoofed.lock().expect("netfilter set mutex poisoned");
        if !set.remove(&ip) {
            return Ok(());
        }
        drop(set);
        self.mutate_set_element(ip, false)
    }

    fn mutate_set_element(&self, ip: Ipv4Addr, add: bool) -> Result<()> {
        let element = NfListObject::Element(nftables::schema::Element {
            family: NfFamily::IP,
            table: self.table_name.clone().into(),
            name: "spoofed_ips".into(),
            elem: vec![Expression::String(ip.to_string())],
        });
        let ruleset = Nftables {
            objects: vec![if add {
                NfObject::ListObject(element)
            } else {
                NfObject::CmdObject(nftables::schema::NfCmd::Delete(element))
            }],
        };
        helper::apply_ruleset(&ruleset, None, None).map_err(|e| Error::Netfilter(e.to_string()))
    }

    /// Tears down the table on shutdown.
    pub fn teardown(&self) -> Result<()> {
        let ruleset = Nftables {
            objects: vec![NfObject::CmdObject(nftables::schema::NfCmd::Delete(
                NfListObject::Table(Table::new(NfFamily::IP, self.table_name.clone())),
            ))],
        };
        helper::apply_ruleset(&ruleset, None, None).map_err(|e| Error::Netfilter(e.to_string()))?;
        info!(table = %self.table_name, "nftables NAT table removed");
        Ok(())
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

fn dnat_rule(table_name: &str, proto_name: &str, proxy_ip: Ipv4Addr, proxy_port: u16) -> Rule {
    let dst_ip_match = Statement::Match(Match {
        left: Expression::Named(NamedExpression::Payload(Payload::PayloadField(PayloadField {
            protocol: "ip".into(),
            field: "daddr".into(),
        }))),
        right: Expression::Named(NamedExpression::Set(vec![Expression::String("@spoofed_ips".into())])),
        op: Operator::EQ,
    });
    let proto_match = Statement::Match(Match {
        left: Expression::Named(NamedExpression::Meta(nftables::expr::Meta { key: nftables::expr::MetaKey::L4Proto })),
        right: Expression::String(proto_name.into()),
        op: Operator::EQ,
    });
    let port_match = Statement::Match(Match {
        left: Expression::Named(NamedExpression::Payload(Payload::PayloadField(PayloadField {
            protocol: proto_name.into(),
            field: "dport".into(),
        }))),
        right: Expression::Named(NamedExpression::Set(vec![Expression::String("@all_ports".into())])),
        op: Operator::EQ,
    });
    let counter = Statement::Counter(Counter::Named("".into()));
    let dnat = Statement::DNAT(Some(NAT {
        addr: Some(Expression::String(proxy_ip.to_string())),
        family: Some(NfFamily::IP),
        port: Some(Expression::Number(proxy_port as i64)),
        flags: None,
    }));

    Rule::new(
        NfFamily::IP,
        table_name.to_string(),
        "prerouting".to_string(),
        vec![dst_ip_match, proto_match, port_match, counter, dnat],
    )
}
