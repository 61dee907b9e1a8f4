use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::addr::Transport;

/// How a MAC or IP first entered the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    PassiveArp,
    ActiveArp,
    ForwardDns,
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiscoveryMethod::PassiveArp => "passive_arp",
            DiscoveryMethod::ActiveArp => "active_arp",
            DiscoveryMethod::ForwardDns => "forward_dns",
        };
        f.write_str(s)
    }
}

impl FromStr for DiscoveryMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passive_arp" => Ok(DiscoveryMethod::PassiveArp),
            "active_arp" => Ok(DiscoveryMethod::ActiveArp),
            "forward_dns" => Ok(DiscoveryMethod::ForwardDns),
            other => Err(format!("unknown discovery method: {other}")),
        }
    }
}

/// Row in the `mac` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mac {
    pub id: i64,
    /// Canonical lowercase colon-delimited 48-bit address, e.g. `aa:bb:cc:dd:ee:ff`.
    pub value: String,
    pub discovery_method: DiscoveryMethod,
}

/// Row in the `ip` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ip {
    pub id: i64,
    pub value: Ipv4Addr,
    pub mac_id: Option<i64>,
    pub discovery_method: DiscoveryMethod,
    pub arp_resolved: bool,
    pub ptr_resolved: bool,
}

impl Ip {
    /// A SNAC iff `arp_resolved` and no owning MAC is known (spec.md §3).
    pub fn is_snac(&self) -> bool {
        self.arp_resolved && self.mac_id.is_none()
    }
}

/// A `(sender_ip, target_ip)` ARP conversation counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArpCount {
    pub sender_ip: Ipv4Addr,
    pub target_ip: Ipv4Addr,
    pub count: i64,
}

/// Row in the `dns_record` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsRecordKind {
    A,
    Ptr,
}

impl fmt::Display for DnsRecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DnsRecordKind::A => "a",
            DnsRecordKind::Ptr => "ptr",
        })
    }
}

impl FromStr for DnsRecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "a" => Ok(DnsRecordKind::A),
            "ptr" => Ok(DnsRecordKind::Ptr),
            other => Err(format!("unknown dns record kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub ip: Ipv4Addr,
    pub name: String,
    pub kind: DnsRecordKind,
}

/// Row in the `aitm_opt` table: a candidate relay target discovered by
/// forward-resolving a PTR name of a SNAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AitmOpportunity {
    pub snac_target_ip: Ipv4Addr,
    pub downstream_ip: Ipv4Addr,
}

/// Row in the `attack` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attack {
    pub id: i64,
    pub sender_ip: Ipv4Addr,
    pub target_ip: Ipv4Addr,
}

/// Row in the `attack_port` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackPort {
    pub attack_id: i64,
    pub number: u16,
    pub protocol: Transport,
}

/// A row of the `dump-snacs` report: `sender_ip,target_ip,arp_count,attack_count,port_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnacRow {
    pub sender_ip: Ipv4Addr,
    pub target_ip: Ipv4Addr,
    pub arp_count: i64,
    pub attack_count: i64,
    pub port_count: i64,
}
