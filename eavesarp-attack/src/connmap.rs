//! The in-memory connection map and its conntrack-driven eviction
//! (spec.md §4.6).

use std::net::Ipv4Addr;
use std::sync::Arc;

use dashmap::DashMap;

use eavesarp_core::addr::AddrTriple;

/// `victim_ip:victim_src_port -> original (pre-DNAT) destination IP`.
/// Consulted by the TCP proxy's certificate minter to recover the IP a
/// client thought it was dialing before DNAT rewrote the destination.
pub type SpoofedMap = Arc<DashMap<String, Ipv4Addr>>;

/// `victim address triple -> downstream address triple`. Consulted by
/// both proxies when accepting a DNAT'd flow.
pub type DownstreamMap = Arc<DashMap<AddrTriple, AddrTriple>>;

#[derive(Clone, Default)]
pub struct ConnectionMap {
    pub spoofed: SpoofedMap,
    pub downstreams: DownstreamMap,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self {
            spoofed: Arc::new(DashMap::new()),
            downstreams: Arc::new(DashMap::new()),
        }
    }

    /// Records the pre-DNAT original destination for a TCP SYN from the
    /// victim, and the downstream the flow should be relayed to.
    pub fn record_tcp_syn(&self, victim_ip: Ipv4Addr, victim_src_port: u16, original_dst: Ipv4Addr, downstream: AddrTriple) {
        let key = eavesarp_core::addr::spoofed_key(victim_ip, victim_src_port);
        self.spoofed.insert(key, original_dst);
        let victim = AddrTriple::new(victim_ip, victim_src_port, eavesarp_core::addr::Transport::Tcp);
        self.downstreams.insert(victim, downstream);
    }

    /// Records only the downstream mapping for a UDP datagram from the
    /// victim (spec.md §4.4: "For UDP, record only the downstream mapping").
    pub fn record_udp(&self, victim: AddrTriple, downstream: AddrTriple) {
        self.downstreams.insert(victim, downstream);
    }

    pub fn original_destination(&self, victim_ip: Ipv4Addr, victim_src_port: u16) -> Option<Ipv4Addr> {
        let key = eavesarp_core::addr::spoofed_key(victim_ip, victim_src_port);
        self.spoofed.get(&key).map(|v| *v)
    }

    pub fn downstream_for(&self, victim: &AddrTriple) -> Option<AddrTriple> {
        self.downstreams.get(victim).map(|v| *v)
    }

    /// Evicts both maps' entries for a flow's 4-tuple, called on
    /// conntrack DESTROY events.
    pub fn evict(&self, victim_ip: Ipv4Addr, victim_src_port: u16, transport: eavesarp_core::addr::Transport) {
        let key = eavesarp_core::addr::spoofed_key(victim_ip, victim_src_port);
        self.spoofed.remove(&key);
        let victim = AddrTriple::new(victim_ip, victim_src_port, transport);
        self.downstreams.remove(&victim);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eavesarp_core::addr::Transport;

    #[test]
    fn record_and_evict_round_trip() {
        let map = ConnectionMap::new();
        let victim_ip: Ipv4Addr = "10.0.0.10".parse().unwrap();
        let downstream = AddrTriple::new("10.0.0.30".parse().unwrap(), 443, Transport::Tcp);
        map.record_tcp_syn(victim_ip, 5000, "10.0.0.20".parse().unwrap(), downstream);

        assert_eq!(map.original_destination(victim_ip, 5000), Some("10.0.0.20".parse().unwrap()));
        let victim = AddrTriple::new(victim_ip, 5000, Transport::Tcp);
        assert_eq!(map.downstream_for(&victim), Some(downstream));

        map.evict(victim_ip, 5000, Transport::Tcp);
        assert_eq!(map.original_destination(victim_ip, 5000), None);
        assert_eq!(map.downstream_for(&victim), None);
    }
}
