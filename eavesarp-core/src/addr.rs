use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A layer-4 protocol, as persisted on `attack_port` and carried by the
/// data log's address triples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
    Sctp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
            Transport::Sctp => "sctp",
        };
        f.write_str(s)
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            "sctp" => Ok(Transport::Sctp),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

/// An IPv4 address plus port plus transport, the address triple used
/// throughout §6's data log schema and the connection map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddrTriple {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub transport: Transport,
}

impl AddrTriple {
    pub fn new(ip: Ipv4Addr, port: u16, transport: Transport) -> Self {
        Self { ip, port, transport }
    }

    /// Key used by the connection map: `ip:port/transport`.
    pub fn key(&self) -> String {
        format!("{}:{}/{}", self.ip, self.port, self.transport)
    }
}

impl fmt::Display for AddrTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.port, self.transport)
    }
}

impl FromStr for AddrTriple {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host_port, transport) = s
            .rsplit_once('/')
            .ok_or_else(|| format!("missing transport in address triple: {s}"))?;
        let (ip, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in address triple: {s}"))?;
        Ok(AddrTriple {
            ip: ip.parse().map_err(|e| format!("bad ip {ip}: {e}"))?,
            port: port.parse().map_err(|e| format!("bad port {port}: {e}"))?,
            transport: transport.parse()?,
        })
    }
}

/// Key used by the attack engine's `spoofed` map: `victim_ip:victim_src_port`.
pub fn spoofed_key(victim_ip: Ipv4Addr, victim_src_port: u16) -> String {
    format!("{victim_ip}:{victim_src_port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_triple_round_trips() {
        let a = AddrTriple::new(Ipv4Addr::new(10, 0, 0, 20), 443, Transport::Tcp);
        let s = a.to_string();
        let parsed: AddrTriple = s.parse().unwrap();
        assert_eq!(a, parsed);
    }

    #[test]
    fn transport_round_trips() {
        for t in [Transport::Tcp, Transport::Udp, Transport::Sctp] {
            let s = t.to_string();
            let parsed: Transport = s.parse().unwrap();
            assert_eq!(t, parsed);
        }
    }
}
