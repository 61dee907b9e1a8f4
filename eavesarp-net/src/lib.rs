pub mod arp_sender;
pub mod dns_resolver;
pub mod error;
pub mod frame;
pub mod rate_gate;
pub mod sink;
pub mod sniffer;

pub use arp_sender::{ArpSendRequest, ArpSender};
pub use dns_resolver::DnsResolver;
pub use error::{Error, Result};
pub use rate_gate::RateGate;
pub use sniffer::Sniffer;
