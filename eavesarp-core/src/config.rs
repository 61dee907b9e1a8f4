use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use ipnetwork::Ipv4Network;

/// Jittered pacing window used by both the ARP and DNS senders.
#[derive(Debug, Clone, Copy)]
pub struct RateGateConfig {
    pub min: Duration,
    pub max: Duration,
    /// Secondary jitter applied on top of the uniform window, as a
    /// percentage of the window width.
    pub jitter_pct: f64,
}

impl Default for RateGateConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(250),
            max: Duration::from_millis(750),
            jitter_pct: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ArpSenderConfig {
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for ArpSenderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(4),
            retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DnsResolverConfig {
    pub timeout: Duration,
    /// Fixed maximum transport-level failures before lookups are
    /// silently skipped for the rest of the process lifetime.
    pub max_failures: u32,
    /// Strict maximum depth for PTR->A->PTR... forward-resolution chains.
    pub max_ptr_depth: u32,
}

impl Default for DnsResolverConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(7),
            max_failures: 10,
            max_ptr_depth: 10,
        }
    }
}

/// The configuration root: built once from parsed CLI flags in
/// `eavesarp-cli` and handed by reference (`Arc<Config>`) to every
/// subsystem, per DESIGN NOTES §9 ("Global state ... constructed once
/// in a configuration root").
#[derive(Debug, Clone)]
pub struct Config {
    pub interface: String,
    pub interface_addr: Ipv4Addr,
    pub subnet: Ipv4Network,
    pub db_file: PathBuf,
    pub log_file: Option<PathBuf>,
    pub log_level: LogLevel,
    pub data_file: Option<PathBuf>,
    pub rate_gate: RateGateConfig,
    pub arp_sender: ArpSenderConfig,
    pub dns_resolver: DnsResolverConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}
