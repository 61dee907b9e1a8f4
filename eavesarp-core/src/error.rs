use thiserror::Error;

/// The abstract error kinds shared across every eavesarp-ng crate.
///
/// Downstream crates (`eavesarp-net`, `eavesarp-attack`, `eavesarp-proxy`)
/// define their own error enums for transport-specific failures and wrap
/// this one with `#[from]`, mirroring the one-enum-per-crate-boundary
/// pattern used throughout the codebase.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("resolve: {0}")]
    Resolve(String),

    #[error("store: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("store pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("netfilter: {0}")]
    Netfilter(String),

    #[error("arp reply requires a known target hardware address")]
    InvalidReply,

    #[error("no downstream mapped for victim {0}")]
    NoDownstreamForVictim(String),

    #[error("dns failure budget exceeded")]
    BudgetExceeded,

    #[error("active arp entry already set for {0}")]
    AlreadySet(String),
}

pub type Result<T> = std::result::Result<T, Error>;
