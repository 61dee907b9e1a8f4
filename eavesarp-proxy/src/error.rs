use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] eavesarp_core::Error),

    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("tls: {0}")]
    Tls(String),

    #[error("no downstream mapped for victim {0}")]
    NoDownstreamForVictim(String),
}

pub type Result<T> = std::result::Result<T, Error>;
