use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] eavesarp_core::Error),

    #[error(transparent)]
    Net(#[from] eavesarp_net::Error),

    #[error("netfilter: {0}")]
    Netfilter(String),

    #[error("capture: {0}")]
    Capture(String),
}

pub type Result<T> = std::result::Result<T, Error>;
