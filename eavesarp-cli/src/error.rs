use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] eavesarp_core::Error),

    #[error(transparent)]
    Net(#[from] eavesarp_net::Error),

    #[error(transparent)]
    Attack(#[from] eavesarp_attack::Error),

    #[error(transparent)]
    Proxy(#[from] eavesarp_proxy::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
