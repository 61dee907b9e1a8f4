use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] eavesarp_core::Error),

    #[error("capture: {0}")]
    Capture(String),

    #[error("dns: {0}")]
    Dns(String),
}

pub type Result<T> = std::result::Result<T, Error>;
