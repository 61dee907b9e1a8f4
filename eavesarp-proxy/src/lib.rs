pub mod datalog;
pub mod error;
pub mod peek;
pub mod tcp_proxy;
pub mod tls_cache;
pub mod udp_proxy;

pub use datalog::DataLogSink;
pub use error::{Error, Result};
pub use tcp_proxy::TcpProxy;
pub use tls_cache::TlsCertCache;
pub use udp_proxy::UdpProxy;
