pub mod connmap;
pub mod conntrack;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod netfilter;

pub use connmap::ConnectionMap;
pub use engine::AttackEngine;
pub use error::{Error, Result};
pub use netfilter::NetfilterPlane;
