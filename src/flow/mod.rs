//! Flow storage: the sharded flow map and its sidecar caches

pub mod dhc;
pub mod fhc;
pub mod map;

pub use dhc::DnsHintCache;
pub use fhc::FlowHashCache;
pub use map::FlowMap;
