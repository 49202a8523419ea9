//! NX9 DNS Relay Library
//!
//! This library provides a caching DNS relay. It answers address queries
//! from a local cache, reports blocked names as non-existent, and forwards
//! everything else to an upstream resolver over UDP, caching the address
//! answers it learns along the way.

pub mod cache;
pub mod config;
pub mod db;
pub mod dns;
pub mod errors;
pub mod handlers;
pub mod name;
pub mod resolver;
pub mod seed;
pub mod upstream;

// Re-export commonly used items
pub use cache::{CachePort, MemoryCache, Ttl};
pub use config::ServerConfig;
pub use db::SqliteCache;
pub use dns::Message;
pub use errors::DnsError;
pub use resolver::{DnsRelay, Outcome};
pub use upstream::UdpForwarder;
