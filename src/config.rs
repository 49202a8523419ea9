//! Configuration for the DNS relay.
//!
//! This module defines the configuration structure and methods to load
//! configuration from environment variables, with command-line overrides
//! applied on top.

use std::{
    env,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::cache::CacheEngine;
use crate::errors::DnsError;

/// Port every DNS server listens on.
pub const DNS_PORT: u16 = 53;

/// Default upstream resolver.
pub const DEFAULT_UPSTREAM: &str = "8.8.8.8";

/// Default upstream round-trip timeout in seconds.
pub const DEFAULT_UPSTREAM_TIMEOUT: u64 = 5;

/// Default receive buffer for client datagrams.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Smallest receive buffer the listener will use.
pub const MIN_PACKET_SIZE: usize = 512;

/// Default number of expiring keys kept by the in-memory cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Default number of datagrams resolved at the same time.
pub const DEFAULT_MAX_INFLIGHT: usize = 1024;

/// Relay configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the listener to.
    pub bind_addr: SocketAddr,

    /// Upstream resolver queries are forwarded to.
    pub upstream: SocketAddr,

    /// Upstream round-trip timeout; `None` waits forever.
    pub upstream_timeout: Option<Duration>,

    /// Only accept upstream replies from the upstream address with the query's ID.
    pub verify_upstream: bool,

    /// Cache backend to use.
    pub cache_engine: CacheEngine,

    /// Expiring keys kept by the in-memory cache.
    pub cache_capacity: usize,

    /// Path to the SQLite cache database.
    pub db_path: String,

    /// Static name to address mappings loaded at startup.
    pub seed_file: Option<PathBuf>,

    /// Receive buffer size for client datagrams.
    pub max_packet_size: usize,

    /// Datagrams resolved concurrently before the listener stops reading.
    pub max_inflight: usize,

    /// Default log filter.
    pub log_level: String,
}

/// Values given on the command line, each replacing its environment setting.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub cache_engine: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
    pub upstream: Option<String>,
    pub seed_file: Option<PathBuf>,
    pub db_path: Option<String>,
}

/// Parse `host` or `host:port`; a bare address gets port 53.
pub fn parse_upstream(value: &str) -> Result<SocketAddr, DnsError> {
    let value = value.trim();
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .map_err(|_| DnsError::Config(format!("Invalid upstream address: {}", value)))
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> Result<T, DnsError> {
    match env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| DnsError::Config(format!("Invalid {}: {}", name, v))),
        Err(_) => Ok(default),
    }
}

impl ServerConfig {
    /// Load relay configuration from environment variables.
    ///
    /// # Returns
    /// A `Result` containing either the loaded `ServerConfig` or a `DnsError`.
    pub fn from_env() -> Result<Self, DnsError> {
        let bind_addr = env::var("DNS_BIND")
            .unwrap_or_else(|_| format!("0.0.0.0:{}", DNS_PORT))
            .parse()
            .map_err(|_| DnsError::Config("Invalid DNS_BIND address".into()))?;

        let upstream =
            parse_upstream(&env::var("DNS_UPSTREAM").unwrap_or_else(|_| DEFAULT_UPSTREAM.into()))?;

        let timeout_secs = env_number("DNS_UPSTREAM_TIMEOUT", DEFAULT_UPSTREAM_TIMEOUT)?;

        let cache_engine = env::var("DNS_CACHE")
            .unwrap_or_else(|_| "memory".into())
            .parse()?;

        Ok(Self {
            bind_addr,
            upstream,
            upstream_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            verify_upstream: env::var("DNS_VERIFY_UPSTREAM")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            cache_engine,
            cache_capacity: env_number("DNS_CACHE_CAPACITY", DEFAULT_CACHE_CAPACITY)?,
            db_path: env::var("DNS_DB_PATH").unwrap_or_else(|_| "dns-cache.db".into()),
            seed_file: env::var("DNS_SEED_FILE").ok().map(PathBuf::from),
            max_packet_size: env_number("DNS_MAX_PACKET_SIZE", MAX_PACKET_SIZE)?
                .max(MIN_PACKET_SIZE),
            max_inflight: env_number("DNS_MAX_INFLIGHT", DEFAULT_MAX_INFLIGHT)?.max(1),
            log_level: env::var("DNS_LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        })
    }

    /// Apply command-line values on top of this configuration.
    pub fn with_overrides(mut self, cli: CliOverrides) -> Result<Self, DnsError> {
        if let Some(engine) = cli.cache_engine {
            self.cache_engine = engine.parse()?;
        }
        if let Some(host) = cli.host {
            self.bind_addr.set_ip(
                host.parse()
                    .map_err(|_| DnsError::Config(format!("Invalid listen host: {}", host)))?,
            );
        }
        if let Some(port) = cli.port {
            self.bind_addr.set_port(port);
        }
        if let Some(level) = cli.log_level {
            self.log_level = level.to_ascii_lowercase();
        }
        if let Some(upstream) = cli.upstream {
            self.upstream = parse_upstream(&upstream)?;
        }
        if cli.seed_file.is_some() {
            self.seed_file = cli.seed_file;
        }
        if let Some(path) = cli.db_path {
            self.db_path = path;
        }
        Ok(self)
    }
}
