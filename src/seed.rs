//! Seed file loading.
//!
//! A seed file uses the hosts-file layout, one address followed by one or
//! more names per line:
//!
//! ```text
//! # static override
//! 192.168.1.10  nas.home nas
//! # blocked
//! 0.0.0.0       ads.example.com
//! ```
//!
//! Every name becomes a persistent `A` entry in the cache.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use log::{info, warn};

use crate::cache::{CachePort, Ttl, FIELD_A};
use crate::errors::DnsError;
use crate::name::Name;

/// Load the seed file at `path`, returning how many names were stored.
pub fn load_seed_file(path: &Path, cache: &dyn CachePort) -> Result<usize, DnsError> {
    let content = fs::read_to_string(path)
        .map_err(|e| DnsError::Config(format!("Cannot read seed file {}: {}", path.display(), e)))?;
    let loaded = load_seed(&content, cache)?;
    info!("Loaded {} names from seed file {}", loaded, path.display());
    Ok(loaded)
}

/// Load seed entries from text. Malformed lines are logged and skipped.
pub fn load_seed(content: &str, cache: &dyn CachePort) -> Result<usize, DnsError> {
    let mut loaded = 0;
    for (index, raw) in content.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(addr) = parts.next() else {
            continue;
        };
        let addr: Ipv4Addr = match addr.parse() {
            Ok(addr) => addr,
            Err(_) => {
                warn!("Seed line {}: invalid IPv4 address {:?}", index + 1, addr);
                continue;
            }
        };
        let mut names = parts.peekable();
        if names.peek().is_none() {
            warn!("Seed line {}: no name for {}", index + 1, addr);
            continue;
        }
        for name in names {
            let name = match Name::from_text(name) {
                Ok(name) => name,
                Err(e) => {
                    warn!("Seed line {}: {}", index + 1, e);
                    continue;
                }
            };
            cache.put(name.as_str(), FIELD_A, &addr.octets())?;
            cache.set_ttl(name.as_str(), Ttl::Persistent)?;
            loaded += 1;
        }
    }
    Ok(loaded)
}
