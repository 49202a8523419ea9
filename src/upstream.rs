//! Forwarding of queries to the upstream resolver.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use log::debug;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::config::ServerConfig;
use crate::errors::DnsError;

/// Receive buffer for upstream replies, large enough for EDNS-sized answers.
pub const UPSTREAM_RECV_BUFFER: usize = 4096;

/// One-shot UDP forwarder to a fixed upstream resolver.
#[derive(Debug, Clone)]
pub struct UdpForwarder {
    upstream: SocketAddr,
    timeout: Option<Duration>,
    verify: bool,
}

impl UdpForwarder {
    pub fn new(upstream: SocketAddr) -> Self {
        Self {
            upstream,
            timeout: None,
            verify: false,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            upstream: config.upstream,
            timeout: config.upstream_timeout,
            verify: config.verify_upstream,
        }
    }

    /// Give up on a round-trip after `limit`.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Discard replies that do not come from the upstream or do not carry
    /// the query's transaction ID, waiting for the real one instead.
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    /// Send `query` to the upstream and return the first (acceptable) reply.
    ///
    /// Uses a fresh socket per call; the socket closes when this returns.
    pub async fn forward(&self, query: &[u8]) -> Result<Vec<u8>, DnsError> {
        let round_trip = self.round_trip(query);
        let result = match self.timeout {
            Some(limit) => timeout(limit, round_trip).await.map_err(|_| {
                DnsError::UpstreamUnavailable(format!(
                    "{} did not answer within {:?}",
                    self.upstream, limit
                ))
            })?,
            None => round_trip.await,
        };
        result.map_err(|e| match e {
            DnsError::Io(io) => DnsError::UpstreamUnavailable(format!("{}: {}", self.upstream, io)),
            other => other,
        })
    }

    async fn round_trip(&self, query: &[u8]) -> Result<Vec<u8>, DnsError> {
        let local: SocketAddr = if self.upstream.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.send_to(query, self.upstream).await?;

        let mut buf = vec![0u8; UPSTREAM_RECV_BUFFER];
        loop {
            let (size, from) = socket.recv_from(&mut buf).await?;
            if !self.verify || self.is_expected(query, &buf[..size], from) {
                return Ok(buf[..size].to_vec());
            }
            debug!("Ignoring unexpected {}-byte reply from {}", size, from);
        }
    }

    fn is_expected(&self, query: &[u8], reply: &[u8], from: SocketAddr) -> bool {
        from == self.upstream && query.len() >= 2 && reply.len() >= 2 && query[..2] == reply[..2]
    }
}
