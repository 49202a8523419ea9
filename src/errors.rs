//! Error types for the DNS relay.
//!
//! This module defines the error types used throughout the relay implementation.

use thiserror::Error;

/// Represents errors that can occur in the DNS relay.
#[derive(Error, Debug)]
pub enum DnsError {
    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed DNS message: unparseable header or section.
    #[error("Format error: {0}")]
    Format(String),

    /// The cache backend could not be reached or failed the operation.
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    /// The upstream resolver timed out, refused, or sent garbage.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown signal received.
    #[error("Shutdown signal received")]
    Shutdown,
}

impl DnsError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        DnsError::Format(msg.into())
    }
}

impl From<rusqlite::Error> for DnsError {
    fn from(e: rusqlite::Error) -> Self {
        DnsError::CacheUnavailable(e.to_string())
    }
}

impl From<r2d2::Error> for DnsError {
    fn from(e: r2d2::Error) -> Self {
        DnsError::CacheUnavailable(e.to_string())
    }
}
