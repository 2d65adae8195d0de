//! Meek tunnel client
//!
//! Carries an arbitrary TCP byte stream to a relay inside a sequence of
//! short HTTP(S) POST exchanges, so the traffic blends in with ordinary web
//! requests. Optionally the outer TLS connection is made to a fronting CDN
//! domain while an inner `Host` header selects the true relay.
//!
//! The host application binds one [`MeekClient`] per relay, points the
//! upstream protocol stack at [`MeekClient::local_port`], and everything a
//! local connection writes is relayed through polled HTTP exchanges. Session
//! parameters travel in an encrypted cookie, never in the URL or body.

pub mod client;
pub mod config;
pub mod cookie;
pub mod dns;
pub mod obfuscate;
pub mod protect;

mod session;
mod transport;

// Re-export the items hosts actually touch
pub use client::MeekClient;
pub use config::{MeekConfig, MeekMode};
pub use dns::{DnsResolver, UntunneledDns};
pub use protect::{NoProtect, SocketProtector};

/// Meek transport errors
#[derive(Debug, thiserror::Error)]
pub enum MeekError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cookie construction failed: {0}")]
    Cookie(String),

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("Request timed out")]
    Timeout,

    #[error("Local socket error: {0}")]
    LocalIo(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type MeekResult<T> = Result<T, MeekError>;
