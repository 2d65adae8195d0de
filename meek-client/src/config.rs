//! Client configuration
//!
//! All knobs are construction parameters supplied by the orchestrator that
//! decides which relays to instantiate. Nothing is read from files or the
//! environment, and the configuration is immutable once built.

use base64::{Engine, engine::general_purpose::STANDARD};

use crate::{MeekError, MeekResult};

/// How requests reach the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeekMode {
    /// HTTPS through a fronting CDN. The TLS SNI, DNS lookup and URL all
    /// name `domain`; the `Host` header names the relay behind the front.
    Fronted { domain: String, host: String },
    /// Plain HTTP straight to the relay. Session parameters travel only in
    /// the obfuscated cookie.
    Unfronted { host: String, port: u16 },
}

/// Immutable per-relay configuration.
#[derive(Debug, Clone)]
pub struct MeekConfig {
    pub mode: MeekMode,
    /// Opaque id identifying this client session to the relay.
    pub session_id: String,
    /// `host:port` the relay should dial on our behalf.
    pub target_address: String,
    /// Relay public key for cookie encryption, decoded from base64.
    pub(crate) recipient_public_key: [u8; 32],
    /// When set, cookie bytes are additionally passed through the
    /// keyword-seeded stream obfuscator.
    pub obfuscation_keyword: Option<String>,
}

impl MeekConfig {
    /// Build a configuration, decoding and checking the relay public key.
    pub fn new(
        mode: MeekMode,
        session_id: impl Into<String>,
        target_address: impl Into<String>,
        recipient_public_key_b64: &str,
        obfuscation_keyword: Option<String>,
    ) -> MeekResult<Self> {
        let key_bytes = STANDARD
            .decode(recipient_public_key_b64)
            .map_err(|e| MeekError::Config(format!("bad relay public key: {}", e)))?;
        let recipient_public_key: [u8; 32] = key_bytes.try_into().map_err(|v: Vec<u8>| {
            MeekError::Config(format!("relay public key must be 32 bytes, got {}", v.len()))
        })?;

        Ok(Self {
            mode,
            session_id: session_id.into(),
            target_address: target_address.into(),
            recipient_public_key,
            obfuscation_keyword,
        })
    }

    pub(crate) fn is_fronted(&self) -> bool {
        matches!(self.mode, MeekMode::Fronted { .. })
    }

    /// Host to resolve and connect to, with the port. In fronted mode this
    /// is the front, which is also the TLS SNI.
    pub fn endpoint(&self) -> (&str, u16) {
        match &self.mode {
            MeekMode::Fronted { domain, .. } => (domain, 443),
            MeekMode::Unfronted { host, port } => (host, *port),
        }
    }

    /// Value of the `Host` request header. In fronted mode this is the
    /// relay behind the CDN, not the name the TLS connection was made to.
    pub fn host_header(&self) -> String {
        match &self.mode {
            MeekMode::Fronted { host, .. } => host.clone(),
            MeekMode::Unfronted { host, port } => {
                if *port == 80 {
                    host.clone()
                } else {
                    format!("{}:{}", host, port)
                }
            }
        }
    }

    /// Endpoint URL, for diagnostics only.
    pub fn url(&self) -> String {
        match &self.mode {
            MeekMode::Fronted { domain, .. } => format!("https://{}/", domain),
            MeekMode::Unfronted { host, port } => format!("http://{}:{}/", host, port),
        }
    }
}
