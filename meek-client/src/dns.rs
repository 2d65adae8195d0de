//! Out-of-tunnel DNS resolution
//!
//! Relay hostnames must not be resolved through the tunnel's own DNS, both
//! to avoid a bootstrap loop and because local resolvers may be the thing
//! being censored. Hosts inject a [`DnsResolver`]; the bundled
//! [`UntunneledDns`] queries Cloudflare (1.1.1.1 / 1.0.0.1) directly instead
//! of the system resolver.

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use crate::{MeekError, MeekResult};

/// Future returned by [`DnsResolver::resolve`].
pub type Resolving = Pin<Box<dyn Future<Output = MeekResult<Vec<IpAddr>>> + Send>>;

/// Host-provided hostname resolution that bypasses the tunnel.
pub trait DnsResolver: Send + Sync {
    fn resolve(&self, hostname: &str) -> Resolving;
}

/// DNS resolver that queries fixed public resolvers over UDP with TCP
/// fallback, skipping the (possibly tunneled or unreliable) system DNS.
pub struct UntunneledDns {
    resolver: TokioAsyncResolver,
}

impl UntunneledDns {
    pub fn new() -> Self {
        let mut config = ResolverConfig::new();

        // Primary: 1.1.1.1 (UDP, TCP fallback)
        config.add_name_server(NameServerConfig::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53),
            Protocol::Udp,
        ));
        config.add_name_server(NameServerConfig::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53),
            Protocol::Tcp,
        ));

        // Fallback: 1.0.0.1 (UDP, TCP fallback)
        config.add_name_server(NameServerConfig::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)), 53),
            Protocol::Udp,
        ));
        config.add_name_server(NameServerConfig::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)), 53),
            Protocol::Tcp,
        ));

        let resolver = TokioAsyncResolver::tokio(config, ResolverOpts::default());

        Self { resolver }
    }

    /// Shared instance for hosts that have no resolver of their own.
    pub fn shared() -> Arc<Self> {
        static INSTANCE: std::sync::OnceLock<Arc<UntunneledDns>> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(|| Arc::new(Self::new())).clone()
    }
}

impl Default for UntunneledDns {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsResolver for UntunneledDns {
    fn resolve(&self, hostname: &str) -> Resolving {
        let resolver = self.resolver.clone();
        let hostname = hostname.to_string();
        Box::pin(async move {
            // Address literals need no lookup (common for unfronted relays)
            if let Ok(ip) = hostname.parse::<IpAddr>() {
                return Ok(vec![ip]);
            }

            let lookup = resolver
                .lookup_ip(hostname.as_str())
                .await
                .map_err(|e| MeekError::Dns(format!("'{}': {}", hostname, e)))?;

            let addrs: Vec<IpAddr> = lookup.into_iter().collect();
            if addrs.is_empty() {
                return Err(MeekError::Dns(format!("no addresses for '{}'", hostname)));
            }

            Ok(addrs)
        })
    }
}
