/// Destination name resolution.
///
/// The SOCKS4 reply format, the firewall, and BIND peer verification are all
/// IPv4-only, so resolution yields the first IPv4 record in resolver order.
/// There is no fallback across addresses: if the first usable record is
/// unreachable the session fails rather than trying the next one.

use std::net::{SocketAddr, SocketAddrV4};
use thiserror::Error;
use tokio::net::lookup_host;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("lookup failed for {host}:{port}: {source}")]
    Lookup {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("{host}:{port} has no IPv4 address")]
    NoIpv4 { host: String, port: u16 },
}

/// Resolve `host:port` to the first IPv4 endpoint the resolver returns.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddrV4, ResolveError> {
    let mut addrs = lookup_host((host, port))
        .await
        .map_err(|source| ResolveError::Lookup {
            host: host.to_string(),
            port,
            source,
        })?;

    let endpoint = addrs
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| ResolveError::NoIpv4 {
            host: host.to_string(),
            port,
        })?;

    debug!(host, port, %endpoint, "resolved");
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_resolve_ipv4_literal() {
        let endpoint = resolve("127.0.0.1", 80).await.unwrap();
        assert_eq!(endpoint, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 80));
    }

    #[tokio::test]
    async fn test_resolve_ipv6_literal_has_no_ipv4() {
        assert!(matches!(
            resolve("::1", 80).await,
            Err(ResolveError::NoIpv4 { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_empty_host_fails() {
        assert!(resolve("", 80).await.is_err());
    }
}
