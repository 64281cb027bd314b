//! Connection gate against server-side request forgery
//!
//! Every outbound destination must be a public IPv4/IPv6 address on port 80
//! or 443. Host names are resolved by [`SafeResolver`], which drops any
//! non-public address before the connector sees it, so the address that gets
//! dialed is the address that was checked.

use std::error::Error as StdError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use url::{Host, Url};

use super::whitelist::Whitelist;
use crate::error::FetchError;

const SAFE_PORTS: [u16; 2] = [80, 443];

/// Allow-list and connection gate applied to the initial request and to every
/// redirect hop.
#[derive(Debug, Clone)]
pub struct RequestGate {
    whitelist: Whitelist,
    bypass: bool,
}

impl RequestGate {
    pub fn new(whitelist: Whitelist, bypass: bool) -> Self {
        Self { whitelist, bypass }
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    pub fn check(&self, url: &Url) -> Result<(), FetchError> {
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(FetchError::UnsupportedScheme(other.to_string())),
        }
        let host = url
            .host()
            .ok_or_else(|| FetchError::MissingHost(url.to_string()))?;

        if !self.whitelist.allows(url) {
            return Err(FetchError::NotWhitelisted(url.to_string()));
        }
        if self.bypass {
            return Ok(());
        }

        let port = url.port_or_known_default().unwrap_or(0);
        if !SAFE_PORTS.contains(&port) {
            return Err(FetchError::UnsafePort(port));
        }

        // Literal addresses never reach the resolver
        let literal = match host {
            Host::Ipv4(ip) => Some(IpAddr::V4(ip)),
            Host::Ipv6(ip) => Some(IpAddr::V6(ip)),
            Host::Domain(_) => None,
        };
        if let Some(ip) = literal {
            if !is_public_ip(ip) {
                return Err(FetchError::UnsafeAddress(ip));
            }
        }

        Ok(())
    }
}

/// Resolver that only yields publicly routable addresses
#[derive(Debug, Default, Clone, Copy)]
pub struct SafeResolver;

/// Raised by [`SafeResolver`] when a name only resolves to non-public addresses
#[derive(Debug)]
pub struct UnsafeResolution {
    pub host: String,
    pub address: IpAddr,
}

impl fmt::Display for UnsafeResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} resolves to {}, which is not a public IP address", self.host, self.address)
    }
}

impl StdError for UnsafeResolution {}

impl Resolve for SafeResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await?
                .collect();

            let rejected = resolved.iter().find(|addr| !is_public_ip(addr.ip())).map(|a| a.ip());
            let public: Vec<SocketAddr> = resolved
                .into_iter()
                .filter(|addr| is_public_ip(addr.ip()))
                .collect();

            if public.is_empty() {
                let address = rejected.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
                tracing::warn!(%host, %address, "Refusing connection to non-public address");
                return Err(Box::new(UnsafeResolution { host, address }) as Box<dyn StdError + Send + Sync>);
            }

            Ok(Box::new(public.into_iter()) as Addrs)
        })
    }
}

/// Find an [`UnsafeResolution`] anywhere in an error's source chain
pub(crate) fn unsafe_resolution(err: &(dyn StdError + 'static)) -> Option<IpAddr> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(resolution) = e.downcast_ref::<UnsafeResolution>() {
            return Some(resolution.address);
        }
        current = e.source();
    }
    None
}

/// True for globally routable unicast addresses
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_ipv4(v4),
        IpAddr::V6(v6) => is_public_ipv6(v6),
    }
}

fn is_public_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();

    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation()
        // 0.0.0.0/8 "this network"
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xc0) == 64)
        // 192.0.0.0/24 IETF protocol assignments
        || (a == 192 && b == 0 && c == 0)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b & 0xfe) == 18)
        // 240.0.0.0/4 reserved
        || a >= 240)
}

fn is_public_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_public_ipv4(v4);
    }

    let segments = ip.segments();
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (segments[0] & 0xfe00) == 0xfc00
        // fe80::/10 link-local
        || (segments[0] & 0xffc0) == 0xfe80
        // fec0::/10 deprecated site-local
        || (segments[0] & 0xffc0) == 0xfec0
        // 2001:db8::/32 documentation
        || (segments[0] == 0x2001 && segments[1] == 0x0db8)
        // 100::/64 discard-only
        || (segments[0] == 0x0100 && segments[1] == 0 && segments[2] == 0 && segments[3] == 0)
        // ::/96 IPv4-compatible (deprecated)
        || (segments[..6].iter().all(|s| *s == 0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_private_addresses_rejected() {
        for addr in [
            "10.0.0.1",
            "10.255.255.255",
            "172.16.0.1",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.169.254",
            "0.0.0.0",
            "100.64.0.1",
            "224.0.0.1",
            "255.255.255.255",
            "::1",
            "::",
            "fe80::1",
            "fd00::1",
            "ff02::1",
            "::ffff:10.0.0.1",
            "::ffff:127.0.0.1",
        ] {
            assert!(!is_public_ip(ip(addr)), "{} should not be public", addr);
        }
    }

    #[test]
    fn test_public_addresses_accepted() {
        for addr in ["1.1.1.1", "8.8.8.8", "93.184.216.34", "2606:4700:4700::1111", "::ffff:1.1.1.1"] {
            assert!(is_public_ip(ip(addr)), "{} should be public", addr);
        }
    }

    #[test]
    fn test_gate_rejects_private_literal() {
        let gate = RequestGate::new(Whitelist::default(), false);
        let err = gate.check(&Url::parse("http://10.0.0.1/book.epub").unwrap()).unwrap_err();
        assert!(matches!(err, FetchError::UnsafeAddress(_)));

        let err = gate.check(&Url::parse("http://[::1]/book.epub").unwrap()).unwrap_err();
        assert!(matches!(err, FetchError::UnsafeAddress(_)));
    }

    #[test]
    fn test_gate_rejects_unsafe_port() {
        let gate = RequestGate::new(Whitelist::default(), false);
        let err = gate
            .check(&Url::parse("https://example.com:8443/book.epub").unwrap())
            .unwrap_err();
        assert!(matches!(err, FetchError::UnsafePort(8443)));

        assert!(gate.check(&Url::parse("https://example.com/book.epub").unwrap()).is_ok());
        assert!(gate.check(&Url::parse("http://example.com:80/book.epub").unwrap()).is_ok());
    }

    #[test]
    fn test_gate_rejects_other_schemes() {
        let gate = RequestGate::new(Whitelist::default(), true);
        let err = gate.check(&Url::parse("ftp://example.com/a").unwrap()).unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedScheme(_)));
    }

    #[test]
    fn test_bypass_still_applies_whitelist() {
        let whitelist = Whitelist::parse(&["http://127.0.0.1:9000/books"]).unwrap();
        let gate = RequestGate::new(whitelist, true);

        assert!(gate.check(&Url::parse("http://127.0.0.1:9000/books/a.epub").unwrap()).is_ok());
        assert!(matches!(
            gate.check(&Url::parse("http://127.0.0.1:9000/etc/a.epub").unwrap()),
            Err(FetchError::NotWhitelisted(_))
        ));
    }
}
