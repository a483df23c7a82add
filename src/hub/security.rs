//! Connection admission: origin allowlist, authentication for non-local
//! peers, per-address connection cap.

use std::net::IpAddr;

use dashmap::DashMap;
use thiserror::Error;
use url::Url;

use crate::core::{ErrorKind, SecurityError};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("too many connections from {address} (limit {limit})")]
    TooManyConnections { address: IpAddr, limit: usize },

    #[error("hub is shutting down")]
    ShuttingDown,
}

impl AdmissionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Security(_) => ErrorKind::Security,
            Self::TooManyConnections { .. } => ErrorKind::ResourceExhaustion,
            Self::ShuttingDown => ErrorKind::Transient,
        }
    }
}

/// One allowlist entry: a bare host matches any port over http(s); a full
/// origin must match scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AllowedOrigin {
    Host(String),
    Exact {
        scheme: String,
        host: String,
        port: Option<u16>,
    },
}

#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allowed: Vec<AllowedOrigin>,
}

impl OriginPolicy {
    pub fn new(entries: &[String]) -> Self {
        let allowed = entries
            .iter()
            .filter_map(|entry| {
                let entry = entry.trim();
                if entry.contains("://") {
                    let url = Url::parse(entry).ok()?;
                    Some(AllowedOrigin::Exact {
                        scheme: url.scheme().to_string(),
                        host: bare_host(url.host_str()?),
                        port: url.port_or_known_default(),
                    })
                } else {
                    Some(AllowedOrigin::Host(bare_host(entry)))
                }
            })
            .collect();
        Self { allowed }
    }

    /// Validate an `Origin` header and return it normalized.
    pub fn check(&self, origin: Option<&str>) -> Result<String, SecurityError> {
        let origin = origin
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .ok_or(SecurityError::MissingOrigin)?;
        let url =
            Url::parse(origin).map_err(|_| SecurityError::OriginRejected(origin.to_string()))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(SecurityError::OriginRejected(origin.to_string()));
        }
        let host = url
            .host_str()
            .map(bare_host)
            .ok_or_else(|| SecurityError::OriginRejected(origin.to_string()))?;
        let port = url.port_or_known_default();

        let allowed = self.allowed.iter().any(|entry| match entry {
            AllowedOrigin::Host(h) => *h == host,
            AllowedOrigin::Exact {
                scheme,
                host: h,
                port: p,
            } => scheme == url.scheme() && *h == host && *p == port,
        });

        if allowed {
            Ok(url.origin().ascii_serialization())
        } else {
            Err(SecurityError::OriginRejected(origin.to_string()))
        }
    }
}

/// Lowercased host without IPv6 brackets.
fn bare_host(host: &str) -> String {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}

/// What the handshake learned about a connecting peer.
#[derive(Debug, Clone)]
pub struct AdmissionRequest<'a> {
    pub address: IpAddr,
    pub origin: Option<&'a str>,
    pub token: Option<&'a str>,
}

pub struct AdmissionGate {
    origins: OriginPolicy,
    auth_token: Option<String>,
    max_per_address: usize,
    connections: DashMap<IpAddr, usize>,
}

impl AdmissionGate {
    pub fn new(origins: OriginPolicy, auth_token: Option<String>, max_per_address: usize) -> Self {
        Self {
            origins,
            auth_token: auth_token.filter(|t| !t.is_empty()),
            max_per_address: max_per_address.max(1),
            connections: DashMap::new(),
        }
    }

    /// Check a peer and reserve one connection for its address. Returns the
    /// normalized origin. Every success must be paired with [`Self::release`].
    pub fn admit(&self, request: &AdmissionRequest<'_>) -> Result<String, AdmissionError> {
        let origin = self.origins.check(request.origin)?;
        self.authenticate(request.address, request.token)?;

        let mut count = self.connections.entry(request.address).or_insert(0);
        if *count >= self.max_per_address {
            return Err(AdmissionError::TooManyConnections {
                address: request.address,
                limit: self.max_per_address,
            });
        }
        *count += 1;
        Ok(origin)
    }

    fn authenticate(&self, address: IpAddr, token: Option<&str>) -> Result<(), SecurityError> {
        if address.is_loopback() {
            return Ok(());
        }
        match (&self.auth_token, token) {
            (Some(expected), Some(given)) if constant_time_eq(expected.as_bytes(), given.as_bytes()) => {
                Ok(())
            }
            _ => Err(SecurityError::Unauthenticated(address)),
        }
    }

    pub fn release(&self, address: IpAddr) {
        if let Some(mut count) = self.connections.get_mut(&address) {
            *count = count.saturating_sub(1);
        }
        self.connections.remove_if(&address, |_, count| *count == 0);
    }

    pub fn connections_from(&self, address: IpAddr) -> usize {
        self.connections.get(&address).map_or(0, |c| *c)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn policy(entries: &[&str]) -> OriginPolicy {
        OriginPolicy::new(&entries.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_host_entries_match_any_port() {
        let p = policy(&["localhost", "127.0.0.1"]);
        assert_eq!(p.check(Some("http://localhost:3000")).unwrap(), "http://localhost:3000");
        assert!(p.check(Some("https://127.0.0.1")).is_ok());
        assert!(p.check(Some("http://evil.example")).is_err());
    }

    #[test]
    fn test_exact_origin_entries() {
        let p = policy(&["https://preview.local:8443"]);
        assert!(p.check(Some("https://preview.local:8443")).is_ok());
        assert!(p.check(Some("http://preview.local:8443")).is_err());
        assert!(p.check(Some("https://preview.local")).is_err());
    }

    #[test]
    fn test_non_http_schemes_and_missing_origin() {
        let p = policy(&["localhost"]);
        assert!(matches!(
            p.check(Some("file://localhost/index.html")),
            Err(SecurityError::OriginRejected(_))
        ));
        assert!(p.check(Some("null")).is_err());
        assert_eq!(p.check(None), Err(SecurityError::MissingOrigin));
    }

    fn request<'a>(address: IpAddr, token: Option<&'a str>) -> AdmissionRequest<'a> {
        AdmissionRequest {
            address,
            origin: Some("http://localhost:8080"),
            token,
        }
    }

    #[test]
    fn test_non_local_peer_needs_token() {
        let remote = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        let open = AdmissionGate::new(policy(&["localhost"]), None, 4);
        assert_eq!(
            open.admit(&request(remote, Some("x"))).unwrap_err().kind(),
            ErrorKind::Security
        );

        let gated = AdmissionGate::new(policy(&["localhost"]), Some("s3cret".into()), 4);
        assert!(gated.admit(&request(remote, Some("wrong"))).is_err());
        assert!(gated.admit(&request(remote, None)).is_err());
        assert!(gated.admit(&request(remote, Some("s3cret"))).is_ok());
        // loopback never needs a token
        assert!(gated.admit(&request(IpAddr::V4(Ipv4Addr::LOCALHOST), None)).is_ok());
    }

    #[test]
    fn test_per_address_cap_and_release() {
        let local = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let gate = AdmissionGate::new(policy(&["localhost"]), None, 2);
        gate.admit(&request(local, None)).unwrap();
        gate.admit(&request(local, None)).unwrap();
        let err = gate.admit(&request(local, None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);

        gate.release(local);
        assert_eq!(gate.connections_from(local), 1);
        assert!(gate.admit(&request(local, None)).is_ok());
        gate.release(local);
        gate.release(local);
        assert_eq!(gate.connections_from(local), 0);
    }
}
