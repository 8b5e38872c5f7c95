//! Rate limit key derivation.
//!
//! A key is the identity a policy's quota is tracked against. Derivation is
//! pure and infallible: an address that cannot be understood collapses to a
//! fixed sentinel instead of failing the request.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Key used for callers whose address cannot be resolved.
pub const UNKNOWN_ADDRESS_KEY: &str = "ip:unknown";

/// The parts of an inbound request that key derivation looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// The caller's network address as seen by the HTTP layer, in any of the
    /// forms `ip`, `ip:port` or `[ipv6]:port`.
    pub remote_addr: Option<String>,
    /// The authenticated principal, if an upstream auth layer attached one.
    pub identity: Option<String>,
}

impl RequestContext {
    /// A context for an anonymous caller.
    pub fn from_addr(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: Some(remote_addr.into()),
            identity: None,
        }
    }

    /// Attach an authenticated identity.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }
}

/// How a policy turns a request into a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyStrategy {
    /// Limit per normalized client address.
    ByRemoteAddress,
    /// Limit per authenticated principal, falling back to the client address
    /// for anonymous callers.
    ByAuthenticatedIdentity,
}

impl KeyStrategy {
    /// Derive the key for a request.
    pub fn derive(&self, req: &RequestContext) -> String {
        match self {
            KeyStrategy::ByRemoteAddress => by_remote_address(req),
            KeyStrategy::ByAuthenticatedIdentity => by_authenticated_identity(req),
        }
    }
}

fn by_remote_address(req: &RequestContext) -> String {
    req.remote_addr
        .as_deref()
        .and_then(normalize_addr)
        .map(|ip| format!("ip:{}", ip))
        .unwrap_or_else(|| UNKNOWN_ADDRESS_KEY.to_string())
}

fn by_authenticated_identity(req: &RequestContext) -> String {
    match req.identity.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => format!("user:{}", id),
        _ => by_remote_address(req),
    }
}

/// Canonicalize a client address so one client always maps to one key.
///
/// Ports, brackets and IPv6 zone identifiers are stripped, and IPv4-mapped
/// IPv6 addresses are reduced to their IPv4 form.
pub fn normalize_addr(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(sock) = raw.parse::<SocketAddr>() {
        return Some(sock.ip().to_canonical());
    }

    let host = match raw.strip_prefix('[') {
        Some(rest) => &rest[..rest.find(']')?],
        None => raw,
    };
    let host = host.split('%').next().unwrap_or(host);

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip.to_canonical());
    }

    // IPv4 with a port that failed to parse as a socket address, e.g. "10.0.0.1:"
    let (v4, _) = host.rsplit_once(':')?;
    v4.parse::<std::net::Ipv4Addr>().ok().map(IpAddr::V4)
}

/// A key namespaced by the policy it belongs to.
///
/// Policies share a single store, so the store key carries the policy name
/// to keep tiers from consuming each other's quota.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    /// The policy this key is counted under
    pub policy: String,
    /// The derived identity
    pub identity: String,
}

impl StoreKey {
    /// Create a new store key.
    pub fn new(policy: &str, identity: &str) -> Self {
        Self {
            policy: policy.to_string(),
            identity: identity.to_string(),
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.policy, self.identity)
    }
}
