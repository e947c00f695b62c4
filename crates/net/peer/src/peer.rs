//! Remote endpoint identity.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

use crate::scope;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid peer address: {0:?}")]
pub struct ParsePeerError(String);

/// A remote endpoint identified by IP address and port.
///
/// A peer may additionally carry an unresolved hostname (e.g. from a node
/// reference that has not been looked up yet); identity is by IP + port only,
/// so maps keyed by `Peer` must hold hostname-free peers obtained via
/// [`Peer::strip_host`].
#[derive(Debug, Clone)]
pub struct Peer {
    host: Option<String>,
    ip: Option<IpAddr>,
    port: u16,
}

impl Peer {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            host: None,
            ip: Some(ip),
            port,
        }
    }

    /// A peer known by hostname, with an optional already-resolved address.
    pub fn with_host(host: impl Into<String>, ip: Option<IpAddr>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            ip,
            port,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// The hostname-free identity of this peer, or `None` if no resolved
    /// address is available to identify it by.
    pub fn strip_host(&self) -> Option<Peer> {
        self.ip.map(|ip| Peer::new(ip, self.port))
    }

    /// True if the peer's address is publicly routable, i.e. traffic from it
    /// is evidence about our visibility from the open internet.
    pub fn is_real_internet_address(&self) -> bool {
        self.ip.is_some_and(scope::is_real_internet_address)
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.ip, &self.host) {
            (Some(ip), _) => write!(f, "{}", SocketAddr::new(ip, self.port)),
            (None, Some(host)) => write!(f, "{}:{}", host, self.port),
            (None, None) => write!(f, "?:{}", self.port),
        }
    }
}

impl FromStr for Peer {
    type Err = ParsePeerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddr = s.parse().map_err(|_| ParsePeerError(s.to_owned()))?;
        Ok(Peer::new(addr.ip(), addr.port()))
    }
}
