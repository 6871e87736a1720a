//! Agent identity: address-based node ids and the transport identity policy.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Node ID: the `host:port` an agent is reachable at. Used as transport
/// destination and as the allocator's node-table key.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(addr: impl Into<String>) -> Self {
        NodeId(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for `0.0.0.0:port` / `[::]:port`: a listen address, not a
    /// destination.
    pub fn has_unspecified_host(&self) -> bool {
        self.0
            .parse::<SocketAddr>()
            .map_or(false, |addr| addr.ip().is_unspecified())
    }
}

impl From<SocketAddr> for NodeId {
    fn from(addr: SocketAddr) -> Self {
        NodeId(addr.to_string())
    }
}

impl From<&str> for NodeId {
    fn from(addr: &str) -> Self {
        NodeId(addr.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity a transport attaches to every outbound connection. Fixed at bind
/// time; never changed per send.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Identity {
    /// No fixed identity; peers address replies to the envelope source.
    #[default]
    Anonymous,
    /// Use the bound local address (resolved after bind, so ephemeral ports work).
    Address,
    /// Explicit identity.
    Named(NodeId),
    /// Advertise this host (name or IP) with the port actually bound.
    Host(String),
}

impl Identity {
    /// Resolve against the address the listener actually bound.
    pub fn resolve(&self, bound: SocketAddr) -> Option<NodeId> {
        match self {
            Identity::Anonymous => None,
            Identity::Address => Some(NodeId::from(bound)),
            Identity::Named(id) => Some(id.clone()),
            Identity::Host(host) if host.contains(':') && !host.starts_with('[') => {
                Some(NodeId::new(format!("[{}]:{}", host, bound.port())))
            }
            Identity::Host(host) => Some(NodeId::new(format!("{}:{}", host, bound.port()))),
        }
    }
}
