//! Allocation protocol: envelope types, payloads and timeout correlation keys.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// Current protocol version. Sent in every connection preamble.
pub const PROTOCOL_VERSION: u8 = 1;

/// The eight envelope types. Agents dispatch on this with an exhaustive match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Load asks to be known by the allocator; carries its current allocation.
    Join,
    JoinAck,
    /// Allocator assigns an allocation to a load.
    Allocation,
    /// Load accepted an allocation; echoes it back.
    AllocationAck,
    /// Load departs the network.
    Leave,
    /// Passive status report from a load; no reply expected.
    CurrAllocation,
    /// Shut down: sent by the allocator to every load, or by an operator to the allocator.
    Stop,
    StopAck,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Join => "join",
            MessageType::JoinAck => "join_ack",
            MessageType::Allocation => "allocation",
            MessageType::AllocationAck => "allocation_ack",
            MessageType::Leave => "leave",
            MessageType::CurrAllocation => "curr_allocation",
            MessageType::Stop => "stop",
            MessageType::StopAck => "stop_ack",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique allocation token.
#[derive(Debug, Clone, PartialEq, Eq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct AllocationId(String);

impl AllocationId {
    pub fn new(id: impl Into<String>) -> Self {
        AllocationId(id.into())
    }

    /// Fresh random (v4 UUID) id.
    pub fn generate() -> Self {
        AllocationId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for AllocationId {
    fn from(id: String) -> Self {
        AllocationId(id)
    }
}

impl From<&str> for AllocationId {
    fn from(id: &str) -> Self {
        AllocationId(id.to_string())
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resource assignment. Two allocations are equal iff every field matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub allocation_id: AllocationId,
    pub value: f64,
    pub duration: Duration,
}

impl Allocation {
    pub fn new(allocation_id: impl Into<AllocationId>, value: f64, duration: Duration) -> Self {
        Self {
            allocation_id: allocation_id.into(),
            value,
            duration,
        }
    }

    /// The zero allocation a load reports before it has been assigned anything.
    pub fn idle() -> Self {
        Self {
            allocation_id: AllocationId::new(""),
            value: 0.0,
            duration: Duration::ZERO,
        }
    }
}

/// Structured envelope payloads. New payload kinds are added as variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Payload {
    #[default]
    Empty,
    Allocation(Allocation),
}

impl Payload {
    pub fn allocation(&self) -> Option<&Allocation> {
        match self {
            Payload::Allocation(a) => Some(a),
            Payload::Empty => None,
        }
    }
}

impl From<Allocation> for Payload {
    fn from(a: Allocation) -> Self {
        Payload::Allocation(a)
    }
}

/// The addressed, typed unit exchanged between agents. Built fresh per send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageType,
    pub src: NodeId,
    pub dst: NodeId,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(kind: MessageType, src: NodeId, dst: NodeId) -> Self {
        Self {
            kind,
            src,
            dst,
            payload: Payload::Empty,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = payload.into();
        self
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.kind, self.src, self.dst)
    }
}

/// Correlates an outstanding request with its timeout and its acknowledgment.
/// Namespaced by message family so allocation and stop timers never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventId {
    AllocationAck {
        allocation: AllocationId,
        node: NodeId,
    },
    StopAck {
        node: NodeId,
    },
}

impl EventId {
    pub fn allocation(allocation: &AllocationId, node: &NodeId) -> Self {
        EventId::AllocationAck {
            allocation: allocation.clone(),
            node: node.clone(),
        }
    }

    pub fn stop(node: &NodeId) -> Self {
        EventId::StopAck { node: node.clone() }
    }

    /// Node the outstanding request was sent to.
    pub fn node(&self) -> &NodeId {
        match self {
            EventId::AllocationAck { node, .. } | EventId::StopAck { node } => node,
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventId::AllocationAck { allocation, node } => {
                write!(f, "allocation_ack({}, {})", allocation, node)
            }
            EventId::StopAck { node } => write!(f, "stop_ack({})", node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_equality_is_field_wise() {
        let a = Allocation::new("a1", 10.0, Duration::from_secs(5));
        assert_eq!(a, Allocation::new("a1", 10.0, Duration::from_secs(5)));
        assert_ne!(a, Allocation::new("a1", 11.0, Duration::from_secs(5)));
        assert_ne!(a, Allocation::new("a2", 10.0, Duration::from_secs(5)));
        assert_ne!(a, Allocation::new("a1", 10.0, Duration::from_secs(6)));
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(AllocationId::generate(), AllocationId::generate());
    }

    #[test]
    fn event_ids_are_namespaced_by_family() {
        let node = NodeId::new("127.0.0.1:5000");
        let stop = EventId::stop(&node);
        // An allocation whose id is literally "stop" must not alias the stop timer.
        let alloc = EventId::allocation(&AllocationId::new("stop"), &node);
        assert_ne!(stop, alloc);
        assert_eq!(stop.node(), alloc.node());
    }

    #[test]
    fn event_id_display() {
        let eid = EventId::allocation(&"a1".into(), &NodeId::new("127.0.0.1:5000"));
        assert_eq!(eid.to_string(), "allocation_ack(a1, 127.0.0.1:5000)");
    }

    #[test]
    fn message_type_names() {
        assert_eq!(MessageType::CurrAllocation.to_string(), "curr_allocation");
        assert_eq!(MessageType::StopAck.as_str(), "stop_ack");
    }

    #[test]
    fn payload_accessor() {
        assert!(Payload::Empty.allocation().is_none());
        let p = Payload::from(Allocation::idle());
        assert_eq!(p.allocation().map(|a| a.value), Some(0.0));
    }
}
