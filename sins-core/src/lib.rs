//! Decentralized allocation network: an Allocator and a dynamic set of Loads
//! coordinate over an asynchronous transport with a join / allocate /
//! acknowledge / stop handshake and timeout-based failure detection.
//!
//! Protocol logic runs on a per-agent [`Scheduler`] timeline; socket I/O runs
//! on the transport's own thread and reaches the timeline only through its
//! [`Mailbox`].

pub mod agent;
pub mod allocator;
pub mod config;
pub mod identity;
pub mod load;
pub mod protocol;
pub mod record;
pub mod retry;
pub mod scheduler;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod testing;

pub use agent::{inbound_handler, run_agent, Agent};
pub use allocator::{Allocator, AllocatorConfig, NodeUpdate, TimeoutFailure};
pub use config::Config;
pub use identity::{Identity, NodeId};
pub use load::{Load, LoadConfig};
pub use protocol::{Allocation, AllocationId, Envelope, EventId, MessageType, Payload, PROTOCOL_VERSION};
pub use record::{Record, RecordLog};
pub use retry::RetryPolicy;
pub use scheduler::{Mailbox, Scheduler, SchedulerError, SchedulerState, SimTime, StopHandle};
pub use transport::{InboundHandler, Link, Transport, TransportConfig, TransportError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
