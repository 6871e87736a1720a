//! The agent seam: protocol state machines driven by a [`Scheduler`] timeline.

use std::sync::Arc;

use tracing::debug;

use crate::identity::NodeId;
use crate::protocol::Envelope;
use crate::scheduler::{Mailbox, Scheduler, SchedulerError};
use crate::transport::InboundHandler;

/// A protocol participant. All methods run on the agent's own timeline.
pub trait Agent: Sized + 'static {
    fn id(&self) -> &NodeId;

    /// Dispatch one inbound envelope.
    fn on_envelope(&mut self, envelope: Envelope, sched: &mut Scheduler<Self>);

    /// Tear down the agent's transport. Idempotent.
    fn shutdown(&mut self);
}

/// Transport callback that re-posts each decoded envelope onto the agent's
/// timeline. Network threads never touch agent state directly.
pub fn inbound_handler<A: Agent>(mailbox: Mailbox<A>) -> InboundHandler {
    Arc::new(move |envelope: Envelope| {
        let kind = envelope.kind;
        let delivered = mailbox.post(move |agent: &mut A, sched: &mut Scheduler<A>| {
            agent.on_envelope(envelope, sched)
        });
        if !delivered {
            debug!(%kind, "timeline gone; envelope dropped");
        }
    })
}

/// Run `agent` on `sched` until the timeline stops (protocol stop, stop
/// request or interrupt), then shut the agent down.
pub fn run_agent<A: Agent>(agent: &mut A, sched: &mut Scheduler<A>) -> Result<(), SchedulerError> {
    let result = sched.run(agent);
    agent.shutdown();
    result
}
