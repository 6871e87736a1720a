//! Load protocol: the leaf agent. Joins the allocator, acknowledges and applies
//! allocations, and stops on command.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::identity::NodeId;
use crate::protocol::{Allocation, AllocationId, Envelope, MessageType, Payload};
use crate::record::{Record, RecordLog};
use crate::scheduler::Scheduler;
use crate::transport::Link;

pub const DEFAULT_APPLY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct LoadConfig {
    /// Gap between acknowledging an allocation and applying it.
    pub apply_delay: Duration,
    /// Send `curr_allocation` to the allocator this often, if set.
    pub report_interval: Option<Duration>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            apply_delay: DEFAULT_APPLY_DELAY,
            report_interval: None,
        }
    }
}

pub struct Load<L> {
    id: NodeId,
    link: L,
    config: LoadConfig,
    allocator: Option<NodeId>,
    joined: bool,
    current: Allocation,
    /// Inside the hold period of `current`.
    holding: bool,
    applied: u64,
    records: Option<RecordLog>,
}

impl<L: Link> Load<L> {
    pub fn new(id: NodeId, link: L, config: LoadConfig) -> Self {
        Self {
            id,
            link,
            config,
            allocator: None,
            joined: false,
            current: Allocation::idle(),
            holding: false,
            applied: 0,
            records: None,
        }
    }

    /// Append a record per applied allocation to `log`.
    pub fn with_record_log(mut self, log: RecordLog) -> Self {
        self.records = Some(log);
        self
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn allocator(&self) -> Option<&NodeId> {
        self.allocator.as_ref()
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn current_allocation(&self) -> &Allocation {
        &self.current
    }

    pub fn is_holding(&self) -> bool {
        self.holding
    }

    /// Number of allocations applied so far.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Announce this load to `allocator`, carrying the current allocation.
    pub fn join(&mut self, allocator: NodeId, sched: &mut Scheduler<Self>) {
        info!(%allocator, "joining");
        let envelope = Envelope::new(MessageType::Join, self.id.clone(), allocator.clone())
            .with_payload(self.current.clone());
        self.link.send(envelope, &allocator);
        self.allocator = Some(allocator);
        if let Some(every) = self.config.report_interval {
            sched.schedule(every, |load: &mut Self, sched: &mut Scheduler<Self>| load.report_tick(sched));
        }
    }

    pub fn leave(&mut self) {
        let Some(allocator) = self.allocator.take() else {
            debug!("leave: not joined");
            return;
        };
        info!(%allocator, "leaving");
        self.joined = false;
        self.link
            .send(Envelope::new(MessageType::Leave, self.id.clone(), allocator.clone()), &allocator);
    }

    /// Send the current allocation to the allocator as a status report.
    pub fn report_allocation(&self) {
        let Some(allocator) = self.allocator.as_ref() else {
            return;
        };
        let envelope = Envelope::new(MessageType::CurrAllocation, self.id.clone(), allocator.clone())
            .with_payload(self.current.clone());
        self.link.send(envelope, allocator);
    }

    fn report_tick(&mut self, sched: &mut Scheduler<Self>) {
        let Some(every) = self.config.report_interval else {
            return;
        };
        if self.allocator.is_none() {
            return;
        }
        self.report_allocation();
        sched.schedule(every, |load: &mut Self, sched: &mut Scheduler<Self>| load.report_tick(sched));
    }

    /// Make `allocation` current and hold it for its duration.
    pub fn apply_allocation(&mut self, allocation: Allocation, sched: &mut Scheduler<Self>) {
        info!(allocation = %allocation.allocation_id, value = allocation.value, "current load is {}", allocation.value);
        self.applied += 1;
        self.holding = true;
        if let Some(log) = self.records.as_mut() {
            let record = Record::now(
                self.id.clone(),
                vec![
                    allocation.value,
                    allocation.duration.as_secs_f64(),
                    sched.now().as_secs_f64(),
                ],
            );
            if let Err(e) = log.append(&record) {
                warn!(path = %log.path().display(), error = %e, "cannot write record");
            }
        }
        let id = allocation.allocation_id.clone();
        let hold = allocation.duration;
        self.current = allocation;
        sched.schedule(hold, move |load: &mut Self, _: &mut Scheduler<Self>| load.hold_elapsed(&id));
    }

    fn hold_elapsed(&mut self, id: &AllocationId) {
        if self.current.allocation_id == *id {
            debug!(allocation = %id, "allocation period elapsed");
            self.holding = false;
        } else {
            debug!(allocation = %id, "allocation period elapsed after being superseded");
        }
    }

    /// Where replies to `src` go. A wildcard source (an allocator bound to
    /// every interface) is not routable, so the joined allocator is used.
    fn reply_to(&self, src: NodeId) -> NodeId {
        match self.allocator.as_ref() {
            Some(allocator) if src.has_unspecified_host() => allocator.clone(),
            _ => src,
        }
    }

    fn send_ack(&self, allocation: Allocation, dst: &NodeId) {
        debug!(allocation = %allocation.allocation_id, %dst, "sending allocation_ack");
        let envelope = Envelope::new(MessageType::AllocationAck, self.id.clone(), dst.clone())
            .with_payload(allocation);
        self.link.send(envelope, dst);
    }

    /// Stop the timeline and the transport.
    pub fn stop(&mut self, sched: &mut Scheduler<Self>) {
        sched.stop();
        self.link.stop();
    }
}

impl<L: Link> Agent for Load<L> {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn on_envelope(&mut self, envelope: Envelope, sched: &mut Scheduler<Self>) {
        debug!(%envelope, "handling");
        let Envelope {
            kind, src, payload, ..
        } = envelope;
        match kind {
            MessageType::JoinAck => {
                info!(allocator = %src, "joined");
                self.joined = true;
            }
            MessageType::Allocation => {
                let Payload::Allocation(allocation) = payload else {
                    warn!(from = %src, "allocation without payload; ignored");
                    return;
                };
                let ack = allocation.clone();
                let dst = self.reply_to(src);
                sched.schedule(Duration::ZERO, move |load: &mut Self, _: &mut Scheduler<Self>| {
                    load.send_ack(ack, &dst)
                });
                sched.schedule(self.config.apply_delay, move |load: &mut Self, sched: &mut Scheduler<Self>| {
                    load.apply_allocation(allocation, sched)
                });
            }
            MessageType::Stop => {
                info!(from = %src, "stop received");
                let dst = self.reply_to(src);
                self.link
                    .send(Envelope::new(MessageType::StopAck, self.id.clone(), dst.clone()), &dst);
                self.stop(sched);
            }
            MessageType::Join
            | MessageType::AllocationAck
            | MessageType::Leave
            | MessageType::CurrAllocation
            | MessageType::StopAck => {
                warn!(%kind, from = %src, "unexpected message for load; ignored");
            }
        }
    }

    fn shutdown(&mut self) {
        self.link.stop();
    }
}
