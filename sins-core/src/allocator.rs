//! Allocator protocol: the central coordinator. Keeps the node table, issues
//! allocations and runs the coordinated stop handshake.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::identity::NodeId;
use crate::protocol::{Allocation, Envelope, EventId, MessageType, Payload};
use crate::retry::RetryPolicy;
use crate::scheduler::{Scheduler, SimTime};
use crate::transport::Link;

pub const DEFAULT_ALLOC_ACK_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_STOP_ACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct AllocatorConfig {
    pub alloc_ack_timeout: Duration,
    pub stop_ack_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            alloc_ack_timeout: DEFAULT_ALLOC_ACK_TIMEOUT,
            stop_ack_timeout: DEFAULT_STOP_ACK_TIMEOUT,
            retry: RetryPolicy::none(),
        }
    }
}

/// Outcome of [`Allocator::add_node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeUpdate {
    Added,
    /// Known node, different payload; the observer was notified.
    Updated,
    Unchanged,
}

/// An acknowledgment that never arrived, after every allowed resend.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutFailure {
    pub event: EventId,
    pub at: SimTime,
    pub attempts: u32,
}

/// Called with `(new payload, node)` when a known node's stored payload changes.
pub type AllocationObserver = Box<dyn FnMut(&Payload, &NodeId) + Send>;

pub struct Allocator<L> {
    id: NodeId,
    link: L,
    nodes: BTreeMap<NodeId, Payload>,
    config: AllocatorConfig,
    allocation_updated: Option<AllocationObserver>,
    stopping: bool,
    failures: Vec<TimeoutFailure>,
}

impl<L: Link> Allocator<L> {
    pub fn new(id: NodeId, link: L, config: AllocatorConfig) -> Self {
        Self {
            id,
            link,
            nodes: BTreeMap::new(),
            config,
            allocation_updated: None,
            stopping: false,
            failures: Vec::new(),
        }
    }

    pub fn set_allocation_updated<F>(&mut self, observer: F)
    where
        F: FnMut(&Payload, &NodeId) + Send + 'static,
    {
        self.allocation_updated = Some(Box::new(observer));
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn node(&self, node: &NodeId) -> Option<&Payload> {
        self.nodes.get(node)
    }

    /// Known nodes in address order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn failures(&self) -> &[TimeoutFailure] {
        &self.failures
    }

    /// Upsert. A changed payload notifies the observer before the stored value
    /// is overwritten; an identical one is a no-op.
    pub fn add_node(&mut self, node: NodeId, payload: Payload) -> NodeUpdate {
        match self.nodes.entry(node) {
            Entry::Vacant(slot) => {
                info!(node = %slot.key(), "adding node");
                slot.insert(payload);
                NodeUpdate::Added
            }
            Entry::Occupied(slot) if *slot.get() == payload => {
                debug!(node = %slot.key(), "node already added");
                NodeUpdate::Unchanged
            }
            Entry::Occupied(mut slot) => {
                info!(node = %slot.key(), from = ?slot.get(), to = ?payload, "node already added, allocation updated");
                if let Some(observer) = self.allocation_updated.as_mut() {
                    observer(&payload, slot.key());
                }
                slot.insert(payload);
                NodeUpdate::Updated
            }
        }
    }

    /// Remove `node`; `None` if it was not known. While stopping, the last
    /// removal completes the shutdown.
    pub fn remove_node(&mut self, node: &NodeId, sched: &mut Scheduler<Self>) -> Option<Payload> {
        let removed = self.nodes.remove(node);
        match removed {
            Some(_) => info!(%node, remaining = self.nodes.len(), "removing node"),
            None => debug!(%node, "remove: node not known"),
        }
        if removed.is_some() && self.stopping && self.nodes.is_empty() {
            sched.schedule(Duration::ZERO, |allocator: &mut Self, sched: &mut Scheduler<Self>| {
                allocator.finish_shutdown(sched)
            });
        }
        removed
    }

    /// Send `allocation` to `node` and start its ack timer.
    pub fn send_allocation(&mut self, node: &NodeId, allocation: Allocation, sched: &mut Scheduler<Self>) {
        self.send_allocation_attempt(node.clone(), allocation, 0, sched);
    }

    fn send_allocation_attempt(&mut self, node: NodeId, allocation: Allocation, retries: u32, sched: &mut Scheduler<Self>) {
        info!(%node, allocation = %allocation.allocation_id, value = allocation.value, retries, "sending allocation");
        let event_id = EventId::allocation(&allocation.allocation_id, &node);
        let envelope = Envelope::new(MessageType::Allocation, self.id.clone(), node.clone())
            .with_payload(allocation.clone());
        sched.create_timeout(event_id, self.config.alloc_ack_timeout, move |allocator: &mut Self, sched, event_id| {
            allocator.on_allocation_timeout(event_id, allocation, retries, sched)
        });
        self.link.send(envelope, &node);
    }

    fn on_allocation_timeout(&mut self, event_id: EventId, allocation: Allocation, retries: u32, sched: &mut Scheduler<Self>) {
        if self.config.retry.should_retry(retries) {
            let delay = self.config.retry.delay(retries);
            warn!(event = %event_id, retries, retry_in = ?delay, "no allocation_ack; resending");
            // Backoff stays live under the same event, so an ack in the gap cancels the resend.
            sched.create_timeout(event_id, delay, move |allocator: &mut Self, sched, event_id| {
                let node = event_id.node().clone();
                allocator.send_allocation_attempt(node, allocation, retries + 1, sched)
            });
        } else {
            warn!(event = %event_id, attempts = retries + 1, "no allocation_ack");
            self.record_failure(event_id, retries + 1, sched.now());
        }
    }

    pub fn send_join_ack(&self, node: &NodeId) {
        debug!(%node, "sending join_ack");
        self.link
            .send(Envelope::new(MessageType::JoinAck, self.id.clone(), node.clone()), node);
    }

    /// Broadcast `stop` to every known node. Completes (stopping the timeline
    /// and the transport) once every node has acked or timed out. Repeated
    /// calls while stopping are no-ops.
    pub fn stop_network(&mut self, sched: &mut Scheduler<Self>) {
        if self.stopping {
            debug!("stop already in progress");
            return;
        }
        self.stopping = true;
        if self.nodes.is_empty() {
            info!("stopping network: no nodes");
            self.finish_shutdown(sched);
            return;
        }
        info!(nodes = self.nodes.len(), "stopping network");
        for node in self.node_ids() {
            self.send_stop(node, 0, sched);
        }
    }

    fn send_stop(&mut self, node: NodeId, retries: u32, sched: &mut Scheduler<Self>) {
        debug!(%node, retries, "sending stop");
        let envelope = Envelope::new(MessageType::Stop, self.id.clone(), node.clone());
        sched.create_timeout(EventId::stop(&node), self.config.stop_ack_timeout, move |allocator: &mut Self, sched, event_id| {
            allocator.on_stop_timeout(event_id, retries, sched)
        });
        self.link.send(envelope, &node);
    }

    fn on_stop_timeout(&mut self, event_id: EventId, retries: u32, sched: &mut Scheduler<Self>) {
        let node = event_id.node().clone();
        if !self.nodes.contains_key(&node) {
            return;
        }
        if self.config.retry.should_retry(retries) {
            let delay = self.config.retry.delay(retries);
            warn!(event = %event_id, retries, retry_in = ?delay, "no stop_ack; resending");
            sched.create_timeout(event_id, delay, move |allocator: &mut Self, sched, _| {
                if allocator.nodes.contains_key(&node) {
                    allocator.send_stop(node, retries + 1, sched);
                }
            });
        } else {
            warn!(event = %event_id, attempts = retries + 1, "no stop_ack; dropping node");
            self.record_failure(event_id, retries + 1, sched.now());
            self.remove_node(&node, sched);
        }
    }

    fn record_failure(&mut self, event: EventId, attempts: u32, at: SimTime) {
        self.failures.push(TimeoutFailure { event, at, attempts });
    }

    fn finish_shutdown(&mut self, sched: &mut Scheduler<Self>) {
        info!(failures = self.failures.len(), "network stopped");
        sched.stop();
        self.link.stop();
    }

    fn on_allocation_ack(&mut self, src: NodeId, payload: Payload, sched: &mut Scheduler<Self>) {
        let event_id = payload
            .allocation()
            .map(|a| EventId::allocation(&a.allocation_id, &src));
        self.add_node(src.clone(), payload);
        match event_id {
            Some(event_id) => {
                if !sched.cancel_timeout(&event_id) {
                    debug!(event = %event_id, "late or duplicate allocation_ack");
                }
            }
            None => warn!(node = %src, "allocation_ack without allocation"),
        }
    }
}

impl<L: Link> Agent for Allocator<L> {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn on_envelope(&mut self, envelope: Envelope, sched: &mut Scheduler<Self>) {
        debug!(%envelope, "handling");
        let Envelope {
            kind, src, payload, ..
        } = envelope;
        match kind {
            MessageType::Join => {
                self.add_node(src.clone(), payload);
                if self.stopping {
                    // Joined mid-shutdown: it gets a stop instead of a welcome.
                    self.send_stop(src, 0, sched);
                } else {
                    sched.schedule(Duration::ZERO, move |allocator: &mut Self, _: &mut Scheduler<Self>| {
                        allocator.send_join_ack(&src)
                    });
                }
            }
            MessageType::AllocationAck => self.on_allocation_ack(src, payload, sched),
            MessageType::Leave => {
                sched.schedule(Duration::ZERO, move |allocator: &mut Self, sched: &mut Scheduler<Self>| {
                    allocator.remove_node(&src, sched);
                });
            }
            MessageType::CurrAllocation => {
                self.add_node(src, payload);
            }
            MessageType::Stop => {
                info!(from = %src, "stop requested");
                sched.schedule(Duration::ZERO, |allocator: &mut Self, sched: &mut Scheduler<Self>| {
                    allocator.stop_network(sched)
                });
            }
            MessageType::StopAck => {
                if !sched.cancel_timeout(&EventId::stop(&src)) {
                    debug!(node = %src, "stop_ack without live timer");
                }
                self.remove_node(&src, sched);
            }
            MessageType::JoinAck | MessageType::Allocation => {
                warn!(%kind, from = %src, "unexpected message for allocator; ignored");
            }
        }
    }

    fn shutdown(&mut self) {
        self.link.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::scheduler::SchedulerState;
    use crate::testing::MemoryLink;

    type Sched = Scheduler<Allocator<MemoryLink>>;

    fn node(port: u16) -> NodeId {
        NodeId::new(format!("127.0.0.1:{}", port))
    }

    fn setup(config: AllocatorConfig) -> (Allocator<MemoryLink>, MemoryLink, Sched) {
        let link = MemoryLink::default();
        let allocator = Allocator::new(node(5555), link.clone(), config);
        (allocator, link, Scheduler::new())
    }

    fn from(kind: MessageType, src: &NodeId, payload: Payload) -> Envelope {
        Envelope::new(kind, src.clone(), node(5555)).with_payload(payload)
    }

    fn alloc(id: &str, value: f64) -> Allocation {
        Allocation::new(id, value, Duration::from_secs(5))
    }

    fn recording_observer(allocator: &mut Allocator<MemoryLink>) -> Arc<Mutex<Vec<(Payload, NodeId)>>> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        allocator.set_allocation_updated(move |payload, node| {
            sink.lock().unwrap().push((payload.clone(), node.clone()));
        });
        calls
    }

    #[test]
    fn identical_rejoin_is_idempotent() {
        let (mut a, link, mut s) = setup(AllocatorConfig::default());
        let calls = recording_observer(&mut a);
        let n = node(5001);
        let join = from(MessageType::Join, &n, Allocation::idle().into());
        a.on_envelope(join.clone(), &mut s);
        a.on_envelope(join, &mut s);
        s.run_until(&mut a, SimTime::ZERO);
        assert_eq!(a.node_count(), 1);
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(link.take_kinds(), [MessageType::JoinAck, MessageType::JoinAck]);
    }

    #[test]
    fn changed_rejoin_notifies_once_then_stores() {
        let (mut a, _link, mut s) = setup(AllocatorConfig::default());
        let calls = recording_observer(&mut a);
        let n = node(5001);
        a.on_envelope(from(MessageType::Join, &n, Allocation::idle().into()), &mut s);
        let fresh: Payload = alloc("a1", 3.0).into();
        a.on_envelope(from(MessageType::Join, &n, fresh.clone()), &mut s);
        assert_eq!(*calls.lock().unwrap(), [(fresh.clone(), n.clone())]);
        assert_eq!(a.node(&n), Some(&fresh));
        assert_eq!(a.node_count(), 1);
    }

    #[test]
    fn observer_sees_new_value_before_overwrite() {
        let (mut a, _link, _s) = setup(AllocatorConfig::default());
        let n = node(5001);
        assert_eq!(a.add_node(n.clone(), Allocation::idle().into()), NodeUpdate::Added);
        assert_eq!(a.add_node(n.clone(), Allocation::idle().into()), NodeUpdate::Unchanged);
        assert_eq!(a.add_node(n.clone(), alloc("a1", 1.0).into()), NodeUpdate::Updated);
    }

    #[test]
    fn removing_unknown_node_is_harmless() {
        let (mut a, _link, mut s) = setup(AllocatorConfig::default());
        assert_eq!(a.remove_node(&node(5009), &mut s), None);
    }

    #[test]
    fn leave_removes_the_node() {
        let (mut a, _link, mut s) = setup(AllocatorConfig::default());
        let n = node(5001);
        a.add_node(n.clone(), Payload::Empty);
        a.on_envelope(from(MessageType::Leave, &n, Payload::Empty), &mut s);
        assert_eq!(a.node_count(), 1);
        s.run_until(&mut a, SimTime::ZERO);
        assert_eq!(a.node_count(), 0);
    }

    #[test]
    fn curr_allocation_upserts_without_reply() {
        let (mut a, link, mut s) = setup(AllocatorConfig::default());
        let n = node(5001);
        a.on_envelope(from(MessageType::CurrAllocation, &n, alloc("a1", 2.0).into()), &mut s);
        s.run_until(&mut a, SimTime::ZERO);
        assert_eq!(a.node(&n), Some(&Payload::from(alloc("a1", 2.0))));
        assert!(link.take().is_empty());
    }

    #[test]
    fn allocation_ack_cancels_the_timer() {
        let (mut a, link, mut s) = setup(AllocatorConfig::default());
        let n = node(5001);
        let allocation = alloc("a1", 10.0);
        a.send_allocation(&n, allocation.clone(), &mut s);
        let sent = link.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, n);
        assert_eq!(sent[0].0.payload, Payload::from(allocation.clone()));

        let eid = EventId::allocation(&"a1".into(), &n);
        assert!(s.has_timeout(&eid));
        s.advance(&mut a, Duration::from_millis(500));
        a.on_envelope(from(MessageType::AllocationAck, &n, allocation.clone().into()), &mut s);
        assert!(!s.has_timeout(&eid));
        assert_eq!(a.node(&n), Some(&Payload::from(allocation)));

        s.advance(&mut a, Duration::from_secs(10));
        assert!(a.failures().is_empty());
    }

    #[test]
    fn missing_ack_is_recorded_once() {
        let (mut a, link, mut s) = setup(AllocatorConfig::default());
        let n = node(5001);
        a.send_allocation(&n, alloc("a1", 10.0), &mut s);
        s.advance(&mut a, Duration::from_secs(1));
        assert!(a.failures().is_empty());
        s.advance(&mut a, Duration::from_secs(1));
        let eid = EventId::allocation(&"a1".into(), &n);
        assert_eq!(
            a.failures(),
            [TimeoutFailure {
                event: eid.clone(),
                at: SimTime::from_duration(DEFAULT_ALLOC_ACK_TIMEOUT),
                attempts: 1,
            }]
        );
        assert!(!s.has_timeout(&eid));
        s.advance(&mut a, Duration::from_secs(10));
        assert_eq!(a.failures().len(), 1);
        assert_eq!(link.take_kinds(), [MessageType::Allocation]);
    }

    #[test]
    fn ack_at_the_deadline_beats_expiry() {
        let (mut a, _link, mut s) = setup(AllocatorConfig::default());
        let n = node(5001);
        let allocation = alloc("a1", 10.0);
        a.send_allocation(&n, allocation.clone(), &mut s);
        let ack = from(MessageType::AllocationAck, &n, allocation.into());
        s.schedule(DEFAULT_ALLOC_ACK_TIMEOUT, move |a: &mut Allocator<MemoryLink>, s: &mut Sched| {
            a.on_envelope(ack, s)
        });
        s.advance(&mut a, Duration::from_secs(10));
        assert!(a.failures().is_empty());
    }

    #[test]
    fn late_ack_still_updates_the_table() {
        let (mut a, _link, mut s) = setup(AllocatorConfig::default());
        let n = node(5001);
        let allocation = alloc("a1", 10.0);
        a.send_allocation(&n, allocation.clone(), &mut s);
        s.advance(&mut a, Duration::from_secs(3));
        a.on_envelope(from(MessageType::AllocationAck, &n, allocation.clone().into()), &mut s);
        assert_eq!(a.failures().len(), 1);
        assert_eq!(a.node(&n), Some(&Payload::from(allocation)));
    }

    #[test]
    fn retry_policy_resends_with_backoff() {
        let config = AllocatorConfig {
            retry: RetryPolicy::new(2, Duration::from_secs(1), Duration::ZERO),
            ..AllocatorConfig::default()
        };
        let (mut a, link, mut s) = setup(config);
        let n = node(5001);
        a.send_allocation(&n, alloc("a1", 10.0), &mut s);
        // Sends at t=0, t=2+1, t=5+2; final expiry at t=9.
        s.run_until(&mut a, SimTime::from_secs_f64(3.0));
        assert_eq!(link.take_kinds(), [MessageType::Allocation, MessageType::Allocation]);
        s.run_until(&mut a, SimTime::from_secs_f64(8.9));
        assert_eq!(link.take_kinds(), [MessageType::Allocation]);
        assert!(a.failures().is_empty());
        s.run_until(&mut a, SimTime::from_secs_f64(9.0));
        assert_eq!(a.failures().len(), 1);
        assert_eq!(a.failures()[0].attempts, 3);
    }

    #[test]
    fn ack_during_backoff_cancels_the_resend() {
        let config = AllocatorConfig {
            retry: RetryPolicy::new(1, Duration::from_secs(1), Duration::ZERO),
            ..AllocatorConfig::default()
        };
        let (mut a, link, mut s) = setup(config);
        let n = node(5001);
        let allocation = alloc("a1", 10.0);
        a.send_allocation(&n, allocation.clone(), &mut s);
        link.take();
        let eid = EventId::allocation(&"a1".into(), &n);

        // First ack window closed at t=2; resend due at t=3.
        s.run_until(&mut a, SimTime::from_secs_f64(2.5));
        assert!(link.take().is_empty());
        assert!(s.has_timeout(&eid));

        a.on_envelope(from(MessageType::AllocationAck, &n, allocation.clone().into()), &mut s);
        assert!(!s.has_timeout(&eid));
        s.run_until(&mut a, SimTime::from_secs_f64(10.0));
        assert!(link.take().is_empty());
        assert!(a.failures().is_empty());
        assert_eq!(s.live_timeouts(), 0);
        assert_eq!(a.node(&n), Some(&Payload::from(allocation)));
    }

    #[test]
    fn stop_ack_during_backoff_completes_the_shutdown() {
        let config = AllocatorConfig {
            retry: RetryPolicy::new(1, Duration::from_secs(1), Duration::ZERO),
            ..AllocatorConfig::default()
        };
        let (mut a, link, mut s) = setup(config);
        let n = node(5001);
        a.add_node(n.clone(), Payload::Empty);
        a.stop_network(&mut s);
        link.take();

        s.run_until(&mut a, SimTime::from_secs_f64(5.5));
        assert!(s.has_timeout(&EventId::stop(&n)));
        a.on_envelope(from(MessageType::StopAck, &n, Payload::Empty), &mut s);
        s.advance(&mut a, Duration::from_millis(10));
        assert_eq!(s.state(), SchedulerState::Stopped);
        assert!(a.failures().is_empty());
        assert!(link.take().is_empty());
    }

    #[test]
    fn stop_network_completes_when_the_last_node_acks() {
        let (mut a, link, mut s) = setup(AllocatorConfig::default());
        let nodes = [node(5001), node(5002), node(5003)];
        for n in &nodes {
            a.add_node(n.clone(), Payload::Empty);
        }
        a.stop_network(&mut s);
        assert!(a.is_stopping());
        let sent = link.take();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(e, _)| e.kind == MessageType::Stop));
        assert_eq!(s.live_timeouts(), 3);

        // Repeated stop while stopping: nothing new goes out.
        a.stop_network(&mut s);
        assert!(link.take().is_empty());

        for n in &nodes[..2] {
            a.on_envelope(from(MessageType::StopAck, n, Payload::Empty), &mut s);
        }
        s.advance(&mut a, Duration::from_millis(10));
        assert_eq!(s.state(), SchedulerState::Running);
        assert!(!a.link().is_stopped());

        a.on_envelope(from(MessageType::StopAck, &nodes[2], Payload::Empty), &mut s);
        s.advance(&mut a, Duration::from_millis(10));
        assert_eq!(a.node_count(), 0);
        assert_eq!(s.state(), SchedulerState::Stopped);
        assert!(a.link().is_stopped());
        assert!(a.failures().is_empty());
    }

    #[test]
    fn stop_network_with_no_nodes_stops_at_once() {
        let (mut a, link, mut s) = setup(AllocatorConfig::default());
        a.stop_network(&mut s);
        assert_eq!(s.state(), SchedulerState::Stopped);
        assert!(link.is_stopped());
    }

    #[test]
    fn silent_node_is_dropped_after_stop_timeout() {
        let (mut a, _link, mut s) = setup(AllocatorConfig::default());
        let (quick, silent) = (node(5001), node(5002));
        a.add_node(quick.clone(), Payload::Empty);
        a.add_node(silent.clone(), Payload::Empty);
        a.stop_network(&mut s);
        a.on_envelope(from(MessageType::StopAck, &quick, Payload::Empty), &mut s);
        s.advance(&mut a, Duration::from_secs(4));
        assert_eq!(s.state(), SchedulerState::Running);
        s.advance(&mut a, Duration::from_secs(1));
        assert_eq!(s.state(), SchedulerState::Stopped);
        assert_eq!(a.failures().len(), 1);
        assert_eq!(a.failures()[0].event, EventId::stop(&silent));
    }

    #[test]
    fn stop_leaves_allocation_timers_alone() {
        let (mut a, _link, mut s) = setup(AllocatorConfig::default());
        let n = node(5001);
        a.add_node(n.clone(), Payload::Empty);
        a.send_allocation(&n, alloc("a1", 1.0), &mut s);
        a.stop_network(&mut s);
        assert_eq!(s.live_timeouts(), 2);
        assert!(s.has_timeout(&EventId::allocation(&"a1".into(), &n)));
        assert!(s.has_timeout(&EventId::stop(&n)));
    }

    #[test]
    fn inbound_stop_triggers_stop_network() {
        let (mut a, link, mut s) = setup(AllocatorConfig::default());
        let n = node(5001);
        a.add_node(n.clone(), Payload::Empty);
        a.on_envelope(from(MessageType::Stop, &node(6000), Payload::Empty), &mut s);
        assert!(!a.is_stopping());
        s.run_until(&mut a, SimTime::ZERO);
        assert!(a.is_stopping());
        assert_eq!(link.take_kinds(), [MessageType::Stop]);
    }

    #[test]
    fn join_during_shutdown_gets_a_stop() {
        let (mut a, link, mut s) = setup(AllocatorConfig::default());
        a.add_node(node(5001), Payload::Empty);
        a.stop_network(&mut s);
        link.take();
        a.on_envelope(from(MessageType::Join, &node(5002), Payload::Empty), &mut s);
        s.run_until(&mut a, SimTime::ZERO);
        assert_eq!(link.take_kinds(), [MessageType::Stop]);
        assert_eq!(s.live_timeouts(), 2);
    }

    #[test]
    fn unexpected_types_are_ignored() {
        let (mut a, link, mut s) = setup(AllocatorConfig::default());
        let n = node(5001);
        a.on_envelope(from(MessageType::JoinAck, &n, Payload::Empty), &mut s);
        a.on_envelope(from(MessageType::Allocation, &n, alloc("a1", 1.0).into()), &mut s);
        s.run_until(&mut a, SimTime::ZERO);
        assert_eq!(a.node_count(), 0);
        assert!(link.take().is_empty());
    }
}
