//! Agent timeline: delayed actions and correlated, cancellable timeouts on a
//! single-threaded clock kept in step with wall time.
//!
//! All protocol state is mutated only by actions running here. Other threads
//! reach the timeline through a [`Mailbox`] (zero-delay posts) or a
//! [`StopHandle`]; nothing else crosses the boundary.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::protocol::EventId;

/// A unit of work on the timeline.
pub type Action<A> = Box<dyn FnOnce(&mut A, &mut Scheduler<A>) + Send + 'static>;

/// How long `drive` sleeps when nothing is scheduled. Mailbox posts and stop
/// requests wake it earlier.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Simulated time since the timeline started. Never rewinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimTime(Duration);

impl SimTime {
    pub const ZERO: SimTime = SimTime(Duration::ZERO);

    pub fn from_duration(d: Duration) -> Self {
        SimTime(d)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        SimTime(Duration::from_secs_f64(secs))
    }

    pub fn as_duration(self) -> Duration {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0.as_secs_f64()
    }

    /// The instant `delay` after `self`.
    pub fn plus(self, delay: Duration) -> SimTime {
        SimTime(self.0.saturating_add(delay))
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T={:.3}s", self.0.as_secs_f64())
    }
}

/// Handle to a scheduled action; pass to [`Scheduler::interrupt`] to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    Stopped,
}

/// At the same instant every ordinary action (acknowledgment handling
/// included) runs before any timeout expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Lane {
    Action,
    Expiry,
}

struct Entry<A> {
    at: SimTime,
    lane: Lane,
    handle: ActionHandle,
    action: Action<A>,
}

impl<A> Entry<A> {
    fn key(&self) -> (SimTime, Lane, u64) {
        (self.at, self.lane, self.handle.0)
    }
}

impl<A> PartialEq for Entry<A> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<A> Eq for Entry<A> {}

impl<A> PartialOrd for Entry<A> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<A> Ord for Entry<A> {
    // Reversed: BinaryHeap is a max-heap, the timeline wants the earliest key.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

struct StopSignal {
    requested: AtomicBool,
    notify: Notify,
}

/// Thread-safe request to stop a timeline. Cloneable; usable from signal
/// tasks and other threads.
#[derive(Clone)]
pub struct StopHandle(Arc<StopSignal>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.requested.store(true, AtomicOrdering::SeqCst);
        self.0.notify.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.0.requested.load(AtomicOrdering::SeqCst)
    }
}

/// Posts zero-delay actions onto a timeline from any thread.
pub struct Mailbox<A> {
    tx: mpsc::UnboundedSender<Action<A>>,
}

impl<A> Clone for Mailbox<A> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<A: 'static> Mailbox<A> {
    /// Queue `action` to run at the timeline's current time. Returns false if
    /// the timeline has been dropped.
    pub fn post<F>(&self, action: F) -> bool
    where
        F: FnOnce(&mut A, &mut Scheduler<A>) + Send + 'static,
    {
        self.tx.send(Box::new(action)).is_ok()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to build timeline runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// The per-agent timeline. `A` is the agent state every action receives.
pub struct Scheduler<A> {
    now: SimTime,
    queue: BinaryHeap<Entry<A>>,
    next_handle: u64,
    /// Scheduled and not yet run or interrupted.
    pending: HashSet<ActionHandle>,
    timeouts: HashMap<EventId, ActionHandle>,
    state: SchedulerState,
    inbox: mpsc::UnboundedReceiver<Action<A>>,
    outbox: mpsc::UnboundedSender<Action<A>>,
    stop_signal: Arc<StopSignal>,
}

impl<A: 'static> Scheduler<A> {
    pub fn new() -> Self {
        let (outbox, inbox) = mpsc::unbounded_channel();
        Self {
            now: SimTime::ZERO,
            queue: BinaryHeap::new(),
            next_handle: 0,
            pending: HashSet::new(),
            timeouts: HashMap::new(),
            state: SchedulerState::Running,
            inbox,
            outbox,
            stop_signal: Arc::new(StopSignal {
                requested: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SchedulerState::Running
    }

    /// Number of actions (timeouts included) still waiting to run.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn mailbox(&self) -> Mailbox<A> {
        Mailbox {
            tx: self.outbox.clone(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop_signal))
    }

    /// Run `action` once the timeline reaches now + `delay`.
    pub fn schedule<F>(&mut self, delay: Duration, action: F) -> ActionHandle
    where
        F: FnOnce(&mut A, &mut Scheduler<A>) + Send + 'static,
    {
        let at = self.now.plus(delay);
        self.push(at, Lane::Action, Box::new(action))
    }

    /// Cancel a pending action. Returns false if it already ran or was interrupted.
    pub fn interrupt(&mut self, handle: ActionHandle) -> bool {
        if !self.pending.remove(&handle) {
            return false;
        }
        self.timeouts.retain(|_, h| *h != handle);
        true
    }

    /// Register a timer under `event_id`. Any live timer for the same id is
    /// interrupted first, so at most one exists per id.
    pub fn create_timeout<F>(&mut self, event_id: EventId, delay: Duration, on_expire: F) -> ActionHandle
    where
        F: FnOnce(&mut A, &mut Scheduler<A>, EventId) + Send + 'static,
    {
        if self.cancel_timeout(&event_id) {
            debug!(event = %event_id, "replacing live timeout");
        }
        let at = self.now.plus(delay);
        let key = event_id.clone();
        let handle = self.push(
            at,
            Lane::Expiry,
            Box::new(move |agent: &mut A, sched: &mut Scheduler<A>| {
                sched.timeouts.remove(&key);
                debug!(event = %key, at = %sched.now, "timeout expired");
                on_expire(agent, sched, key);
            }),
        );
        self.timeouts.insert(event_id, handle);
        handle
    }

    /// Interrupt the live timer for `event_id`. No-op (false) when absent.
    /// An interrupted timer never runs its expiry.
    pub fn cancel_timeout(&mut self, event_id: &EventId) -> bool {
        match self.timeouts.remove(event_id) {
            Some(handle) => self.pending.remove(&handle),
            None => false,
        }
    }

    pub fn has_timeout(&self, event_id: &EventId) -> bool {
        self.timeouts.contains_key(event_id)
    }

    pub fn live_timeouts(&self) -> usize {
        self.timeouts.len()
    }

    /// `Running -> Stopped`, once. Interrupts every live timeout without
    /// running its expiry and ends `drive`/`run`.
    pub fn stop(&mut self) {
        if self.state == SchedulerState::Stopped {
            return;
        }
        self.state = SchedulerState::Stopped;
        let interrupted = self.timeouts.len();
        for (_, handle) in self.timeouts.drain() {
            self.pending.remove(&handle);
        }
        info!(at = %self.now, interrupted, "scheduler stopped");
    }

    /// Execute every action due at or before `until`, in (time, lane,
    /// submission) order, then leave the clock at `until`. Returns how many
    /// actions ran.
    pub fn run_until(&mut self, agent: &mut A, until: SimTime) -> usize {
        let mut executed = 0;
        loop {
            if self.stop_signal.requested.load(AtomicOrdering::SeqCst) {
                self.stop();
            }
            if !self.is_running() {
                break;
            }
            self.drain_inbox(self.now);
            match self.next_due() {
                Some(at) if at <= until => {}
                _ => break,
            }
            let Some(entry) = self.queue.pop() else {
                break;
            };
            self.pending.remove(&entry.handle);
            if entry.at > self.now {
                self.now = entry.at;
            }
            (entry.action)(agent, self);
            executed += 1;
        }
        if self.is_running() && until > self.now {
            self.now = until;
        }
        executed
    }

    /// `run_until(now + delta)`.
    pub fn advance(&mut self, agent: &mut A, delta: Duration) -> usize {
        let until = self.now.plus(delta);
        self.run_until(agent, until)
    }

    /// Real-time loop: keeps the timeline in step with the tokio clock until
    /// the scheduler stops.
    pub async fn drive(&mut self, agent: &mut A) {
        let signal = Arc::clone(&self.stop_signal);
        let started = Instant::now();
        let epoch = started
            .checked_sub(self.now.as_duration())
            .unwrap_or(started);
        debug!(at = %self.now, "timeline running");
        while self.is_running() {
            self.run_until(agent, SimTime(epoch.elapsed()));
            if !self.is_running() {
                break;
            }
            // Far-future entries (long holds, saturated times) just re-check after IDLE_WAIT.
            let idle = Instant::now() + IDLE_WAIT;
            let deadline = self
                .next_due()
                .and_then(|at| epoch.checked_add(at.as_duration()))
                .map_or(idle, |due| due.min(idle));
            let posted = tokio::select! {
                posted = self.inbox.recv() => posted,
                _ = tokio::time::sleep_until(deadline) => None,
                _ = signal.notify.notified() => None,
            };
            if let Some(action) = posted {
                // Stamp with arrival time so timers already overdue still fire first.
                let arrived = SimTime(epoch.elapsed()).max(self.now);
                self.push(arrived, Lane::Action, action);
            }
        }
    }

    /// Block the calling thread on `drive` until stopped. An interrupt
    /// (Ctrl-C / SIGTERM) stops the scheduler and returns `Ok` instead of
    /// propagating.
    pub fn run(&mut self, agent: &mut A) -> Result<(), SchedulerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let interrupted = runtime.block_on(async {
            tokio::select! {
                _ = self.drive(agent) => false,
                _ = shutdown_signal() => true,
            }
        });
        if interrupted {
            info!(at = %self.now, "interrupt received");
        }
        self.stop();
        Ok(())
    }

    fn push(&mut self, at: SimTime, lane: Lane, action: Action<A>) -> ActionHandle {
        let handle = ActionHandle(self.next_handle);
        self.next_handle += 1;
        self.pending.insert(handle);
        self.queue.push(Entry {
            at,
            lane,
            handle,
            action,
        });
        handle
    }

    fn drain_inbox(&mut self, at: SimTime) {
        while let Ok(action) = self.inbox.try_recv() {
            self.push(at, Lane::Action, action);
        }
    }

    /// Earliest live entry, discarding interrupted ones from the head.
    fn next_due(&mut self) -> Option<SimTime> {
        while let Some(head) = self.queue.peek() {
            if self.pending.contains(&head.handle) {
                return Some(head.at);
            }
            self.queue.pop();
        }
        None
    }
}

impl<A: 'static> Default for Scheduler<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
