//! In-memory link for protocol tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::identity::NodeId;
use crate::protocol::{Envelope, MessageType};
use crate::transport::Link;

/// Records every send. Clones share state, so a test keeps one clone while
/// the agent owns another.
#[derive(Clone, Default)]
pub(crate) struct MemoryLink {
    sent: Arc<Mutex<Vec<(Envelope, NodeId)>>>,
    stopped: Arc<AtomicBool>,
}

impl MemoryLink {
    /// Drain everything sent so far.
    pub(crate) fn take(&self) -> Vec<(Envelope, NodeId)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub(crate) fn take_kinds(&self) -> Vec<MessageType> {
        self.take().into_iter().map(|(e, _)| e.kind).collect()
    }
}

impl Link for MemoryLink {
    fn send(&self, envelope: Envelope, remote: &NodeId) {
        if self.is_stopped() {
            return;
        }
        self.sent.lock().unwrap().push((envelope, remote.clone()));
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
