//! Immediate, unthrottled delivery.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bridge::transport::Delivery;
use bridge::{Bridge, BridgeError, SchedulerRef, WeakBridge};
use tracing::{trace, warn};

/// Hands every payload to the peer bridge on the next scheduler turn.
///
/// Clones share the same mailbox.
#[derive(Clone)]
pub struct Mailbox {
    inner: Rc<MailboxInner>,
}

struct MailboxInner {
    scheduler: SchedulerRef,
    peer: RefCell<Option<WeakBridge>>,
    delivered: Cell<usize>,
}

impl Mailbox {
    /// Creates an unconnected mailbox.
    pub fn new(scheduler: SchedulerRef) -> Self {
        Self {
            inner: Rc::new(MailboxInner {
                scheduler,
                peer: RefCell::new(None),
                delivered: Cell::new(0),
            }),
        }
    }

    /// Routes future payloads to `peer`.
    pub fn connect(&self, peer: &Bridge) {
        *self.inner.peer.borrow_mut() = Some(peer.downgrade());
    }

    /// Number of payloads handed to the peer so far.
    pub fn delivered(&self) -> usize {
        self.inner.delivered.get()
    }
}

impl Delivery for Mailbox {
    fn deliver(&self, payload: String) -> Result<(), BridgeError> {
        let Some(peer) = self.inner.peer.borrow().clone() else {
            warn!("Mailbox is not connected; dropping payload");
            return Ok(());
        };
        let inner = self.inner.clone();
        self.inner.scheduler.defer(Box::new(move || match peer.upgrade() {
            Some(bridge) => {
                inner.delivered.set(inner.delivered.get() + 1);
                trace!(bytes = payload.len(), "Mailbox delivering payload");
                bridge.receive_string(&payload);
            }
            None => warn!("Peer bridge dropped; discarding payload"),
        }));
        Ok(())
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("connected", &self.inner.peer.borrow().is_some())
            .field("delivered", &self.inner.delivered.get())
            .finish()
    }
}
