//! A lossy, rate-limited side band.
//!
//! Models a channel made of a shared payload slot plus a trigger that only
//! fires once per scheduler turn: a signal raised while the previous one is
//! still pending is dropped, and a store that overwrites a payload the peer
//! has not read yet loses that payload. The queued adapter's ack gate keeps
//! both counters at zero.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bridge::transport::SideBand;
use bridge::{Bridge, SchedulerRef, WeakBridge};
use tracing::{debug, warn};

/// Counters describing what the slot lost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    /// Signals that fired and handed the payload to the peer.
    pub delivered: usize,
    /// Signals dropped because the previous one had not fired yet.
    pub dropped_signals: usize,
    /// Payloads overwritten before the peer read them.
    pub lost_payloads: usize,
}

/// One-slot side band between a throttled sender and its peer.
///
/// Clones share the same slot.
#[derive(Clone)]
pub struct SideBandSlot {
    inner: Rc<SlotInner>,
}

struct SlotInner {
    scheduler: SchedulerRef,
    peer: RefCell<Option<WeakBridge>>,
    payload: RefCell<Option<String>>,
    unread: Cell<bool>,
    signal_pending: Cell<bool>,
    stats: Cell<SlotStats>,
}

impl SideBandSlot {
    /// Creates an empty, unconnected slot.
    pub fn new(scheduler: SchedulerRef) -> Self {
        Self {
            inner: Rc::new(SlotInner {
                scheduler,
                peer: RefCell::new(None),
                payload: RefCell::new(None),
                unread: Cell::new(false),
                signal_pending: Cell::new(false),
                stats: Cell::new(SlotStats::default()),
            }),
        }
    }

    /// Routes signalled payloads to `peer`.
    pub fn connect(&self, peer: &Bridge) {
        *self.inner.peer.borrow_mut() = Some(peer.downgrade());
    }

    /// What the slot delivered and lost so far.
    pub fn stats(&self) -> SlotStats {
        self.inner.stats.get()
    }

    /// The payload currently in the slot.
    pub fn payload(&self) -> Option<String> {
        self.inner.payload.borrow().clone()
    }
}

impl SlotInner {
    fn update(&self, f: impl FnOnce(&mut SlotStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    fn fire(&self) {
        self.signal_pending.set(false);
        let payload = self.payload.borrow().clone();
        let peer = self.peer.borrow().as_ref().and_then(WeakBridge::upgrade);
        match (payload, peer) {
            (Some(payload), Some(peer)) => {
                self.unread.set(false);
                self.update(|s| s.delivered += 1);
                peer.receive_string(&payload);
            }
            (None, _) => debug!("Side band signalled with an empty slot"),
            (_, None) => warn!("Side band peer is gone; payload not delivered"),
        }
    }
}

impl SideBand for SideBandSlot {
    fn store(&self, payload: String) {
        if self.inner.unread.replace(true) {
            warn!("Overwriting an unread side band payload");
            self.inner.update(|s| s.lost_payloads += 1);
        }
        *self.inner.payload.borrow_mut() = Some(payload);
    }

    fn signal(&self) {
        if self.inner.signal_pending.replace(true) {
            warn!("Side band signal dropped; previous signal still pending");
            self.inner.update(|s| s.dropped_signals += 1);
            return;
        }
        let inner = self.inner.clone();
        self.inner.scheduler.defer(Box::new(move || inner.fire()));
    }

    fn clear_outbound(&self) {
        self.inner.payload.borrow_mut().take();
        self.inner.unread.set(false);
    }
}

impl std::fmt::Debug for SideBandSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideBandSlot")
            .field("occupied", &self.inner.payload.borrow().is_some())
            .field("stats", &self.inner.stats.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bridge::EventLoop;

    use super::*;

    #[test]
    fn test_signals_in_same_turn_are_dropped() {
        let event_loop = EventLoop::new();
        let slot = SideBandSlot::new(event_loop.clone());
        slot.store("a".to_string());
        slot.signal();
        slot.signal();
        assert_eq!(slot.stats().dropped_signals, 1);

        event_loop.run_until_idle();
        slot.signal();
        assert_eq!(slot.stats().dropped_signals, 1);
    }

    #[test]
    fn test_overwriting_unread_payload_is_counted() {
        let event_loop = EventLoop::new();
        let slot = SideBandSlot::new(event_loop);
        slot.store("a".to_string());
        slot.store("b".to_string());
        assert_eq!(slot.stats().lost_payloads, 1);
        assert_eq!(slot.payload().as_deref(), Some("b"));

        slot.clear_outbound();
        slot.store("c".to_string());
        assert_eq!(slot.stats().lost_payloads, 1);
    }
}
