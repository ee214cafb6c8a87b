//! Request/response correlation.
//!
//! Turns one-way string delivery into call/return semantics: every message
//! whose reply must be matched gets a [`MessageId`] from an [`IdGenerator`],
//! and its [`ResponseHandler`] waits in the [`Correlation`] registry until the
//! remote side answers with that id.
//!
//! ```text
//!   send:    next_id() → register_pending(id, handler) → deliver
//!   receive: resolve_pending(id, response) → handler(response)   (exactly once)
//! ```

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use tracing::{debug, error, warn};

use crate::{BridgeError, MessageId, Response};

/// Callback waiting for the response to one message.
pub type ResponseHandler = Box<dyn FnOnce(Response) -> Result<(), BridgeError>>;

/// Monotonic per-instance message id counter, starting at 0.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: Cell<u64>,
}

impl IdGenerator {
    /// Creates a generator whose first id is 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current id and advances the counter.
    pub fn next_id(&self) -> MessageId {
        let id = self.next.get();
        self.next.set(id + 1);
        MessageId::new(id)
    }
}

/// Registry of handlers waiting for responses, keyed by message id.
#[derive(Default)]
pub struct Correlation {
    ids: IdGenerator,
    pending: RefCell<HashMap<MessageId, ResponseHandler>>,
}

impl std::fmt::Debug for Correlation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlation")
            .field("ids", &self.ids)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Correlation {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next message id.
    pub fn next_id(&self) -> MessageId {
        self.ids.next_id()
    }

    /// Stores `handler` until a response for `id` arrives.
    ///
    /// Ids come from [`Correlation::next_id`] and are never reused, so an
    /// existing entry is only replaced if the caller reuses an id.
    pub fn register_pending(&self, id: MessageId, handler: ResponseHandler) {
        if self.pending.borrow_mut().insert(id, handler).is_some() {
            warn!(id = %id, "Replaced pending response handler");
        }
    }

    /// Removes and invokes the handler for `id`.
    ///
    /// Unknown ids are logged and ignored. A failing handler is logged and
    /// does not propagate.
    pub fn resolve_pending(&self, id: MessageId, response: Response) {
        // The handler may send further messages and register new ids.
        let handler = self.pending.borrow_mut().remove(&id);
        let Some(handler) = handler else {
            warn!(id = %id, "Received response for unknown message id");
            return;
        };
        debug!(id = %id, success = response.success, "Resolving pending message");
        if let Err(e) = handler(response) {
            error!(id = %id, error = %e, "Response handler failed");
        }
    }

    /// Whether a handler is waiting for `id`.
    pub fn is_pending(&self, id: MessageId) -> bool {
        self.pending.borrow().contains_key(&id)
    }

    /// Number of handlers still waiting.
    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }
}
