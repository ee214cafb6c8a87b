//! Unthrottled adapter: encode and deliver immediately.

use std::rc::Rc;

use tracing::{debug, trace};

use super::{failure_response, Delivery, MessageSender, Transport};
use crate::codec::Codec;
use crate::correlation::{Correlation, ResponseHandler};
use crate::promise::SchedulerRef;
use crate::{BridgeError, Message, MessageId, Response};

/// Delivers each message as soon as it is sent.
///
/// Only messages with a response handler get an id; nothing is queued.
#[derive(Clone)]
pub struct DirectTransport {
    inner: Rc<DirectInner>,
}

struct DirectInner {
    delivery: Box<dyn Delivery>,
    codec: Rc<dyn Codec>,
    correlation: Correlation,
    scheduler: SchedulerRef,
}

impl DirectTransport {
    /// Creates an adapter over `delivery`.
    pub fn new(delivery: Box<dyn Delivery>, codec: Rc<dyn Codec>, scheduler: SchedulerRef) -> Self {
        Self {
            inner: Rc::new(DirectInner {
                delivery,
                codec,
                correlation: Correlation::new(),
                scheduler,
            }),
        }
    }
}

impl DirectInner {
    fn send(&self, mut message: Message, handler: Option<ResponseHandler>) -> Result<(), BridgeError> {
        if let Some(handler) = handler {
            let id = self.correlation.next_id();
            message.id = Some(id);
            self.correlation.register_pending(id, handler);
        }

        let payload = match self.codec.encode(&message.to_value()) {
            Ok(payload) => payload,
            Err(e) => {
                let error = BridgeError::from(e);
                self.fail_pending(message.id, &error);
                return Err(error);
            }
        };
        trace!(name = %message.name, id = ?message.id, "Delivering message");
        if let Err(error) = self.delivery.deliver(payload) {
            self.fail_pending(message.id, &error);
            return Err(error);
        }
        Ok(())
    }

    fn fail_pending(&self, id: Option<MessageId>, error: &BridgeError) {
        if let Some(id) = id.filter(|id| self.correlation.is_pending(*id)) {
            self.correlation.resolve_pending(id, failure_response(error));
        }
    }
}

impl Transport for DirectTransport {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn send(&self, message: Message, handler: Option<ResponseHandler>) -> Result<(), BridgeError> {
        self.inner.send(message, handler)
    }

    fn receive(&self, id: MessageId, response: Response) {
        self.inner.correlation.resolve_pending(id, response);
    }

    fn acknowledge(&self, id: Option<MessageId>) {
        debug!(id = ?id, "Ignoring acknowledgement on unthrottled transport");
    }

    fn scheduler(&self) -> SchedulerRef {
        self.inner.scheduler.clone()
    }

    fn sender(&self) -> MessageSender {
        let inner = self.inner.clone();
        Rc::new(move |message| inner.send(message, None))
    }

    fn pending_responses(&self) -> usize {
        self.inner.correlation.pending_count()
    }
}
