//! Throttled adapter: one message in flight, gated by acknowledgements.
//!
//! ```text
//!            enqueue                  ack(id)
//!   Idle ─────────────▶ Sending(id) ─────────▶ Idle ──▶ dequeue next
//!                         │   ▲
//!                 submit  │   │ queue non-empty
//!                         ▼   │
//!              store + deferred signal
//! ```
//!
//! A message is written to the side band and the delivery signal fires on the
//! next scheduler turn, so the write is visible before the remote side looks.
//! The next message waits until the remote side acknowledges the current one:
//! signals raised before that may be dropped by the channel.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::{debug, error, warn};

use super::{failure_response, MessageSender, SideBand, Transport};
use crate::codec::Codec;
use crate::correlation::{Correlation, ResponseHandler};
use crate::promise::SchedulerRef;
use crate::{BridgeError, Message, MessageId, Response};

/// State of the send gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing in flight; the next enqueue submits immediately.
    Idle,
    /// The message with this id was submitted and awaits acknowledgement.
    Sending(MessageId),
}

/// Queues messages and submits them one at a time over a [`SideBand`].
#[derive(Clone)]
pub struct QueuedTransport {
    inner: Rc<QueuedInner>,
}

struct QueuedInner {
    side_band: Rc<dyn SideBand>,
    codec: Rc<dyn Codec>,
    correlation: Correlation,
    scheduler: SchedulerRef,
    state: Cell<QueueState>,
    queue: RefCell<VecDeque<Message>>,
}

impl QueuedTransport {
    /// Creates an idle adapter over `side_band`.
    pub fn new(side_band: Rc<dyn SideBand>, codec: Rc<dyn Codec>, scheduler: SchedulerRef) -> Self {
        Self {
            inner: Rc::new(QueuedInner {
                side_band,
                codec,
                correlation: Correlation::new(),
                scheduler,
                state: Cell::new(QueueState::Idle),
                queue: RefCell::new(VecDeque::new()),
            }),
        }
    }

    /// Current gate state.
    pub fn state(&self) -> QueueState {
        self.inner.state.get()
    }

    /// Number of messages waiting behind the one in flight.
    pub fn queued(&self) -> usize {
        self.inner.queue.borrow().len()
    }
}

impl QueuedInner {
    fn enqueue(&self, mut message: Message, handler: Option<ResponseHandler>) {
        let id = self.correlation.next_id();
        message.id = Some(id);
        if let Some(handler) = handler {
            self.correlation.register_pending(id, handler);
        }
        self.queue.borrow_mut().push_back(message);
        debug!(id = %id, queued = self.queue.borrow().len(), "Enqueued message");

        if self.state.get() == QueueState::Idle {
            self.dequeue();
        }
    }

    fn dequeue(&self) {
        let next = self.queue.borrow_mut().pop_front();
        match next {
            None => self.state.set(QueueState::Idle),
            Some(message) => {
                // Every queued message carries an id assigned in `enqueue`.
                let id = message.id.unwrap_or_else(|| self.correlation.next_id());
                self.state.set(QueueState::Sending(id));
                self.submit(id, message);
            }
        }
    }

    fn submit(&self, id: MessageId, message: Message) {
        match self.codec.encode(&message.to_value()) {
            Ok(payload) => {
                debug!(id = %id, name = %message.name, "Submitting message");
                self.side_band.store(payload);
                let side_band = self.side_band.clone();
                self.scheduler.defer(Box::new(move || side_band.signal()));
            }
            Err(e) => {
                let error = BridgeError::from(e);
                error!(id = %id, name = %message.name, error = %error, "Dropping unencodable message");
                if self.correlation.is_pending(id) {
                    self.correlation.resolve_pending(id, failure_response(&error));
                }
                self.dequeue();
            }
        }
    }

    fn ack(&self, id: Option<MessageId>) {
        match (self.state.get(), id) {
            (QueueState::Idle, _) => {
                warn!(id = ?id, "Acknowledgement while no message is in flight");
            }
            (QueueState::Sending(current), Some(id)) if current != id => {
                warn!(id = %id, current = %current, "Ignoring stale acknowledgement");
            }
            (QueueState::Sending(current), _) => {
                debug!(id = %current, "Message acknowledged");
                self.state.set(QueueState::Idle);
                self.side_band.clear_outbound();
                if !self.queue.borrow().is_empty() {
                    self.dequeue();
                }
            }
        }
    }
}

impl Transport for QueuedTransport {
    fn name(&self) -> &'static str {
        "queued"
    }

    fn send(&self, message: Message, handler: Option<ResponseHandler>) -> Result<(), BridgeError> {
        self.inner.enqueue(message, handler);
        Ok(())
    }

    fn receive(&self, id: MessageId, response: Response) {
        self.inner.correlation.resolve_pending(id, response);
        self.inner.side_band.clear_inbound();
    }

    fn acknowledge(&self, id: Option<MessageId>) {
        self.inner.ack(id);
    }

    fn scheduler(&self) -> SchedulerRef {
        self.inner.scheduler.clone()
    }

    fn sender(&self) -> MessageSender {
        let inner = self.inner.clone();
        Rc::new(move |message| {
            inner.enqueue(message, None);
            Ok(())
        })
    }

    fn pending_responses(&self) -> usize {
        self.inner.correlation.pending_count()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::codec::{CodecError, JsonCodec};
    use crate::promise::EventLoop;

    #[derive(Default)]
    struct RecordingSideBand {
        stored: RefCell<Vec<String>>,
        signals: Cell<usize>,
        cleared_outbound: Cell<usize>,
        cleared_inbound: Cell<usize>,
    }

    impl SideBand for RecordingSideBand {
        fn store(&self, payload: String) {
            self.stored.borrow_mut().push(payload);
        }

        fn signal(&self) {
            self.signals.set(self.signals.get() + 1);
        }

        fn clear_outbound(&self) {
            self.cleared_outbound.set(self.cleared_outbound.get() + 1);
        }

        fn clear_inbound(&self) {
            self.cleared_inbound.set(self.cleared_inbound.get() + 1);
        }
    }

    fn names(side_band: &RecordingSideBand) -> Vec<String> {
        side_band
            .stored
            .borrow()
            .iter()
            .map(|p| {
                let value: Value = serde_json::from_str(p).expect("json");
                value["name"].as_str().unwrap_or_default().to_string()
            })
            .collect()
    }

    fn setup() -> (Rc<EventLoop>, Rc<RecordingSideBand>, QueuedTransport) {
        let event_loop = EventLoop::new();
        let side_band = Rc::new(RecordingSideBand::default());
        let transport = QueuedTransport::new(side_band.clone(), Rc::new(JsonCodec), event_loop.clone());
        (event_loop, side_band, transport)
    }

    #[test]
    fn test_one_submit_until_ack_in_fifo_order() {
        let (event_loop, side_band, transport) = setup();
        for name in ["first", "second", "third"] {
            transport.send(Message::notification(name, vec![]), None).expect("send");
        }
        event_loop.run_until_idle();
        assert_eq!(names(&side_band), vec!["first"]);
        assert_eq!(side_band.signals.get(), 1);
        assert_eq!(transport.state(), QueueState::Sending(MessageId::new(0)));
        assert_eq!(transport.queued(), 2);

        transport.acknowledge(Some(MessageId::new(0)));
        event_loop.run_until_idle();
        assert_eq!(names(&side_band), vec!["first", "second"]);

        transport.acknowledge(Some(MessageId::new(1)));
        event_loop.run_until_idle();
        assert_eq!(names(&side_band), vec!["first", "second", "third"]);

        transport.acknowledge(Some(MessageId::new(2)));
        assert_eq!(transport.state(), QueueState::Idle);
        assert_eq!(side_band.cleared_outbound.get(), 3);
        assert_eq!(side_band.signals.get(), 3);
    }

    #[test]
    fn test_signal_is_deferred_after_store() {
        let (event_loop, side_band, transport) = setup();
        transport.send(Message::notification("x", vec![]), None).expect("send");
        assert_eq!(side_band.stored.borrow().len(), 1);
        assert_eq!(side_band.signals.get(), 0);
        event_loop.tick();
        assert_eq!(side_band.signals.get(), 1);
    }

    #[test]
    fn test_stale_and_idle_acks_are_ignored() {
        let (event_loop, side_band, transport) = setup();
        transport.acknowledge(Some(MessageId::new(9)));
        assert_eq!(side_band.cleared_outbound.get(), 0);

        transport.send(Message::notification("a", vec![]), None).expect("send");
        transport.send(Message::notification("b", vec![]), None).expect("send");
        transport.acknowledge(Some(MessageId::new(7)));
        event_loop.run_until_idle();
        assert_eq!(names(&side_band), vec!["a"]);

        // An anonymous acknowledgement releases whatever is in flight.
        transport.acknowledge(None);
        event_loop.run_until_idle();
        assert_eq!(names(&side_band), vec!["a", "b"]);
    }

    #[test]
    fn test_every_message_gets_id_and_response_cleans_up() {
        let (_event_loop, side_band, transport) = setup();
        let got = Rc::new(RefCell::new(None));
        let sink = got.clone();
        transport
            .send(
                Message::request("add", vec![json!(1)]),
                Some(Box::new(move |response| {
                    *sink.borrow_mut() = Some(response);
                    Ok(())
                })),
            )
            .expect("send");
        transport.send(Message::notification("log", vec![]), None).expect("send");
        assert_eq!(transport.pending_responses(), 1);

        transport.receive(MessageId::new(0), Response::success(vec![json!(1)]));
        assert_eq!(*got.borrow(), Some(Response::success(vec![json!(1)])));
        assert_eq!(side_band.cleared_inbound.get(), 1);

        // Unknown id still cleans up.
        transport.receive(MessageId::new(5), Response::success(vec![]));
        assert_eq!(side_band.cleared_inbound.get(), 2);
    }

    struct BrokenCodec;

    impl Codec for BrokenCodec {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn encode(&self, value: &serde_json::Value) -> Result<String, CodecError> {
            if value["name"] == json!("bad") {
                Err(CodecError::UnexpectedEnd)
            } else {
                JsonCodec.encode(value)
            }
        }

        fn decode(&self, text: &str) -> Result<serde_json::Value, CodecError> {
            JsonCodec.decode(text)
        }
    }

    #[test]
    fn test_encode_failure_fails_handler_and_moves_on() {
        let event_loop = EventLoop::new();
        let side_band = Rc::new(RecordingSideBand::default());
        let transport = QueuedTransport::new(side_band.clone(), Rc::new(BrokenCodec), event_loop.clone());
        let got = Rc::new(RefCell::new(None));
        let sink = got.clone();
        transport
            .send(
                Message::request("bad", vec![]),
                Some(Box::new(move |response| {
                    *sink.borrow_mut() = Some(response);
                    Ok(())
                })),
            )
            .expect("send");
        transport.send(Message::notification("good", vec![]), None).expect("send");
        event_loop.run_until_idle();

        assert_eq!(got.borrow().as_ref().map(|r| r.success), Some(false));
        assert_eq!(names(&side_band), vec!["good"]);
        assert_eq!(transport.state(), QueueState::Sending(MessageId::new(1)));
    }
}
