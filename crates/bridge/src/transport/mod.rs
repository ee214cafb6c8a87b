//! Transport adapters and the string-delivery ports they drive.
//!
//! The bridge never touches a concrete channel. An adapter encodes each
//! [`Message`] with the configured [`Codec`] and hands the string to an
//! abstract primitive supplied by the host:
//!
//! | Adapter | Port | Behaviour |
//! |---------|------|-----------|
//! | [`DirectTransport`] | [`Delivery`] | delivers every message immediately |
//! | [`QueuedTransport`] | [`SideBand`] | one message in flight, next one only after `ack` |
//!
//! Both adapters share the [`Transport`] contract: `send` with an optional
//! response handler, `receive` for responses coming back, `acknowledge` for
//! the throttled channel's backpressure signal, and the inverse-call helper
//! [`Transport::get`].
//!
//! [`Codec`]: crate::codec::Codec

mod direct;
mod queued;

use std::rc::Rc;

use serde_json::Value;

use crate::correlation::ResponseHandler;
use crate::promise::{Outcome, Promise, SchedulerRef};
use crate::{BridgeError, ErrorEnvelope, Message, MessageId, Response};

pub use direct::DirectTransport;
pub use queued::{QueueState, QueuedTransport};

/// Sends a message through a transport without waiting for a response.
pub type MessageSender = Rc<dyn Fn(Message) -> Result<(), BridgeError>>;

/// A local function the remote side may invoke through [`Transport::get`].
pub type LocalFunction = Rc<dyn Fn(Vec<Value>) -> Outcome>;

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Unthrottled one-way string delivery to the remote side.
pub trait Delivery {
    /// Delivers one encoded message.
    fn deliver(&self, payload: String) -> Result<(), BridgeError>;
}

/// A rate-limited channel split into a payload slot and a delivery trigger.
///
/// The payload is written with [`SideBand::store`] where the remote side can
/// retrieve it, then [`SideBand::signal`] tells the remote side to fetch it.
/// Signals raised too close together may be lost.
pub trait SideBand {
    /// Writes the payload the next signal refers to.
    fn store(&self, payload: String);

    /// Triggers the rate-limited delivery primitive.
    fn signal(&self);

    /// Releases artifacts of the last outbound message once it is acknowledged.
    fn clear_outbound(&self);

    /// Releases artifacts left behind by an inbound response.
    fn clear_inbound(&self) {}
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Delivery strategy shared by both adapters.
pub trait Transport {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Sends `message`, correlating the eventual response with `handler`.
    ///
    /// The adapter assigns `message.id` whenever it has to match something
    /// back to the message.
    fn send(&self, message: Message, handler: Option<ResponseHandler>) -> Result<(), BridgeError>;

    /// Routes a response from the remote side to its pending handler.
    fn receive(&self, id: MessageId, response: Response);

    /// The remote side has accepted a message (`None` when it could not tell
    /// which one).
    fn acknowledge(&self, id: Option<MessageId>);

    /// Scheduler used by the promises this transport creates.
    fn scheduler(&self) -> SchedulerRef;

    /// A detached handle for sending notifications from reactions.
    fn sender(&self) -> MessageSender;

    /// Number of messages waiting for a response.
    fn pending_responses(&self) -> usize;

    /// Runs a local function on behalf of the remote side and reports back.
    ///
    /// The function's result (or failure) is sent as a notification to
    /// `handler_name` with parameters `[true, ...values]` or
    /// `[false, ...reasons]`. A function that could not be resolved is
    /// reported the same way. The returned promise settles once the report
    /// has been handed to the transport.
    fn get(
        &self,
        handler_name: &str,
        function: Result<LocalFunction, ErrorEnvelope>,
        parameters: Vec<Value>,
    ) -> Promise {
        let on_success = self.sender();
        let on_failure = on_success.clone();
        let success_name = handler_name.to_string();
        let failure_name = success_name.clone();

        Promise::new(self.scheduler(), move |resolver| {
            let function = function?;
            resolver.settle(function(parameters))?;
            Ok(())
        })
        .then_or_else(
            move |values| {
                let mut parameters = vec![Value::Bool(true)];
                parameters.extend(values);
                on_success(Message::notification(success_name, parameters))
            },
            move |reasons| {
                let mut parameters = vec![Value::Bool(false)];
                parameters.extend(reasons);
                on_failure(Message::notification(failure_name, parameters))
            },
        )
    }
}

/// Shorthand used by adapters to fail a pending handler locally.
pub(crate) fn failure_response(error: &BridgeError) -> Response {
    Response::failure(vec![error.to_envelope().to_value()])
}
