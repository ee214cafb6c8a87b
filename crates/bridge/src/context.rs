//! What a handler sees of the message it is running for.
//!
//! A handler invoked for a request receives a [`ResponseContext`]: the local
//! [`Bridge`] plus `resolve`/`reject` bound to the request's id. Settling the
//! context sends `<ns>.receive [id, {success, parameters}]` back to the
//! remote side on a later scheduler turn. It may be settled long after the
//! handler returned, from any later callback on the same thread.

use serde_json::Value;
use tracing::debug;

use crate::promise::{Awaitable, IntoOutcome, Promise, PromiseError, PromiseState, Resolver};
use crate::{Bridge, ErrorEnvelope, MessageId, Response};

/// Invocation context passed to every handler.
#[derive(Debug, Clone)]
pub enum CallContext {
    /// The sender waits for a response.
    Request(ResponseContext),
    /// Fire-and-forget; nothing is sent back.
    Notification(Bridge),
}

impl CallContext {
    /// The local bridge the message arrived on.
    pub fn recipient(&self) -> &Bridge {
        match self {
            Self::Request(context) => context.recipient(),
            Self::Notification(bridge) => bridge,
        }
    }

    /// The response context, if the sender waits for a response.
    pub fn responder(&self) -> Option<&ResponseContext> {
        match self {
            Self::Request(context) => Some(context),
            Self::Notification(_) => None,
        }
    }
}

/// Resolve/reject bound to one inbound request.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    id: MessageId,
    recipient: Bridge,
    resolver: Resolver,
}

impl ResponseContext {
    pub(crate) fn new(recipient: &Bridge, id: MessageId) -> Self {
        let (promise, resolver) = Promise::deferred(recipient.scheduler());
        let on_success = recipient.downgrade();
        let on_failure = on_success.clone();
        promise.then_or_else(
            move |values| on_success.respond(id, Response::success(values)),
            move |reasons| on_failure.respond(id, Response::failure(reasons)),
        );
        Self {
            id,
            recipient: recipient.clone(),
            resolver,
        }
    }

    /// Id of the request being answered.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// The local bridge the request arrived on.
    pub fn recipient(&self) -> &Bridge {
        &self.recipient
    }

    /// Whether the response has been decided.
    pub fn is_settled(&self) -> bool {
        self.resolver.promise().state() != PromiseState::Pending
    }

    /// Answers the request successfully. Promises among `values` are awaited
    /// first.
    #[track_caller]
    pub fn resolve<I>(&self, values: I) -> Result<(), PromiseError>
    where
        I: IntoIterator,
        I::Item: Into<Awaitable>,
    {
        self.resolver.resolve(values)
    }

    /// Answers the request with a failure.
    #[track_caller]
    pub fn reject<I>(&self, reasons: I) -> Result<(), PromiseError>
    where
        I: IntoIterator<Item = Value>,
    {
        self.resolver.reject(reasons)
    }

    /// Answers the request with an error envelope.
    #[track_caller]
    pub fn reject_error(&self, envelope: ErrorEnvelope) -> Result<(), PromiseError> {
        self.resolver.reject([envelope.to_value()])
    }

    /// Answers the request with whatever a handler body produced.
    #[track_caller]
    pub fn settle(&self, outcome: impl IntoOutcome) -> Result<(), PromiseError> {
        let result = self.resolver.settle(outcome.into_outcome());
        if let Err(e) = &result {
            debug!(id = %self.id, error = %e, "Response already settled");
        }
        result
    }
}
