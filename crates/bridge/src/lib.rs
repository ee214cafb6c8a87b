//! Two-sided asynchronous remote-call bridge.
//!
//! Each side of the boundary owns one [`Bridge`]. A side registers named
//! handlers with `on`/`once`, sends fire-and-forget messages with `call`, and
//! sends requests with `get`, which return a [`Promise`] settled by the remote
//! handler's response. Messages are encoded as strings and handed to a
//! host-supplied delivery primitive, either directly or through the throttled,
//! acknowledgement-gated queue.
//!
//! ## Architectural Layer
//!
//! **Protocol logic + port definitions.** This crate has no I/O dependencies
//! and no async runtime. The delivery primitives ([`transport::Delivery`],
//! [`transport::SideBand`]) and the promise [`Scheduler`] are ports; the
//! `loopback` and `runtime` crates implement them.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`bridge`] | The facade: registration, outbound calls, inbound dispatch |
//! | [`context`] | What a handler sees: [`CallContext`], [`ResponseContext`] |
//! | [`promise`] | Single-threaded promises, scheduler port, combinators |
//! | [`correlation`] | Message id generation and pending response handlers |
//! | [`transport`] | Direct and queued adapters over the delivery ports |
//! | [`codec`] | JSON codec and the fallback recursive-descent codec |
//! | [`handlers`] | Named callback registry |
//! | [`config`] | Per-instance configuration |
//! | [`identifiers`] | Newtype identifiers (`MessageId`, `HandlerName`) |
//! | [`types`] | Wire value types (`Message`, `Response`, `Timestamp`) |
//! | [`errors`] | [`BridgeError`] and the portable [`ErrorEnvelope`] |
//!
//! ## Threading
//!
//! Everything here is single-threaded (`Rc`/`RefCell`). A bridge, its
//! promises, and its transport live on one thread and are driven by one
//! scheduler.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod context;
pub mod correlation;
pub mod errors;
pub mod handlers;
pub mod identifiers;
pub mod promise;
pub mod transport;
pub mod types;

// Re-export the everyday surface at the crate root.
pub use bridge::{Bridge, TransportSelection, WeakBridge};
pub use codec::{Codec, CodecError, CodecKind, FallbackCodec, JsonCodec};
pub use config::BridgeConfig;
pub use context::{CallContext, ResponseContext};
pub use errors::{BridgeError, ErrorEnvelope, ErrorKind};
pub use identifiers::{HandlerName, MessageId};
pub use promise::{
    Awaitable, EventLoop, IntoOutcome, Outcome, Promise, PromiseError, PromiseState, Resolver,
    Scheduler, SchedulerRef, Settlement, Task, UnhandledRejection,
};
pub use types::{Message, Response, Timestamp};

pub use serde_json::Value;
