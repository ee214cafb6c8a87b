//! In-memory delivery primitives for the bridge.
//!
//! Implements the delivery ports defined in [`bridge::transport`] without any
//! real channel, so two [`bridge::Bridge`] instances can talk to each other on
//! one thread.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** This crate must not contain protocol rules. It only
//! moves strings between two bridges, with the timing of the channels the
//! protocol was designed for.
//!
//! | Primitive | Port | Behaviour |
//! |-----------|------|-----------|
//! | [`Mailbox`] | [`bridge::transport::Delivery`] | every payload arrives on the next scheduler turn |
//! | [`SideBandSlot`] | [`bridge::transport::SideBand`] | one payload slot; signals raised too close together are dropped |
//!
//! [`direct_pair`] and [`throttled_pair`] build two connected bridges.

mod mailbox;
mod pair;
mod side_band;

pub use mailbox::Mailbox;
pub use pair::{direct_pair, throttled_pair, LoopbackPair, PageLink};
pub use side_band::{SideBandSlot, SlotStats};
