//! Tokio integration for the bridge.
//!
//! The bridge core is runtime-agnostic: promises hand their reactions to a
//! [`bridge::Scheduler`]. This crate supplies one that runs on a tokio
//! [`LocalSet`](tokio::task::LocalSet), and lets async code `.await` a
//! [`bridge::Promise`].
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Everything here is `!Send` and must run inside a
//! `LocalSet` on a current-thread runtime:
//!
//! ```ignore
//! let local = tokio::task::LocalSet::new();
//! local.run_until(async {
//!     let scheduler = TokioScheduler::spawn();
//!     let promise = bridge.get("add", vec![json!(4), json!(2)])?;
//!     let values = promise.settled().await?;
//! }).await;
//! ```

mod future;
mod scheduler;

pub use future::{PromiseExt, PromiseFuture};
pub use scheduler::TokioScheduler;
