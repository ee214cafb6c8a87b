//! `.await` support for bridge promises.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bridge::{BridgeError, Promise, Settlement, Value};
use tokio::sync::oneshot;
use tokio::time::Timeout;
use tracing::warn;

/// Adds async adapters to [`Promise`].
pub trait PromiseExt {
    /// A future that completes when the promise settles.
    ///
    /// Subscribing counts as handling a rejection.
    fn settled(&self) -> PromiseFuture;

    /// [`PromiseExt::settled`] bounded by `limit`.
    fn settled_within(&self, limit: Duration) -> Timeout<PromiseFuture> {
        tokio::time::timeout(limit, self.settled())
    }
}

impl PromiseExt for Promise {
    fn settled(&self) -> PromiseFuture {
        let (sender, receiver) = oneshot::channel();
        self.observe(move |settlement| {
            // The future may have been dropped already.
            let _ = sender.send(settlement);
        });
        PromiseFuture { receiver }
    }
}

/// Future returned by [`PromiseExt::settled`].
///
/// Resolves to the promise's values, or to the error reconstructed from its
/// rejection reasons. A promise dropped while still pending yields
/// [`BridgeError::Rejected`] with no reasons.
#[derive(Debug)]
pub struct PromiseFuture {
    receiver: oneshot::Receiver<Settlement>,
}

impl Future for PromiseFuture {
    type Output = Result<Vec<Value>, BridgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(settlement)) => Poll::Ready(settlement.into_result()),
            Poll::Ready(Err(_)) => {
                warn!("Promise dropped before it settled");
                Poll::Ready(Err(BridgeError::Rejected { reasons: Vec::new() }))
            }
        }
    }
}
