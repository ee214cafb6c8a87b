//! A [`Scheduler`] driven by a task on the current `LocalSet`.

use std::cell::Cell;
use std::rc::Rc;

use bridge::{Scheduler, Task, UnhandledRejection};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Runs deferred bridge tasks in FIFO order on a `spawn_local` driver.
///
/// Tasks go through an unbounded channel to a single driver task, so their
/// order is the order they were deferred in, independent of how the
/// `LocalSet` interleaves its other tasks.
pub struct TokioScheduler {
    sender: mpsc::UnboundedSender<Task>,
    unhandled: Cell<usize>,
}

impl TokioScheduler {
    /// Spawns the driver on the current `LocalSet`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a `LocalSet`, like [`tokio::task::spawn_local`].
    pub fn spawn() -> Rc<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        tokio::task::spawn_local(async move {
            let mut count = 0usize;
            while let Some(task) = receiver.recv().await {
                task();
                count += 1;
            }
            debug!(tasks = count, "Bridge scheduler driver stopped");
        });
        Rc::new(Self {
            sender,
            unhandled: Cell::new(0),
        })
    }

    /// Number of unhandled rejections reported so far.
    pub fn unhandled_count(&self) -> usize {
        self.unhandled.get()
    }
}

impl Scheduler for TokioScheduler {
    fn defer(&self, task: Task) {
        if self.sender.send(task).is_err() {
            warn!("Bridge scheduler driver is gone; dropping task");
        }
    }

    fn report_unhandled(&self, rejection: UnhandledRejection) {
        self.unhandled.set(self.unhandled.get() + 1);
        error!(
            kind = %rejection.kind,
            reason = %rejection.message,
            location = %rejection.location,
            reported_at = %rejection.reported_at,
            "Unhandled promise rejection"
        );
    }
}

impl std::fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("closed", &self.sender.is_closed())
            .field("unhandled", &self.unhandled.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use tokio::task::LocalSet;

    use super::*;

    #[tokio::test]
    async fn test_tasks_run_in_order() {
        LocalSet::new()
            .run_until(async {
                let scheduler = TokioScheduler::spawn();
                let order = Rc::new(RefCell::new(Vec::new()));
                for n in 0..5 {
                    let order = order.clone();
                    scheduler.defer(Box::new(move || order.borrow_mut().push(n)));
                }
                let (tx, rx) = tokio::sync::oneshot::channel();
                scheduler.defer(Box::new(move || {
                    let _ = tx.send(());
                }));
                rx.await.expect("driver ran");
                assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
            })
            .await;
    }
}
