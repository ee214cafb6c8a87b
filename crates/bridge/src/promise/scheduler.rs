//! Scheduling port for promise reactions.
//!
//! Reactions never run inside the `resolve`/`reject`/`then` call that made them
//! runnable; they are handed to a [`Scheduler`] and executed on a later turn.
//! [`EventLoop`] is the deterministic in-process implementation used by tests
//! and by hosts that drive the bridge by hand.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::Location;
use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, error};

use crate::{ErrorEnvelope, Timestamp};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

/// Shared handle to the scheduler driving a bridge instance.
pub type SchedulerRef = Rc<dyn Scheduler>;

/// Runs deferred work on a later turn of the surrounding event loop.
pub trait Scheduler {
    /// Queues `task` to run after the current call stack has unwound.
    fn defer(&self, task: Task);

    /// Surfaces a rejection that nobody handled.
    fn report_unhandled(&self, rejection: UnhandledRejection) {
        error!(
            kind = %rejection.kind,
            reason = %rejection.message,
            location = %rejection.location,
            "Unhandled promise rejection"
        );
    }
}

// ---------------------------------------------------------------------------
// Unhandled rejection diagnostic
// ---------------------------------------------------------------------------

/// Diagnostic for a promise rejected without any rejection reaction attached.
#[derive(Debug, Clone, PartialEq)]
pub struct UnhandledRejection {
    /// Error type of the first reason, or its JSON type name.
    pub kind: String,
    /// Error message of the first reason, or its JSON text.
    pub message: String,
    /// Best-effort source location of the rejection.
    pub location: String,
    /// The full rejection reasons.
    pub reasons: Vec<Value>,
    /// When the rejection was found to be unhandled.
    pub reported_at: Timestamp,
}

impl UnhandledRejection {
    pub(crate) fn new(reasons: Vec<Value>, origin: &'static Location<'static>) -> Self {
        let first = reasons.first();
        let (kind, message, location) = match first.and_then(ErrorEnvelope::from_value) {
            Some(envelope) => {
                let location = envelope
                    .backtrace
                    .first()
                    .cloned()
                    .unwrap_or_else(|| origin.to_string());
                (envelope.error_type, envelope.message, location)
            }
            None => (
                json_type_name(first).to_string(),
                first.map(Value::to_string).unwrap_or_default(),
                origin.to_string(),
            ),
        };
        Self {
            kind,
            message,
            location,
            reasons,
            reported_at: Timestamp::now(),
        }
    }
}

fn json_type_name(value: Option<&Value>) -> &'static str {
    match value {
        None => "undefined",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}

// ---------------------------------------------------------------------------
// EventLoop
// ---------------------------------------------------------------------------

/// A FIFO task queue driven explicitly by its owner.
///
/// Unhandled rejections are logged and also kept for inspection through
/// [`EventLoop::take_unhandled`].
#[derive(Default)]
pub struct EventLoop {
    queue: RefCell<VecDeque<Task>>,
    unhandled: RefCell<Vec<UnhandledRejection>>,
}

impl EventLoop {
    /// Creates an empty event loop.
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Runs the oldest queued task. Returns `false` if the queue was empty.
    pub fn tick(&self) -> bool {
        // The borrow must end before the task runs: tasks defer more tasks.
        let task = self.queue.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs tasks until the queue is empty, including tasks queued meanwhile.
    /// Returns the number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut count = 0;
        while self.tick() {
            count += 1;
        }
        debug!(tasks = count, "Event loop idle");
        count
    }

    /// Number of queued tasks.
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Drains the unhandled rejections recorded so far.
    pub fn take_unhandled(&self) -> Vec<UnhandledRejection> {
        std::mem::take(&mut *self.unhandled.borrow_mut())
    }
}

impl Scheduler for EventLoop {
    fn defer(&self, task: Task) {
        self.queue.borrow_mut().push_back(task);
    }

    fn report_unhandled(&self, rejection: UnhandledRejection) {
        error!(
            kind = %rejection.kind,
            reason = %rejection.message,
            location = %rejection.location,
            "Unhandled promise rejection"
        );
        self.unhandled.borrow_mut().push(rejection);
    }
}
