//! A minimal single-threaded promise engine.
//!
//! A [`Promise`] settles once, either resolved or rejected, with an ordered
//! list of JSON values. Reactions registered with [`Promise::then`],
//! [`Promise::catch`], or [`Promise::observe`] queue up while the promise is
//! pending and each run exactly once, always on a later turn of the
//! [`Scheduler`], never inside the call that settled or subscribed.
//!
//! Settlement is done through a [`Resolver`]. Resolving with another promise
//! makes the receiver follow it; a promise therefore never holds an unsettled
//! promise as its value.
//!
//! A promise rejected while nothing is subscribed to it is reported through
//! [`Scheduler::report_unhandled`] unless a reaction is attached before the
//! next scheduler turn.

mod combinators;
mod scheduler;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::Location;
use std::rc::{Rc, Weak};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use crate::{BridgeError, ErrorEnvelope};

pub use scheduler::{EventLoop, Scheduler, SchedulerRef, Task, UnhandledRejection};

// ---------------------------------------------------------------------------
// Public value types
// ---------------------------------------------------------------------------

/// Errors raised by settling a promise that is no longer pending.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromiseError {
    /// The promise is already resolved with different values.
    #[error("promise already resolved with different values")]
    AlreadyResolved,

    /// The promise is already rejected with different reasons.
    #[error("promise already rejected")]
    AlreadyRejected,

    /// The promise follows another promise and cannot be settled directly.
    #[error("promise is already following another promise")]
    AlreadyFollowing,
}

/// Observable state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    /// Not settled yet (possibly following another promise).
    Pending,
    /// Resolved with values.
    Resolved,
    /// Rejected with reasons.
    Rejected,
}

/// The terminal value of a settled promise.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// Result values.
    Resolved(Vec<Value>),
    /// Rejection reasons.
    Rejected(Vec<Value>),
}

impl Settlement {
    /// Converts the settlement into a `Result`, reconstructing the error from
    /// rejection reasons.
    pub fn into_result(self) -> Result<Vec<Value>, BridgeError> {
        match self {
            Self::Resolved(values) => Ok(values),
            Self::Rejected(reasons) => Err(BridgeError::from_reasons(reasons)),
        }
    }
}

/// A value a promise can be resolved with: a plain value or another promise.
#[derive(Debug, Clone)]
pub enum Awaitable {
    /// A plain JSON value.
    Value(Value),
    /// A promise whose settlement is adopted.
    Promise(Promise),
}

impl From<Value> for Awaitable {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Promise> for Awaitable {
    fn from(promise: Promise) -> Self {
        Self::Promise(promise)
    }
}

impl From<&Promise> for Awaitable {
    fn from(promise: &Promise) -> Self {
        Self::Promise(promise.clone())
    }
}

/// What a reaction produces for the downstream promise.
pub type Outcome = Result<Vec<Awaitable>, ErrorEnvelope>;

/// Conversion of reaction and function return values into an [`Outcome`].
pub trait IntoOutcome {
    /// Performs the conversion.
    fn into_outcome(self) -> Outcome;
}

impl IntoOutcome for () {
    fn into_outcome(self) -> Outcome {
        Ok(Vec::new())
    }
}

impl IntoOutcome for Value {
    fn into_outcome(self) -> Outcome {
        Ok(vec![Awaitable::Value(self)])
    }
}

impl IntoOutcome for Vec<Value> {
    fn into_outcome(self) -> Outcome {
        Ok(self.into_iter().map(Awaitable::Value).collect())
    }
}

impl IntoOutcome for Vec<Awaitable> {
    fn into_outcome(self) -> Outcome {
        Ok(self)
    }
}

impl IntoOutcome for Promise {
    fn into_outcome(self) -> Outcome {
        Ok(vec![Awaitable::Promise(self)])
    }
}

impl<T: IntoOutcome> IntoOutcome for Result<T, ErrorEnvelope> {
    fn into_outcome(self) -> Outcome {
        self.and_then(IntoOutcome::into_outcome)
    }
}

impl<T: IntoOutcome> IntoOutcome for Result<T, BridgeError> {
    fn into_outcome(self) -> Outcome {
        self.map_err(|e| e.to_envelope())
            .and_then(IntoOutcome::into_outcome)
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

type Reaction = Box<dyn FnOnce(Vec<Value>) -> Outcome>;
type Observer = Box<dyn FnOnce(Settlement)>;

enum Subscriber {
    Chain {
        on_resolve: Option<Reaction>,
        on_reject: Option<Reaction>,
        downstream: Resolver,
    },
    Observe(Observer),
}

enum State {
    Pending,
    Following(Vec<Adopted>),
    Resolved(Vec<Value>),
    Rejected(Vec<Value>),
}

// What a following promise was resolved with. Weak so a follower and its
// target do not keep each other alive.
enum Adopted {
    Value(Value),
    Promise(Weak<RefCell<PromiseInner>>),
}

struct PromiseInner {
    state: State,
    subscribers: VecDeque<Subscriber>,
    handled: bool,
    origin: &'static Location<'static>,
}

// ---------------------------------------------------------------------------
// Promise
// ---------------------------------------------------------------------------

/// Handle to a single-threaded promise. Clones share the same promise.
#[derive(Clone)]
pub struct Promise {
    inner: Rc<RefCell<PromiseInner>>,
    scheduler: SchedulerRef,
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .field("settlement", &self.settlement())
            .finish()
    }
}

impl Promise {
    /// Creates a promise and runs `executor` with its resolver.
    ///
    /// An `Err` returned by the executor rejects the promise, unless the
    /// executor already settled it.
    #[track_caller]
    pub fn new<F>(scheduler: SchedulerRef, executor: F) -> Self
    where
        F: FnOnce(&Resolver) -> Result<(), ErrorEnvelope>,
    {
        let (promise, resolver) = Self::deferred(scheduler);
        if let Err(envelope) = executor(&resolver) {
            if resolver.reject([envelope.to_value()]).is_err() {
                debug!(error = %envelope, "Executor failed after settling its promise");
            }
        }
        promise
    }

    /// Creates a pending promise together with the resolver that settles it.
    #[track_caller]
    pub fn deferred(scheduler: SchedulerRef) -> (Self, Resolver) {
        let promise = Self {
            inner: Rc::new(RefCell::new(PromiseInner {
                state: State::Pending,
                subscribers: VecDeque::new(),
                handled: false,
                origin: Location::caller(),
            })),
            scheduler,
        };
        let resolver = Resolver {
            promise: promise.clone(),
        };
        (promise, resolver)
    }

    /// A promise resolved with `values` (following any promise among them).
    #[track_caller]
    pub fn resolved<I>(scheduler: SchedulerRef, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Awaitable>,
    {
        let (promise, resolver) = Self::deferred(scheduler);
        // Fresh promise: cannot already be settled.
        let _ = resolver.resolve(values);
        promise
    }

    /// A promise rejected with `reasons`.
    #[track_caller]
    pub fn rejected<I>(scheduler: SchedulerRef, reasons: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        let (promise, resolver) = Self::deferred(scheduler);
        let _ = resolver.reject(reasons);
        promise
    }

    /// The scheduler this promise defers its reactions to.
    pub fn scheduler(&self) -> SchedulerRef {
        self.scheduler.clone()
    }

    /// Current state.
    pub fn state(&self) -> PromiseState {
        match self.inner.borrow().state {
            State::Pending | State::Following(_) => PromiseState::Pending,
            State::Resolved(_) => PromiseState::Resolved,
            State::Rejected(_) => PromiseState::Rejected,
        }
    }

    /// The terminal value, once settled.
    pub fn settlement(&self) -> Option<Settlement> {
        match &self.inner.borrow().state {
            State::Pending | State::Following(_) => None,
            State::Resolved(values) => Some(Settlement::Resolved(values.clone())),
            State::Rejected(reasons) => Some(Settlement::Rejected(reasons.clone())),
        }
    }

    /// Chains a reaction to resolution. Rejections pass through unchanged.
    pub fn then<F, R>(&self, on_resolve: F) -> Promise
    where
        F: FnOnce(Vec<Value>) -> R + 'static,
        R: IntoOutcome,
    {
        self.chain(Some(reaction(on_resolve)), None)
    }

    /// Chains a reaction to rejection. Resolutions pass through unchanged.
    pub fn catch<G, R>(&self, on_reject: G) -> Promise
    where
        G: FnOnce(Vec<Value>) -> R + 'static,
        R: IntoOutcome,
    {
        self.chain(None, Some(reaction(on_reject)))
    }

    /// Chains reactions to both outcomes.
    pub fn then_or_else<F, G, R1, R2>(&self, on_resolve: F, on_reject: G) -> Promise
    where
        F: FnOnce(Vec<Value>) -> R1 + 'static,
        G: FnOnce(Vec<Value>) -> R2 + 'static,
        R1: IntoOutcome,
        R2: IntoOutcome,
    {
        self.chain(Some(reaction(on_resolve)), Some(reaction(on_reject)))
    }

    /// Subscribes to the settlement without creating a downstream promise.
    ///
    /// Counts as handling a rejection.
    pub fn observe<F>(&self, observer: F)
    where
        F: FnOnce(Settlement) + 'static,
    {
        self.subscribe(Subscriber::Observe(Box::new(observer)));
    }

    fn chain(&self, on_resolve: Option<Reaction>, on_reject: Option<Reaction>) -> Promise {
        let (downstream, resolver) = Self::deferred(self.scheduler.clone());
        downstream.inner.borrow_mut().origin = self.inner.borrow().origin;
        self.subscribe(Subscriber::Chain {
            on_resolve,
            on_reject,
            downstream: resolver,
        });
        downstream
    }

    fn subscribe(&self, subscriber: Subscriber) {
        let settled = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            inner.handled = true;
            match &inner.state {
                State::Pending | State::Following(_) => {
                    inner.subscribers.push_back(subscriber);
                    return;
                }
                State::Resolved(values) => (Settlement::Resolved(values.clone()), inner.origin),
                State::Rejected(reasons) => (Settlement::Rejected(reasons.clone()), inner.origin),
            }
        };
        let (settlement, origin) = settled;
        self.schedule(subscriber, settlement, origin);
    }

    fn schedule(&self, subscriber: Subscriber, settlement: Settlement, origin: &'static Location<'static>) {
        self.scheduler
            .defer(Box::new(move || run_subscriber(subscriber, settlement, origin)));
    }

    fn is_same(&self, other: &Promise) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Moves the promise to its terminal state and dispatches subscribers.
    fn settle(&self, settlement: Settlement, origin: &'static Location<'static>) {
        let subscribers = {
            let mut inner = self.inner.borrow_mut();
            inner.state = match &settlement {
                Settlement::Resolved(values) => State::Resolved(values.clone()),
                Settlement::Rejected(reasons) => State::Rejected(reasons.clone()),
            };
            inner.origin = origin;
            std::mem::take(&mut inner.subscribers)
        };

        if subscribers.is_empty() {
            if let Settlement::Rejected(_) = settlement {
                self.check_unhandled_later();
            }
            return;
        }
        for subscriber in subscribers {
            self.schedule(subscriber, settlement.clone(), origin);
        }
    }

    fn check_unhandled_later(&self) {
        let promise = self.inner.clone();
        let scheduler = self.scheduler.clone();
        self.scheduler.defer(Box::new(move || {
            let rejection = {
                let inner = promise.borrow();
                match &inner.state {
                    State::Rejected(reasons) if !inner.handled => {
                        UnhandledRejection::new(reasons.clone(), inner.origin)
                    }
                    _ => return,
                }
            };
            scheduler.report_unhandled(rejection);
        }));
    }

    fn resolve_with(&self, values: Vec<Awaitable>, origin: &'static Location<'static>) -> Result<(), PromiseError> {
        {
            let inner = self.inner.borrow();
            match &inner.state {
                State::Pending => {}
                State::Following(adopted) => {
                    return if same_adoption(adopted, &values) {
                        Ok(())
                    } else {
                        Err(PromiseError::AlreadyFollowing)
                    };
                }
                State::Rejected(_) => return Err(PromiseError::AlreadyRejected),
                State::Resolved(existing) => {
                    return if same_values(existing, &values) {
                        Ok(())
                    } else {
                        Err(PromiseError::AlreadyResolved)
                    };
                }
            }
        }

        if values.iter().any(|v| matches!(v, Awaitable::Promise(p) if p.is_same(self))) {
            let envelope = ErrorEnvelope::new("TypeError", "a promise cannot be resolved with itself")
                .with_backtrace(vec![origin.to_string()]);
            self.settle(Settlement::Rejected(vec![envelope.to_value()]), origin);
            return Ok(());
        }

        if !values.iter().any(|v| matches!(v, Awaitable::Promise(_))) {
            let plain = values
                .into_iter()
                .filter_map(|v| match v {
                    Awaitable::Value(value) => Some(value),
                    Awaitable::Promise(_) => None,
                })
                .collect();
            self.settle(Settlement::Resolved(plain), origin);
            return Ok(());
        }

        let adopted = values
            .iter()
            .map(|v| match v {
                Awaitable::Value(value) => Adopted::Value(value.clone()),
                Awaitable::Promise(p) => Adopted::Promise(Rc::downgrade(&p.inner)),
            })
            .collect();
        self.inner.borrow_mut().state = State::Following(adopted);
        let follower = self.clone();
        let adopt = move |settlement: Settlement| follower.settle(settlement, origin);

        // A lone promise is adopted as is; mixed values go through `all`.
        if let [Awaitable::Promise(target)] = values.as_slice() {
            target.observe(adopt);
            return Ok(());
        }
        Promise::all(self.scheduler.clone(), values).observe(move |settlement| match settlement {
            Settlement::Resolved(mut results) => {
                let spread = match results.pop() {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                adopt(Settlement::Resolved(spread));
            }
            rejected => adopt(rejected),
        });
        Ok(())
    }

    fn reject_with(&self, reasons: Vec<Value>, origin: &'static Location<'static>) -> Result<(), PromiseError> {
        {
            let inner = self.inner.borrow();
            match &inner.state {
                State::Pending => {}
                State::Following(_) => return Err(PromiseError::AlreadyFollowing),
                State::Resolved(_) => return Err(PromiseError::AlreadyResolved),
                State::Rejected(existing) => {
                    return if *existing == reasons {
                        Ok(())
                    } else {
                        Err(PromiseError::AlreadyRejected)
                    };
                }
            }
        }
        self.settle(Settlement::Rejected(reasons), origin);
        Ok(())
    }
}

fn same_adoption(adopted: &[Adopted], values: &[Awaitable]) -> bool {
    adopted.len() == values.len()
        && adopted.iter().zip(values).all(|(a, b)| match (a, b) {
            (Adopted::Value(a), Awaitable::Value(b)) => a == b,
            (Adopted::Promise(a), Awaitable::Promise(b)) => a.as_ptr() == Rc::as_ptr(&b.inner),
            _ => false,
        })
}

fn same_values(existing: &[Value], values: &[Awaitable]) -> bool {
    existing.len() == values.len()
        && existing.iter().zip(values).all(|(a, b)| match b {
            Awaitable::Value(b) => a == b,
            Awaitable::Promise(_) => false,
        })
}

fn reaction<F, R>(callback: F) -> Reaction
where
    F: FnOnce(Vec<Value>) -> R + 'static,
    R: IntoOutcome,
{
    Box::new(move |values| callback(values).into_outcome())
}

fn run_subscriber(subscriber: Subscriber, settlement: Settlement, origin: &'static Location<'static>) {
    let (on_resolve, on_reject, downstream) = match subscriber {
        Subscriber::Observe(observer) => return observer(settlement),
        Subscriber::Chain {
            on_resolve,
            on_reject,
            downstream,
        } => (on_resolve, on_reject, downstream),
    };

    let outcome = match (settlement, on_resolve, on_reject) {
        (Settlement::Resolved(values), Some(reaction), _) => reaction(values),
        (Settlement::Rejected(reasons), _, Some(reaction)) => reaction(reasons),
        (Settlement::Resolved(values), None, _) => {
            let _ = downstream.promise.resolve_with(values.into_iter().map(Awaitable::Value).collect(), origin);
            return;
        }
        (Settlement::Rejected(reasons), _, None) => {
            let _ = downstream.promise.reject_with(reasons, origin);
            return;
        }
    };

    let result = match outcome {
        Ok(values) => downstream.promise.resolve_with(values, origin),
        Err(envelope) => {
            error!(error = %envelope, "Promise reaction failed");
            downstream.promise.reject_with(vec![envelope.to_value()], origin)
        }
    };
    if let Err(e) = result {
        debug!(error = %e, "Downstream promise already settled");
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// The settling half of a promise.
#[derive(Clone)]
pub struct Resolver {
    promise: Promise,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver").field("promise", &self.promise).finish()
    }
}

impl Resolver {
    /// The promise this resolver settles.
    pub fn promise(&self) -> Promise {
        self.promise.clone()
    }

    /// Resolves the promise.
    ///
    /// If any value is a promise the receiver follows it (all of them, when
    /// several) and settles once they have. Resolving again with identical
    /// plain values is a no-op; anything else after settlement is an error.
    #[track_caller]
    pub fn resolve<I>(&self, values: I) -> Result<(), PromiseError>
    where
        I: IntoIterator,
        I::Item: Into<Awaitable>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.promise.resolve_with(values, Location::caller())
    }

    /// Rejects the promise with `reasons`.
    #[track_caller]
    pub fn reject<I>(&self, reasons: I) -> Result<(), PromiseError>
    where
        I: IntoIterator<Item = Value>,
    {
        self.promise
            .reject_with(reasons.into_iter().collect(), Location::caller())
    }

    /// Settles the promise from a reaction-style [`Outcome`].
    #[track_caller]
    pub fn settle(&self, outcome: Outcome) -> Result<(), PromiseError> {
        match outcome {
            Ok(values) => self.promise.resolve_with(values, Location::caller()),
            Err(envelope) => self
                .promise
                .reject_with(vec![envelope.to_value()], Location::caller()),
        }
    }
}
