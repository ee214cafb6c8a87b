//! `all` and `race`.

use std::cell::{Cell, RefCell};
use std::panic::Location;
use std::rc::Rc;

use serde_json::Value;

use super::{Awaitable, Promise, PromiseState, SchedulerRef, Settlement};

impl Promise {
    /// Resolves once every input has resolved, rejects with the first rejection.
    ///
    /// The promise resolves with a single array holding one entry per input,
    /// in input order. Each input's values collapse to one entry: no values
    /// become `null`, a single value stays as is, several become an array.
    /// Plain values pass through. An empty input resolves with `[]`.
    #[track_caller]
    pub fn all<I>(scheduler: SchedulerRef, inputs: I) -> Promise
    where
        I: IntoIterator,
        I::Item: Into<Awaitable>,
    {
        let origin = Location::caller();
        let inputs: Vec<Awaitable> = inputs.into_iter().map(Into::into).collect();
        let (combined, _resolver) = Promise::deferred(scheduler);

        let results = Rc::new(RefCell::new(vec![Value::Null; inputs.len()]));
        let remaining = Rc::new(Cell::new(inputs.len()));

        let finish = {
            let combined = combined.clone();
            let results = results.clone();
            move || {
                let values = std::mem::take(&mut *results.borrow_mut());
                combined.settle(Settlement::Resolved(vec![Value::Array(values)]), origin);
            }
        };
        let finish = Rc::new(finish);

        for (index, input) in inputs.into_iter().enumerate() {
            match input {
                Awaitable::Value(value) => {
                    results.borrow_mut()[index] = value;
                    remaining.set(remaining.get() - 1);
                }
                Awaitable::Promise(promise) => {
                    let combined = combined.clone();
                    let results = results.clone();
                    let remaining = remaining.clone();
                    let finish = finish.clone();
                    promise.observe(move |settlement| {
                        if combined.state() != PromiseState::Pending {
                            return;
                        }
                        match settlement {
                            Settlement::Resolved(values) => {
                                results.borrow_mut()[index] = collapse(values);
                                remaining.set(remaining.get() - 1);
                                if remaining.get() == 0 {
                                    finish();
                                }
                            }
                            rejected => combined.settle(rejected, origin),
                        }
                    });
                }
            }
        }

        if remaining.get() == 0 {
            finish();
        }
        combined
    }

    /// Settles like whichever input settles first.
    ///
    /// A plain value among the inputs wins immediately. An empty input never
    /// settles.
    #[track_caller]
    pub fn race<I>(scheduler: SchedulerRef, inputs: I) -> Promise
    where
        I: IntoIterator,
        I::Item: Into<Awaitable>,
    {
        let origin = Location::caller();
        let inputs: Vec<Awaitable> = inputs.into_iter().map(Into::into).collect();
        let (winner, _resolver) = Promise::deferred(scheduler);

        let first_plain = inputs.iter().find_map(|input| match input {
            Awaitable::Value(value) => Some(value.clone()),
            Awaitable::Promise(_) => None,
        });
        if let Some(value) = first_plain {
            winner.settle(Settlement::Resolved(vec![value]), origin);
        }

        for input in inputs {
            if let Awaitable::Promise(promise) = input {
                let winner = winner.clone();
                promise.observe(move |settlement| {
                    if winner.state() == PromiseState::Pending {
                        winner.settle(settlement, origin);
                    }
                });
            }
        }
        winner
    }
}

fn collapse(mut values: Vec<Value>) -> Value {
    match values.len() {
        0 => Value::Null,
        1 => values.remove(0),
        _ => Value::Array(values),
    }
}
