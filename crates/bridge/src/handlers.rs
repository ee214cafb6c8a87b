//! Named callback registry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

use crate::context::CallContext;
use crate::{ErrorEnvelope, HandlerName};

/// A persistent handler body.
pub type HandlerFn = dyn Fn(&CallContext, Vec<Value>) -> Result<(), ErrorEnvelope>;

/// A single-use handler body.
pub type OnceHandlerFn = dyn FnOnce(&CallContext, Vec<Value>) -> Result<(), ErrorEnvelope>;

/// A registered callback.
pub enum Callback {
    /// Stays registered until replaced or removed.
    Persistent(Rc<HandlerFn>),
    /// Removed from the registry right before its first invocation.
    Once(Box<OnceHandlerFn>),
}

impl Callback {
    /// Wraps a persistent handler.
    pub fn persistent<F>(handler: F) -> Self
    where
        F: Fn(&CallContext, Vec<Value>) -> Result<(), ErrorEnvelope> + 'static,
    {
        Self::Persistent(Rc::new(handler))
    }

    /// Wraps a single-use handler.
    pub fn once<F>(handler: F) -> Self
    where
        F: FnOnce(&CallContext, Vec<Value>) -> Result<(), ErrorEnvelope> + 'static,
    {
        Self::Once(Box::new(handler))
    }

    /// Runs the callback.
    pub fn invoke(self, context: &CallContext, parameters: Vec<Value>) -> Result<(), ErrorEnvelope> {
        match self {
            Self::Persistent(handler) => handler(context, parameters),
            Self::Once(handler) => handler(context, parameters),
        }
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Persistent(_) => f.write_str("Callback::Persistent"),
            Self::Once(_) => f.write_str("Callback::Once"),
        }
    }
}

/// Mapping from handler name to callback.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: RefCell<HashMap<HandlerName, Callback>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback`, replacing any previous registration.
    pub fn insert(&self, name: HandlerName, callback: Callback) {
        self.handlers.borrow_mut().insert(name, callback);
    }

    /// Removes a registration. Returns whether one existed.
    pub fn remove(&self, name: &str) -> bool {
        let key = HandlerName::new(name);
        key.is_some_and(|key| self.handlers.borrow_mut().remove(&key).is_some())
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        HandlerName::new(name).is_some_and(|key| self.handlers.borrow().contains_key(&key))
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.handlers.borrow().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.handlers.borrow().is_empty()
    }

    /// Fetches the callback for `name` for one invocation.
    ///
    /// A single-use registration is removed here, before the caller runs it,
    /// so a reentrant dispatch of the same name already finds it gone.
    pub fn take(&self, name: &str) -> Option<Callback> {
        let key = HandlerName::new(name)?;
        let mut handlers = self.handlers.borrow_mut();
        if let Callback::Persistent(handler) = handlers.get(&key)? {
            return Some(Callback::Persistent(handler.clone()));
        }
        handlers.remove(&key)
    }
}
