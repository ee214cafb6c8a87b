//! The request handler facade.
//!
//! A [`Bridge`] pairs a local handler registry with a transport adapter. It is
//! the only type most callers touch:
//!
//! | Operation | Direction | Effect |
//! |-----------|-----------|--------|
//! | [`Bridge::on`] / [`Bridge::once`] / [`Bridge::off`] | local | (un)register a named handler |
//! | [`Bridge::call`] | outbound | fire-and-forget message |
//! | [`Bridge::get`] | outbound | request; returns a [`Promise`] for the remote handler's answer |
//! | [`Bridge::invoke`] | outbound | ask the remote side to run an exposed function |
//! | [`Bridge::expose`] | local | publish a function for the remote side's `invoke` |
//! | [`Bridge::receive_string`] | inbound | decode and dispatch one payload |
//!
//! ## Reserved names
//!
//! Everything under `<namespace>.` is reserved for the protocol and cannot be
//! registered by user code. The built-in handlers are:
//!
//! - `<ns>.receive [id, {success, parameters}]`: response to a request.
//! - `<ns>.ack [id]`: the remote side accepted a message (throttled transport).
//! - `<ns>.get [handler, function, ...parameters]`: run an exposed function
//!   and report back to `handler`.
//! - `<ns>.puts [...values]`: debug sink, logged under `bridge::puts`.
//! - `<ns>.error [type, message, backtrace]`: remote error report, logged
//!   under `bridge::remote`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::Codec;
use crate::config::BridgeConfig;
use crate::context::{CallContext, ResponseContext};
use crate::correlation::ResponseHandler;
use crate::handlers::{Callback, HandlerRegistry};
use crate::promise::{IntoOutcome, Promise, Resolver, SchedulerRef};
use crate::transport::{
    Delivery, DirectTransport, LocalFunction, QueuedTransport, SideBand, Transport,
};
use crate::{BridgeError, ErrorEnvelope, HandlerName, Message, MessageId, Response};

/// Which adapter carries this side's outbound messages.
pub enum TransportSelection {
    /// Unthrottled delivery through [`DirectTransport`].
    Direct(Box<dyn Delivery>),
    /// Queued, ack-gated delivery through [`QueuedTransport`].
    Queued(Rc<dyn SideBand>),
}

impl std::fmt::Debug for TransportSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct(_) => f.write_str("TransportSelection::Direct"),
            Self::Queued(_) => f.write_str("TransportSelection::Queued"),
        }
    }
}

struct ReservedNames {
    receive: String,
    ack: String,
    get: String,
    puts: String,
    error: String,
}

impl ReservedNames {
    fn new(config: &BridgeConfig) -> Self {
        Self {
            receive: config.reserved("receive"),
            ack: config.reserved("ack"),
            get: config.reserved("get"),
            puts: config.reserved("puts"),
            error: config.reserved("error"),
        }
    }
}

struct BridgeInner {
    config: BridgeConfig,
    names: ReservedNames,
    codec: Rc<dyn Codec>,
    transport: Box<dyn Transport>,
    handlers: HandlerRegistry,
    functions: RefCell<HashMap<String, LocalFunction>>,
    scheduler: SchedulerRef,
}

/// One side of the bridge. Clones share the same instance.
#[derive(Clone)]
pub struct Bridge {
    inner: Rc<BridgeInner>,
}

/// A non-owning handle to a [`Bridge`].
#[derive(Clone)]
pub struct WeakBridge {
    inner: Weak<BridgeInner>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("namespace", &self.inner.config.namespace)
            .field("transport", &self.inner.transport.name())
            .field("codec", &self.inner.codec.name())
            .field("handlers", &self.inner.handlers.len())
            .field("pending_responses", &self.inner.transport.pending_responses())
            .finish()
    }
}

impl Bridge {
    /// Creates a bridge over the selected transport.
    ///
    /// Fails if the configuration is invalid, or if it asks this side to
    /// acknowledge inbound messages while sending through the throttled
    /// adapter (the acks would wait behind the messages they release).
    pub fn new(
        config: BridgeConfig,
        scheduler: SchedulerRef,
        selection: TransportSelection,
    ) -> Result<Self, BridgeError> {
        config.validate()?;
        if config.acknowledge_inbound && matches!(selection, TransportSelection::Queued(_)) {
            return Err(BridgeError::Configuration {
                message: "acknowledge_inbound cannot be combined with the queued transport".to_string(),
            });
        }

        let codec = config.codec.build();
        let transport: Box<dyn Transport> = match selection {
            TransportSelection::Direct(delivery) => Box::new(DirectTransport::new(
                delivery,
                codec.clone(),
                scheduler.clone(),
            )),
            TransportSelection::Queued(side_band) => Box::new(QueuedTransport::new(
                side_band,
                codec.clone(),
                scheduler.clone(),
            )),
        };

        let bridge = Self {
            inner: Rc::new(BridgeInner {
                names: ReservedNames::new(&config),
                config,
                codec,
                transport,
                handlers: HandlerRegistry::new(),
                functions: RefCell::new(HashMap::new()),
                scheduler,
            }),
        };
        bridge.install_builtins();
        info!(
            namespace = %bridge.inner.config.namespace,
            transport = bridge.inner.transport.name(),
            codec = bridge.inner.codec.name(),
            "Bridge created"
        );
        Ok(bridge)
    }

    /// A non-owning handle to this bridge.
    pub fn downgrade(&self) -> WeakBridge {
        WeakBridge {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// The configuration this bridge was built with.
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// The scheduler driving this bridge's promises.
    pub fn scheduler(&self) -> SchedulerRef {
        self.inner.scheduler.clone()
    }

    /// Name of the active transport adapter.
    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.name()
    }

    /// Number of outbound requests still waiting for a response.
    pub fn pending_responses(&self) -> usize {
        self.inner.transport.pending_responses()
    }

    /// Whether a handler is registered under `name`.
    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.handlers.contains(name)
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Registers `callback` under `name`, replacing any previous handler.
    pub fn on<F>(&self, name: &str, callback: F) -> Result<(), BridgeError>
    where
        F: Fn(&CallContext, Vec<Value>) -> Result<(), ErrorEnvelope> + 'static,
    {
        let name = self.registrable(name)?;
        self.inner.handlers.insert(name, Callback::persistent(callback));
        Ok(())
    }

    /// Registers `callback` for a single invocation.
    pub fn once<F>(&self, name: &str, callback: F) -> Result<(), BridgeError>
    where
        F: FnOnce(&CallContext, Vec<Value>) -> Result<(), ErrorEnvelope> + 'static,
    {
        let name = self.registrable(name)?;
        self.inner.handlers.insert(name, Callback::once(callback));
        Ok(())
    }

    /// Registers a handler whose return value answers the request.
    ///
    /// The result (a value, several values, a promise, or an error) is sent
    /// back when the sender waits for a response. For notifications an error
    /// is only logged.
    pub fn handle<F, R>(&self, name: &str, function: F) -> Result<(), BridgeError>
    where
        F: Fn(Vec<Value>) -> R + 'static,
        R: IntoOutcome,
    {
        self.on(name, move |context, parameters| {
            let outcome = function(parameters).into_outcome();
            match (context.responder(), outcome) {
                (_, Err(envelope)) => Err(envelope),
                (Some(responder), ok) => {
                    // Logged by `settle` when the handler answered already.
                    let _ = responder.settle(ok);
                    Ok(())
                }
                (None, Ok(_)) => Ok(()),
            }
        })
    }

    /// Removes the handler registered under `name`, if any.
    pub fn off(&self, name: &str) -> Result<(), BridgeError> {
        self.registrable(name)?;
        self.inner.handlers.remove(name);
        Ok(())
    }

    /// Publishes a local function the remote side may run through `invoke`.
    pub fn expose<F, R>(&self, name: &str, function: F) -> Result<(), BridgeError>
    where
        F: Fn(Vec<Value>) -> R + 'static,
        R: IntoOutcome,
    {
        validate_identifier(name)?;
        let function: LocalFunction = Rc::new(move |parameters| function(parameters).into_outcome());
        self.inner
            .functions
            .borrow_mut()
            .insert(name.to_string(), function);
        Ok(())
    }

    /// Withdraws an exposed function. Returns whether it was exposed.
    pub fn unexpose(&self, name: &str) -> bool {
        self.inner.functions.borrow_mut().remove(name).is_some()
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Sends a fire-and-forget message to the remote handler `name`.
    pub fn call(&self, name: &str, parameters: Vec<Value>) -> Result<(), BridgeError> {
        validate_identifier(name)?;
        self.inner
            .transport
            .send(Message::notification(name, parameters), None)
    }

    /// Sends a request to the remote handler `name`.
    ///
    /// The promise resolves with the values the remote handler resolves its
    /// response context with, or rejects with its rejection reasons (an
    /// [`ErrorEnvelope`] for faults).
    pub fn get(&self, name: &str, parameters: Vec<Value>) -> Result<Promise, BridgeError> {
        validate_identifier(name)?;
        let (promise, resolver) = Promise::deferred(self.scheduler());
        let settler = self.register_settler(resolver)?;

        let bridge = self.downgrade();
        let on_response: ResponseHandler = Box::new(move |response| {
            let mut parameters = vec![Value::Bool(response.success)];
            parameters.extend(response.parameters);
            bridge.dispatch_internal(settler.as_str(), parameters)
        });
        if let Err(e) = self
            .inner
            .transport
            .send(Message::request(name, parameters), Some(on_response))
        {
            // The pending handler has already rejected the promise.
            warn!(name = %name, error = %e, "Failed to send request");
        }
        Ok(promise)
    }

    /// Asks the remote side to run its exposed function `function_name`.
    ///
    /// The promise settles with the function's result once the remote side
    /// reports back.
    pub fn invoke(&self, function_name: &str, parameters: Vec<Value>) -> Result<Promise, BridgeError> {
        validate_identifier(function_name)?;
        let (promise, resolver) = Promise::deferred(self.scheduler());
        let settler = self.register_settler(resolver)?;

        let mut arguments = vec![json!(settler.as_str()), json!(function_name)];
        arguments.extend(parameters);
        let message = Message::notification(self.inner.names.get.as_str(), arguments);
        if let Err(e) = self.inner.transport.send(message, None) {
            self.inner.handlers.remove(settler.as_str());
            return Err(e);
        }
        Ok(promise)
    }

    /// Sends values to the remote debug sink.
    pub fn puts(&self, values: Vec<Value>) -> Result<(), BridgeError> {
        self.call(&self.inner.names.puts, values)
    }

    /// Reports an error to the remote error sink.
    pub fn error(&self, envelope: &ErrorEnvelope) -> Result<(), BridgeError> {
        self.call(
            &self.inner.names.error,
            vec![
                json!(envelope.error_type),
                json!(envelope.message),
                json!(envelope.backtrace),
            ],
        )
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Decodes and dispatches one payload from the remote side.
    ///
    /// Never fails: problems are logged, and a sender waiting for a response
    /// is answered with an error envelope.
    pub fn receive_string(&self, payload: &str) {
        let value = match self.inner.codec.decode(payload) {
            Ok(value) => value,
            Err(e) => {
                error!(codec = self.inner.codec.name(), error = %e, "Failed to decode inbound payload");
                self.acknowledge_inbound(None);
                return;
            }
        };

        let raw_id = value.get("id").and_then(Value::as_u64).map(MessageId::new);
        let waiting_id = Message::waiting_id(&value);
        let message = match Message::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                error!(id = ?raw_id, error = %e, "Rejecting malformed message");
                if let Some(id) = waiting_id {
                    if let Err(send_error) = self.respond(id, Response::failure(vec![e.to_envelope().to_value()])) {
                        error!(id = %id, error = %send_error, "Failed to report malformed message");
                    }
                }
                self.acknowledge_inbound(raw_id);
                return;
            }
        };

        let is_ack = message.name == self.inner.names.ack;
        let id = message.id;
        self.dispatch_message(message);
        if !is_ack {
            self.acknowledge_inbound(id);
        }
    }

    /// Routes a response to the request it answers.
    pub fn receive_response(&self, id: MessageId, response: Response) {
        self.inner.transport.receive(id, response);
    }

    /// Releases the throttled transport's send gate.
    pub fn acknowledge(&self, id: Option<MessageId>) {
        self.inner.transport.acknowledge(id);
    }

    fn dispatch_message(&self, message: Message) {
        let Message {
            id,
            name,
            parameters,
            expects_callback,
        } = message;
        let context = match (expects_callback, id) {
            (true, Some(id)) => CallContext::Request(ResponseContext::new(self, id)),
            (true, None) => {
                warn!(name = %name, "Request without id cannot be answered");
                CallContext::Notification(self.clone())
            }
            (false, _) => CallContext::Notification(self.clone()),
        };

        debug!(name = %name, id = ?id, expects_callback, "Dispatching message");
        if let Err(error) = self.dispatch(&name, &context, parameters) {
            if let Some(responder) = context.responder() {
                if let Err(e) = responder.reject_error(error.to_envelope()) {
                    debug!(id = %responder.id(), error = %e, "Response already settled");
                }
            }
            error!(name = %name, id = ?id, error = %error, "Handler failed");
        }
    }

    fn dispatch(&self, name: &str, context: &CallContext, parameters: Vec<Value>) -> Result<(), BridgeError> {
        let callback = self
            .inner
            .handlers
            .take(name)
            .ok_or_else(|| BridgeError::NoSuchHandler { name: name.to_string() })?;
        callback
            .invoke(context, parameters)
            .map_err(|envelope| BridgeError::HandlerFault {
                name: name.to_string(),
                envelope,
            })
    }

    pub(crate) fn respond(&self, id: MessageId, response: Response) -> Result<(), BridgeError> {
        let message = Message::notification(
            self.inner.names.receive.as_str(),
            vec![json!(id), response.to_value()],
        );
        self.inner.transport.send(message, None)
    }

    fn acknowledge_inbound(&self, id: Option<MessageId>) {
        if !self.inner.config.acknowledge_inbound {
            return;
        }
        let parameters = id.map(|id| vec![json!(id)]).unwrap_or_default();
        let message = Message::notification(self.inner.names.ack.as_str(), parameters);
        if let Err(e) = self.inner.transport.send(message, None) {
            error!(id = ?id, error = %e, "Failed to acknowledge inbound message");
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn registrable(&self, name: &str) -> Result<HandlerName, BridgeError> {
        let handler_name =
            HandlerName::new(name).ok_or_else(|| BridgeError::invalid_argument("handler name must not be empty"))?;
        if self.inner.config.is_reserved(name) {
            return Err(BridgeError::invalid_argument(format!(
                "handler name `{name}` is reserved"
            )));
        }
        Ok(handler_name)
    }

    fn mint_handler_name(&self) -> Result<HandlerName, BridgeError> {
        for _ in 0..self.inner.config.handler_name_attempts {
            let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
            let candidate = self.inner.config.reserved(&format!("resolve/reject_{suffix}"));
            if !self.inner.handlers.contains(&candidate) {
                if let Some(name) = HandlerName::new(candidate) {
                    return Ok(name);
                }
            }
        }
        Err(BridgeError::invalid_argument(
            "could not mint a unique response handler name",
        ))
    }

    /// Registers a single-use handler that settles `resolver` from
    /// `[success, ...values]`.
    fn register_settler(&self, resolver: Resolver) -> Result<HandlerName, BridgeError> {
        let name = self.mint_handler_name()?;
        self.inner.handlers.insert(
            name.clone(),
            Callback::once(move |_, parameters| {
                let mut parameters = parameters.into_iter();
                let success = parameters.next().is_some_and(|flag| truthy(&flag));
                let result = if success {
                    resolver.resolve(parameters)
                } else {
                    resolver.reject(parameters)
                };
                result.map_err(ErrorEnvelope::from)
            }),
        );
        Ok(name)
    }

    fn lookup_function(&self, name: &str) -> Result<LocalFunction, ErrorEnvelope> {
        self.inner
            .functions
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| ErrorEnvelope::new("ReferenceError", format!("`{name}` is not defined")))
    }

    fn install(&self, name: &str, callback: Callback) {
        if let Some(name) = HandlerName::new(name) {
            self.inner.handlers.insert(name, callback);
        }
    }

    fn install_builtins(&self) {
        let names = &self.inner.names;

        self.install(
            &names.receive,
            Callback::persistent(|context, parameters| {
                let mut parameters = parameters.into_iter();
                let id = parameters
                    .next()
                    .and_then(|id| id.as_u64())
                    .map(MessageId::new)
                    .ok_or_else(|| malformed("response without a message id"))?;
                match Response::from_value(parameters.next().unwrap_or(Value::Null)) {
                    Ok(response) => {
                        context.recipient().receive_response(id, response);
                        Ok(())
                    }
                    Err(e) => {
                        // The waiting request still has to settle.
                        let envelope = e.to_envelope();
                        context
                            .recipient()
                            .receive_response(id, Response::failure(vec![envelope.to_value()]));
                        Err(envelope)
                    }
                }
            }),
        );

        self.install(
            &names.ack,
            Callback::persistent(|context, parameters| {
                let id = parameters.first().and_then(Value::as_u64).map(MessageId::new);
                context.recipient().acknowledge(id);
                Ok(())
            }),
        );

        self.install(
            &names.get,
            Callback::persistent(|context, parameters| {
                let mut parameters = parameters.into_iter();
                let handler = string_parameter(parameters.next(), "response handler name")?;
                let function = string_parameter(parameters.next(), "function name")?;
                let bridge = context.recipient();
                let target = bridge.lookup_function(&function);
                debug!(function = %function, handler = %handler, "Invoking exposed function");
                bridge
                    .inner
                    .transport
                    .get(&handler, target, parameters.collect());
                Ok(())
            }),
        );

        self.install(
            &names.puts,
            Callback::persistent(|_, parameters| {
                info!(target: "bridge::puts", "{}", inspect_line(&parameters));
                Ok(())
            }),
        );

        self.install(
            &names.error,
            Callback::persistent(|_, parameters| {
                let mut parameters = parameters.into_iter();
                let error_type = parameters.next().unwrap_or(Value::Null);
                let error_type = error_type.as_str().unwrap_or("Error").to_string();
                let message = parameters.next().map(|m| display_value(&m)).unwrap_or_default();
                let backtrace = parameters.next().unwrap_or(Value::Null);
                let envelope = ErrorEnvelope::from_value(&json!({
                    "type": error_type,
                    "message": message,
                    "backtrace": backtrace,
                }))
                .unwrap_or_else(|| ErrorEnvelope::new(error_type, message));
                error!(
                    target: "bridge::remote",
                    error_type = %envelope.error_type,
                    remote_message = %envelope.message,
                    backtrace = ?envelope.backtrace,
                    "Remote error"
                );
                Ok(())
            }),
        );
    }
}

impl WeakBridge {
    /// The bridge, if it is still alive.
    pub fn upgrade(&self) -> Option<Bridge> {
        self.inner.upgrade().map(|inner| Bridge { inner })
    }

    pub(crate) fn respond(&self, id: MessageId, response: Response) -> Result<(), BridgeError> {
        match self.upgrade() {
            Some(bridge) => bridge.respond(id, response),
            None => {
                debug!(id = %id, "Bridge dropped before the response was sent");
                Ok(())
            }
        }
    }

    fn dispatch_internal(&self, name: &str, parameters: Vec<Value>) -> Result<(), BridgeError> {
        let Some(bridge) = self.upgrade() else {
            return Ok(());
        };
        let context = CallContext::Notification(bridge.clone());
        bridge.dispatch(name, &context, parameters)
    }
}

impl std::fmt::Debug for WeakBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakBridge")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// Names sent over the wire must look like (dotted) identifiers.
fn validate_identifier(name: &str) -> Result<(), BridgeError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(BridgeError::invalid_argument(format!(
            "`{name}` is not a valid identifier"
        )))
    }
}

fn malformed(message: &str) -> ErrorEnvelope {
    BridgeError::MalformedPayload {
        message: message.to_string(),
    }
    .to_envelope()
}

fn string_parameter(value: Option<Value>, what: &str) -> Result<String, ErrorEnvelope> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        _ => Err(malformed(&format!("missing {what}"))),
    }
}

fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

// Each argument in its wire form, so strings appear quoted.
fn inspect_line(parameters: &[Value]) -> String {
    parameters.iter().map(Value::to_string).collect::<Vec<_>>().join(" ")
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("add").is_ok());
        assert!(validate_identifier("Module.method_2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("alert('x')").is_err());
        assert!(validate_identifier("a b").is_err());
    }

    #[test]
    fn test_truthy_follows_script_semantics() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!(0)));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&Value::Null));
    }

    #[test]
    fn test_display_value_unquotes_strings() {
        assert_eq!(display_value(&json!("hi")), "hi");
        assert_eq!(display_value(&json!({"a": 1})), "{\"a\":1}");
    }

    #[test]
    fn test_inspect_line_quotes_strings() {
        let line = inspect_line(&[json!("value"), json!(1), json!({"a": "b"}), Value::Null]);
        assert_eq!(line, r#""value" 1 {"a":"b"} null"#);
    }
}
