//! End-to-end tests: two bridges wired together on one event loop.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bridge::transport::{Delivery, SideBand};
use bridge::{
    Bridge, BridgeConfig, BridgeError, CodecKind, ErrorEnvelope, EventLoop, Promise,
    ResponseContext, Scheduler, TransportSelection, Value, WeakBridge,
};
use serde_json::json;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Delivers to the peer bridge on the next event-loop turn.
#[derive(Default)]
struct Wire {
    peer: RefCell<Option<WeakBridge>>,
    event_loop: RefCell<Option<Rc<EventLoop>>>,
    sent: RefCell<Vec<String>>,
}

impl Wire {
    fn connect(&self, event_loop: &Rc<EventLoop>, peer: &Bridge) {
        *self.event_loop.borrow_mut() = Some(event_loop.clone());
        *self.peer.borrow_mut() = Some(peer.downgrade());
    }

    fn sent(&self) -> Vec<Value> {
        self.sent
            .borrow()
            .iter()
            .map(|p| serde_json::from_str(p).expect("json"))
            .collect()
    }
}

/// Local handle so the foreign `Delivery` trait can be implemented for a
/// shared `Wire` (orphan rule forbids `impl Delivery for Rc<Wire>` here).
struct WireLink(Rc<Wire>);

impl std::ops::Deref for WireLink {
    type Target = Wire;
    fn deref(&self) -> &Wire {
        &self.0
    }
}

impl Delivery for WireLink {
    fn deliver(&self, payload: String) -> Result<(), BridgeError> {
        self.sent.borrow_mut().push(payload.clone());
        let peer = self.peer.borrow().clone();
        if let (Some(peer), Some(event_loop)) = (peer, self.event_loop.borrow().as_ref()) {
            event_loop.defer(Box::new(move || {
                if let Some(bridge) = peer.upgrade() {
                    bridge.receive_string(&payload);
                }
            }));
        }
        Ok(())
    }
}

/// A one-slot side band that hands the stored payload to the peer on signal.
#[derive(Default)]
struct Slot {
    peer: RefCell<Option<WeakBridge>>,
    payload: RefCell<Option<String>>,
    overwritten: Cell<usize>,
    signals: Cell<usize>,
}

impl SideBand for Slot {
    fn store(&self, payload: String) {
        if self.payload.borrow_mut().replace(payload).is_some() {
            self.overwritten.set(self.overwritten.get() + 1);
        }
    }

    fn signal(&self) {
        self.signals.set(self.signals.get() + 1);
        let payload = self.payload.borrow().clone();
        let peer = self.peer.borrow().as_ref().and_then(WeakBridge::upgrade);
        if let (Some(payload), Some(peer)) = (payload, peer) {
            peer.receive_string(&payload);
        }
    }

    fn clear_outbound(&self) {
        self.payload.borrow_mut().take();
    }
}

struct Pair {
    event_loop: Rc<EventLoop>,
    host: Bridge,
    page: Bridge,
    to_page: Rc<Wire>,
    to_host: Rc<Wire>,
}

fn direct_pair(codec: CodecKind) -> Pair {
    let event_loop = EventLoop::new();
    let config = BridgeConfig {
        codec,
        ..BridgeConfig::default()
    };
    let to_page = Rc::new(Wire::default());
    let to_host = Rc::new(Wire::default());
    let host = Bridge::new(
        config.clone(),
        event_loop.clone(),
        TransportSelection::Direct(Box::new(WireLink(to_page.clone()))),
    )
    .expect("host");
    let page = Bridge::new(
        config,
        event_loop.clone(),
        TransportSelection::Direct(Box::new(WireLink(to_host.clone()))),
    )
    .expect("page");
    to_page.connect(&event_loop, &page);
    to_host.connect(&event_loop, &host);
    Pair {
        event_loop,
        host,
        page,
        to_page,
        to_host,
    }
}

fn settled(event_loop: &EventLoop, promise: &Promise) -> Result<Vec<Value>, BridgeError> {
    event_loop.run_until_idle();
    promise.settlement().expect("settled").into_result()
}

fn remote_type(result: Result<Vec<Value>, BridgeError>) -> String {
    match result {
        Err(BridgeError::Remote(envelope)) => envelope.error_type,
        other => panic!("expected a remote error, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[test]
fn test_get_resolves_with_remote_result() {
    let pair = direct_pair(CodecKind::Json);
    pair.page
        .handle("add", |params: Vec<Value>| {
            json!(params.iter().filter_map(Value::as_i64).sum::<i64>())
        })
        .expect("register");

    let promise = pair.host.get("add", vec![json!(4), json!(2)]).expect("get");
    assert_eq!(settled(&pair.event_loop, &promise).expect("resolved"), vec![json!(6)]);
    assert_eq!(pair.host.pending_responses(), 0);
    assert!(pair.event_loop.take_unhandled().is_empty());
}

#[test]
fn test_get_over_fallback_codec() {
    let pair = direct_pair(CodecKind::Fallback);
    pair.page
        .handle("echo", |params: Vec<Value>| params)
        .expect("register");

    let promise = pair
        .host
        .get("echo", vec![json!("\u{00e9}\u{1f600}"), json!({"a": [1, 2.5, null]})])
        .expect("get");
    assert_eq!(
        settled(&pair.event_loop, &promise).expect("resolved"),
        vec![json!("\u{00e9}\u{1f600}"), json!({"a": [1, 2.5, null]})]
    );
    assert!(pair.to_page.sent.borrow()[0].contains("\\u00e9"));
}

#[test]
fn test_handler_fault_rejects_with_envelope() {
    let pair = direct_pair(CodecKind::Json);
    pair.page
        .handle("divide", |params: Vec<Value>| {
            match (params[0].as_i64(), params[1].as_i64()) {
                (Some(_), Some(0)) => Err(ErrorEnvelope::new("ZeroDivisionError", "divided by 0")),
                (Some(a), Some(b)) => Ok(json!(a / b)),
                _ => Err(ErrorEnvelope::new("TypeError", "expected integers")),
            }
        })
        .expect("register");

    let promise = pair.host.get("divide", vec![json!(1), json!(0)]).expect("get");
    let caught = promise.catch(|reasons| {
        let envelope = ErrorEnvelope::from_value(&reasons[0]).expect("envelope");
        json!(envelope.error_type)
    });
    assert_eq!(
        settled(&pair.event_loop, &caught).expect("caught"),
        vec![json!("ZeroDivisionError")]
    );
    assert!(pair.event_loop.take_unhandled().is_empty());
}

#[test]
fn test_missing_handler_rejects_request() {
    let pair = direct_pair(CodecKind::Json);
    let promise = pair.host.get("nothing", vec![]).expect("get");
    assert_eq!(remote_type(settled(&pair.event_loop, &promise)), "NoSuchHandler");
    assert_eq!(pair.event_loop.take_unhandled().len(), 1);
}

#[test]
fn test_once_handler_answers_only_first_request() {
    let pair = direct_pair(CodecKind::Json);
    pair.page
        .once("token", |context, _| {
            if let Some(responder) = context.responder() {
                responder.resolve([json!("abc")]).map_err(ErrorEnvelope::from)?;
            }
            Ok(())
        })
        .expect("register");

    let first = pair.host.get("token", vec![]).expect("get");
    let second = pair.host.get("token", vec![]).expect("get");
    assert_eq!(settled(&pair.event_loop, &first).expect("resolved"), vec![json!("abc")]);
    assert_eq!(remote_type(settled(&pair.event_loop, &second)), "NoSuchHandler");
    assert!(!pair.page.is_registered("token"));
}

#[test]
fn test_fault_after_answer_keeps_first_response() {
    let pair = direct_pair(CodecKind::Json);
    pair.page
        .on("eager", |context, _| {
            if let Some(responder) = context.responder() {
                responder.resolve([json!("early")]).map_err(ErrorEnvelope::from)?;
            }
            Err(ErrorEnvelope::new("TypeError", "late"))
        })
        .expect("register");

    let promise = pair.host.get("eager", vec![]).expect("get");
    assert_eq!(settled(&pair.event_loop, &promise).expect("resolved"), vec![json!("early")]);
    let answers = pair.to_host.sent();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0]["parameters"][1]["success"], json!(true));
    assert_eq!(pair.host.pending_responses(), 0);
}

#[test]
fn test_response_can_be_settled_later() {
    let pair = direct_pair(CodecKind::Json);
    let parked: Rc<RefCell<Option<ResponseContext>>> = Rc::new(RefCell::new(None));
    let slot = parked.clone();
    pair.page
        .on("slow", move |context, _| {
            *slot.borrow_mut() = context.responder().cloned();
            Ok(())
        })
        .expect("register");

    let promise = pair.host.get("slow", vec![]).expect("get");
    pair.event_loop.run_until_idle();
    assert!(promise.settlement().is_none());
    assert_eq!(pair.host.pending_responses(), 1);

    let responder = parked.borrow_mut().take().expect("parked");
    assert!(!responder.is_settled());
    responder.resolve([json!("done")]).expect("resolve");
    assert!(responder.resolve([json!("again")]).is_err());
    assert_eq!(settled(&pair.event_loop, &promise).expect("resolved"), vec![json!("done")]);
}

#[test]
fn test_handler_may_answer_with_promise() {
    let pair = direct_pair(CodecKind::Json);
    let scheduler = pair.page.scheduler();
    pair.page
        .handle("later", move |params: Vec<Value>| {
            let (promise, resolver) = Promise::deferred(scheduler.clone());
            scheduler.defer(Box::new(move || {
                let _ = resolver.resolve(params);
            }));
            promise
        })
        .expect("register");
    pair.page
        .handle("pair", |params: Vec<Value>| -> Result<Vec<Value>, ErrorEnvelope> {
            let n = params[0]
                .as_i64()
                .ok_or_else(|| ErrorEnvelope::new("TypeError", "not a number"))?;
            Ok(vec![json!(n * 2), json!("extra")])
        })
        .expect("register");

    let later = pair.host.get("later", vec![json!("x"), json!(2)]).expect("get");
    let multi = pair.host.get("pair", vec![json!(21)]).expect("get");
    assert_eq!(settled(&pair.event_loop, &later).expect("resolved"), vec![json!("x"), json!(2)]);
    assert_eq!(
        settled(&pair.event_loop, &multi).expect("resolved"),
        vec![json!(42), json!("extra")]
    );
}

// ---------------------------------------------------------------------------
// Notifications, invoke, argument checks
// ---------------------------------------------------------------------------

#[test]
fn test_call_delivers_notification_without_id() {
    let pair = direct_pair(CodecKind::Json);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    pair.page
        .on("log", move |context, params| {
            assert!(context.responder().is_none());
            sink.borrow_mut().extend(params);
            Ok(())
        })
        .expect("register");

    pair.host.call("log", vec![json!("hello"), json!(1)]).expect("call");
    pair.event_loop.run_until_idle();
    assert_eq!(*seen.borrow(), vec![json!("hello"), json!(1)]);
    assert_eq!(
        pair.to_page.sent()[0],
        json!({"name": "log", "parameters": ["hello", 1], "expectsCallback": false})
    );
}

#[test]
fn test_invoke_runs_exposed_function() {
    let pair = direct_pair(CodecKind::Json);
    pair.page
        .expose("Math.add", |params: Vec<Value>| {
            json!(params.iter().filter_map(Value::as_i64).sum::<i64>())
        })
        .expect("expose");

    let promise = pair.host.invoke("Math.add", vec![json!(4), json!(2)]).expect("invoke");
    assert_eq!(settled(&pair.event_loop, &promise).expect("resolved"), vec![json!(6)]);

    let sent = pair.to_page.sent();
    assert_eq!(sent[0]["name"], json!("Bridge.get"));
    let handler = sent[0]["parameters"][0].as_str().expect("handler name");
    assert!(handler.starts_with("Bridge.resolve/reject_"));
    assert!(!pair.host.is_registered(handler));

    assert!(pair.page.unexpose("Math.add"));
    let missing = pair.host.invoke("Math.add", vec![]).expect("invoke");
    assert_eq!(remote_type(settled(&pair.event_loop, &missing)), "ReferenceError");
}

#[test]
fn test_reserved_and_invalid_names_are_rejected() {
    let pair = direct_pair(CodecKind::Json);
    assert!(matches!(
        pair.host.on("Bridge.receive", |_, _| Ok(())),
        Err(BridgeError::InvalidArgument { .. })
    ));
    assert!(matches!(pair.host.on("", |_, _| Ok(())), Err(BridgeError::InvalidArgument { .. })));
    assert!(matches!(pair.host.off("Bridge.ack"), Err(BridgeError::InvalidArgument { .. })));
    assert!(matches!(
        pair.host.call("alert('x')", vec![]),
        Err(BridgeError::InvalidArgument { .. })
    ));
    assert!(matches!(pair.host.get("", vec![]), Err(BridgeError::InvalidArgument { .. })));
    assert!(pair.host.is_registered("Bridge.receive"));
}

#[test]
fn test_off_removes_handler() {
    let pair = direct_pair(CodecKind::Json);
    pair.page.handle("x", |_: Vec<Value>| ()).expect("register");
    pair.page.off("x").expect("off");
    let promise = pair.host.get("x", vec![]).expect("get");
    assert_eq!(remote_type(settled(&pair.event_loop, &promise)), "NoSuchHandler");
}

#[test]
fn test_puts_and_error_reach_builtin_sinks() {
    let pair = direct_pair(CodecKind::Json);
    pair.host.puts(vec![json!("value"), json!({"a": 1})]).expect("puts");
    pair.host
        .error(&ErrorEnvelope::new("TypeError", "boom").with_backtrace(vec!["a.rb:1".to_string()]))
        .expect("error");
    pair.event_loop.run_until_idle();
    let sent = pair.to_page.sent();
    assert_eq!(sent[0]["name"], json!("Bridge.puts"));
    assert_eq!(sent[1]["parameters"], json!(["TypeError", "boom", ["a.rb:1"]]));
}

// ---------------------------------------------------------------------------
// Malformed input
// ---------------------------------------------------------------------------

#[test]
fn test_malformed_payloads_do_not_break_dispatch() {
    let pair = direct_pair(CodecKind::Json);
    pair.page.handle("ping", |_: Vec<Value>| json!("pong")).expect("register");

    pair.page.receive_string("not json");
    pair.page.receive_string("[1, 2]");
    // Missing name, but the sender waits: it gets a failure response.
    pair.page
        .receive_string(r#"{"id": 41, "parameters": [], "expectsCallback": true}"#);
    pair.event_loop.run_until_idle();

    assert!(pair.to_page.sent().is_empty());
    let answers = pair.to_host.sent();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0]["name"], json!("Bridge.receive"));
    assert_eq!(answers[0]["parameters"][0], json!(41));
    assert_eq!(answers[0]["parameters"][1]["success"], json!(false));
    assert_eq!(
        answers[0]["parameters"][1]["parameters"][0]["type"],
        json!("MalformedPayload")
    );

    let promise = pair.host.get("ping", vec![]).expect("get");
    assert_eq!(settled(&pair.event_loop, &promise).expect("resolved"), vec![json!("pong")]);
}

#[test]
fn test_malformed_request_is_answered_with_failure() {
    let event_loop = EventLoop::new();
    let outbox = Rc::new(Wire::default());
    let bridge = Bridge::new(
        BridgeConfig::default(),
        event_loop.clone(),
        TransportSelection::Direct(Box::new(WireLink(outbox.clone()))),
    )
    .expect("bridge");

    bridge.receive_string(r#"{"id": 41, "name": 7, "expectsCallback": true}"#);
    event_loop.run_until_idle();

    let sent = outbox.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["name"], json!("Bridge.receive"));
    assert_eq!(sent[0]["parameters"][0], json!(41));
    assert_eq!(sent[0]["parameters"][1]["success"], json!(false));
    assert_eq!(
        sent[0]["parameters"][1]["parameters"][0]["type"],
        json!("MalformedPayload")
    );
}

#[test]
fn test_malformed_response_rejects_waiting_request() {
    let event_loop = EventLoop::new();
    let outbox = Rc::new(Wire::default());
    let bridge = Bridge::new(
        BridgeConfig::default(),
        event_loop.clone(),
        TransportSelection::Direct(Box::new(WireLink(outbox.clone()))),
    )
    .expect("bridge");

    let promise = bridge.get("f", vec![json!(1)]).expect("get");
    event_loop.run_until_idle();
    let id = outbox.sent()[0]["id"].clone();
    assert_eq!(bridge.pending_responses(), 1);

    let reply = json!({
        "name": "Bridge.receive",
        "parameters": [id, {"success": "yes", "parameters": []}],
    });
    bridge.receive_string(&reply.to_string());

    assert_eq!(remote_type(settled(&event_loop, &promise)), "MalformedPayload");
    assert_eq!(bridge.pending_responses(), 0);
}

// ---------------------------------------------------------------------------
// Throttled pair
// ---------------------------------------------------------------------------

#[test]
fn test_queued_transport_rejects_acknowledging_config() {
    let event_loop = EventLoop::new();
    let config = BridgeConfig {
        acknowledge_inbound: true,
        ..BridgeConfig::default()
    };
    let result = Bridge::new(
        config,
        event_loop,
        TransportSelection::Queued(Rc::new(Slot::default())),
    );
    assert!(matches!(result, Err(BridgeError::Configuration { .. })));
}

#[test]
fn test_throttled_side_waits_for_acks() {
    let event_loop = EventLoop::new();
    let slot = Rc::new(Slot::default());
    let to_page = Rc::new(Wire::default());

    let page = Bridge::new(
        BridgeConfig::default(),
        event_loop.clone(),
        TransportSelection::Queued(slot.clone()),
    )
    .expect("page");
    let host = Bridge::new(
        BridgeConfig {
            acknowledge_inbound: true,
            ..BridgeConfig::default()
        },
        event_loop.clone(),
        TransportSelection::Direct(Box::new(WireLink(to_page.clone()))),
    )
    .expect("host");
    *slot.peer.borrow_mut() = Some(host.downgrade());
    to_page.connect(&event_loop, &page);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    host.on("log", move |_, params| {
        sink.borrow_mut().extend(params);
        Ok(())
    })
    .expect("register");
    host.handle("add", |params: Vec<Value>| {
        json!(params.iter().filter_map(Value::as_i64).sum::<i64>())
    })
    .expect("register");

    for n in 0..3 {
        page.call("log", vec![json!(n)]).expect("call");
    }
    let promise = page.get("add", vec![json!(4), json!(2)]).expect("get");

    assert_eq!(settled(&event_loop, &promise).expect("resolved"), vec![json!(6)]);
    assert_eq!(*seen.borrow(), vec![json!(0), json!(1), json!(2)]);
    assert_eq!(slot.signals.get(), 4);
    assert_eq!(slot.overwritten.get(), 0);

    let acks = to_page
        .sent()
        .into_iter()
        .filter(|m| m["name"] == json!("Bridge.ack"))
        .map(|m| m["parameters"][0].clone())
        .collect::<Vec<_>>();
    assert_eq!(acks, vec![json!(0), json!(1), json!(2), json!(3)]);
    assert_eq!(page.pending_responses(), 0);
}
