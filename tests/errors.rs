mod common;

use common::*;
use quicmux::consts::*;
use quicmux::transport::{TransportError, TransportEvent};
use quicmux::types::WireVariant;
use quicmux::{Handler, HandlerProvider, Header, Message, Transaction};

/// HEADERS frame whose declared payload length exceeds the bytes sent.
fn truncated_headers() -> Vec<u8> {
    vec![0x01, 0x05, 0x00, 0x00]
}

#[test]
fn framed_body_shorter_than_declared_is_stream_fatal() {
    let transport = MockTransport::new();
    let log = new_log();
    let mut session = session(WireVariant::Framed, transport.clone(), silent(log.clone()));

    let head = headers_frame(
        0,
        &[
            Header::new(":method", "POST"),
            Header::new(":path", "/upload"),
            Header::new("content-length", "10"),
        ],
    );
    let mut wire = head.to_vec();
    wire.extend_from_slice(&data_frame(b"abc"));
    deliver(&mut session, &transport, 0, &wire, true);

    assert_eq!(count(&log, 0, |e| matches!(e, Ev::Error(_))), 1);
    assert_eq!(count(&log, 0, |e| *e == Ev::Detach), 1);
    assert_eq!(transport.reset_code(0), Some(H3_MESSAGE_ERROR));
    assert_eq!(transport.stop_code(0), Some(H3_MESSAGE_ERROR));
    assert!(!session.is_closed());
}

#[test]
fn transport_failure_delivers_one_error_per_transaction() {
    let transport = MockTransport::new();
    let log = new_log();
    let mut session = session(WireVariant::H3, transport.clone(), silent(log.clone()));

    deliver(&mut session, &transport, 0, &get_request("/a"), true);
    deliver(&mut session, &transport, 4, &get_request("/b"), true);

    session.on_transport_event(TransportEvent::ConnectionError(TransportError::Internal(
        "connection lost".to_string(),
    )));

    assert!(session.is_closed());
    for id in [0u64, 4] {
        assert_eq!(count(&log, id, |e| matches!(e, Ev::Error(_))), 1, "stream {}", id);
        assert_eq!(count(&log, id, |e| *e == Ev::Detach), 1, "stream {}", id);
    }
}

/// Drops the connection from inside its own headers callback.
struct DroppingHandler {
    log: Log,
}

impl Handler for DroppingHandler {
    fn on_headers_complete(&mut self, txn: &mut Transaction<'_>, _msg: Message) {
        let id = txn.stream_id().unwrap_or(u64::MAX);
        txn.drop_connection();
        // The drop is deferred until the callback returns; sends in the
        // meantime still land in the egress queue.
        let head = Message::response(200).header("content-length", "0");
        let ok = txn.send_headers(&head).is_ok();
        self.log
            .borrow_mut()
            .push((id, Ev::Error(format!("post-drop send ok={}", ok))));
    }

    fn on_error(&mut self, txn: &mut Transaction<'_>, error: &quicmux::SessionError) {
        let id = txn.stream_id().unwrap_or(u64::MAX);
        self.log
            .borrow_mut()
            .push((id, Ev::Error(error.to_string())));
    }

    fn on_detach(&mut self) {
        self.log.borrow_mut().push((0, Ev::Detach));
    }
}

#[test]
fn drop_connection_inside_a_callback_is_deferred() {
    let transport = MockTransport::new();
    let log = new_log();
    let drop_log = log.clone();
    let mut session = session(
        WireVariant::H3,
        transport.clone(),
        provider(move |_| {
            Box::new(DroppingHandler {
                log: drop_log.clone(),
            })
        }),
    );

    deliver(&mut session, &transport, 0, &get_request("/"), true);

    assert!(session.is_closed());
    let events = events_for(&log, 0);
    assert_eq!(events[0], Ev::Error("post-drop send ok=true".to_string()));
    assert!(matches!(&events[1], Ev::Error(msg) if msg.contains("dropped")));
    assert_eq!(events[2], Ev::Detach);
    assert_eq!(events.len(), 3);
}

#[test]
fn timeout_before_headers_answers_with_408() {
    let transport = MockTransport::new();
    let log = new_log();
    let mut session = session(
        WireVariant::H3,
        transport.clone(),
        responder(log.clone(), Respond::ok(b"never")),
    );

    // The head never completes, so no handler is ever bound.
    deliver(&mut session, &transport, 0, &truncated_headers(), false);
    assert!(log.borrow().is_empty());

    session.on_transport_event(TransportEvent::TransactionTimeout(0));
    session.run_loop_turn();

    assert_eq!(response_status(&transport, 0), Some(408));
    assert!(transport.write_fin(0));
    assert!(log.borrow().is_empty());
}

#[test]
fn timeout_after_binding_goes_to_the_handler() {
    let transport = MockTransport::new();
    let log = new_log();
    let mut session = session(WireVariant::H3, transport.clone(), silent(log.clone()));

    deliver(&mut session, &transport, 0, &get_request("/slow"), true);
    session.on_transport_event(TransportEvent::TransactionTimeout(0));
    session.run_loop_turn();

    assert_eq!(count(&log, 0, |e| matches!(e, Ev::Error(_))), 1);
    assert_eq!(count(&log, 0, |e| *e == Ev::Detach), 1);
    assert_eq!(transport.reset_code(0), Some(H3_REQUEST_CANCELLED));
    assert!(!session.is_closed());
}

/// Provider that hands out a late-bound handler for failed transactions.
struct ErrorHandlerProvider {
    log: Log,
}

impl HandlerProvider for ErrorHandlerProvider {
    fn new_handler(&mut self, _msg: &Message) -> Box<dyn Handler> {
        Box::new(RecordingHandler::new(self.log.clone(), None))
    }

    fn error_handler(&mut self) -> Option<Box<dyn Handler>> {
        Some(Box::new(RecordingHandler::new(self.log.clone(), None)))
    }
}

#[test]
fn error_handler_receives_timeouts_that_precede_binding() {
    let transport = MockTransport::new();
    let log = new_log();
    let mut session = session(
        WireVariant::H3,
        transport.clone(),
        Box::new(ErrorHandlerProvider { log: log.clone() }),
    );

    deliver(&mut session, &transport, 0, &truncated_headers(), false);
    session.on_transport_event(TransportEvent::TransactionTimeout(0));
    session.run_loop_turn();

    // The late binding never saw headers, so its events carry no stream id.
    assert_eq!(count(&log, u64::MAX, |e| matches!(e, Ev::Error(_))), 1);
    assert_eq!(count(&log, u64::MAX, |e| *e == Ev::Detach), 1);
    assert_eq!(transport.reset_code(0), Some(H3_REQUEST_CANCELLED));
    assert!(!session.is_closed());
}

#[test]
fn failed_delivery_registration_is_stream_fatal() {
    let transport = MockTransport::new();
    let log = new_log();
    let mut session = session(
        WireVariant::H3,
        transport.clone(),
        responder(log.clone(), Respond::ok(b"payload")),
    );

    transport.set_fail_registration(true);
    deliver(&mut session, &transport, 0, &get_request("/"), true);

    // The response flushed, but its terminal ack can never be observed.
    assert_eq!(response_status(&transport, 0), Some(200));
    assert_eq!(count(&log, 0, |e| matches!(e, Ev::Error(_))), 1);
    assert_eq!(count(&log, 0, |e| *e == Ev::Detach), 1);
    assert_eq!(transport.reset_code(0), Some(H3_REQUEST_CANCELLED));
    assert!(!session.is_closed());
}
