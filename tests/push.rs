mod common;

use std::cell::RefCell;
use std::rc::Rc;

use bytes::BytesMut;
use common::*;
use quicmux::codec::Frame;
use quicmux::compress::{decode_fields, split_field_section};
use quicmux::consts::*;
use quicmux::transport::StreamId;
use quicmux::types::WireVariant;
use quicmux::varint::decode_varint;
use quicmux::{Handler, Message, PushInfo, Transaction};

type PushResult = Rc<RefCell<Option<Result<PushInfo, String>>>>;

/// Promises a stylesheet push, then answers the request itself.
struct PushingParent {
    log: Log,
    result: PushResult,
}

impl Handler for PushingParent {
    fn on_headers_complete(&mut self, txn: &mut Transaction<'_>, _msg: Message) {
        let promise = Message::request("GET", "/style.css");
        let pushed = Box::new(RecordingHandler::new(
            self.log.clone(),
            Some(Respond::ok(b"body{}")),
        ));
        let outcome = txn
            .create_push(&promise, pushed)
            .map_err(|e| e.to_string());
        *self.result.borrow_mut() = Some(outcome);

        let head = Message::response(200).header("content-length", "0");
        txn.send_headers(&head).expect("parent head");
        txn.send_eom().expect("parent eom");
    }
}

fn pushing_session(
    transport: MockTransport,
    log: Log,
    result: PushResult,
) -> quicmux::Session<MockTransport> {
    session(
        WireVariant::H3,
        transport.clone(),
        provider(move |_| {
            Box::new(PushingParent {
                log: log.clone(),
                result: result.clone(),
            })
        }),
    )
}

/// Frames on a push stream, after the type and push-id preface.
fn push_stream_frames(transport: &MockTransport, id: StreamId) -> (u64, Vec<Frame>) {
    let written = transport.written(id);
    let (stream_type, mut offset) = decode_varint(&written).expect("type preface");
    assert_eq!(stream_type, STREAM_TYPE_PUSH);
    let (push_id, consumed) = decode_varint(&written[offset..]).expect("push id");
    offset += consumed;
    (push_id, parse_frames(&written[offset..]))
}

#[test]
fn push_requires_a_peer_limit() {
    let transport = MockTransport::new();
    let log = new_log();
    let result = PushResult::default();
    let mut session = pushing_session(transport.clone(), log.clone(), result.clone());

    // No MAX_PUSH_ID has arrived.
    deliver(&mut session, &transport, 0, &get_request("/index.html"), true);

    assert!(result.borrow().as_ref().expect("attempted").is_err());
    assert_eq!(transport.opened_uni(), vec![3, 7, 11]);
    // The parent exchange is unaffected.
    assert_eq!(response_status(&transport, 0), Some(200));
}

#[test]
fn promise_rides_the_parent_and_the_response_rides_a_push_stream() {
    let transport = MockTransport::new();
    let log = new_log();
    let result = PushResult::default();
    let mut session = pushing_session(transport.clone(), log.clone(), result.clone());

    let mut opening = BytesMut::new();
    opening.extend_from_slice(&control_opening(&[]));
    opening.extend_from_slice(&Frame::with_varint_payload(FRAME_MAX_PUSH_ID, 4).to_bytes());
    deliver(&mut session, &transport, PEER_CONTROL, &opening, false);

    deliver(&mut session, &transport, 0, &get_request("/index.html"), true);

    assert_eq!(
        *result.borrow(),
        Some(Ok(PushInfo {
            stream_id: 15,
            push_id: 0,
        }))
    );
    assert_eq!(session.max_allowed_push_id(), Some(4));
    // Control, encoder, decoder, and the push stream.
    assert_eq!(session.num_outgoing_streams(), 4);
    assert_eq!(transport.priority_of(15), None);

    // The promise is announced on the request stream that spawned it.
    let parent = transport.written(0);
    let frames = parse_frames(&parent);
    let promise = frames
        .iter()
        .find(|f| f.frame_type == FRAME_PUSH_PROMISE)
        .expect("PUSH_PROMISE on the parent");
    let (push_id, consumed) = decode_varint(&promise.payload).expect("push id");
    assert_eq!(push_id, 0);
    let section = split_field_section(&promise.payload[consumed..]).expect("section");
    let fields = decode_fields(&section.payload).expect("fields");
    assert_eq!(fields, request_fields("GET", "/style.css"));

    // The pushed response carries its own preface and completes.
    let (push_id, frames) = push_stream_frames(&transport, 15);
    assert_eq!(push_id, 0);
    assert_eq!(frames[0].frame_type, FRAME_HEADERS);
    assert_eq!(status_of(&decode_headers_frame(&frames[0])), Some(200));
    assert_eq!(frames[1].frame_type, FRAME_DATA);
    assert_eq!(&frames[1].payload[..], b"body{}");
    assert!(transport.write_fin(15));
}

#[test]
fn peer_cancel_push_aborts_the_push_stream() {
    let transport = MockTransport::new();
    let log = new_log();
    let result = PushResult::default();
    let mut session = pushing_session(transport.clone(), log.clone(), result.clone());

    let mut opening = BytesMut::new();
    opening.extend_from_slice(&control_opening(&[]));
    opening.extend_from_slice(&Frame::with_varint_payload(FRAME_MAX_PUSH_ID, 4).to_bytes());
    deliver(&mut session, &transport, PEER_CONTROL, &opening, false);
    deliver(&mut session, &transport, 0, &get_request("/index.html"), true);

    let cancel = Frame::with_varint_payload(FRAME_CANCEL_PUSH, 0).to_bytes();
    deliver(&mut session, &transport, PEER_CONTROL, &cancel, false);

    assert_eq!(transport.reset_code(15), Some(H3_REQUEST_CANCELLED));
    assert_eq!(count(&log, 15, |e| matches!(e, Ev::Error(_))), 1);
    assert_eq!(count(&log, 15, |e| *e == Ev::Detach), 1);
    assert!(!session.is_closed());
}

#[test]
fn stop_sending_on_a_push_stream_reaches_its_handler() {
    let transport = MockTransport::new();
    let log = new_log();
    let result = PushResult::default();
    let mut session = pushing_session(transport.clone(), log.clone(), result.clone());

    let mut opening = BytesMut::new();
    opening.extend_from_slice(&control_opening(&[]));
    opening.extend_from_slice(&Frame::with_varint_payload(FRAME_MAX_PUSH_ID, 4).to_bytes());
    deliver(&mut session, &transport, PEER_CONTROL, &opening, false);
    deliver(&mut session, &transport, 0, &get_request("/index.html"), true);

    session.on_transport_event(quicmux::transport::TransportEvent::StopSending(
        15,
        H3_REQUEST_CANCELLED,
    ));

    assert_eq!(count(&log, 15, |e| matches!(e, Ev::Error(_))), 1);
    assert_eq!(count(&log, 15, |e| *e == Ev::Detach), 1);
    assert_eq!(transport.reset_code(15), Some(H3_REQUEST_CANCELLED));
    assert!(!session.is_closed());
}

#[test]
fn peer_goaway_blocks_new_pushes() {
    let transport = MockTransport::new();
    let log = new_log();
    let result = PushResult::default();
    let mut session = pushing_session(transport.clone(), log.clone(), result.clone());

    let mut opening = BytesMut::new();
    opening.extend_from_slice(&control_opening(&[]));
    opening.extend_from_slice(&Frame::with_varint_payload(FRAME_MAX_PUSH_ID, 10).to_bytes());
    opening.extend_from_slice(&Frame::goaway(0).to_bytes());
    deliver(&mut session, &transport, PEER_CONTROL, &opening, false);

    deliver(&mut session, &transport, 0, &get_request("/index.html"), true);

    // Push id 0 is already past the peer's cutoff.
    assert!(result.borrow().as_ref().expect("attempted").is_err());
    assert_eq!(transport.opened_uni(), vec![3, 7, 11]);
    assert_eq!(response_status(&transport, 0), Some(200));
}
