//! Receive-side reassembly scenarios: in-order, reordered and overlapping
//! stream bytes must all produce the same monotonic body delivery.

mod common;

use common::{feed, MockTransport, Recording, TestSession};

use hqmcast::qpack;
use hqmcast::{
    Frame, Header, RequestId, Session, Settings, TransportEvent, TransportSettings,
};

const REQUEST: RequestId = RequestId(9);

fn client() -> TestSession {
    let mut session = Session::new_client(
        MockTransport::client(8),
        Recording::default(),
        Settings::default(),
        TransportSettings::default(),
    )
    .unwrap();

    // Opens stream 4 and binds our handle to it.
    session
        .submit_request(&[Header::new(":method", "GET")], None, false, REQUEST)
        .unwrap();
    session
}

fn headers_frame(headers: &[Header]) -> Vec<u8> {
    let block = qpack::Context::new().compress(headers);
    Frame::Headers { block }.to_vec()
}

fn data(stream_id: u64, offset: u64, data: &[u8], fin: bool) -> TransportEvent {
    TransportEvent::StreamData {
        stream_id,
        offset,
        data: data.to_vec(),
        fin,
    }
}

/// A response HEADERS frame followed by a 98-byte DATA frame, returned as
/// (stream bytes, offset of the DATA frame, DATA payload).
fn response_with_body() -> (Vec<u8>, u64, Vec<u8>) {
    let mut stream = headers_frame(&[Header::new(":status", "200")]);
    let data_at = stream.len() as u64;

    let payload: Vec<u8> = (0..98).collect();
    Frame::Data {
        payload: payload.clone(),
    }
    .encode(&mut stream);

    (stream, data_at, payload)
}

#[test]
fn in_order_delivery() {
    let mut session = client();
    let (stream, _, payload) = response_with_body();

    let (first, second) = stream.split_at(stream.len() / 2);
    feed(&mut session, vec![data(4, 0, first, false)]).unwrap();
    feed(&mut session, vec![data(4, first.len() as u64, second, true)]).unwrap();

    let events = session.events();
    assert_eq!(events.body(REQUEST), payload);

    // Strictly monotonic, gap-free body offsets.
    let mut expected = 0;
    for (_, bytes, offset, _) in &events.data {
        assert_eq!(*offset, expected);
        expected += bytes.len() as u64;
    }

    // End-of-data flagged on the final delivery only.
    let (flags, _, _, _) = events.data.last().unwrap();
    assert!(flags.end_data);
    assert_eq!(events.data.iter().filter(|(f, ..)| f.end_data).count(), 1);
}

#[test]
fn reordered_delivery_matches_in_order() {
    let mut session = client();
    let (stream, _, payload) = response_with_body();

    let (first, second) = stream.split_at(stream.len() / 2);
    feed(&mut session, vec![data(4, first.len() as u64, second, true)]).unwrap();

    // Nothing can be delivered from the tail alone.
    assert!(session.events().data.is_empty());
    assert!(session.events().headers.is_empty());

    feed(&mut session, vec![data(4, 0, first, false)]).unwrap();

    let events = session.events();
    assert_eq!(events.body(REQUEST), payload);
    // Once the gap filled, the whole body came out in one piece.
    assert_eq!(events.data.len(), 1);
    assert_eq!(events.data[0].2, 0);
    assert!(events.data[0].0.end_data);
}

#[test]
fn overlapping_retransmits_deliver_once() {
    let mut session = client();
    let (stream, _, payload) = response_with_body();
    let total = stream.len();

    // Three overlapping spans covering the stream, out of order.
    feed(&mut session, vec![data(4, 30, &stream[30..70], false)]).unwrap();
    feed(&mut session, vec![data(4, 0, &stream[0..40], false)]).unwrap();
    feed(
        &mut session,
        vec![data(4, 60, &stream[60..total], true)],
    )
    .unwrap();

    let events = session.events();
    assert_eq!(events.body(REQUEST), payload);

    // No byte delivered twice: offsets are contiguous from zero.
    let mut expected = 0;
    for (_, bytes, offset, _) in &events.data {
        assert_eq!(*offset, expected);
        expected += bytes.len() as u64;
    }
    assert_eq!(expected, payload.len() as u64);
}

#[test]
fn headers_then_body_then_trailers() {
    let mut session = client();

    let mut stream = headers_frame(&[
        Header::new(":status", "200"),
        Header::new("trailer", "x-checksum"),
    ]);
    let body_at = stream.len();
    Frame::Data {
        payload: b"segment".to_vec(),
    }
    .encode(&mut stream);
    let trailers_at = stream.len();
    stream.extend_from_slice(&headers_frame(&[Header::new("x-checksum", "0abc")]));

    feed(&mut session, vec![data(4, 0, &stream[..body_at], false)]).unwrap();
    feed(
        &mut session,
        vec![data(4, body_at as u64, &stream[body_at..trailers_at], false)],
    )
    .unwrap();
    feed(
        &mut session,
        vec![data(4, trailers_at as u64, &stream[trailers_at..], true)],
    )
    .unwrap();

    let events = session.events();
    assert_eq!(events.begins, vec![REQUEST]);
    assert_eq!(events.body(REQUEST), b"segment");

    let initial: Vec<_> = events
        .headers
        .iter()
        .filter(|(flags, ..)| !flags.trailers)
        .collect();
    assert_eq!(initial.len(), 2);
    assert!(initial.iter().all(|(flags, ..)| !flags.end_request));

    let trailers: Vec<_> = events
        .headers
        .iter()
        .filter(|(flags, ..)| flags.trailers)
        .collect();
    assert_eq!(trailers.len(), 1);
    assert!(trailers[0].0.end_request);
    assert!(trailers[0].1.is("x-checksum", "0abc"));

    // Fin on the trailers closed the request exactly once.
    assert_eq!(events.closes, vec![(None, REQUEST)]);
}

#[test]
fn unpromised_trailers_reset_the_stream() {
    let mut session = client();

    let mut stream = headers_frame(&[Header::new(":status", "200")]);
    Frame::Data {
        payload: b"body".to_vec(),
    }
    .encode(&mut stream);
    stream.extend_from_slice(&headers_frame(&[Header::new("x-checksum", "0abc")]));

    feed(&mut session, vec![data(4, 0, &stream, true)]).unwrap();

    let events = session.events();
    assert_eq!(events.closes.len(), 1);
    assert_eq!(
        events.closes[0].0,
        Some(hqmcast::Error::TrailersNotPromised),
    );

    // The offending stream was shut down; the session lives on.
    assert!(session.transport().shutdowns.iter().any(|&(id, _)| id == 4));
    session.send().unwrap();

    // Late bytes on the reset stream are rejected, not reopened: no new
    // events, and in particular no second close.
    let headers_before = session.events().headers.len();
    let data_before = session.events().data.len();
    feed(
        &mut session,
        vec![data(4, stream.len() as u64, b"\x00\x04late", false)],
    )
    .unwrap();
    assert_eq!(session.events().headers.len(), headers_before);
    assert_eq!(session.events().data.len(), data_before);
    assert_eq!(session.events().closes.len(), 1);
}

#[test]
fn body_held_until_headers_arrive() {
    let mut session = client();
    let (stream, data_at, payload) = response_with_body();

    // The DATA frame is complete, the HEADERS before it are missing.
    feed(
        &mut session,
        vec![data(4, data_at, &stream[data_at as usize..], true)],
    )
    .unwrap();
    assert!(session.events().data.is_empty());

    feed(&mut session, vec![data(4, 0, &stream[..data_at as usize], false)]).unwrap();

    let events = session.events();
    assert!(!events.headers.is_empty());
    assert_eq!(events.body(REQUEST), payload);
}
