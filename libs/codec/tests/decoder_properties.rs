//! Property tests for the streaming frame decoder
//!
//! The decoder must yield the same frames no matter how the byte stream is
//! cut into reads, and must reject any frame whose terminal octet is wrong.

use mq_codec::{
    encode_publish, BasicProperties, FieldTable, FieldValue, Frame, FrameDecoder, Method,
    ProtocolError,
};
use proptest::prelude::*;

fn sample_stream(body_len: usize) -> Vec<u8> {
    let mut out = Vec::new();

    let mut server_properties = FieldTable::new();
    server_properties.insert("product".into(), FieldValue::string("RabbitMQ"));
    let start = Frame::method(
        0,
        Method::ConnectionStart {
            version_major: 0,
            version_minor: 9,
            server_properties,
            mechanisms: "PLAIN".into(),
            locales: "en_US".into(),
        },
    );
    out.extend_from_slice(&start.encode().unwrap());
    out.extend_from_slice(&Frame::Heartbeat.encode().unwrap());

    let body: Vec<u8> = (0..body_len).map(|i| (i % 251) as u8).collect();
    let props = BasicProperties {
        content_type: Some("application/octet-stream".into()),
        timestamp: Some(1_700_000_000),
        ..Default::default()
    };
    out.extend_from_slice(&encode_publish(2, "amq.topic", "orders.created", props, &body, 4096).unwrap());
    out.extend_from_slice(
        &Frame::method(2, Method::ChannelCloseOk)
            .encode()
            .unwrap(),
    );
    out
}

fn decode_at(bytes: &[u8], cuts: &[usize]) -> Vec<Frame> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (bytes.len() + 1)).collect();
    points.push(0);
    points.push(bytes.len());
    points.sort_unstable();
    points.dedup();

    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    for window in points.windows(2) {
        decoder.feed(&bytes[window[0]..window[1]]);
        while let Some(frame) = decoder.next_frame().unwrap() {
            frames.push(frame);
        }
    }
    assert_eq!(decoder.buffered(), 0);
    frames
}

fn decode_in_chunks_of(bytes: &[u8], chunk: usize) -> Vec<Frame> {
    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    for piece in bytes.chunks(chunk) {
        decoder.feed(piece);
        while let Some(frame) = decoder.next_frame().unwrap() {
            frames.push(frame);
        }
    }
    frames
}

#[test]
fn test_whole_stream_frame_count() {
    // start, heartbeat, publish, header, 3 bodies, close-ok
    let frames = decode_at(&sample_stream(10_000), &[]);
    assert_eq!(frames.len(), 8);
    assert_eq!(frames[1], Frame::Heartbeat);
}

proptest! {
    #[test]
    fn decoding_is_independent_of_cut_points(
        body_len in 0usize..12_000,
        cuts in prop::collection::vec(any::<usize>(), 0..48),
    ) {
        let bytes = sample_stream(body_len);
        let whole = decode_at(&bytes, &[]);
        let cut = decode_at(&bytes, &cuts);
        prop_assert_eq!(whole, cut);
    }

    #[test]
    fn decoding_is_independent_of_chunk_size(
        body_len in 0usize..6_000,
        chunk in 1usize..97,
    ) {
        let bytes = sample_stream(body_len);
        prop_assert_eq!(decode_at(&bytes, &[]), decode_in_chunks_of(&bytes, chunk));
    }

    #[test]
    fn wrong_frame_end_is_rejected(end in any::<u8>().prop_filter("must differ from 0xCE", |b| *b != 0xCE)) {
        let mut bytes = Frame::method(1, Method::ChannelOpen).encode().unwrap().to_vec();
        let last = bytes.len() - 1;
        bytes[last] = end;

        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let is_end_mismatch = matches!(
            decoder.next_frame(),
            Err(ProtocolError::FrameEndMismatch { found, .. }) if found == end
        );
        prop_assert!(is_end_mismatch);
    }
}
