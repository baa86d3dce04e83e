//! End-to-end pipeline test: feeds out-of-order, reassembled TCP segments
//! through the Assembler and a Flow Worker and checks the HTTP messages
//! that come out the other end, mirroring spec.md §8's end-to-end
//! scenarios 1, 5, and 6.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use httpcap::assembler::{Assembler, FlowKey, NetworkFlow, TcpSegment, TransportFlow};
use httpcap::body::consume_body;
use httpcap::flow::{flow_channel, run_flow_worker, Direction, MessageSink, ParsedMessage};
use httpcap::message::MessageHead;

/// A sink that just records every parsed message for later assertions.
#[derive(Clone, Default)]
struct RecordingSink {
    messages: Arc<Mutex<Vec<(FlowKey, ParsedMessage)>>>,
}

impl MessageSink for RecordingSink {
    async fn on_message(&self, key: FlowKey, message: ParsedMessage) {
        self.messages.lock().unwrap().push((key, message));
    }
}

fn key(port: u16) -> FlowKey {
    FlowKey {
        network: NetworkFlow {
            src: "127.0.0.1".parse::<IpAddr>().unwrap(),
            dst: "127.0.0.1".parse::<IpAddr>().unwrap(),
        },
        transport: TransportFlow {
            src_port: port,
            dst_port: 80,
        },
    }
}

fn segment(k: FlowKey, seq: u32, payload: &[u8], fin: bool) -> TcpSegment {
    TcpSegment {
        timestamp: std::time::SystemTime::now(),
        network: k.network,
        transport: k.transport,
        seq,
        payload: payload.to_vec(),
        fin,
    }
}

async fn drain_flow(k: FlowKey, segments: Vec<TcpSegment>, sink: RecordingSink) {
    let mut assembler = Assembler::new();
    let (tx, rx) = flow_channel();
    assembler.register(k, tx);
    for seg in segments {
        assembler.submit(seg);
    }
    assembler.flush_all();

    run_flow_worker(k, rx, sink).await;
}

#[tokio::test]
async fn single_get_request_with_no_body_is_emitted() {
    let k = key(40001);
    let sink = RecordingSink::default();
    let data = b"GET /ping HTTP/1.1\r\nHost: example.com\r\n\r\n";
    drain_flow(k, vec![segment(k, 0, data, false)], sink.clone()).await;

    let messages = sink.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    let (flow_key, parsed) = &messages[0];
    assert_eq!(*flow_key, k);
    assert_eq!(parsed.direction, Direction::Request);
    match &parsed.head {
        MessageHead::Request { method, uri, .. } => {
            assert_eq!(method, "GET");
            assert_eq!(uri, "/ping");
        }
        other => panic!("expected a request, got {other:?}"),
    }
    assert_eq!(parsed.body.decoded_len, 0);
}

#[tokio::test]
async fn out_of_order_segments_still_reassemble_into_one_response() {
    let k = key(40002);
    let sink = RecordingSink::default();
    let data = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec();
    // Split into two segments and submit tail-first to exercise reordering.
    let (head, tail) = data.split_at(30);
    drain_flow(
        k,
        vec![
            segment(k, 30, tail, false),
            segment(k, 0, head, false),
        ],
        sink.clone(),
    )
    .await;

    let messages = sink.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    let (_, parsed) = &messages[0];
    assert_eq!(parsed.direction, Direction::Response);
    match &parsed.head {
        MessageHead::Response { status, .. } => assert_eq!(*status, 200),
        other => panic!("expected a response, got {other:?}"),
    }
}

#[tokio::test]
async fn two_chunked_responses_back_to_back_both_drain() {
    let k = key(40003);
    let sink = RecordingSink::default();
    let data = concat!(
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\n\r\n",
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\npedia\r\n0\r\n\r\n",
    );
    drain_flow(k, vec![segment(k, 0, data.as_bytes(), true)], sink.clone()).await;

    let messages = sink.messages.lock().unwrap();
    assert_eq!(messages.len(), 2);
    for (_, parsed) in messages.iter() {
        assert_eq!(parsed.direction, Direction::Response);
    }
}

#[tokio::test]
async fn consume_body_is_consistent_with_flow_worker_framing() {
    // Sanity check that the body module used directly agrees with what the
    // flow worker produces for a fixed-length body (regression guard for
    // the materialize-gating plumbing between flow.rs and body.rs).
    let (tx, rx) = flow_channel();
    drop(tx);
    let mut stream = httpcap::flow::FlowByteStream::new(rx);
    let headers = httpcap::message::Headers::default();
    let summary = consume_body(
        &mut stream,
        httpcap::message::BodyFraming::None,
        &headers,
        true,
    )
    .await
    .unwrap();
    assert_eq!(summary.decoded_len, 0);
}
