//! Flow Dispatcher, Flow Worker, and Direction Classifier.
//!
//! On the first segment of a flow, the dispatcher creates a Flow Worker
//! bound to the reader end of a bounded byte-stream channel; the Assembler
//! holds the writer end. The worker peeks the stream's opening bytes to
//! classify direction, then drives the matching Message Reader in a loop
//! until end-of-stream. This is the task-per-flow analogue of the teacher's
//! goroutine-per-connection workers (`timer_core::workers::client`), built
//! on a bounded `tokio::sync::mpsc` channel instead of a raw TCP socket.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::assembler::FlowKey;
use crate::body::{consume_body, BodySummary};
use crate::message::MessageHead;
use crate::message_reader::{MessageReader, ReadOutcome, RequestReader, ResponseReader};

/// Capacity of the per-flow byte channel (spec §4.1: "writer uses a bounded
/// buffer; when full, the packet thread drops the segment").
pub const FLOW_CHANNEL_CAPACITY: usize = 256;

/// A unit handed from the Assembler (writer side) to a Flow Worker (reader
/// side) over the per-flow channel.
#[derive(Debug)]
pub enum FlowChunk {
    Data(Bytes),
    /// A gap in the byte stream could not be filled within the memory
    /// budget; the stream is considered closed from here.
    Discontinuity,
    /// The flow ended (FIN observed, or the flow was flushed as idle).
    Eof,
}

pub type FlowSender = mpsc::Sender<FlowChunk>;
pub type FlowReceiver = mpsc::Receiver<FlowChunk>;

/// Create a fresh bounded channel pair for a new flow.
pub fn flow_channel() -> (FlowSender, FlowReceiver) {
    mpsc::channel(FLOW_CHANNEL_CAPACITY)
}

// ---------------------------------------------------------------------------
// Byte-stream reader
// ---------------------------------------------------------------------------

/// A blocking (suspend-on-empty), single-consumer, finite lazy sequence of
/// bytes for one flow direction. Closes on Eof or Discontinuity.
pub struct FlowByteStream {
    rx: FlowReceiver,
    buf: Vec<u8>,
    pos: usize,
    closed: bool,
}

/// Why a `FlowByteStream` stopped producing more bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Eof,
    Discontinuity,
}

impl FlowByteStream {
    pub fn new(rx: FlowReceiver) -> Self {
        FlowByteStream {
            rx,
            buf: Vec::new(),
            pos: 0,
            closed: false,
        }
    }

    fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Suspend until at least `n` bytes are available, or the stream ends.
    async fn fill(&mut self, n: usize) -> Result<(), StreamEnd> {
        while self.available() < n {
            if self.closed {
                return Err(StreamEnd::Eof);
            }
            match self.rx.recv().await {
                Some(FlowChunk::Data(b)) => {
                    if self.pos > 4096 && self.pos == self.buf.len() {
                        self.buf.clear();
                        self.pos = 0;
                    } else if self.pos > 0 {
                        self.buf.drain(..self.pos);
                        self.pos = 0;
                    }
                    self.buf.extend_from_slice(&b);
                }
                Some(FlowChunk::Discontinuity) => {
                    self.closed = true;
                    return Err(StreamEnd::Discontinuity);
                }
                Some(FlowChunk::Eof) | None => {
                    self.closed = true;
                    return Err(StreamEnd::Eof);
                }
            }
        }
        Ok(())
    }

    /// Peek at the next `n` bytes without consuming them. Returns fewer than
    /// `n` bytes only when the stream ends first.
    pub async fn peek(&mut self, n: usize) -> Result<&[u8], StreamEnd> {
        match self.fill(n).await {
            Ok(()) => Ok(&self.buf[self.pos..self.pos + n]),
            Err(_) if self.available() > 0 => Ok(&self.buf[self.pos..]),
            Err(e) => Err(e),
        }
    }

    /// Consume and return exactly `n` bytes, suspending as needed.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, StreamEnd> {
        self.fill(n).await?;
        let out = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(out)
    }

    /// Consume and return whatever is currently buffered, plus the next
    /// chunk if the buffer is empty. Used for body draining and
    /// close-delimited responses.
    pub async fn read_some(&mut self) -> Result<Vec<u8>, StreamEnd> {
        if self.available() == 0 {
            self.fill(1).await?;
        }
        let out = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        Ok(out)
    }

    /// Consume and return up to `limit` bytes: whatever is already
    /// buffered, capped at `limit`, pulling exactly one more chunk first if
    /// nothing is buffered yet. Never over-reads past `limit`, so callers
    /// streaming a length-delimited body one wire chunk at a time never
    /// pull bytes belonging to the next message into memory.
    pub async fn read_upto(&mut self, limit: usize) -> Result<Vec<u8>, StreamEnd> {
        if self.available() == 0 {
            self.fill(1).await?;
        }
        let take = self.available().min(limit);
        let out = self.buf[self.pos..self.pos + take].to_vec();
        self.pos += take;
        Ok(out)
    }

    /// Grow the internal buffer by at least one more chunk without
    /// consuming anything already buffered. Used by header parsing, which
    /// needs to keep re-trying a parse over a growing window.
    pub async fn grow(&mut self) -> Result<(), StreamEnd> {
        self.fill(self.available() + 1).await
    }

    /// All bytes currently buffered and not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    pub fn consume(&mut self, n: usize) {
        self.pos += n;
    }
}

// ---------------------------------------------------------------------------
// Direction classifier
// ---------------------------------------------------------------------------

const RESPONSE_PREFIX: &[u8] = b"HTTP/";

/// A stream carries requests (client → server) or responses (server →
/// client), decided purely from the first 5 bytes (spec §4.2): no
/// header-based heuristic or reverse-flow handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Peek the stream's opening bytes and classify its direction. Blocks for 5
/// bytes or until end-of-stream (a stream that ends with fewer than 5 bytes
/// is classified as a request, matching the literal-prefix check failing).
pub async fn classify(stream: &mut FlowByteStream) -> Direction {
    match stream.peek(RESPONSE_PREFIX.len()).await {
        Ok(bytes) if bytes == RESPONSE_PREFIX => Direction::Response,
        _ => Direction::Request,
    }
}

// ---------------------------------------------------------------------------
// Flow worker
// ---------------------------------------------------------------------------

/// One fully-parsed HTTP message: head metadata plus its consumed body.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub direction: Direction,
    pub head: MessageHead,
    pub body: BodySummary,
}

/// Per-flow callbacks the worker invokes for each fully-parsed message.
pub trait MessageSink: Send {
    /// Whether a body in this direction should be materialized in full when
    /// its content type is textual (spec §4.4: responses are gated by the
    /// `printBody` flag, requests by whether any replay rule is configured).
    /// Default allows it, matching a sink with no such policy.
    fn should_materialize(&self, direction: Direction) -> bool {
        let _ = direction;
        true
    }

    fn on_message(&self, key: FlowKey, message: ParsedMessage) -> impl std::future::Future<Output = ()> + Send;
}

/// Drive one flow's byte stream to completion: classify direction,
/// instantiate the matching Message Reader, and feed every parsed message
/// to `sink` until end-of-stream or an unrecoverable parse error.
pub async fn run_flow_worker<S: MessageSink>(key: FlowKey, rx: FlowReceiver, sink: S) {
    info!(flow = %key, "flow worker started");
    let mut stream = FlowByteStream::new(rx);
    let direction = classify(&mut stream).await;

    match direction {
        Direction::Request => {
            let mut reader = RequestReader::new(stream);
            run_reader_loop(key, direction, &mut reader, &sink).await;
        }
        Direction::Response => {
            let mut reader = ResponseReader::new(stream);
            run_reader_loop(key, direction, &mut reader, &sink).await;
        }
    }

    info!(flow = %key, "flow worker ended");
}

async fn run_reader_loop<R: MessageReader, S: MessageSink>(
    key: FlowKey,
    direction: Direction,
    reader: &mut R,
    sink: &S,
) {
    loop {
        match reader.read().await {
            ReadOutcome::Message(head) => {
                info!(flow = %key, message = %head.summary_line(), "received message");
                let framing = head.framing();
                let headers = head.headers().clone();
                let materialize = sink.should_materialize(direction);
                let body = match consume_body(reader.stream_mut(), framing, &headers, materialize).await {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(flow = %key, error = %e, "body read error, terminating worker");
                        return;
                    }
                };
                sink.on_message(
                    key,
                    ParsedMessage {
                        direction,
                        head,
                        body,
                    },
                )
                .await;
            }
            ReadOutcome::EndOfStream => {
                info!(flow = %key, "end of stream");
                return;
            }
            ReadOutcome::ParseError(e) => {
                warn!(flow = %key, error = %e, "parse error, terminating worker");
                return;
            }
        }
    }
}
