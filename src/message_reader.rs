//! Incremental HTTP/1.x message parsing on top of a flow's byte stream.
//!
//! Two variants, `RequestReader` and `ResponseReader`, each expose
//! `read() -> ReadOutcome` in a loop (spec §4.3). Header tokenizing uses
//! `httparse`; the returned [`MessageHead`] does not include the body —
//! callers must consume it (via [`crate::body`]) before calling `read()`
//! again, mirroring `original_source/parser.go`'s `http.ReadRequest`, whose
//! returned `*http.Request` likewise carries an unread `Body`.

use thiserror::Error;

use crate::flow::{FlowByteStream, StreamEnd};
use crate::message::{framing_from_headers, Headers, MessageHead};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("stream ended mid-message")]
    Truncated,
    #[error("stream discontinuity mid-message")]
    Discontinuity,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("header block exceeded {MAX_HEADER_BYTES} bytes")]
    HeaderTooLarge,
}

#[derive(Debug)]
pub enum ReadOutcome {
    Message(MessageHead),
    EndOfStream,
    ParseError(ParseError),
}

/// Shared interface for the request/response readers, plus access to the
/// underlying stream so the Body Handler can consume the message body that
/// `read()` deliberately leaves untouched.
pub trait MessageReader {
    fn stream_mut(&mut self) -> &mut FlowByteStream;
    fn read(&mut self) -> impl std::future::Future<Output = ReadOutcome> + Send;
}

/// Grow `stream`'s buffer until either a head parse succeeds or the stream
/// ends. Returns `Ok(None)` for a clean end-of-stream with no bytes ever
/// buffered (the normal "no more messages" case), `Ok(Some(buffered_len))`
/// once growth should stop and parsing should be retried, or an error.
async fn await_growth(stream: &mut FlowByteStream) -> Result<Option<usize>, ReadOutcome> {
    if stream.buffered().len() > MAX_HEADER_BYTES {
        return Err(ReadOutcome::ParseError(ParseError::HeaderTooLarge));
    }
    match stream.grow().await {
        Ok(()) => Ok(Some(stream.buffered().len())),
        Err(StreamEnd::Eof) if stream.buffered().is_empty() => Ok(None),
        Err(StreamEnd::Eof) => Err(ReadOutcome::ParseError(ParseError::Truncated)),
        Err(StreamEnd::Discontinuity) => Err(ReadOutcome::ParseError(ParseError::Discontinuity)),
    }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Headers {
    let mut headers = Headers::default();
    for h in raw {
        headers.push(
            h.name.to_owned(),
            String::from_utf8_lossy(h.value).into_owned(),
        );
    }
    headers
}

// ---------------------------------------------------------------------------
// RequestReader
// ---------------------------------------------------------------------------

pub struct RequestReader {
    stream: FlowByteStream,
}

impl RequestReader {
    pub fn new(stream: FlowByteStream) -> Self {
        RequestReader { stream }
    }
}

impl MessageReader for RequestReader {
    fn stream_mut(&mut self) -> &mut FlowByteStream {
        &mut self.stream
    }

    async fn read(&mut self) -> ReadOutcome {
        loop {
            let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut req = httparse::Request::new(&mut header_storage);
            match req.parse(self.stream.buffered()) {
                Ok(httparse::Status::Complete(consumed)) => {
                    let method = req.method.unwrap_or("").to_owned();
                    let uri = req.path.unwrap_or("").to_owned();
                    let version = (1, req.version.unwrap_or(1));
                    let headers = collect_headers(req.headers);
                    self.stream.consume(consumed);
                    let framing = framing_from_headers(&headers, false);
                    return ReadOutcome::Message(MessageHead::Request {
                        method,
                        uri,
                        version,
                        headers,
                        framing,
                    });
                }
                Ok(httparse::Status::Partial) => match await_growth(&mut self.stream).await {
                    Ok(Some(_)) => continue,
                    Ok(None) => return ReadOutcome::EndOfStream,
                    Err(outcome) => return outcome,
                },
                Err(e) => return ReadOutcome::ParseError(ParseError::Malformed(e.to_string())),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ResponseReader
// ---------------------------------------------------------------------------

pub struct ResponseReader {
    stream: FlowByteStream,
}

impl ResponseReader {
    pub fn new(stream: FlowByteStream) -> Self {
        ResponseReader { stream }
    }
}

impl MessageReader for ResponseReader {
    fn stream_mut(&mut self) -> &mut FlowByteStream {
        &mut self.stream
    }

    async fn read(&mut self) -> ReadOutcome {
        loop {
            let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut resp = httparse::Response::new(&mut header_storage);
            match resp.parse(self.stream.buffered()) {
                Ok(httparse::Status::Complete(consumed)) => {
                    let status = resp.code.unwrap_or(0);
                    let reason = resp.reason.unwrap_or("").to_owned();
                    let version = (1, resp.version.unwrap_or(1));
                    let headers = collect_headers(resp.headers);
                    self.stream.consume(consumed);
                    let framing = framing_from_headers(&headers, true);
                    return ReadOutcome::Message(MessageHead::Response {
                        version,
                        status,
                        reason,
                        headers,
                        framing,
                    });
                }
                Ok(httparse::Status::Partial) => match await_growth(&mut self.stream).await {
                    Ok(Some(_)) => continue,
                    Ok(None) => return ReadOutcome::EndOfStream,
                    Err(outcome) => return outcome,
                },
                Err(e) => return ReadOutcome::ParseError(ParseError::Malformed(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{flow_channel, FlowChunk};
    use bytes::Bytes;

    async fn stream_of(data: &'static [u8]) -> FlowByteStream {
        let (tx, rx) = flow_channel();
        tx.send(FlowChunk::Data(Bytes::from_static(data)))
            .await
            .unwrap();
        tx.send(FlowChunk::Eof).await.unwrap();
        FlowByteStream::new(rx)
    }

    #[tokio::test]
    async fn parses_simple_get_request() {
        let s = stream_of(b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n").await;
        let mut r = RequestReader::new(s);
        match r.read().await {
            ReadOutcome::Message(MessageHead::Request { method, uri, .. }) => {
                assert_eq!(method, "GET");
                assert_eq!(uri, "/ping");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn parses_simple_response_with_content_length() {
        let s = stream_of(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;
        let mut r = ResponseReader::new(s);
        match r.read().await {
            ReadOutcome::Message(MessageHead::Response { status, framing, .. }) => {
                assert_eq!(status, 200);
                assert_eq!(framing, crate::message::BodyFraming::Fixed(5));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_stream_is_clean_end_of_stream() {
        let (tx, rx) = flow_channel();
        tx.send(FlowChunk::Eof).await.unwrap();
        let s = FlowByteStream::new(rx);
        let mut r = RequestReader::new(s);
        assert!(matches!(r.read().await, ReadOutcome::EndOfStream));
    }

    #[tokio::test]
    async fn truncated_request_is_a_parse_error() {
        let s = stream_of(b"GET /ping HTTP/1.1\r\nHost:").await;
        let mut r = RequestReader::new(s);
        assert!(matches!(
            r.read().await,
            ReadOutcome::ParseError(ParseError::Truncated)
        ));
    }
}
