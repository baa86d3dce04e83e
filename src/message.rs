//! HTTP message types shared between the Message Reader and Body Handler.

/// A single HTTP header, preserving the original casing of the name.
#[derive(Debug, Clone)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// An ordered collection of headers with case-insensitive lookup, mirroring
/// the "each header forwarded as a single value (first value chosen when
/// multiple are present)" rule from spec §4.5.
#[derive(Debug, Clone, Default)]
pub struct Headers(pub Vec<Header>);

impl Headers {
    pub fn push(&mut self, name: String, value: String) {
        self.0.push(Header { name, value });
    }

    /// First value for a header name, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|h| (h.name.as_str(), h.value.as_str()))
    }
}

/// How a message's body is delimited, decided from its headers in the
/// priority order specified in spec §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body at all.
    None,
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// `Content-Length: N`.
    Fixed(u64),
    /// Responses only: no length given, body runs until connection close.
    UntilClose,
}

/// Parsed message metadata, with the body not yet consumed.
#[derive(Debug, Clone)]
pub enum MessageHead {
    Request {
        method: String,
        uri: String,
        version: (u8, u8),
        headers: Headers,
        framing: BodyFraming,
    },
    Response {
        version: (u8, u8),
        status: u16,
        reason: String,
        headers: Headers,
        framing: BodyFraming,
    },
}

impl MessageHead {
    pub fn headers(&self) -> &Headers {
        match self {
            MessageHead::Request { headers, .. } => headers,
            MessageHead::Response { headers, .. } => headers,
        }
    }

    pub fn framing(&self) -> BodyFraming {
        match self {
            MessageHead::Request { framing, .. } => *framing,
            MessageHead::Response { framing, .. } => *framing,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, MessageHead::Request { .. })
    }

    /// One-line summary, e.g. `GET /ping HTTP/1.1` or `HTTP/1.1 200 OK`.
    pub fn summary_line(&self) -> String {
        match self {
            MessageHead::Request {
                method,
                uri,
                version,
                ..
            } => format!("{method} {uri} HTTP/{}.{}", version.0, version.1),
            MessageHead::Response {
                version,
                status,
                reason,
                ..
            } => format!("HTTP/{}.{} {status} {reason}", version.0, version.1),
        }
    }
}

/// Determine body framing from a header set per spec §4.3's priority order.
/// `is_response` controls whether an unlengthed response falls back to
/// until-close (requests with no framing info simply have no body).
pub fn framing_from_headers(headers: &Headers, is_response: bool) -> BodyFraming {
    if let Some(te) = headers.get("Transfer-Encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return BodyFraming::Chunked;
        }
    }
    if let Some(cl) = headers.get("Content-Length") {
        if let Ok(n) = cl.trim().parse::<u64>() {
            return BodyFraming::Fixed(n);
        }
    }
    if is_response {
        BodyFraming::UntilClose
    } else {
        BodyFraming::None
    }
}
