//! HTTP/1.1 framing for the session loop
//!
//! ## Responsibilities
//!
//! - Accumulate a request head (bounded; overflow is reported, not fatal,
//!   so the session can answer 400 before closing)
//! - Parse the request line and the headers the hub cares about
//! - Accumulate a `Content-Length` body across reads
//! - Drain unread body bytes before the next request on the connection
//! - Serialize uniform responses (Server header, Content-Length, optional
//!   `Connection: close`)
//!
//! The hub speaks a deliberately small subset of HTTP: one request at a time
//! per connection, no chunked bodies, no multi-line headers.

use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 2048;
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Outcome of reading one request head.
#[derive(Debug)]
pub enum HeadOutcome {
    /// Complete head, including the terminating blank line.
    Head(Vec<u8>),
    /// The head outgrew the configured cap before terminating.
    Overflow,
    /// Peer closed the connection.
    Closed,
}

/// Outcome of a body read.
#[derive(Debug, PartialEq, Eq)]
pub enum BodyOutcome {
    Complete,
    Closed,
}

/// Parsed request line + relevant headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub query: String,
    pub content_length: Option<i64>,
}

/// An as-yet-unparsed request, constructed when a complete head arrives.
#[derive(Debug)]
pub struct HttpRequest {
    raw_head: Vec<u8>,
}

impl HttpRequest {
    pub fn new(raw_head: Vec<u8>) -> Self {
        Self { raw_head }
    }

    /// Parse the request line and headers.
    pub fn parse(&self) -> Result<RequestHead, ()> {
        let text = std::str::from_utf8(&self.raw_head).map_err(|_| ())?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().ok_or(())?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or(())?.to_string();
        let target = parts.next().ok_or(())?;
        let version = parts.next().ok_or(())?;
        if !version.starts_with("HTTP/") {
            return Err(());
        }

        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (target.to_string(), String::new()),
        };

        let mut content_length = None;
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse::<i64>().ok();
                }
            }
        }

        Ok(RequestHead {
            method,
            path,
            query,
            content_length,
        })
    }
}

/// Buffered reader side of one connection.
///
/// Bytes past a request head stay in `buf` and are consumed by the body
/// reader (or the drain) of the same request.
pub struct Connection<R> {
    reader: R,
    buf: Vec<u8>,
    max_head: usize,
}

impl<R: AsyncRead + Unpin> Connection<R> {
    pub fn new(reader: R, max_head: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            max_head,
        }
    }

    /// Read until a complete request head (or overflow / close).
    pub async fn read_head(&mut self) -> std::io::Result<HeadOutcome> {
        loop {
            if let Some(pos) = find_terminator(&self.buf) {
                let head: Vec<u8> = self.buf.drain(..pos + HEAD_TERMINATOR.len()).collect();
                return Ok(HeadOutcome::Head(head));
            }
            if self.buf.len() > self.max_head {
                return Ok(HeadOutcome::Overflow);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(HeadOutcome::Closed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Accumulate body bytes until `body` holds `content_length` bytes.
    pub async fn read_body(
        &mut self,
        body: &mut Vec<u8>,
        content_length: usize,
    ) -> std::io::Result<BodyOutcome> {
        loop {
            if !self.buf.is_empty() && body.len() < content_length {
                let take = (content_length - body.len()).min(self.buf.len());
                body.extend(self.buf.drain(..take));
            }
            if body.len() >= content_length {
                return Ok(BodyOutcome::Complete);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(BodyOutcome::Closed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "Unknown",
    }
}

/// Serialize a full response.
pub fn build_response(
    server_header: &str,
    status: u16,
    body: Option<&str>,
    close: bool,
) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nServer: {}\r\n",
        status,
        status_reason(status),
        server_header
    );
    if let Some(body) = body {
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    if close {
        out.push_str("Connection: close\r\n");
    }
    out.push_str("\r\n");
    let mut bytes = out.into_bytes();
    if let Some(body) = body {
        bytes.extend_from_slice(body.as_bytes());
    }
    bytes
}
