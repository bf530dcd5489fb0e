//! Incremental HTTP/1.x request parser
//!
//! Bytes may arrive split at any point. The parser keeps just enough state
//! to resume (a partial line, or the remaining body length) and reports what
//! it recognised through [`ParserCallbacks`]:
//!
//! ```text
//!   RequestLine ──url──▶ Headers ──header*──▶ headers complete
//!                                                  │
//!                      ┌───────────────────────────┼─────────────────────┐
//!                      ▼                           ▼                     ▼
//!               Body { remaining }        ChunkSize ⇄ ChunkData       no body
//!                      │                           │                     │
//!                      └──────────── body* ────────┴──▶ message complete ◀┘
//! ```
//!
//! A parser handles exactly one message; `feed` stops consuming at the end
//! of it and returns how many bytes it used, so any bytes of a pipelined
//! next request are left with the caller. Any callback can return
//! `ControlFlow::Break(())` to stop parsing at that event.

use std::mem;
use std::ops::ControlFlow;

use thiserror::Error;

use crate::request::Method;

pub type Flow = ControlFlow<()>;

/// What is known about a request once its header block is complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHead {
    pub method: Method,
    /// e.g. `"1.1"`
    pub version: String,
    pub keep_alive: bool,
}

/// Receives parse events, all default to `Continue`
pub trait ParserCallbacks {
    fn on_message_begin(&mut self) -> Flow {
        Flow::Continue(())
    }
    fn on_url(&mut self, _url: &[u8]) -> Flow {
        Flow::Continue(())
    }
    fn on_header(&mut self, _name: &[u8], _value: &[u8]) -> Flow {
        Flow::Continue(())
    }
    fn on_headers_complete(&mut self, _head: &MessageHead) -> Flow {
        Flow::Continue(())
    }
    fn on_body(&mut self, _chunk: &[u8]) -> Flow {
        Flow::Continue(())
    }
    fn on_message_complete(&mut self) -> Flow {
        Flow::Continue(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid request line")]
    InvalidRequestLine,
    #[error("invalid HTTP method")]
    InvalidMethod,
    #[error("invalid HTTP version")]
    InvalidVersion,
    #[error("invalid header")]
    InvalidHeader,
    #[error("invalid content-length")]
    InvalidContentLength,
    #[error("invalid transfer-encoding")]
    InvalidTransferEncoding,
    #[error("both content-length and transfer-encoding present")]
    AmbiguousBodyLength,
    #[error("invalid chunk")]
    InvalidChunk,
    #[error("request line too long")]
    RequestLineTooLong,
    #[error("header line too long")]
    HeaderLineTooLong,
    #[error("too many headers")]
    TooManyHeaders,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserLimits {
    /// Longest request line, header line or chunk size line
    pub max_line_len: usize,
    pub max_header_count: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_line_len: 8 * 1024,
            max_header_count: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestLine,
    Headers,
    Body { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    Complete,
}

#[derive(Debug)]
pub struct RequestParser {
    limits: ParserLimits,
    state: State,
    line: Vec<u8>,
    method: Option<Method>,
    version: (u8, u8),
    header_count: usize,
    content_length: Option<u64>,
    transfer_encoding: bool,
    chunked: bool,
    conn_close: bool,
    conn_keep_alive: bool,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self::with_limits(ParserLimits::default())
    }

    pub fn with_limits(limits: ParserLimits) -> Self {
        Self {
            limits,
            state: State::RequestLine,
            line: Vec::new(),
            method: None,
            version: (1, 1),
            header_count: 0,
            content_length: None,
            transfer_encoding: false,
            chunked: false,
            conn_close: false,
            conn_keep_alive: false,
        }
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    /// Version as it appears on the status line, e.g. `"1.1"`
    pub fn http_version(&self) -> String {
        format!("{}.{}", self.version.0, self.version.1)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// True once any byte of the request line has been seen
    pub fn has_started(&self) -> bool {
        self.state != State::RequestLine || !self.line.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Whether the connection may carry another request after this one
    ///
    /// HTTP/1.1 and later default to persistent connections unless the
    /// client sent `Connection: close`; HTTP/1.0 needs an explicit
    /// `Connection: keep-alive`.
    pub fn should_keep_alive(&self) -> bool {
        if self.conn_close {
            return false;
        }
        if self.version >= (1, 1) {
            true
        } else {
            self.version == (1, 0) && self.conn_keep_alive
        }
    }

    /// Parse as much of `data` as belongs to this message
    ///
    /// Returns the number of bytes consumed. That is less than `data.len()`
    /// when the message completed early or a callback asked to stop.
    pub fn feed<C: ParserCallbacks>(&mut self, data: &[u8], cb: &mut C) -> Result<usize, ParseError> {
        let mut pos = 0;
        while pos < data.len() {
            match self.state {
                State::Complete => break,
                State::RequestLine => {
                    let Some(line) = self.take_line(data, &mut pos, ParseError::RequestLineTooLong)? else {
                        break;
                    };
                    // Stray CRLFs before a request line are allowed
                    if line.is_empty() {
                        continue;
                    }
                    let url = self.request_line(&line)?;
                    self.state = State::Headers;
                    if cb.on_message_begin().is_break() || cb.on_url(url).is_break() {
                        return Ok(pos);
                    }
                }
                State::Headers => {
                    let Some(line) = self.take_line(data, &mut pos, ParseError::HeaderLineTooLong)? else {
                        break;
                    };
                    if line.is_empty() {
                        self.state = self.body_state()?;
                        if cb.on_headers_complete(&self.head()).is_break() {
                            return Ok(pos);
                        }
                        if self.state == State::Complete {
                            let _ = cb.on_message_complete();
                            return Ok(pos);
                        }
                        continue;
                    }
                    let (name, value) = self.header_line(&line)?;
                    if cb.on_header(name, value).is_break() {
                        return Ok(pos);
                    }
                }
                State::Body { remaining } | State::ChunkData { remaining } => {
                    let available = (data.len() - pos) as u64;
                    let n = remaining.min(available) as usize;
                    let chunk = &data[pos..pos + n];
                    pos += n;
                    let remaining = remaining - n as u64;

                    let chunked = matches!(self.state, State::ChunkData { .. });
                    self.state = match (chunked, remaining) {
                        (false, 0) => State::Complete,
                        (false, r) => State::Body { remaining: r },
                        (true, 0) => State::ChunkDataEnd,
                        (true, r) => State::ChunkData { remaining: r },
                    };
                    if cb.on_body(chunk).is_break() {
                        return Ok(pos);
                    }
                    if self.state == State::Complete {
                        let _ = cb.on_message_complete();
                        return Ok(pos);
                    }
                }
                State::ChunkSize => {
                    let Some(line) = self.take_line(data, &mut pos, ParseError::InvalidChunk)? else {
                        break;
                    };
                    let size = chunk_size(&line)?;
                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::ChunkData { remaining: size }
                    };
                }
                State::ChunkDataEnd => {
                    let Some(line) = self.take_line(data, &mut pos, ParseError::InvalidChunk)? else {
                        break;
                    };
                    if !line.is_empty() {
                        return Err(ParseError::InvalidChunk);
                    }
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    let Some(line) = self.take_line(data, &mut pos, ParseError::HeaderLineTooLong)? else {
                        break;
                    };
                    if line.is_empty() {
                        self.state = State::Complete;
                        let _ = cb.on_message_complete();
                        return Ok(pos);
                    }
                }
            }
        }
        Ok(pos)
    }

    /// Complete line starting at `pos`, without its line ending
    ///
    /// A line split across feeds is accumulated in `self.line`.
    fn take_line(&mut self, data: &[u8], pos: &mut usize, too_long: ParseError) -> Result<Option<Vec<u8>>, ParseError> {
        let rest = &data[*pos..];
        match rest.iter().position(|&b| b == b'\n') {
            Some(i) => {
                self.line.extend_from_slice(&rest[..i]);
                *pos += i + 1;
                let mut line = mem::take(&mut self.line);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.len() > self.limits.max_line_len {
                    return Err(too_long);
                }
                Ok(Some(line))
            }
            None => {
                self.line.extend_from_slice(rest);
                *pos = data.len();
                // One extra byte for a trailing CR
                if self.line.len() > self.limits.max_line_len + 1 {
                    return Err(too_long);
                }
                Ok(None)
            }
        }
    }

    fn request_line<'a>(&mut self, line: &'a [u8]) -> Result<&'a [u8], ParseError> {
        let mut parts = line.split(|&b| b == b' ');
        let (Some(method), Some(url), Some(version), None) = (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::InvalidRequestLine);
        };
        if url.is_empty() || url.iter().any(|&b| b < 0x21 || b == 0x7f) {
            return Err(ParseError::InvalidRequestLine);
        }
        self.method = Some(Method::from_bytes(method).ok_or(ParseError::InvalidMethod)?);
        self.version = parse_version(version)?;
        Ok(url)
    }

    fn header_line<'a>(&mut self, line: &'a [u8]) -> Result<(&'a [u8], &'a [u8]), ParseError> {
        if self.header_count == self.limits.max_header_count {
            return Err(ParseError::TooManyHeaders);
        }
        self.header_count += 1;

        let colon = line.iter().position(|&b| b == b':').ok_or(ParseError::InvalidHeader)?;
        let name = &line[..colon];
        if name.is_empty() || !name.iter().all(|&b| is_token(b)) {
            // Also rejects obsolete line folding, which starts with whitespace
            return Err(ParseError::InvalidHeader);
        }
        let value = trim_ows(&line[colon + 1..]);
        if value.iter().any(|&b| b == 0 || b == b'\r') {
            return Err(ParseError::InvalidHeader);
        }

        if name.eq_ignore_ascii_case(b"content-length") {
            let n = parse_decimal(value).ok_or(ParseError::InvalidContentLength)?;
            if self.content_length.is_some_and(|prev| prev != n) {
                return Err(ParseError::InvalidContentLength);
            }
            self.content_length = Some(n);
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            self.transfer_encoding = true;
            // Only the final coding decides the framing
            let last = value.rsplit(|&b| b == b',').next().map(trim_ows).unwrap_or_default();
            self.chunked = last.eq_ignore_ascii_case(b"chunked");
        } else if name.eq_ignore_ascii_case(b"connection") {
            for token in value.split(|&b| b == b',').map(trim_ows) {
                if token.eq_ignore_ascii_case(b"close") {
                    self.conn_close = true;
                } else if token.eq_ignore_ascii_case(b"keep-alive") {
                    self.conn_keep_alive = true;
                }
            }
        }
        Ok((name, value))
    }

    fn head(&self) -> MessageHead {
        MessageHead {
            method: self.method.unwrap_or(Method::Get),
            version: self.http_version(),
            keep_alive: self.should_keep_alive(),
        }
    }

    fn body_state(&self) -> Result<State, ParseError> {
        if self.transfer_encoding {
            if self.content_length.is_some() {
                return Err(ParseError::AmbiguousBodyLength);
            }
            if !self.chunked {
                return Err(ParseError::InvalidTransferEncoding);
            }
            return Ok(State::ChunkSize);
        }
        Ok(match self.content_length {
            Some(n) if n > 0 => State::Body { remaining: n },
            _ => State::Complete,
        })
    }
}

fn parse_version(v: &[u8]) -> Result<(u8, u8), ParseError> {
    match v {
        [b'H', b'T', b'T', b'P', b'/', major, b'.', minor] if major.is_ascii_digit() && minor.is_ascii_digit() => {
            Ok((major - b'0', minor - b'0'))
        }
        _ => Err(ParseError::InvalidVersion),
    }
}

fn parse_decimal(v: &[u8]) -> Option<u64> {
    if v.is_empty() || v.len() > 19 || !v.iter().all(u8::is_ascii_digit) {
        return None;
    }
    Some(v.iter().fold(0u64, |acc, d| acc * 10 + u64::from(d - b'0')))
}

fn chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let digits = line.split(|&b| b == b';').next().map(trim_ows).unwrap_or_default();
    if digits.is_empty() || digits.len() > 15 {
        return Err(ParseError::InvalidChunk);
    }
    digits.iter().try_fold(0u64, |acc, &b| {
        let d = (b as char).to_digit(16).ok_or(ParseError::InvalidChunk)?;
        Ok(acc * 16 + u64::from(d))
    })
}

fn trim_ows(mut v: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = v {
        v = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = v {
        v = rest;
    }
    v
}

fn is_token(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
