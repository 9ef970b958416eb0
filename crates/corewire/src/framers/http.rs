//! HTTP/1.x framing: request/status line + headers, then either a
//! `Content-Length` body, a chunked body, or no body at all.
//!
//! Grounded on `HttpDataCutter.cpp`/`HttpHeaderDecl.h` from the original
//! implementation this crate replaces, re-expressed as two [`Cut`]
//! implementations (`MsgCut` for the header + non-chunked body, `ChunkCut`
//! for the inner chunked sub-cutter) composed by [`HttpFramer`].

use std::collections::HashMap;

use crate::buffer::Data;
use crate::cutter::{Cut, HeaderOutcome, TapeCutter};
use crate::error::{NetError, Result};
use crate::resource::DataResource;

/// Cap on a single chunk's declared size (`"FFFF\r\n"`).
pub const MAX_CHUNK_BYTES: usize = 65_535;
const CHUNK_SEPARATOR_LEN: usize = 2; // "\r\n"

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
    Http2,
}

impl HttpVersion {
    fn from_minor(minor: u8) -> Self {
        if minor == 0 { Self::Http10 } else { Self::Http11 }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 | Self::Http2 => "HTTP/1.1",
        }
    }
}

/// A subset of the original's ~100-entry field table: the fields this
/// crate's framers and servers actually inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownField {
    Host,
    ContentLength,
    TransferEncoding,
    Connection,
    ContentType,
    Upgrade,
    SecWebSocketKey,
    SecWebSocketAccept,
    SecWebSocketVersion,
    SecWebSocketProtocol,
    Location,
    UserAgent,
    Accept,
    Date,
    Authorization,
    CacheControl,
    Cookie,
    SetCookie,
    ContentEncoding,
    Origin,
    Server,
}

impl KnownField {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "host" => Self::Host,
            "content-length" => Self::ContentLength,
            "transfer-encoding" => Self::TransferEncoding,
            "connection" => Self::Connection,
            "content-type" => Self::ContentType,
            "upgrade" => Self::Upgrade,
            "sec-websocket-key" => Self::SecWebSocketKey,
            "sec-websocket-accept" => Self::SecWebSocketAccept,
            "sec-websocket-version" => Self::SecWebSocketVersion,
            "sec-websocket-protocol" => Self::SecWebSocketProtocol,
            "location" => Self::Location,
            "user-agent" => Self::UserAgent,
            "accept" => Self::Accept,
            "date" => Self::Date,
            "authorization" => Self::Authorization,
            "cache-control" => Self::CacheControl,
            "cookie" => Self::Cookie,
            "set-cookie" => Self::SetCookie,
            "content-encoding" => Self::ContentEncoding,
            "origin" => Self::Origin,
            "server" => Self::Server,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "Host",
            Self::ContentLength => "Content-Length",
            Self::TransferEncoding => "Transfer-Encoding",
            Self::Connection => "Connection",
            Self::ContentType => "Content-Type",
            Self::Upgrade => "Upgrade",
            Self::SecWebSocketKey => "Sec-WebSocket-Key",
            Self::SecWebSocketAccept => "Sec-WebSocket-Accept",
            Self::SecWebSocketVersion => "Sec-WebSocket-Version",
            Self::SecWebSocketProtocol => "Sec-WebSocket-Protocol",
            Self::Location => "Location",
            Self::UserAgent => "User-Agent",
            Self::Accept => "Accept",
            Self::Date => "Date",
            Self::Authorization => "Authorization",
            Self::CacheControl => "Cache-Control",
            Self::Cookie => "Cookie",
            Self::SetCookie => "Set-Cookie",
            Self::ContentEncoding => "Content-Encoding",
            Self::Origin => "Origin",
            Self::Server => "Server",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, target: String },
    Response { status: u16, reason: String },
}

/// A parsed HTTP/1.x header block. Exactly one of a request-line or a
/// status-line is present, matched by [`StartLine`].
#[derive(Debug, Clone)]
pub struct HttpHeader {
    pub version: HttpVersion,
    pub start_line: StartLine,
    known: HashMap<KnownField, String>,
    unknown: HashMap<String, String>,
}

impl HttpHeader {
    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    pub fn field(&self, field: KnownField) -> Option<&str> {
        self.known.get(&field).map(String::as_str)
    }

    pub fn has_field(&self, field: KnownField) -> bool {
        self.known.contains_key(&field)
    }

    pub fn unknown_field(&self, name: &str) -> Option<&str> {
        self.unknown.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn known_fields(&self) -> impl Iterator<Item = (KnownField, &str)> {
        self.known.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn unknown_fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.unknown.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn request(version: HttpVersion, method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            version,
            start_line: StartLine::Request { method: method.into(), target: target.into() },
            known: HashMap::new(),
            unknown: HashMap::new(),
        }
    }

    pub fn response(version: HttpVersion, status: u16, reason: impl Into<String>) -> Self {
        Self {
            version,
            start_line: StartLine::Response { status, reason: reason.into() },
            known: HashMap::new(),
            unknown: HashMap::new(),
        }
    }

    pub fn set_field(&mut self, field: KnownField, value: impl Into<String>) {
        self.known.insert(field, value.into());
    }

    pub fn set_unknown_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.unknown.insert(name.into().to_ascii_lowercase(), value.into());
    }

    /// Serializes the request-line/status-line and header block, including
    /// the trailing blank line. Does not touch the body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match &self.start_line {
            StartLine::Request { method, target } => {
                out.extend_from_slice(format!("{method} {target} {}\r\n", self.version.as_str()).as_bytes());
            }
            StartLine::Response { status, reason } => {
                out.extend_from_slice(
                    format!("{} {status} {reason}\r\n", self.version.as_str()).as_bytes(),
                );
            }
        }
        for (field, value) in &self.known {
            out.extend_from_slice(format!("{}: {value}\r\n", field.as_str()).as_bytes());
        }
        for (name, value) in &self.unknown {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    None,
    ContentLength,
    Chunked,
}

/// Parses one request-line/status-line + header block out of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet contain a complete header
/// block (`\r\n\r\n` not found).
fn parse_header_block(buf: &[u8]) -> Result<Option<(usize, HttpHeader)>> {
    let mut raw_headers = [httparse::EMPTY_HEADER; 64];

    if buf.starts_with(b"HTTP/") {
        let mut resp = httparse::Response::new(&mut raw_headers);
        match resp
            .parse(buf)
            .map_err(|e| NetError::FramingParse(format!("http status line: {e}")))?
        {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(consumed) => {
                let version = HttpVersion::from_minor(resp.version.unwrap_or(1));
                let status = resp.code.unwrap_or(0);
                let reason = resp.reason.unwrap_or_default().to_string();
                let (known, unknown) = split_fields(resp.headers);
                Ok(Some((
                    consumed,
                    HttpHeader { version, start_line: StartLine::Response { status, reason }, known, unknown },
                )))
            }
        }
    } else {
        let mut req = httparse::Request::new(&mut raw_headers);
        match req.parse(buf).map_err(|e| NetError::FramingParse(format!("http request line: {e}")))? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(consumed) => {
                let version = HttpVersion::from_minor(req.version.unwrap_or(1));
                let method = req.method.unwrap_or_default().to_string();
                let target = req.path.unwrap_or_default().to_string();
                if target.is_empty() {
                    return Err(NetError::FramingParse("empty request target".into()));
                }
                let (known, unknown) = split_fields(req.headers);
                Ok(Some((
                    consumed,
                    HttpHeader { version, start_line: StartLine::Request { method, target }, known, unknown },
                )))
            }
        }
    }
}

fn split_fields(raw: &[httparse::Header]) -> (HashMap<KnownField, String>, HashMap<String, String>) {
    let mut known = HashMap::new();
    let mut unknown = HashMap::new();
    for h in raw {
        if h.name.is_empty() {
            continue;
        }
        let value = String::from_utf8_lossy(h.value).trim().to_string();
        if let Some(field) = KnownField::from_name(h.name) {
            known.insert(field, value);
        } else {
            unknown.insert(h.name.to_ascii_lowercase(), value);
        }
    }
    (known, unknown)
}

fn body_mode(header: &HttpHeader) -> Result<(BodyMode, u64)> {
    // Transfer-Encoding wins over Content-Length per RFC 7230 §3.3.3; a
    // Content-Length alongside `chunked` is recorded but ignored for framing.
    if let Some(te) = header.field(KnownField::TransferEncoding) {
        if te.eq_ignore_ascii_case("chunked") {
            return Ok((BodyMode::Chunked, 0));
        }
        return Err(NetError::FramingParse(format!("unsupported transfer-encoding: {te}")));
    }
    if let Some(len) = header.field(KnownField::ContentLength) {
        let len: u64 =
            len.parse().map_err(|_| NetError::FramingParse(format!("bad content-length: {len}")))?;
        return Ok((BodyMode::ContentLength, len));
    }
    Ok((BodyMode::None, 0))
}

/// Header + non-chunked body. When the header indicates a chunked transfer,
/// reports `HeaderOutcome::FoundHandoff` instead of a body size, so
/// `TapeCutter` stops after the header rather than trying to reparse the
/// chunk bytes as another HTTP request; [`HttpFramer`] then redirects the
/// remaining tape to its [`ChunkCut`]. The message itself is only pushed to
/// `completed` once the real (chunked) body finishes.
struct MsgCut {
    header: Option<HttpHeader>,
    resource: DataResource,
    mode: BodyMode,
    mem_cache_bytes: u64,
    /// Messages completed by this cut. A single `add_data` call can legally
    /// complete more than one (two short requests landing in the same
    /// read), so completion is recorded here as it happens rather than
    /// inferred afterwards.
    completed: Vec<HttpMessage>,
    /// Set by `add_body` on a disk IO failure; `Cut::add_body` has no
    /// `Result` return, so the error is captured here for `HttpFramer` to
    /// surface after driving the cutter.
    io_error: Option<NetError>,
}

impl MsgCut {
    fn new(mem_cache_bytes: u64) -> Self {
        Self {
            header: None,
            resource: DataResource::new(),
            mode: BodyMode::None,
            mem_cache_bytes,
            completed: Vec::new(),
            io_error: None,
        }
    }
}

impl Cut for MsgCut {
    fn find_header(&mut self, tape: &mut Data) -> HeaderOutcome {
        match parse_header_block(tape.current()) {
            Ok(None) => HeaderOutcome::KeepWaiting,
            Ok(Some((consumed, header))) => {
                let (mode, expected) = match body_mode(&header) {
                    Ok(v) => v,
                    Err(_) => return HeaderOutcome::Fail,
                };
                tape.add_offset(consumed);
                self.mode = mode;
                self.resource = DataResource::with_mem_cache_bytes(self.mem_cache_bytes);
                self.resource.set_expected_size(expected);
                self.header = Some(header);
                if mode == BodyMode::Chunked {
                    // The body doesn't belong to this cut at all; `HttpFramer`
                    // redirects whatever tape remains to `ChunkCut` right
                    // after this call returns.
                    HeaderOutcome::FoundHandoff
                } else {
                    HeaderOutcome::Found { expected_cut_size: expected }
                }
            }
            Err(_) => HeaderOutcome::Fail,
        }
    }

    fn add_body(&mut self, body: &Data) {
        if let Err(e) = self.resource.add_data(body) {
            self.io_error.get_or_insert(e);
        }
    }

    fn find_footer(&mut self, _tape: &mut Data) {
        if self.mode == BodyMode::Chunked {
            return;
        }
        if let Some(header) = self.header.take() {
            let resource = std::mem::replace(&mut self.resource, DataResource::with_mem_cache_bytes(self.mem_cache_bytes));
            self.completed.push(HttpMessage { header, resource });
        }
    }
}

/// The inner chunked-transfer sub-cutter: one cut per chunk, `"hex\r\n"`
/// header, raw bytes body, `"\r\n"` footer. A zero-length chunk finalizes
/// the joined resource.
struct ChunkCut {
    joined: DataResource,
    pending_footer_skip: bool,
    finished: bool,
    io_error: Option<NetError>,
}

impl ChunkCut {
    fn new(mem_cache_bytes: u64) -> Self {
        Self {
            joined: DataResource::with_mem_cache_bytes(mem_cache_bytes),
            pending_footer_skip: false,
            finished: false,
            io_error: None,
        }
    }
}

fn find_chunk_size_line(buf: &[u8]) -> Option<(usize, u64)> {
    let end = buf.windows(2).position(|w| w == b"\r\n")?;
    // Ignore chunk extensions (";name=value") per RFC 7230 §4.1.1.
    let size_str = &buf[..end];
    let size_str = size_str.split(|&b| b == b';').next().unwrap_or(size_str);
    let size_str = std::str::from_utf8(size_str).ok()?;
    let size = u64::from_str_radix(size_str.trim(), 16).ok()?;
    Some((end + 2, size))
}

impl Cut for ChunkCut {
    fn find_header(&mut self, tape: &mut Data) -> HeaderOutcome {
        if self.pending_footer_skip {
            tape.add_offset(CHUNK_SEPARATOR_LEN);
            self.pending_footer_skip = false;
        }

        match find_chunk_size_line(tape.current()) {
            None => HeaderOutcome::KeepWaiting,
            Some((consumed, size)) => {
                if size as usize > MAX_CHUNK_BYTES {
                    return HeaderOutcome::Fail;
                }
                tape.add_offset(consumed);
                if size == 0 {
                    self.finished = true;
                }
                HeaderOutcome::Found { expected_cut_size: size }
            }
        }
    }

    fn add_body(&mut self, body: &Data) {
        if let Err(e) = self.joined.add_data(body) {
            self.io_error.get_or_insert(e);
        }
    }

    fn find_footer(&mut self, tape: &mut Data) {
        let view = tape.current();
        if view.len() >= CHUNK_SEPARATOR_LEN && &view[..CHUNK_SEPARATOR_LEN] == b"\r\n" {
            tape.add_offset(CHUNK_SEPARATOR_LEN);
        } else {
            self.pending_footer_skip = true;
        }
        if self.finished {
            self.joined.set_expected_size(self.joined.size());
        }
    }
}

/// One fully-reassembled HTTP message: its header and body resource.
pub struct HttpMessage {
    pub header: HttpHeader,
    pub resource: DataResource,
}

/// Combines [`MsgCut`] and [`ChunkCut`] the way the original's
/// `HttpMessageBuilder` combines `MsgCutter` and `ChunkCutter`: header
/// parsing decides per-request whether the body comes from the message
/// cutter directly or is handed off to the chunk cutter.
pub struct HttpFramer {
    msg: TapeCutter<MsgCut>,
    chunk: TapeCutter<ChunkCut>,
    chunked_active: bool,
    mem_cache_bytes: u64,
    poisoned: bool,
}

impl HttpFramer {
    pub fn new(mem_cache_bytes: u64) -> Self {
        Self {
            msg: TapeCutter::new(MsgCut::new(mem_cache_bytes)),
            chunk: TapeCutter::new(ChunkCut::new(mem_cache_bytes)),
            chunked_active: false,
            mem_cache_bytes,
            poisoned: false,
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned || self.msg.is_poisoned() || self.chunk.is_poisoned()
    }

    /// Feeds `data` through whichever cutter is active, emitting zero or
    /// more completed messages into `out`. Mirrors the handoff in the
    /// original's `HttpMessageBuilder::AddData`: when the message cutter's
    /// header flips to chunked mode mid-call, the same buffer's leftover
    /// bytes are immediately redirected to the chunk cutter.
    pub fn add_data(&mut self, mut data: Data, out: &mut Vec<HttpMessage>) -> Result<()> {
        if self.poisoned {
            return Err(NetError::FramingParse("http framer poisoned".into()));
        }

        if self.chunked_active {
            self.chunk.add_data(&mut data);
        } else {
            let had_header_before = self.msg.cut().header.is_some();
            self.msg.add_data(&mut data);
            let header_just_landed = !had_header_before && self.msg.cut().header.is_some();
            if header_just_landed && self.msg.cut().mode == BodyMode::Chunked {
                self.chunked_active = true;
                self.chunk = TapeCutter::new(ChunkCut::new(self.mem_cache_bytes));
                self.chunk.add_data(&mut data);
            }
        }

        if self.msg.is_poisoned() || self.chunk.is_poisoned() {
            self.poisoned = true;
            return Err(NetError::FramingParse("malformed http message".into()));
        }

        if let Some(e) = self.msg.cut_mut().io_error.take().or_else(|| self.chunk.cut_mut().io_error.take()) {
            self.poisoned = true;
            return Err(e);
        }

        self.drain_completed(out);
        Ok(())
    }

    fn drain_completed(&mut self, out: &mut Vec<HttpMessage>) {
        if self.chunked_active && self.chunk.cut().finished {
            let header = self.msg.cut_mut().header.take().expect("chunked header present");
            let joined = std::mem::replace(
                &mut self.chunk.cut_mut().joined,
                DataResource::with_mem_cache_bytes(self.mem_cache_bytes),
            );
            out.push(HttpMessage { header, resource: joined });
            self.chunked_active = false;
            self.msg = TapeCutter::new(MsgCut::new(self.mem_cache_bytes));
            self.chunk = TapeCutter::new(ChunkCut::new(self.mem_cache_bytes));
        }
        out.append(&mut self.msg.cut_mut().completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(framer: &mut HttpFramer, chunks: &[&[u8]]) -> Vec<HttpMessage> {
        let mut out = Vec::new();
        for c in chunks {
            framer.add_data(Data::from_slice(c), &mut out).unwrap();
        }
        out
    }

    #[test]
    fn get_request_with_no_body_completes_on_header() {
        let mut framer = HttpFramer::new(4096);
        let req = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut msgs = run(&mut framer, &[req]);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].header.is_request());
        assert_eq!(msgs[0].header.field(KnownField::Host), Some("example.com"));
        assert_eq!(msgs[0].resource.size(), 0);
    }

    #[test]
    fn response_with_content_length_collects_body() {
        let mut framer = HttpFramer::new(4096);
        let resp = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut msgs = run(&mut framer, &[resp]);
        assert_eq!(msgs.len(), 1);
        match &msgs[0].header.start_line {
            StartLine::Response { status, .. } => assert_eq!(*status, 200),
            StartLine::Request { .. } => panic!("expected response"),
        }
        assert_eq!(msgs[0].resource.size(), 5);
        let mut buf = vec![0u8; 5];
        msgs[0].resource.copy_to_buf(&mut buf, 0, 5).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn chunked_body_reassembles_across_multiple_chunks() {
        let mut framer = HttpFramer::new(4096);
        let req = b"POST /upload HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n";
        let body = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut out = Vec::new();
        framer.add_data(Data::from_slice(req), &mut out).unwrap();
        assert!(out.is_empty());
        framer.add_data(Data::from_slice(body), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        let mut buf = vec![0u8; 11];
        out[0].resource.copy_to_buf(&mut buf, 0, 11).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn chunked_body_split_byte_by_byte_matches_whole() {
        let req = b"POST / HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n";

        let mut whole_framer = HttpFramer::new(4096);
        let whole_out = run(&mut whole_framer, &[req]);

        let mut split_framer = HttpFramer::new(4096);
        let mut byte_chunks = Vec::new();
        for b in req {
            byte_chunks.push(std::slice::from_ref(b));
        }
        let split_out = run(&mut split_framer, &byte_chunks);

        assert_eq!(whole_out.len(), 1);
        assert_eq!(split_out.len(), 1);
        let mut a = vec![0u8; 3];
        let mut b = vec![0u8; 3];
        whole_out[0].resource.copy_to_buf(&mut a, 0, 3).unwrap();
        split_out[0].resource.copy_to_buf(&mut b, 0, 3).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, b"abc");
    }

    #[test]
    fn malformed_start_line_poisons_framer() {
        let mut framer = HttpFramer::new(4096);
        let mut out = Vec::new();
        let res = framer.add_data(Data::from_slice(b"NOT A REQUEST LINE AT ALL\r\n\r\n"), &mut out);
        assert!(res.is_err() || framer.is_poisoned());
    }
}
