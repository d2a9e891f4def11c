use crate::{
    errors::ErrorKind,
    http::types::{self, Method, Version},
    limits::ReqLimits,
};
use memchr::memmem;
use std::{
    io,
    net::{IpAddr, SocketAddr},
    ops::Range,
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time::sleep,
};

/// A parsed HTTP/1.x request.
///
/// Instances are owned by a server worker and reused for every request it
/// parses, so handlers only ever see a borrow.
///
/// # Input data requirements
///
/// #### General designations
/// - `SP`: ASCII space (0x20)
/// - `CRLF`: `"\r\n"`, exactly this sequence. A bare `LF` is an error.
///
/// ## First line
/// ```text
/// [METHOD] SP [TARGET] SP "HTTP/" ("1.0" | "1.1") CRLF
/// ```
/// `[METHOD]` is one of [Method](crate::Method). `[TARGET]` must start with
/// `/` and fit in [`ReqLimits::url_size`].
///
/// ## Header
/// ```text
/// [NAME] ":" OWS [VALUE] OWS CRLF
/// ```
/// Names are matched case-insensitively. Leading and trailing spaces and
/// tabs around the value are dropped.
///
/// | Header              | Effect                                             |
/// |---------------------|----------------------------------------------------|
/// | `Content-Length`    | Body size, at most [`ReqLimits::body_size`]        |
/// | `Connection`        | `close` or `keep-alive` overrides the version default |
/// | `Transfer-Encoding` | Rejected with `501 Not Implemented`                |
///
/// The whole head must be `UTF-8`. The body is kept as raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: Method,
    version: Version,

    head: String,
    target: Range<usize>,
    headers: Vec<(Range<usize>, Range<usize>)>,

    content_length: Option<usize>,
    keep_alive: bool,
    body: Vec<u8>,
}

impl Request {
    #[inline(always)]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Request {
            method: Method::Get,
            version: Version::Http11,

            head: String::with_capacity(limits.precalc.max_head),
            target: 0..0,
            headers: Vec::with_capacity(limits.header_count),

            content_length: None,
            keep_alive: true,
            body: Vec::new(),
        }
    }

    #[inline(always)]
    pub(crate) fn reset(&mut self) {
        self.method = Method::Get;
        self.version = Version::Http11;

        self.head.clear();
        self.target = 0..0;
        self.headers.clear();

        self.content_length = None;
        self.keep_alive = true;
        self.body.clear();
    }
}

// Public API
impl Request {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// The request-target exactly as sent, e.g. `/api/users?page=2`.
    #[inline]
    pub fn target(&self) -> &str {
        &self.head[self.target.clone()]
    }

    /// The target without its query component.
    #[inline]
    pub fn path(&self) -> &str {
        let target = self.target();
        target.split_once('?').map_or(target, |(path, _)| path)
    }

    /// The query component without the leading `?`, if present.
    #[inline]
    pub fn query(&self) -> Option<&str> {
        self.target().split_once('?').map(|(_, query)| query)
    }

    /// Returns the first header value with case-insensitive name matching
    /// (per [RFC 9110](https://datatracker.ietf.org/doc/html/rfc9110#section-5.1)).
    /// Uses linear search.
    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    /// Iterates over all headers in the order they were received.
    #[inline]
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(name, value)| (&self.head[name.clone()], &self.head[value.clone()]))
    }

    /// Returns the value of the `Content-Length` header if present.
    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    /// Whether the connection stays open after this request.
    #[inline(always)]
    pub const fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Returns the request body, `None` when it is empty.
    #[inline]
    pub fn body(&self) -> Option<&[u8]> {
        (!self.body.is_empty()).then_some(self.body.as_slice())
    }
}

// Parsing
impl Request {
    /// Parses one request from the front of `data`.
    ///
    /// Returns the number of bytes the request occupies, or `None` when
    /// `data` holds only part of it.
    pub(crate) fn parse(
        &mut self,
        data: &[u8],
        limits: &ReqLimits,
    ) -> Result<Option<usize>, ErrorKind> {
        let window = &data[..data.len().min(limits.precalc.max_head)];
        let Some(end_headers) = memmem::find(window, b"\r\n\r\n") else {
            if data.len() >= limits.precalc.max_head {
                return Err(ErrorKind::HeadTooLarge);
            }
            return Ok(None);
        };

        // Head including the CRLF of its last line
        let head = simdutf8::basic::from_utf8(&data[..end_headers + 2])
            .map_err(|_| ErrorKind::InvalidEncoding)?;
        let head_len = end_headers + 4;

        self.reset();
        self.head.push_str(head);

        let first_line_end = memmem::find(head.as_bytes(), b"\r\n").unwrap_or(head.len() - 2);
        self.parse_first_line(first_line_end, limits)?;

        let mut start = first_line_end + 2;
        while start < self.head.len() {
            let end = memmem::find(&self.head.as_bytes()[start..], b"\r\n")
                .map(|i| start + i)
                .ok_or(ErrorKind::InvalidHeader)?;

            self.parse_header(start..end, limits)?;
            start = end + 2;
        }

        let body_len = self.content_length.unwrap_or(0);
        let total = head_len + body_len;
        if data.len() < total {
            return Ok(None);
        }

        self.body.extend_from_slice(&data[head_len..total]);
        Ok(Some(total))
    }

    #[inline]
    fn parse_first_line(&mut self, end: usize, limits: &ReqLimits) -> Result<(), ErrorKind> {
        let line = &self.head.as_bytes()[..end];
        if line.len() > limits.precalc.first_line {
            return Err(ErrorKind::InvalidUrl);
        }

        let method_end = memchr::memchr(b' ', line).ok_or(ErrorKind::InvalidMethod)?;
        self.method = Method::from_bytes(&line[..method_end])?;

        let target_start = method_end + 1;
        let target_end = memchr::memchr(b' ', &line[target_start..])
            .map(|i| target_start + i)
            .ok_or(ErrorKind::InvalidVersion)?;

        let target = &line[target_start..target_end];
        if target.first() != Some(&b'/') || target.len() > limits.url_size {
            return Err(ErrorKind::InvalidUrl);
        }
        if target.iter().any(|b| b.is_ascii_control()) {
            return Err(ErrorKind::InvalidUrl);
        }

        let (version, keep_alive) = Version::from_bytes(&line[target_end + 1..])?;

        self.target = target_start..target_end;
        self.version = version;
        self.keep_alive = keep_alive;

        Ok(())
    }

    #[inline]
    fn parse_header(&mut self, line: Range<usize>, limits: &ReqLimits) -> Result<(), ErrorKind> {
        if self.headers.len() >= limits.header_count {
            return Err(ErrorKind::TooManyHeaders);
        }

        let bytes = &self.head.as_bytes()[line.clone()];
        let colon = memchr::memchr(b':', bytes).ok_or(ErrorKind::InvalidHeader)?;

        let name = &bytes[..colon];
        if name.is_empty()
            || name.len() > limits.header_name_size
            || !name.iter().all(|b| b.is_ascii_graphic())
        {
            return Err(ErrorKind::InvalidHeader);
        }

        let raw_value = &bytes[colon + 1..];
        if raw_value.iter().any(|&b| b == b'\r' || b == b'\n') {
            return Err(ErrorKind::InvalidHeader);
        }

        let (lead, value) = trim_ows(raw_value);
        if value.len() > limits.header_value_size {
            return Err(ErrorKind::InvalidHeader);
        }

        if name.eq_ignore_ascii_case(b"content-length") {
            let len = types::slice_to_usize(value).ok_or(ErrorKind::InvalidContentLength)?;

            if self.content_length.is_some_and(|known| known != len) {
                return Err(ErrorKind::InvalidContentLength);
            }
            if len > limits.body_size {
                return Err(ErrorKind::BodyTooLarge);
            }
            self.content_length = Some(len);
        } else if name.eq_ignore_ascii_case(b"connection") {
            if let Some(keep_alive) = connection_option(value) {
                self.keep_alive = keep_alive;
            }
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            return Err(ErrorKind::UnsupportedTransferEncoding);
        }

        let value_start = line.start + colon + 1 + lead;
        let value_end = value_start + value.len();
        self.headers
            .push((line.start..line.start + colon, value_start..value_end));

        Ok(())
    }
}

// Strips optional whitespace, returning the offset of the first kept byte.
#[inline]
fn trim_ows(bytes: &[u8]) -> (usize, &[u8]) {
    let is_ows = |b: &&u8| **b == b' ' || **b == b'\t';

    let lead = bytes.iter().take_while(is_ows).count();
    let trail = bytes[lead..].iter().rev().take_while(is_ows).count();

    (lead, &bytes[lead..bytes.len() - trail])
}

// `close` wins over `keep-alive` when both are listed.
#[inline]
fn connection_option(value: &[u8]) -> Option<bool> {
    let mut keep_alive = None;

    for token in value.split(|&b| b == b',') {
        let (_, token) = trim_ows(token);

        if token.eq_ignore_ascii_case(b"close") {
            return Some(false);
        } else if token.eq_ignore_ascii_case(b"keep-alive") {
            keep_alive = Some(true);
        }
    }

    keep_alive
}

//

/// Transport a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
}

/// Facts about the connection a request arrived on.
///
/// Built once per accepted connection and passed by reference to every
/// two-argument handler invoked on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInfo {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    transport: Transport,
}

impl ConnInfo {
    #[inline]
    pub const fn new(remote_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            local_addr,
            transport: Transport::Tcp,
        }
    }

    /// Address of the peer.
    #[inline(always)]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Address the connection was accepted on.
    #[inline(always)]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// IP of the peer.
    #[inline(always)]
    pub const fn hostname(&self) -> IpAddr {
        self.remote_addr.ip()
    }

    /// Port of the peer.
    #[inline(always)]
    pub const fn port(&self) -> u16 {
        self.remote_addr.port()
    }

    #[inline(always)]
    pub const fn transport(&self) -> Transport {
        self.transport
    }
}

//

/// Read buffer of one worker.
///
/// Holds at most one maximal request. Bytes past the end of a parsed
/// request are kept for the next call, which is how pipelined requests
/// are served in order.
#[derive(Debug)]
pub(crate) struct Parser {
    buffer: Box<[u8]>,
    start: usize,
    len: usize,
}

impl Parser {
    #[inline(always)]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Parser {
            buffer: vec![0; limits.precalc.buffer].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.start = 0;
        self.len = 0;
    }

    /// Fills `request` with the next request on the stream.
    ///
    /// Returns `Ok(false)` when the peer is done: it closed the stream or
    /// stayed silent for `read_timeout` between requests.
    pub(crate) async fn next_request<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        request: &mut Request,
        limits: &ReqLimits,
        read_timeout: Duration,
    ) -> Result<bool, ErrorKind> {
        loop {
            if self.start < self.len {
                let pending = &self.buffer[self.start..self.len];

                if let Some(consumed) = request.parse(pending, limits)? {
                    self.start += consumed;
                    if self.start == self.len {
                        self.reset();
                    }
                    return Ok(true);
                }
            }

            self.compact();
            if self.len == self.buffer.len() {
                return Err(ErrorKind::HeadTooLarge);
            }

            let filled = self.len;
            let n = tokio::select! {
                biased;

                read_result = stream.read(&mut self.buffer[filled..]) => read_result?,
                _ = sleep(read_timeout) => {
                    if filled == 0 {
                        return Ok(false);
                    }
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout").into());
                },
            };

            if n == 0 {
                return match self.len {
                    0 => Ok(false),
                    _ => Err(ErrorKind::IncompleteRequest),
                };
            }
            self.len += n;
        }
    }

    #[inline]
    fn compact(&mut self) {
        if self.start > 0 {
            self.buffer.copy_within(self.start..self.len, 0);
            self.len -= self.start;
            self.start = 0;
        }
    }
}
