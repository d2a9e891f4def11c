//! HTTP responses returned by handlers and their wire serialization.

use crate::http::types::{self, StatusCode, Version};
use std::borrow::Cow;
use tracing::warn;

pub use write::WriteBuffer;

/// The value a handler produces.
///
/// A status code, extra headers and a body. `content-length` and
/// `connection` are added by the server when the response is written, so
/// handlers never set them.
///
/// # Examples
/// ```
/// use arity_bench::{Response, StatusCode};
///
/// let resp = Response::new(StatusCode::Ok)
///     .header("content-type", "text/plain")
///     .header("x-request-count", 3)
///     .body("hello world");
///
/// assert_eq!(resp.body_bytes(), b"hello world");
/// assert_eq!(resp.header_value("x-request-count"), Some(&b"3"[..]));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: StatusCode,
    headers: Vec<u8>,
    body: Cow<'static, [u8]>,
}

impl Default for Response {
    #[inline]
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

impl Response {
    /// An empty response with the given status.
    #[inline]
    pub const fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Cow::Borrowed(&[]),
        }
    }

    /// `200 OK` with the given body.
    #[inline]
    pub fn ok<B: IntoBody>(body: B) -> Self {
        Self::new(StatusCode::Ok).body(body)
    }

    /// Replaces the status code.
    #[inline]
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Adds a header line.
    ///
    /// PLEASE DO NOT ADD THE FOLLOWING HEADERS:
    /// - `content-length`: calculated when the response is written
    /// - `connection`: decided by the server from the request and [`ConnLimits`](crate::limits::ConnLimits)
    #[inline]
    #[track_caller]
    pub fn header<N: WriteBuffer, V: WriteBuffer>(mut self, name: N, value: V) -> Self {
        let start = self.headers.len();

        name.write_to(&mut self.headers);
        debug_assert!(
            !self.headers[start..].eq_ignore_ascii_case(b"content-length")
                && !self.headers[start..].eq_ignore_ascii_case(b"connection"),
            "`content-length` and `connection` are set by the server"
        );

        self.headers.extend_from_slice(b": ");
        value.write_to(&mut self.headers);
        self.headers.extend_from_slice(b"\r\n");
        self
    }

    /// Replaces the body.
    #[inline]
    pub fn body<B: IntoBody>(mut self, body: B) -> Self {
        self.body = body.into_body();
        self
    }
}

// Accessors
impl Response {
    #[inline(always)]
    pub const fn status_code(&self) -> StatusCode {
        self.status
    }

    #[inline]
    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    #[inline]
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Returns the first value of a header added with [`header`](Self::header).
    pub fn header_value(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .split(|&b| b == b'\n')
            .filter_map(|line| line.strip_suffix(b"\r"))
            .find_map(|line| {
                let colon = memchr::memchr(b':', line)?;
                let value = line[colon + 1..].strip_prefix(b" ").unwrap_or(&line[colon + 1..]);

                line[..colon]
                    .eq_ignore_ascii_case(name.as_bytes())
                    .then_some(value)
            })
    }
}

// Serialization
impl Response {
    /// Appends the wire form of this response to `buffer`.
    ///
    /// `head_only` drops the body bytes but keeps its `content-length`.
    pub(crate) fn write_to(
        &self,
        buffer: &mut Vec<u8>,
        version: Version,
        keep_alive: bool,
        head_only: bool,
    ) {
        buffer.extend_from_slice(self.status.first_line(version));

        if let Some(value) = Self::connection_header(version, keep_alive) {
            buffer.extend_from_slice(b"connection: ");
            buffer.extend_from_slice(value);
            buffer.extend_from_slice(b"\r\n");
        }

        buffer.extend_from_slice(b"content-length: ");
        types::write_usize(self.body.len(), buffer);
        buffer.extend_from_slice(b"\r\n");

        buffer.extend_from_slice(&self.headers);
        buffer.extend_from_slice(b"\r\n");

        if !head_only {
            buffer.extend_from_slice(&self.body);
        }
    }

    #[inline(always)]
    const fn connection_header(version: Version, keep_alive: bool) -> Option<&'static [u8]> {
        match (version, keep_alive) {
            (Version::Http11, true) => None,
            (Version::Http11, false) => Some(b"close"),
            (Version::Http10, true) => Some(b"keep-alive"),
            (Version::Http10, false) => Some(b"close"),
        }
    }
}

//

/// Conversion of handler output into a [`Response`].
///
/// Text and byte bodies become `200 OK`. A [`StatusCode`] becomes an empty
/// response with that status. `Err` values become an empty
/// `500 Internal Server Error` and are logged.
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    #[inline(always)]
    fn into_response(self) -> Response {
        self
    }
}

impl IntoResponse for StatusCode {
    #[inline]
    fn into_response(self) -> Response {
        Response::new(self)
    }
}

impl IntoResponse for () {
    #[inline]
    fn into_response(self) -> Response {
        Response::new(StatusCode::Ok)
    }
}

impl<T: IntoResponse, E: std::fmt::Display> IntoResponse for Result<T, E> {
    #[inline]
    fn into_response(self) -> Response {
        match self {
            Ok(value) => value.into_response(),
            Err(error) => {
                warn!(%error, "handler returned an error");
                Response::new(StatusCode::InternalServerError)
            }
        }
    }
}

/// Values usable as a response body.
///
/// `'static` text and bytes are kept borrowed, so constant bodies are
/// never copied.
pub trait IntoBody {
    fn into_body(self) -> Cow<'static, [u8]>;
}

impl IntoBody for &'static [u8] {
    #[inline]
    fn into_body(self) -> Cow<'static, [u8]> {
        Cow::Borrowed(self)
    }
}

impl<const N: usize> IntoBody for &'static [u8; N] {
    #[inline]
    fn into_body(self) -> Cow<'static, [u8]> {
        Cow::Borrowed(self)
    }
}

impl IntoBody for &'static str {
    #[inline]
    fn into_body(self) -> Cow<'static, [u8]> {
        Cow::Borrowed(self.as_bytes())
    }
}

impl IntoBody for Vec<u8> {
    #[inline]
    fn into_body(self) -> Cow<'static, [u8]> {
        Cow::Owned(self)
    }
}

impl IntoBody for String {
    #[inline]
    fn into_body(self) -> Cow<'static, [u8]> {
        Cow::Owned(self.into_bytes())
    }
}

impl IntoBody for Cow<'static, [u8]> {
    #[inline]
    fn into_body(self) -> Cow<'static, [u8]> {
        self
    }
}

impl IntoBody for Cow<'static, str> {
    #[inline]
    fn into_body(self) -> Cow<'static, [u8]> {
        match self {
            Cow::Borrowed(text) => text.into_body(),
            Cow::Owned(text) => text.into_body(),
        }
    }
}

macro_rules! impl_into_response_body {
    ($($t:ty),* $(,)?) => {
        $(impl IntoResponse for $t {
            #[inline]
            fn into_response(self) -> Response {
                Response::ok(self)
            }
        })*
    };
}

impl_into_response_body! {
    &'static [u8], &'static str, Vec<u8>, String, Cow<'static, [u8]>, Cow<'static, str>
}

impl<const N: usize> IntoResponse for &'static [u8; N] {
    #[inline]
    fn into_response(self) -> Response {
        Response::ok(self)
    }
}

pub mod write {
    use std::{borrow::Cow, io::Write, rc::Rc, sync::Arc};

    /// Values that can be written as a header name or value.
    ///
    /// Implemented for text, byte slices, integers, `bool` and `char`.
    pub trait WriteBuffer {
        /// Appends the value to the buffer.
        fn write_to(&self, buffer: &mut Vec<u8>);
    }

    macro_rules! impl_write_buffer {
        (bytes, $conn:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    let closure = $conn;
                    closure(self, buffer);
                }
            })*
        };
        (display => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    // Writing into a `Vec` cannot fail
                    let _ = write!(buffer, "{}", self);
                }
            })*
        };
    }

    impl<T: WriteBuffer + ?Sized> WriteBuffer for &T {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            T::write_to(*self, buffer);
        }
    }
    impl WriteBuffer for str {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self.as_bytes());
        }
    }
    impl WriteBuffer for [u8] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl<const N: usize> WriteBuffer for [u8; N] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl_write_buffer! {
        bytes, |value: &str, buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value.as_bytes());
        } => String, Box<str>, Cow<'_, str>, Arc<str>, Rc<str>
    }
    impl_write_buffer! {
        bytes, |value: &[u8], buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value);
        } => Vec<u8>, Box<[u8]>, Cow<'_, [u8]>, Arc<[u8]>, Rc<[u8]>
    }
    impl_write_buffer! {
        display => u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, bool, char
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(resp: &Response, version: Version, keep_alive: bool, head_only: bool) -> String {
        let mut buffer = Vec::new();
        resp.write_to(&mut buffer, version, keep_alive, head_only);
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn hello_world_wire_format() {
        let resp = "hello world".into_response();

        assert_eq!(
            wire(&resp, Version::Http11, true, false),
            "HTTP/1.1 200 OK\r\ncontent-length: 11\r\n\r\nhello world"
        );
    }

    #[test]
    fn connection_header() {
        #[rustfmt::skip]
        let cases = [
            (Version::Http11, true,  None),
            (Version::Http11, false, Some("connection: close\r\n")),
            (Version::Http10, true,  Some("connection: keep-alive\r\n")),
            (Version::Http10, false, Some("connection: close\r\n")),
        ];

        for (version, keep_alive, expected) in cases {
            let raw = wire(&Response::default(), version, keep_alive, false);

            assert!(raw.starts_with(version.as_str()));
            match expected {
                Some(line) => assert!(raw.contains(line), "{raw:?}"),
                None => assert!(!raw.contains("connection"), "{raw:?}"),
            }
        }
    }

    #[test]
    fn head_keeps_length_drops_body() {
        let resp = Response::ok("hello world").header("content-type", "text/plain");

        assert_eq!(
            wire(&resp, Version::Http11, true, true),
            "HTTP/1.1 200 OK\r\ncontent-length: 11\r\ncontent-type: text/plain\r\n\r\n"
        );
    }

    #[test]
    fn headers() {
        let resp = Response::new(StatusCode::Created)
            .header("x-id", 128)
            .header("x-cache", true)
            .header("x-neg", -5i64)
            .header(String::from("X-Name"), b"bytes")
            .header("x-char", 'q');

        #[rustfmt::skip]
        let cases = [
            ("x-id",    Some("128")),
            ("X-CACHE", Some("true")),
            ("x-neg",   Some("-5")),
            ("x-name",  Some("bytes")),
            ("x-char",  Some("q")),
            ("missing", None),
        ];

        for (name, value) in cases {
            assert_eq!(resp.header_value(name), value.map(str::as_bytes));
        }

        assert!(wire(&resp, Version::Http11, true, false).starts_with("HTTP/1.1 201 Created\r\n"));
    }

    #[test]
    fn into_response() {
        #[rustfmt::skip]
        let cases: [(Response, StatusCode, &[u8]); 8] = [
            ("text".into_response(),                          StatusCode::Ok, b"text"),
            (String::from("owned").into_response(),           StatusCode::Ok, b"owned"),
            (b"bytes".as_slice().into_response(),             StatusCode::Ok, b"bytes"),
            (vec![1u8, 2].into_response(),                    StatusCode::Ok, &[1, 2]),
            (StatusCode::NotFound.into_response(),            StatusCode::NotFound, b""),
            (().into_response(),                              StatusCode::Ok, b""),
            (Ok::<_, String>("fine").into_response(),         StatusCode::Ok, b"fine"),
            (Err::<&str, _>("boom").into_response(),          StatusCode::InternalServerError, b""),
        ];

        for (resp, status, body) in cases {
            assert_eq!(resp.status_code(), status);
            assert_eq!(resp.body_bytes(), body);
        }
    }
}
