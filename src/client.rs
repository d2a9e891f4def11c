//! Minimal HTTP/1.1 client for driving the servers.
//!
//! One [`Client`] holds at most one keep-alive connection. It reconnects
//! when the server answers with `connection: close` or when the previous
//! exchange failed. Requests are never retried.

use crate::{errors::Error, http::types::Method};
use memchr::memmem;
use std::{io::Write, net::SocketAddr};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
};

/// Sends one `GET` on a fresh connection.
///
/// # Examples
/// ```no_run
/// # async fn run() -> Result<(), arity_bench::Error> {
/// let fetched = arity_bench::client::fetch("127.0.0.1:8080".parse().unwrap(), "/").await?;
/// assert_eq!(fetched.body(), b"hello world");
/// # Ok(())
/// # }
/// ```
pub async fn fetch(addr: SocketAddr, path: &str) -> Result<Fetched, Error> {
    Client::new(addr).get(path).await
}

/// A keep-alive HTTP/1.1 client bound to one server address.
#[derive(Debug)]
pub struct Client {
    addr: SocketAddr,
    conn: Mutex<Option<Connection>>,
}

impl Client {
    /// Does not connect until the first request.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            conn: Mutex::new(None),
        }
    }

    #[inline(always)]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub async fn get(&self, path: &str) -> Result<Fetched, Error> {
        self.request(Method::Get, path).await
    }

    /// Sends a request without a body and reads the whole response.
    pub async fn request(&self, method: Method, path: &str) -> Result<Fetched, Error> {
        let mut slot = self.conn.lock().await;

        let conn = match &mut *slot {
            Some(conn) => conn,
            empty => empty.insert(Connection::open(self.addr).await?),
        };

        match conn.exchange(self.addr, method, path).await {
            Ok(fetched) => {
                if !fetched.keep_alive {
                    *slot = None;
                }
                Ok(fetched)
            }
            Err(e) => {
                *slot = None;
                Err(e)
            }
        }
    }
}

#[derive(Debug)]
struct Connection {
    stream: TcpStream,
    out: Vec<u8>,
    buffer: Vec<u8>,
}

impl Connection {
    async fn open(addr: SocketAddr) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            out: Vec::with_capacity(128),
            buffer: Vec::with_capacity(1024),
        })
    }

    async fn exchange(
        &mut self,
        addr: SocketAddr,
        method: Method,
        path: &str,
    ) -> Result<Fetched, Error> {
        self.out.clear();
        write!(
            self.out,
            "{} {} HTTP/1.1\r\nhost: {}\r\n\r\n",
            method.as_str(),
            path,
            addr
        )?;
        self.stream.write_all(&self.out).await?;

        self.buffer.clear();
        let head_end = loop {
            if let Some(pos) = memmem::find(&self.buffer, b"\r\n\r\n") {
                break pos;
            }
            if self.read_more().await? == 0 {
                return Err(Error::MalformedResponse("connection closed before the response head"));
            }
        };

        let head = simdutf8::basic::from_utf8(&self.buffer[..head_end])
            .map_err(|_| Error::MalformedResponse("response head is not UTF-8"))?;
        let mut fetched = Fetched::from_head(head)?;

        let body_start = head_end + 4;
        let body_len = match method {
            Method::Head => 0,
            _ => fetched.content_length,
        };

        while self.buffer.len() < body_start + body_len {
            if self.read_more().await? == 0 {
                return Err(Error::MalformedResponse("connection closed inside the body"));
            }
        }

        fetched
            .body
            .extend_from_slice(&self.buffer[body_start..body_start + body_len]);
        Ok(fetched)
    }

    #[inline]
    async fn read_more(&mut self) -> Result<usize, Error> {
        self.buffer.reserve(1024);
        Ok(self.stream.read_buf(&mut self.buffer).await?)
    }
}

/// A response read by [`Client`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    status: u16,
    headers: Vec<(String, String)>,
    content_length: usize,
    keep_alive: bool,
    body: Vec<u8>,
}

impl Fetched {
    fn from_head(head: &str) -> Result<Self, Error> {
        let mut lines = head.split("\r\n");

        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');

        let mut keep_alive = match parts.next() {
            Some("HTTP/1.1") => true,
            Some("HTTP/1.0") => false,
            _ => return Err(Error::MalformedResponse("unknown response version")),
        };
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .filter(|code| (100..1000).contains(code))
            .ok_or(Error::MalformedResponse("invalid status code"))?;

        let mut headers = Vec::new();
        let mut content_length = None;

        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or(Error::MalformedResponse("header line without a colon"))?;
            let value = value.trim();

            if name.eq_ignore_ascii_case("content-length") {
                let len = value
                    .parse::<usize>()
                    .map_err(|_| Error::MalformedResponse("invalid content-length"))?;
                content_length = Some(len);
            } else if name.eq_ignore_ascii_case("connection") {
                if value.eq_ignore_ascii_case("close") {
                    keep_alive = false;
                } else if value.eq_ignore_ascii_case("keep-alive") {
                    keep_alive = true;
                }
            }

            headers.push((name.to_ascii_lowercase(), value.to_string()));
        }

        Ok(Self {
            status,
            headers,
            content_length: content_length
                .ok_or(Error::MalformedResponse("missing content-length"))?,
            keep_alive,
            body: Vec::new(),
        })
    }

    #[inline(always)]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Value of `content-length`, which for `HEAD` differs from `body().len()`.
    #[inline(always)]
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Whether the server left the connection open.
    #[inline(always)]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline(always)]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[inline(always)]
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn parse_heads() {
        #[rustfmt::skip]
        let cases: [(&str, Option<(u16, usize, bool)>); 7] = [
            ("HTTP/1.1 200 OK\r\ncontent-length: 11",                        Some((200, 11, true))),
            ("HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0",    Some((200, 0, false))),
            ("HTTP/1.0 503 Service Unavailable\r\ncontent-length: 3",        Some((503, 3, false))),
            ("HTTP/1.0 200 OK\r\nconnection: keep-alive\r\ncontent-length: 1", Some((200, 1, true))),
            ("HTTP/1.1 200 OK",                                               None),
            ("HTTP/2 200 OK\r\ncontent-length: 1",                            None),
            ("HTTP/1.1 abc OK\r\ncontent-length: 1",                          None),
        ];

        for (head, expected) in cases {
            let got = Fetched::from_head(head)
                .ok()
                .map(|f| (f.status(), f.content_length(), f.keep_alive()));
            assert_eq!(got, expected, "{head:?}");
        }
    }

    async fn canned_server(response: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream.write_all(response).await.unwrap();
        });

        addr
    }

    #[tokio::test]
    async fn reads_split_body() {
        let addr = canned_server(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nx-a: b\r\n\r\nhello").await;

        let fetched = fetch(addr, "/").await.unwrap();
        assert_eq!(fetched.body(), b"hello");
        assert_eq!(fetched.header("X-A"), Some("b"));
    }

    #[tokio::test]
    async fn truncated_body_is_malformed() {
        let addr = canned_server(b"HTTP/1.1 200 OK\r\ncontent-length: 50\r\n\r\nshort").await;

        let result = fetch(addr, "/").await;
        assert!(matches!(result, Err(Error::MalformedResponse(_))));
    }
}
