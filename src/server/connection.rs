use crate::{
    errors::ErrorKind,
    http::{
        request::{ConnInfo, Parser, Request},
        response::Response,
        types::{Method, StatusCode, Version},
    },
    limits::{ConnLimits, ReqLimits, RespLimits},
    server::adapter::Dispatcher,
};
use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    time::Instant,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::{debug, error};

/// Serves connections one after another with reusable buffers.
pub(crate) struct HttpConnection {
    dispatcher: Dispatcher,

    parser: Parser,
    request: Request,
    buffer: Vec<u8>,

    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
    json_errors: bool,
}

impl HttpConnection {
    #[inline]
    pub(crate) fn new(dispatcher: Dispatcher, limits: &AllLimits) -> Self {
        let (server_limits, conn_limits, req_limits, resp_limits) = limits;

        Self {
            dispatcher,

            parser: Parser::new(req_limits),
            request: Request::new(req_limits),
            buffer: Vec::with_capacity(resp_limits.default_capacity),

            conn_limits: conn_limits.clone(),
            req_limits: req_limits.clone(),
            resp_limits: resp_limits.clone(),
            json_errors: server_limits.json_errors,
        }
    }

    #[inline(always)]
    pub(crate) fn conn_limits(&self) -> &ConnLimits {
        &self.conn_limits
    }
}

impl HttpConnection {
    /// Serves every request on `stream` until the peer leaves or a limit hits.
    ///
    /// Protocol errors are answered with their static response; I/O errors
    /// are returned and the connection is dropped silently.
    pub(crate) async fn run<S>(&mut self, stream: &mut S, info: &ConnInfo) -> Result<(), io::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.parser.reset();

        match self.impl_run(stream, info).await {
            Ok(()) => Ok(()),
            Err(ErrorKind::Io(e)) => Err(e.0),
            Err(err) => {
                debug!(peer = %info.remote_addr(), error = %err, "closing connection on protocol error");

                self.conn_limits
                    .send_error(stream, err, self.request.version(), self.json_errors)
                    .await
            }
        }
    }

    async fn impl_run<S>(&mut self, stream: &mut S, info: &ConnInfo) -> Result<(), ErrorKind>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let created = Instant::now();
        let mut served = 0;

        loop {
            let has_request = self
                .parser
                .next_request(
                    stream,
                    &mut self.request,
                    &self.req_limits,
                    self.conn_limits.socket_read_timeout,
                )
                .await?;
            if !has_request {
                return Ok(());
            }

            served += 1;
            let keep_alive = self.request.is_keep_alive()
                && served < self.conn_limits.max_requests_per_connection
                && created.elapsed() < self.conn_limits.connection_lifetime;

            let response = self.dispatch(info);

            self.resp_limits.recycle(&mut self.buffer);
            response.write_to(
                &mut self.buffer,
                self.request.version(),
                keep_alive,
                self.request.method() == Method::Head,
            );
            self.conn_limits.write_bytes(stream, &self.buffer).await?;

            if !keep_alive {
                return Ok(());
            }
        }
    }

    #[inline]
    fn dispatch(&self, info: &ConnInfo) -> Response {
        let call = AssertUnwindSafe(|| (self.dispatcher)(&self.request, info));

        panic::catch_unwind(call).unwrap_or_else(|payload| {
            error!(
                path = self.request.target(),
                panic = panic_message(payload.as_ref()),
                "handler panicked"
            );
            Response::new(StatusCode::InternalServerError)
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string payload>"
    }
}

impl ConnLimits {
    #[inline(always)]
    pub(crate) async fn send_error<S: AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        error: ErrorKind,
        version: Version,
        json: bool,
    ) -> Result<(), io::Error> {
        self.write_bytes(stream, error.as_http(version, json)).await
    }

    #[inline(always)]
    pub(crate) async fn write_bytes<S: AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        bytes: &[u8],
    ) -> Result<(), io::Error> {
        timeout(self.socket_write_timeout, stream.write_all(bytes)).await?
    }
}

pub(crate) type AllLimits = (crate::limits::ServerLimits, ConnLimits, ReqLimits, RespLimits);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapter::{adapt, IntoCallback},
        limits::ServerLimits,
    };
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn limits() -> AllLimits {
        (
            ServerLimits::default(),
            ConnLimits {
                socket_read_timeout: Duration::from_millis(200),
                ..ConnLimits::default()
            },
            ReqLimits::default().precalculate(),
            RespLimits::default(),
        )
    }

    fn info() -> ConnInfo {
        ConnInfo::new(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:8080".parse().unwrap(),
        )
    }

    fn conn_with<C: IntoCallback<M>, M>(callback: C, limits: &AllLimits) -> HttpConnection {
        let adapted = adapt(callback).unwrap();
        HttpConnection::new(adapted.dispatcher().clone(), limits)
    }

    // Writes `input`, half-closes, and returns everything the server sent.
    async fn exchange(conn: &mut HttpConnection, input: &[u8]) -> String {
        let (mut client, mut server): (DuplexStream, DuplexStream) = duplex(64 * 1024);

        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();

        let _ = conn.run(&mut server, &info()).await;
        drop(server);

        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        output
    }

    #[tokio::test]
    async fn serves_hello_world() {
        let mut conn = conn_with(|| "hello world", &limits());

        let output = exchange(&mut conn, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert_eq!(
            output,
            "HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 11\r\n\r\nhello world"
        );
    }

    #[tokio::test]
    async fn answers_pipelined_requests_in_order() {
        let mut conn = conn_with(|req: &Request| req.target().to_string(), &limits());

        let output = exchange(
            &mut conn,
            b"GET /one HTTP/1.1\r\n\r\nGET /two HTTP/1.1\r\n\r\nGET /three HTTP/1.1\r\n\r\n",
        )
        .await;

        let bodies: Vec<_> = output
            .split("HTTP/1.1 200 OK\r\n")
            .filter(|part| !part.is_empty())
            .map(|part| part.split_once("\r\n\r\n").unwrap().1)
            .collect();
        assert_eq!(bodies, ["/one", "/two", "/three"]);
    }

    #[tokio::test]
    async fn head_and_http10() {
        let mut conn = conn_with(|| "hello world", &limits());

        let output = exchange(&mut conn, b"HEAD / HTTP/1.0\r\n\r\n").await;
        assert_eq!(
            output,
            "HTTP/1.0 200 OK\r\nconnection: close\r\ncontent-length: 11\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn request_limit_closes_connection() {
        let mut limits = limits();
        limits.1.max_requests_per_connection = 2;
        let mut conn = conn_with(|| "x", &limits);

        let output = exchange(&mut conn, &b"GET / HTTP/1.1\r\n\r\n".repeat(3)).await;

        assert_eq!(output.matches("HTTP/1.1 200 OK").count(), 2);
        assert_eq!(output.matches("connection: close").count(), 1);
    }

    #[tokio::test]
    async fn protocol_error_skips_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            "x"
        };
        let mut conn = conn_with(handler, &limits());

        #[rustfmt::skip]
        let cases: [(&[u8], &str); 4] = [
            (b"BREW / HTTP/1.1\r\n\r\n",                         "HTTP/1.1 400 Bad Request\r\n"),
            (b"GET / HTTP/2.0\r\n\r\n",                          "HTTP/1.1 505 HTTP Version Not Supported\r\n"),
            (b"POST / HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n", "HTTP/1.1 501 Not Implemented\r\n"),
            (b"GET / HTTP/1.1\r\nHost",                           "HTTP/1.1 400 Bad Request\r\n"),
        ];

        for (input, status_line) in cases {
            let output = exchange(&mut conn, input).await;
            assert!(output.starts_with(status_line), "{output:?}");
            assert!(output.contains("connection: close\r\n"));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_handler_yields_500_and_keeps_serving() {
        let flaky = |req: &Request| {
            if req.path() == "/panic" {
                panic!("boom");
            }
            "fine"
        };
        let mut conn = conn_with(flaky, &limits());

        let output = exchange(
            &mut conn,
            b"GET /panic HTTP/1.1\r\n\r\nGET /ok HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;

        assert!(output.starts_with("HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\n\r\n"));
        assert!(output.ends_with("content-length: 4\r\n\r\nfine"));
    }

    #[tokio::test]
    async fn idle_connection_closes_quietly() {
        let mut conn = conn_with(|| "x", &limits());
        let (mut client, mut server) = duplex(1024);

        let result = conn.run(&mut server, &info()).await;
        assert!(result.is_ok());

        drop(server);
        let mut output = Vec::new();
        client.read_to_end(&mut output).await.unwrap();
        assert!(output.is_empty());
    }
}
