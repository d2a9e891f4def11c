//! Server configuration limits and timeouts
//!
//! Every type here has a [`Default`] and is meant to be tweaked with
//! struct-update syntax. The defaults are small on purpose: the servers in
//! this crate answer tiny `GET` requests, and every connection pre-allocates
//! a parse buffer sized from [`ReqLimits`].
//!
//! # Memory Consumption
//!
//! Each worker keeps, for its whole lifetime:
//!
//! `Total` = [`Request Buffer`](crate::limits::ReqLimits#memory-allocation-strategy) +
//!           [`Response Buffer`](crate::limits::RespLimits#buffer-management) +
//!           `Runtime Overhead`
//!
//! # Examples
//!
//! ```no_run
//! use arity_bench::{limits::{ConnLimits, ReqLimits, ServerLimits}, Server};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), arity_bench::Error> {
//!     Server::builder()
//!         .port(8080)
//!         .handler(|| "hello world")
//!         .server_limits(ServerLimits {
//!             max_connections: 512,
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_read_timeout: Duration::from_secs(5),
//!             max_requests_per_connection: 10_000,
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 24,
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .await?
//!         .launch()
//!         .await;
//!
//!     Ok(())
//! }
//! ```

use std::time::Duration;

/// Server-level concurrency, queueing and overload behavior.
///
/// # Connection management
///
/// The accept loop pushes each new connection onto a pending queue holding
/// at most `max_pending_connections` entries. When the queue is full the
/// connection goes to one of the `count_503_handlers` responders instead,
/// which answer `503 Service Unavailable` and close. Idle workers take
/// connections off the pending queue as described by [`WaitStrategy`].
///
/// Workers are spawned once, when the server starts, and live as long as
/// its [`ServerHandle`](crate::ServerHandle). Each worker serves one
/// connection at a time and reuses its buffers across connections.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of worker tasks, i.e. connections served at once (default: `100`).
    pub max_connections: usize,

    /// Accepted connections allowed to wait for a worker (default: `250`).
    ///
    /// Connections beyond this get an immediate
    /// [503](crate::StatusCode::ServiceUnavailable) and are closed.
    pub max_pending_connections: usize,

    /// How idle workers wait for the next connection (default: [`WaitStrategy::Notify`]).
    pub wait_strategy: WaitStrategy,

    /// Tasks dedicated to answering overflow connections with `503` (default: `1`).
    ///
    /// With `0` overflow connections are dropped without a response.
    pub count_503_handlers: usize,

    /// Format for protocol error responses (default: `true`)
    ///
    /// If `true`, a malformed request is answered with:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 55\r
    /// content-type: application/json\r
    /// \r
    /// {"error":"Invalid HTTP method","code":"INVALID_METHOD"}
    /// ```
    /// If `false`, the body is left out:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 0\r
    /// \r
    /// ```
    pub json_errors: bool,

    /// Length of the kernel accept queue passed to `listen(2)` (default: `1024`).
    pub backlog: i32,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_pending_connections: 250,
            wait_strategy: WaitStrategy::Notify,
            count_503_handlers: 1,
            json_errors: true,
            backlog: 1024,

            _priv: (),
        }
    }
}

/// How a worker waits when the pending queue is empty
#[derive(Debug, Clone, Default)]
pub enum WaitStrategy {
    /// Parks on a [`tokio::sync::Notify`] that the accept loop signals.
    ///
    /// Idle workers cost no CPU, so measurements are not skewed by
    /// spinning pool tasks.
    #[default]
    Notify,

    /// Polls the queue and calls [`tokio::task::yield_now()`] between polls.
    ///
    /// # Note
    /// Keeps one core busy per runtime thread while idle.
    Yield,

    /// Polls the queue and calls [`tokio::time::sleep()`] between polls.
    Sleep(Duration),
}

/// Per-connection limits and timeouts
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum wait for the next bytes of a request (default: `2 seconds`)
    ///
    /// An idle keep-alive connection that hits this is closed without a response.
    pub socket_read_timeout: Duration,

    /// Maximum duration of a single response write (default: `3 seconds`)
    pub socket_write_timeout: Duration,

    /// Requests served on one connection before it is closed (default: `100`)
    ///
    /// The last response carries `connection: close`.
    pub max_requests_per_connection: usize,

    /// Maximum age of a connection (default: `2 minutes`)
    ///
    /// Checked after every response; the first response past this age
    /// carries `connection: close`.
    pub connection_lifetime: Duration,

    /// Sets `TCP_NODELAY` on accepted sockets (default: `true`)
    pub tcp_nodelay: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(2),
            socket_write_timeout: Duration::from_secs(3),
            connection_lifetime: Duration::from_secs(120),
            max_requests_per_connection: 100,
            tcp_nodelay: true,

            _priv: (),
        }
    }
}

/// HTTP request parsing limits and buffer pre-allocation
///
/// # Memory Allocation Strategy
///
/// Each worker pre-allocates one read buffer sized from these limits:
///
/// ```text
/// Total Buffer = First Line + (Headers × Header Line) + CRLF + Body
/// ```
///
/// | Component | Formula | Size | Purpose |
/// |-----------|---------|------|---------|
/// | First Line | `19 + url_size` | 275 B | `METHOD URL HTTP/1.1\r\n` |
/// | Header Line | `header_name_size + header_value_size + 4` | 580 B | `Name: Value\r\n` |
/// | Headers | `header_count × Header Line` | 9,280 B | Headers storage |
/// | Body | `body_size` | 4,096 B | Request payload |
/// | **Total** | **Sum + 2 bytes CRLF** | **13,653 B** | Per worker |
///
/// A request head longer than `Total - Body` is answered with
/// `431 Request Header Fields Too Large`.
///
/// ```
/// use arity_bench::limits::ReqLimits;
///
/// assert_eq!(ReqLimits::default().estimated_buffer_size(), 13_653);
/// ```
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum request-target length in bytes, query included (default: `256 B`)
    pub url_size: usize,

    /// Maximum number of headers per request (default: `16`)
    pub header_count: usize,
    /// Maximum header name length in bytes (default: `64 B`)
    pub header_name_size: usize,
    /// Maximum header value length in bytes (default: `512 B`)
    pub header_value_size: usize,

    /// Maximum request body size in bytes (default: `4 KB`)
    pub body_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub precalc: ReqLimitsPrecalc,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            url_size: 256,

            header_count: 16,
            header_name_size: 64,
            header_value_size: 512,

            body_size: 4 * 1024,

            precalc: ReqLimitsPrecalc::default(),
        }
    }
}

impl ReqLimits {
    /// Returns the read buffer size each worker allocates.
    #[inline(always)]
    pub fn estimated_buffer_size(self) -> usize {
        self.precalculate().precalc.buffer
    }

    #[inline(always)]
    pub(crate) fn precalculate(mut self) -> Self {
        self.precalc.first_line = self.first_line();
        self.precalc.h_line = self.h_line();
        self.precalc.buffer = self.buffer();
        self.precalc.max_head = self.precalc.buffer - self.body_size;

        self
    }

    #[inline(always)]
    // First line + Header * N + "\r\n" + Body
    fn buffer(&self) -> usize {
        self.precalc.first_line + self.header_count * self.precalc.h_line + 2 + self.body_size
    }

    #[inline(always)]
    // OPTIONS /url/test HTTP/1.1\r\n
    // |-----| |-------| |------|
    //  Method    URL    Version
    //
    // Method(7) + " " + URL + " " + Version(8) + "\r\n"
    fn first_line(&self) -> usize {
        19 + self.url_size
    }

    #[inline(always)]
    // Name + ": " + Value + "\r\n"
    fn h_line(&self) -> usize {
        self.header_name_size + self.header_value_size + 4
    }
}

#[doc(hidden)]
#[derive(Debug, Clone, Default)]
pub struct ReqLimitsPrecalc {
    pub(crate) buffer: usize,
    pub(crate) first_line: usize,
    pub(crate) max_head: usize,
    pub(crate) h_line: usize,
}

/// Response buffer sizing
///
/// # Buffer Management
///
/// Every worker serializes responses into one reusable buffer:
/// ```rust
/// # use arity_bench::limits::RespLimits;
/// # let limits = RespLimits::default();
/// # let mut buffer: Vec<u8> = Vec::with_capacity(limits.default_capacity);
/// #
/// if buffer.capacity() > limits.max_capacity {
///     buffer = Vec::with_capacity(limits.default_capacity);
/// } else {
///     buffer.clear();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial response buffer capacity (default: `1024 B`)
    pub default_capacity: usize,
    /// Capacity above which the buffer is reallocated between responses (default: `8192 B`)
    pub max_capacity: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            max_capacity: 8 * 1024,

            _priv: (),
        }
    }
}

impl RespLimits {
    #[inline(always)]
    pub(crate) fn recycle(&self, buffer: &mut Vec<u8>) {
        if buffer.capacity() > self.max_capacity {
            *buffer = Vec::with_capacity(self.default_capacity);
        } else {
            buffer.clear();
        }
    }
}
