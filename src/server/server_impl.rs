use crate::{
    adapter::{adapt, Adapted, Arity, IntoCallback},
    errors::{Error, ErrorKind},
    http::{request::ConnInfo, types::Version},
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits, WaitStrategy},
    server::connection::{AllLimits, HttpConnection},
};
use crossbeam::queue::SegQueue;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    fmt, io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Notify,
    task::{yield_now, JoinSet},
    time::sleep as tokio_sleep,
};
use tracing::{error, info, warn};

/// Registers `callback` on `port` of the loopback interface and starts serving.
///
/// The callback's arity is inspected once, before any socket is created.
///
/// # Examples
/// ```no_run
/// use arity_bench::{register, ConnInfo, Request};
///
/// #[tokio::main]
/// async fn main() -> Result<(), arity_bench::Error> {
///     let zero = register(8080, || "hello world").await?;
///     let one = register(8081, |_: &Request| "hello world").await?;
///     let two = register(8082, |_: &Request, _: &ConnInfo| "hello world").await?;
///
///     zero.wait().await;
///     # drop((one, two));
///     Ok(())
/// }
/// ```
pub async fn register<C, M>(port: u16, callback: C) -> Result<ServerHandle, Error>
where
    C: IntoCallback<M>,
{
    Ok(Server::builder()
        .port(port)
        .handler(callback)
        .build()
        .await?
        .spawn())
}

/// Binds `addr` and serves an already adapted callback with default limits.
pub async fn listen(addr: SocketAddr, adapted: Adapted) -> Result<ServerHandle, Error> {
    Ok(Server::builder()
        .addr(addr)
        .adapted(adapted)
        .build()
        .await?
        .spawn())
}

/// A bound HTTP/1.1 server that has not started accepting yet.
///
/// Created by [`ServerBuilder::build`]. [`spawn`](Server::spawn) starts it in
/// the background, [`launch`](Server::launch) runs it in the current task.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    adapted: Adapted,
    limits: AllLimits,
}

impl Server {
    /// Starts configuring a server bound to `127.0.0.1` on an OS-assigned port.
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            adapted: None,

            server_limits: None,
            request_limits: None,
            response_limits: None,
            connection_limits: None,
        }
    }

    #[inline(always)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the accept loop, the workers and the 503 responders.
    ///
    /// Everything is owned by the returned handle and aborted when it drops.
    pub fn spawn(self) -> ServerHandle {
        let (server_limits, ..) = &self.limits;
        let stream_queue: TcpQueue = Arc::new(StreamQueue::new());
        let error_queue: TcpQueue = Arc::new(StreamQueue::new());
        let mut tasks = JoinSet::new();

        for _ in 0..server_limits.max_connections {
            let conn = HttpConnection::new(self.adapted.dispatcher().clone(), &self.limits);
            tasks.spawn(Self::worker(
                stream_queue.clone(),
                conn,
                server_limits.wait_strategy.clone(),
            ));
        }

        if server_limits.count_503_handlers != 0 {
            for _ in 0..server_limits.count_503_handlers {
                tasks.spawn(Self::alarmist(
                    error_queue.clone(),
                    server_limits.clone(),
                    self.limits.1.clone(),
                ));
            }
        } else {
            tasks.spawn(Self::quiet_alarmist(
                error_queue.clone(),
                server_limits.wait_strategy.clone(),
            ));
        }

        tasks.spawn(Self::accept(
            self.listener,
            stream_queue,
            error_queue,
            server_limits.max_pending_connections,
        ));

        ServerHandle {
            local_addr: self.local_addr,
            arity: self.adapted.arity(),
            tasks,
        }
    }

    /// Serves until every task of the server has stopped.
    #[inline]
    pub async fn launch(self) {
        self.spawn().wait().await;
    }

    async fn accept(
        listener: TcpListener,
        stream_queue: TcpQueue,
        error_queue: TcpQueue,
        max_pending: usize,
    ) {
        loop {
            match listener.accept().await {
                Ok(value) if stream_queue.len() < max_pending => stream_queue.push(value),
                Ok((stream, peer)) => {
                    warn!(%peer, "pending queue full, answering 503");
                    error_queue.push((stream, peer));
                }
                Err(error) => accept_failed(&error).await,
            }
        }
    }

    async fn worker(queue: TcpQueue, mut conn: HttpConnection, wait: WaitStrategy) {
        loop {
            let (mut stream, peer) = queue.pop(&wait).await;

            let Ok(local_addr) = stream.local_addr() else {
                continue;
            };
            if conn.conn_limits().tcp_nodelay {
                let _ = stream.set_nodelay(true);
            }

            let info = ConnInfo::new(peer, local_addr);
            let _ = conn.run(&mut stream, &info).await;
        }
    }

    async fn alarmist(queue: TcpQueue, server_limits: ServerLimits, conn_limits: ConnLimits) {
        loop {
            let (mut stream, _) = queue.pop(&server_limits.wait_strategy).await;

            let sent = conn_limits
                .send_error(
                    &mut stream,
                    ErrorKind::ServiceUnavailable,
                    Version::Http11,
                    server_limits.json_errors,
                )
                .await;
            if sent.is_ok() {
                linger_close(&mut stream).await;
            }
        }
    }

    async fn quiet_alarmist(queue: TcpQueue, wait: WaitStrategy) {
        loop {
            let (stream, _) = queue.pop(&wait).await;

            drop(stream);
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("arity", &self.adapted.arity())
            .finish_non_exhaustive()
    }
}

//

/// Owns a running server.
///
/// Dropping the handle aborts the accept loop and every worker, which closes
/// the listening socket and all open connections.
pub struct ServerHandle {
    local_addr: SocketAddr,
    arity: Arity,
    tasks: JoinSet<()>,
}

impl ServerHandle {
    /// The address the server is bound to, with the OS-assigned port resolved.
    #[inline(always)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline(always)]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Arity of the registered callback.
    #[inline(always)]
    pub fn arity(&self) -> Arity {
        self.arity
    }

    /// Stops the server and waits until all of its tasks are gone.
    pub async fn shutdown(mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }

    /// Waits for the server tasks to finish, which only happens if one of them panics.
    pub async fn wait(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(addr = %self.local_addr, "server task panicked");
                }
            }
        }
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("arity", &self.arity)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

//

/// Builder for [`Server`].
pub struct ServerBuilder {
    addr: SocketAddr,
    adapted: Option<Result<Adapted, Error>>,

    server_limits: Option<ServerLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
    connection_limits: Option<ConnLimits>,
}

impl ServerBuilder {
    /// Port on `127.0.0.1`. `0` lets the OS pick one.
    #[inline(always)]
    pub fn port(mut self, port: u16) -> Self {
        self.addr.set_port(port);
        self
    }

    #[inline(always)]
    pub fn addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the callback. Its arity is inspected here, once.
    #[inline]
    pub fn handler<C, M>(mut self, callback: C) -> Self
    where
        C: IntoCallback<M>,
    {
        self.adapted = Some(adapt(callback));
        self
    }

    /// Sets a callback that was adapted with [`adapt`](crate::adapter::adapt).
    #[inline(always)]
    pub fn adapted(mut self, adapted: Adapted) -> Self {
        self.adapted = Some(Ok(adapted));
        self
    }

    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Validates the handler, then binds the listening socket.
    ///
    /// An invalid arity is reported before any socket exists.
    pub async fn build(self) -> Result<Server, Error> {
        let adapted = self.adapted.ok_or(Error::MissingHandler)??;

        let limits: AllLimits = (
            self.server_limits.unwrap_or_default(),
            self.connection_limits.unwrap_or_default(),
            self.request_limits.unwrap_or_default().precalculate(),
            self.response_limits.unwrap_or_default(),
        );

        let addr = self.addr;
        let listener = bind(addr, limits.0.backlog).map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| Error::Bind { addr, source })?;

        info!(addr = %local_addr, arity = %adapted.arity(), "listening");

        Ok(Server {
            listener,
            local_addr,
            adapted,
            limits,
        })
    }
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// Pause after a failed `accept`. Errors like `EMFILE` persist until a
/// descriptor is freed.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// How long a rejected peer gets to finish sending before the socket closes.
const LINGER: Duration = Duration::from_millis(250);

async fn accept_failed(error: &io::Error) {
    warn!(%error, "accept failed");
    tokio_sleep(ACCEPT_BACKOFF).await;
}

/// Half-closes `stream` and discards what the peer still sends.
///
/// Closing with unread bytes makes the kernel answer with a reset, which can
/// destroy the response before the peer reads it.
async fn linger_close(stream: &mut TcpStream) {
    let _ = stream.shutdown().await;

    let mut scratch = [0u8; 1024];
    let drain = async {
        while let Ok(1..) = stream.read(&mut scratch).await {}
    };
    let _ = tokio::time::timeout(LINGER, drain).await;
}

fn bind(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    // Lets a restarted benchmark reclaim ports still in TIME_WAIT
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

//

type TcpQueue = Arc<StreamQueue>;

/// Accepted connections waiting for a worker.
struct StreamQueue {
    streams: SegQueue<(TcpStream, SocketAddr)>,
    ready: Notify,
}

impl StreamQueue {
    fn new() -> Self {
        Self {
            streams: SegQueue::new(),
            ready: Notify::new(),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.streams.len()
    }

    #[inline]
    fn push(&self, value: (TcpStream, SocketAddr)) {
        self.streams.push(value);
        self.ready.notify_one();
    }

    #[inline]
    async fn pop(&self, wait: &WaitStrategy) -> (TcpStream, SocketAddr) {
        loop {
            if let Some(value) = self.streams.pop() {
                // Hand the leftover wake-up to the next idle worker
                if !self.streams.is_empty() {
                    self.ready.notify_one();
                }
                return value;
            }

            match wait {
                WaitStrategy::Notify => self.ready.notified().await,
                WaitStrategy::Yield => yield_now().await,
                WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;

    #[tokio::test]
    async fn missing_handler() {
        let result = Server::builder().build().await;
        assert!(matches!(result, Err(Error::MissingHandler)));
    }

    #[tokio::test]
    async fn occupied_port_is_a_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        match register(port, || "hello world").await {
            Err(Error::Bind { addr, .. }) => assert_eq!(addr.port(), port),
            other => panic!("expected a bind error, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_queue_answers_503() {
        let handle = Server::builder()
            .handler(|| "hello world")
            .server_limits(ServerLimits {
                max_connections: 1,
                max_pending_connections: 0,
                ..ServerLimits::default()
            })
            .build()
            .await
            .unwrap()
            .spawn();

        let fetched = Client::new(handle.local_addr()).get("/").await.unwrap();
        assert_eq!(fetched.status(), 503);
        assert!(!fetched.keep_alive());
        assert_eq!(
            fetched.body(),
            br#"{"error":"Service temporarily unavailable","code":"SERVICE_UNAVAILABLE"}"#
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overflow_reply_survives_unread_body() {
        let handle = Server::builder()
            .handler(|| "hello world")
            .server_limits(ServerLimits {
                max_pending_connections: 0,
                ..ServerLimits::default()
            })
            .build()
            .await
            .unwrap()
            .spawn();

        let body = vec![b'x'; 32 * 1024];
        let mut raw = format!("POST / HTTP/1.1\r\ncontent-length: {}\r\n\r\n", body.len()).into_bytes();
        raw.extend_from_slice(&body);

        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        stream.write_all(&raw).await.unwrap();

        let mut output = Vec::new();
        stream.read_to_end(&mut output).await.unwrap();
        assert!(output.starts_with(b"HTTP/1.1 503 Service Unavailable\r\n"));
    }

    #[tokio::test]
    async fn failed_accept_backs_off() {
        let error = io::Error::from_raw_os_error(24);

        let started = std::time::Instant::now();
        accept_failed(&error).await;

        assert!(started.elapsed() >= ACCEPT_BACKOFF);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_strategies_serve_requests() {
        for wait_strategy in [
            WaitStrategy::Notify,
            WaitStrategy::Yield,
            WaitStrategy::Sleep(std::time::Duration::from_micros(50)),
        ] {
            let handle = Server::builder()
                .handler(|| "hello world")
                .server_limits(ServerLimits {
                    max_connections: 2,
                    wait_strategy,
                    ..ServerLimits::default()
                })
                .build()
                .await
                .unwrap()
                .spawn();

            let client = Client::new(handle.local_addr());
            for _ in 0..3 {
                assert_eq!(client.get("/").await.unwrap().body(), b"hello world");
            }

            handle.shutdown().await;
        }
    }

    #[tokio::test]
    async fn shutdown_frees_the_port() {
        let handle = register(0, || "hello world").await.unwrap();
        let addr = handle.local_addr();

        handle.shutdown().await;
        assert!(std::net::TcpListener::bind(addr).is_ok());
    }
}
