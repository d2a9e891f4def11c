use arity_bench::{
    adapter::{adapt, Args, Handler},
    bench::{Bench, Sink},
    client::{fetch, Client},
    listen, register, Arity, ConnInfo, Error, Method, Request, ServerHandle,
};
use std::{
    net::{SocketAddr, TcpListener},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::task::JoinSet;

/// Counts how often its arity is inspected and records every argument count it sees.
#[derive(Clone, Default)]
struct Recording {
    arity: usize,
    inspections: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<usize>>>,
}

impl Recording {
    fn new(arity: usize) -> Self {
        Self {
            arity,
            ..Self::default()
        }
    }

    fn inspections(&self) -> usize {
        self.inspections.load(Ordering::SeqCst)
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn all_saw(&self, n: usize) -> bool {
        self.seen.lock().unwrap().iter().all(|&seen| seen == n)
    }
}

impl Handler for Recording {
    type Output = &'static str;

    fn declared_arity(&self) -> usize {
        self.inspections.fetch_add(1, Ordering::SeqCst);
        self.arity
    }

    fn call(&self, args: Args<'_>) -> &'static str {
        self.seen.lock().unwrap().push(args.len());
        "hello world"
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn recorded_servers() -> Vec<(Recording, ServerHandle)> {
    let mut servers = Vec::new();
    for arity in 0..=2 {
        let recording = Recording::new(arity);
        let handle = register(0, recording.clone()).await.unwrap();
        servers.push((recording, handle));
    }
    servers
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handlers_see_their_declared_arity() {
    for (recording, handle) in recorded_servers().await {
        let client = Client::new(handle.local_addr());
        for _ in 0..5 {
            client.get("/").await.unwrap();
        }

        assert_eq!(handle.arity().count(), recording.arity);
        assert_eq!(recording.calls(), 5);
        assert!(recording.all_saw(recording.arity));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn arity_is_inspected_once() {
    for (recording, handle) in recorded_servers().await {
        let client = Client::new(handle.local_addr());
        for _ in 0..1000 {
            client.get("/").await.unwrap();
        }

        assert_eq!(recording.calls(), 1000);
        assert_eq!(recording.inspections(), 1);
    }
}

#[tokio::test]
async fn invalid_arity_leaves_port_free() {
    let port = free_port();
    let recording = Recording::new(3);

    let result = register(port, recording.clone()).await;

    assert!(matches!(result, Err(Error::InvalidArity { declared: 3 })));
    assert_eq!(recording.inspections(), 1);
    assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_server_sends_hello_world() {
    let s0 = register(0, || "hello world").await.unwrap();
    let s1 = register(0, |_: &Request| "hello world").await.unwrap();
    let s2 = register(0, |_: &Request, _: &ConnInfo| "hello world").await.unwrap();

    for handle in [&s0, &s1, &s2] {
        let fetched = fetch(handle.local_addr(), "/").await.unwrap();

        assert_eq!(fetched.status(), 200);
        assert_eq!(fetched.content_length(), 11);
        assert_eq!(fetched.body(), b"hello world");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn servers_are_isolated() {
    let servers = recorded_servers().await;
    let (target, handle) = &servers[1];

    let client = Client::new(handle.local_addr());
    for _ in 0..10 {
        client.get("/").await.unwrap();
    }

    assert_eq!(target.calls(), 10);
    assert_eq!(servers[0].0.calls(), 0);
    assert_eq!(servers[2].0.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fewer_args_are_not_slower() {
    let slack = Duration::from_millis(2);
    let s0 = register(0, || "hello world").await.unwrap();
    let s1 = register(0, |_: &Request| "hello world").await.unwrap();
    let s2 = register(0, |_: &Request, _: &ConnInfo| "hello world").await.unwrap();

    let mut means = Vec::new();
    for handle in [&s0, &s1, &s2] {
        let client = &Client::new(handle.local_addr());
        let measurement = Bench::new(handle.arity().to_string())
            .warmup(100)
            .iterations(500)
            .run(move || async move {
                client.get("/").await?;
                Ok::<_, Error>(())
            })
            .await
            .unwrap();
        means.push(measurement.mean);
    }

    let [t0, t1, t2] = [means[0], means[1], means[2]];
    assert!(t0 <= t1 + slack, "{means:?}");
    assert!(t1 + slack <= t2 + 2 * slack, "{means:?}");
}

// Scenarios

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_args_answers_hello_world() {
    let handle = register(0, || "hello world").await.unwrap();

    let fetched = fetch(handle.local_addr(), "/").await.unwrap();

    assert_eq!(fetched.status(), 200);
    assert_eq!(fetched.header("content-length"), Some("11"));
    assert_eq!(fetched.body(), b"hello world");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_arg_receives_the_request() {
    let handle = register(0, |req: &Request| {
        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.path(), "/");
        "hello world"
    })
    .await
    .unwrap();

    let fetched = fetch(handle.local_addr(), "/").await.unwrap();

    assert_eq!(fetched.status(), 200);
    assert_eq!(fetched.body(), b"hello world");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_args_receive_loopback_peer() {
    let peers = Arc::new(Mutex::new(Vec::<SocketAddr>::new()));
    let recorded = peers.clone();

    let handle = register(0, move |_: &Request, info: &ConnInfo| {
        recorded.lock().unwrap().push(info.remote_addr());
        "hello world"
    })
    .await
    .unwrap();

    let fetched = fetch(handle.local_addr(), "/").await.unwrap();
    assert_eq!(fetched.body(), b"hello world");

    let peers = peers.lock().unwrap();
    assert_eq!(peers.len(), 1);
    assert!(peers[0].ip().is_loopback());
}

#[tokio::test]
async fn three_args_fail_before_binding() {
    let port = free_port();

    let result = register(port, Recording::new(3)).await;

    assert!(matches!(result, Err(Error::InvalidArity { declared: 3 })));
    assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_body_lengths_add_up() {
    let s0 = register(0, || "hello world").await.unwrap();
    let s1 = register(0, |_: &Request| "hello world").await.unwrap();
    let s2 = register(0, |_: &Request, _: &ConnInfo| "hello world").await.unwrap();

    for handle in [&s0, &s1, &s2] {
        let sink = &Sink::new();
        let client = &Client::new(handle.local_addr());

        let measurement = Bench::new(handle.arity().to_string())
            .warmup(0)
            .iterations(10_000)
            .run(move || async move {
                sink.add(client.get("/").await?.body().len());
                Ok::<_, Error>(())
            })
            .await
            .unwrap();

        assert_eq!(measurement.iterations, 10_000);
        assert_eq!(sink.total(), 110_000);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_across_ports() {
    let servers = recorded_servers().await;
    let addrs: Vec<SocketAddr> = servers.iter().map(|(_, h)| h.local_addr()).collect();

    let mut tasks = JoinSet::new();
    for i in 0..100 {
        let addr = addrs[i % addrs.len()];
        tasks.spawn(async move { fetch(addr, "/").await });
    }

    while let Some(result) = tasks.join_next().await {
        assert_eq!(result.unwrap().unwrap().body(), b"hello world");
    }

    let mut total = 0;
    for (recording, handle) in &servers {
        assert!(recording.all_saw(recording.arity));
        assert_eq!(handle.arity(), Arity::try_from(recording.arity).unwrap());
        total += recording.calls();
    }
    assert_eq!(total, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listen_serves_an_adapted_callback() {
    let adapted = adapt(|_: &Request, info: &ConnInfo| {
        assert!(info.hostname().is_loopback());
        format!("hello world|{}", info.remote_addr())
    })
    .unwrap();
    assert_eq!(adapted.arity(), Arity::Two);

    let handle = listen("127.0.0.1:0".parse().unwrap(), adapted).await.unwrap();
    assert_ne!(handle.port(), 0);
    assert_eq!(handle.arity(), Arity::Two);

    let fetched = fetch(handle.local_addr(), "/").await.unwrap();
    let body = std::str::from_utf8(fetched.body()).unwrap();
    let (greeting, peer) = body.split_once('|').unwrap();

    assert_eq!(fetched.status(), 200);
    assert_eq!(greeting, "hello world");
    assert!(peer.parse::<SocketAddr>().unwrap().ip().is_loopback());
}
