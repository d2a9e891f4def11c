use arity_bench::{
    limits::{ConnLimits, ServerLimits},
    ConnInfo, Error, Request, Response, Server, StatusCode,
};
use std::{fmt::Write, time::Duration};
use tracing::Level;

fn inspect(req: &Request, info: &ConnInfo) -> Response {
    if req.path() == "/favicon.ico" {
        return Response::new(StatusCode::NotFound);
    }

    let mut text = String::new();
    let _ = writeln!(text, "{} {} {}", req.method().as_str(), req.target(), req.version().as_str());
    let _ = writeln!(text, "query: {:?}", req.query());
    for (name, value) in req.headers() {
        let _ = writeln!(text, "{name}: {value}");
    }
    let _ = writeln!(
        text,
        "peer {}:{} -> {} over {:?}",
        info.hostname(),
        info.port(),
        info.local_addr(),
        info.transport()
    );

    Response::ok(text).header("content-type", "text/plain; charset=utf-8")
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    Server::builder()
        .port(8082)
        .handler(inspect)
        .server_limits(ServerLimits {
            max_connections: 8,
            ..ServerLimits::default()
        })
        .connection_limits(ConnLimits {
            socket_read_timeout: Duration::from_secs(10),
            ..ConnLimits::default()
        })
        .build()
        .await?
        .launch()
        .await;
    Ok(())
}
