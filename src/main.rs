use arity_bench::{
    bench::{Bench, SINK},
    client::Client,
    register, ConnInfo, Error, Request, ServerHandle,
};
use tracing::{info, Level};

const BODY: &str = "hello world";

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let s0 = register(8080, || BODY).await?;
    let s1 = register(8081, |_req: &Request| BODY).await?;
    let s2 = register(8082, |_req: &Request, _info: &ConnInfo| BODY).await?;

    for (name, server) in [
        ("0 handler args", &s0),
        ("1 handler args", &s1),
        ("2 handler args", &s2),
    ] {
        let measurement = measure(name, server).await?;
        println!("{measurement}");
    }
    info!(bytes = SINK.total(), "benchmarks finished, serving until ctrl-c");

    tokio::signal::ctrl_c().await?;
    for server in [s0, s1, s2] {
        server.shutdown().await;
    }
    Ok(())
}

async fn measure(
    name: &str,
    server: &ServerHandle,
) -> Result<arity_bench::bench::Measurement, Error> {
    let client = &Client::new(server.local_addr());

    Bench::new(name)
        .run(move || async move {
            let fetched = client.get("/").await?;
            SINK.add(fetched.body().len());
            Ok::<_, Error>(())
        })
        .await
}
