use arity_bench::{register, Error};
use tracing::Level;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    register(8080, || "hello world").await?.wait().await;
    Ok(())
}
