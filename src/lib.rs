//! arity_bench - measures what a handler's parameter count costs per request
//!
//! Three HTTP/1.1 servers answer `hello world` from callbacks that declare
//! zero, one or two parameters. The callback's arity is inspected once, when
//! it is registered, and turned into a uniform
//! [`Dispatcher`](adapter::Dispatcher), so every request follows the same path
//! except for the arguments the callback actually receives.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections and pipelining
//! - **HTTP/1.0**: keep-alive on request
//! - `HEAD` requests get the headers of the matching `GET` without a body
//!
//! # Examples
//!
//! Registering the three servers:
//! ```no_run
//! use arity_bench::{register, ConnInfo, Request};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), arity_bench::Error> {
//!     let s0 = register(8080, || "hello world").await?;
//!     let s1 = register(8081, |_req: &Request| "hello world").await?;
//!     let s2 = register(8082, |_req: &Request, _info: &ConnInfo| "hello world").await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     for server in [s0, s1, s2] {
//!         server.shutdown().await;
//!     }
//!     Ok(())
//! }
//! ```
//! Advanced configuration:
//! ```no_run
//! use arity_bench::{Server, Request, limits::{ConnLimits, ServerLimits}};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), arity_bench::Error> {
//!     Server::builder()
//!         .port(8081)
//!         .handler(|req: &Request| format!("you asked for {}", req.path()))
//!         .server_limits(ServerLimits {
//!             max_connections: 16,
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             max_requests_per_connection: 10_000,
//!             socket_read_timeout: Duration::from_secs(5),
//!             ..ConnLimits::default()
//!         })
//!         .build()
//!         .await?
//!         .launch()
//!         .await;
//!     Ok(())
//! }
//! ```

pub(crate) mod http {
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub mod adapter;
    pub(crate) mod connection;
    pub(crate) mod server_impl;
}
pub mod bench;
pub mod client;
pub(crate) mod errors;
pub mod limits;

pub use crate::server::adapter;

pub use crate::{
    errors::Error,
    http::{
        request::{ConnInfo, Request, Transport},
        response::{write, IntoBody, IntoResponse, Response, WriteBuffer},
        types::{Method, StatusCode, Version},
    },
    server::{
        adapter::{adapt, Arity, Handler},
        server_impl::{listen, register, Server, ServerBuilder, ServerHandle},
    },
};
