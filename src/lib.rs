//! # fastgate
//!
//! Embeddable FastCGI client for Rust web servers and reverse proxies.
//!
//! This crate relays HTTP requests to a FastCGI application process
//! (PHP-FPM, a Python or Node FastCGI runner) over TCP or a UNIX domain
//! socket, multiplexing concurrent requests over one connection by 16-bit
//! request ID.
//!
//! ## Architecture
//!
//! - **Wire codec** ([`protocol`]): FastCGI records, name-value pairs
//! - **Client** ([`Client`]): per-connection request façade with an ID
//!   pool, a serialized writer, and a demultiplexing reader task
//! - **Pool** ([`ClientPool`]): lazy creation, bounded idle capacity,
//!   TTL expiry
//! - **Session middleware** ([`session`]): composable CGI parameter
//!   mapping and role selection
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use fastgate::{simple_client_factory, session, ClientPool, Handler};
//! use fastgate::transport::simple_conn_factory;
//!
//! let factory = simple_client_factory(simple_conn_factory("tcp", "127.0.0.1:9000"), 0);
//! let pool = ClientPool::new(factory, 8, Duration::from_secs(30));
//! let handler = Handler::new(pool, session::php_fs("/srv/www"));
//!
//! // per HTTP request:
//! handler.serve(http_ctx, Some(body), &mut sink, &mut stderr_log).await?;
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod authorizer;
pub mod protocol;
pub mod session;
pub mod transport;

mod client;
mod conn;
mod error;
mod host;
mod id_pool;
mod pool;
mod request;
mod response;

pub use authorizer::{AuthDecision, Authorizer};
pub use client::{simple_client_factory, Client, ClientFactory};
pub use error::{FastgateError, Result};
pub use host::Handler;
pub use id_pool::IdPool;
pub use pool::{ClientPool, PooledClient};
pub use protocol::Role;
pub use request::{BodyReader, HttpContext, Request, DATA_LAST_MOD, DATA_LENGTH};
pub use response::{BufferedResponse, HttpResponseSink, ResponsePipe};

/// Boxed future, the dynamic-dispatch seam for factories and session
/// handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
