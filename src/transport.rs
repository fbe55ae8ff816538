//! Transport module - dialing the FastCGI application.
//!
//! A FastCGI application listens on a TCP port or a UNIX domain socket.
//! [`connect`] dials either from a `(network, address)` pair, matching the
//! conventional reverse-proxy configuration surface:
//!
//! - `tcp`, `tcp4`, `tcp6` with `host:port`
//! - `unix` with a socket path
//!
//! # Example
//!
//! ```ignore
//! use fastgate::transport;
//!
//! let stream = transport::connect("tcp", "127.0.0.1:9000").await?;
//! let stream = transport::connect("unix", "/run/php-fpm.sock").await?;
//! ```

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::error::{FastgateError, Result};
use crate::BoxFuture;

/// A connected transport stream to a FastCGI application.
#[derive(Debug)]
pub enum Stream {
    /// TCP connection.
    Tcp(TcpStream),
    /// UNIX domain socket connection.
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Dial the FastCGI application at `(network, address)`.
///
/// # Errors
/// Returns [`FastgateError::Connect`] carrying the endpoint on any dial
/// failure, including an unknown `network`.
pub async fn connect(network: &str, address: &str) -> Result<Stream> {
    let wrap = |source: std::io::Error| FastgateError::Connect {
        address: format!("{network}!{address}"),
        source,
    };

    match network {
        "tcp" => Ok(Stream::Tcp(TcpStream::connect(address).await.map_err(wrap)?)),
        "tcp4" | "tcp6" => {
            let want_v4 = network == "tcp4";
            let addr = tokio::net::lookup_host(address)
                .await
                .map_err(wrap)?
                .find(|a| matches!(a, SocketAddr::V4(_)) == want_v4)
                .ok_or_else(|| {
                    wrap(std::io::Error::new(
                        std::io::ErrorKind::AddrNotAvailable,
                        format!("no {network} address for {address}"),
                    ))
                })?;
            Ok(Stream::Tcp(TcpStream::connect(addr).await.map_err(wrap)?))
        }
        #[cfg(unix)]
        "unix" => Ok(Stream::Unix(
            UnixStream::connect(address).await.map_err(wrap)?,
        )),
        other => Err(wrap(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unknown network {other:?}"),
        ))),
    }
}

/// Factory producing fresh transport streams, one per connection.
pub type ConnFactory = Arc<dyn Fn() -> BoxFuture<'static, Result<Stream>> + Send + Sync>;

/// The standard [`ConnFactory`]: dial `(network, address)` on every call.
pub fn simple_conn_factory(network: impl Into<String>, address: impl Into<String>) -> ConnFactory {
    let network = network.into();
    let address = address.into();
    Arc::new(move || {
        let network = network.clone();
        let address = address.clone();
        Box::pin(async move { connect(&network, &address).await })
    })
}
