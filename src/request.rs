//! Request types: the FastCGI request and its originating HTTP context.
//!
//! A [`Request`] is built by the session middleware chain from an
//! [`HttpContext`] and consumed exactly once by
//! [`Client::do_request`](crate::Client::do_request).

use std::collections::BTreeMap;
use std::net::SocketAddr;

use http::{HeaderMap, Method, Uri, Version};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::error::{FastgateError, Result};
use crate::protocol::Role;

/// Parameter carrying the data stream's modification time (Filter role).
pub const DATA_LAST_MOD: &str = "FCGI_DATA_LAST_MOD";

/// Parameter carrying the data stream's length in bytes (Filter role).
pub const DATA_LENGTH: &str = "FCGI_DATA_LENGTH";

/// A boxed request body stream.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// The originating HTTP request, reduced to what CGI parameter mapping
/// and cancellation need.
#[derive(Debug, Clone)]
pub struct HttpContext {
    /// HTTP request method.
    pub method: Method,
    /// Request URI (path, query, possibly authority).
    pub uri: Uri,
    /// HTTP protocol version.
    pub version: Version,
    /// Request headers.
    pub headers: HeaderMap,
    /// Whether the client connection is TLS.
    pub tls: bool,
    /// Peer address of the HTTP client.
    pub remote_addr: Option<SocketAddr>,
    /// Host (and optional port) the request was addressed to.
    pub host: Option<String>,
    /// Fires when the HTTP caller abandons the request.
    pub cancel: CancellationToken,
}

impl HttpContext {
    /// Create a context for `method` and `uri` with empty headers.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            tls: false,
            remote_addr: None,
            host: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the request headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Mark the originating connection as TLS.
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Set the HTTP client's peer address.
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Set the host the request was addressed to (`host` or `host:port`).
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Attach a cancellation token derived from the HTTP request.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The request scheme: the URI's if present, else derived from TLS.
    pub fn scheme(&self) -> &str {
        match self.uri.scheme_str() {
            Some(s) => s,
            None if self.tls => "https",
            None => "http",
        }
    }

    /// Path plus query, the CGI `REQUEST_URI`.
    pub fn request_uri(&self) -> String {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| self.uri.path().to_owned())
    }

    /// The protocol line, e.g. `HTTP/1.1`.
    pub fn protocol(&self) -> &'static str {
        match self.version {
            Version::HTTP_09 => "HTTP/0.9",
            Version::HTTP_10 => "HTTP/1.0",
            Version::HTTP_2 => "HTTP/2.0",
            Version::HTTP_3 => "HTTP/3.0",
            _ => "HTTP/1.1",
        }
    }
}

/// One FastCGI request, addressed to the application.
pub struct Request {
    /// Role the application should play.
    pub role: Role,
    /// Ask the application to keep the connection open afterwards.
    /// Required for multiplexing and pooling; on by default.
    pub keep_conn: bool,
    /// CGI parameters; insertion is last-write-wins, iteration is ordered.
    pub params: BTreeMap<String, String>,
    /// Request body stream.
    pub stdin: Option<BodyReader>,
    /// Extra data stream; required exactly when `role` is `Filter`.
    pub data: Option<BodyReader>,
    /// The originating HTTP request, if any.
    pub http: Option<HttpContext>,
}

impl Request {
    /// Create an empty Responder request.
    pub fn new() -> Self {
        Self {
            role: Role::Responder,
            keep_conn: true,
            params: BTreeMap::new(),
            stdin: None,
            data: None,
            http: None,
        }
    }

    /// Create a Responder request carrying its HTTP context.
    pub fn from_http(http: HttpContext) -> Self {
        let mut req = Self::new();
        req.http = Some(http);
        req
    }

    /// Set one CGI parameter (last write wins).
    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.insert(name.into(), value.into());
    }

    /// Set the request body stream.
    pub fn set_stdin(&mut self, stdin: impl AsyncRead + Send + Unpin + 'static) {
        self.stdin = Some(Box::new(stdin));
    }

    /// Set the extra data stream for the Filter role.
    pub fn set_data(&mut self, data: impl AsyncRead + Send + Unpin + 'static) {
        self.data = Some(Box::new(data));
    }

    /// The cancellation token for this request; a fresh never-cancelled
    /// token when there is no HTTP context.
    pub fn cancel_token(&self) -> CancellationToken {
        self.http
            .as_ref()
            .map(|h| h.cancel.clone())
            .unwrap_or_default()
    }

    /// Check role-specific requirements before anything hits the wire.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.role != Role::Filter {
            return Ok(());
        }
        if self.data.is_none() {
            return Err(FastgateError::InvalidRequest(
                "filter role requires a data stream".into(),
            ));
        }
        for key in [DATA_LAST_MOD, DATA_LENGTH] {
            let ok = self
                .params
                .get(key)
                .is_some_and(|v| v.parse::<u32>().is_ok());
            if !ok {
                return Err(FastgateError::InvalidRequest(format!(
                    "filter role requires {key} as a decimal u32"
                )));
            }
        }
        Ok(())
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}
