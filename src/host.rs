//! End-to-end handler glue: pool, session chain, response pipe.
//!
//! [`Handler`] is what an HTTP server embeds: it checks a client out of
//! the pool, runs the session chain to build and issue the FastCGI
//! request, drains the response pipe into the server's sinks, and returns
//! the client to the pool.

use http::{HeaderMap, StatusCode};
use tokio::io::AsyncWrite;

use crate::error::Result;
use crate::pool::ClientPool;
use crate::request::{BodyReader, HttpContext, Request};
use crate::response::HttpResponseSink;
use crate::session::{basic_session, Middleware, SessionHandler};

/// A pooled FastCGI gateway for one upstream endpoint.
pub struct Handler {
    pool: ClientPool,
    session: SessionHandler,
}

impl Handler {
    /// Create a handler from a pool and a parameter-mapping middleware
    /// (e.g. [`crate::session::php_fs`]).
    pub fn new(pool: ClientPool, middleware: Middleware) -> Self {
        Self {
            pool,
            session: middleware(basic_session()),
        }
    }

    /// Create a handler with a fully built session chain.
    pub fn with_session(pool: ClientPool, session: SessionHandler) -> Self {
        Self { pool, session }
    }

    /// Relay one HTTP request to the FastCGI application.
    ///
    /// Dial failures commit 502 to the sink; a session failure commits
    /// 500. Header problems in the application's response commit 500 via
    /// the response pipe. In every case the error also comes back to the
    /// caller for logging.
    pub async fn serve<S, E>(
        &self,
        http: HttpContext,
        stdin: Option<BodyReader>,
        sink: &mut S,
        error_sink: &mut E,
    ) -> Result<()>
    where
        S: HttpResponseSink,
        E: AsyncWrite + Unpin + Send,
    {
        let client = match self.pool.create_client().await {
            Ok(client) => client,
            Err(e) => {
                tracing::error!("unable to connect to FastCGI application: {e}");
                let _ = sink
                    .send_head(StatusCode::BAD_GATEWAY, HeaderMap::new())
                    .await;
                return Err(e);
            }
        };

        let mut req = Request::from_http(http);
        req.stdin = stdin;

        match (self.session)(client.client().clone(), req).await {
            Ok(pipe) => {
                let result = pipe.write_to(sink, error_sink).await;
                client.close().await;
                result
            }
            Err(e) => {
                tracing::error!("unable to process request: {e}");
                client.close().await;
                let _ = sink
                    .send_head(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new())
                    .await;
                Err(e)
            }
        }
    }
}
