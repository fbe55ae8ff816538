//! Client: the per-connection request façade.
//!
//! A [`Client`] owns one transport connection and one request-ID pool.
//! [`Client::do_request`] multiplexes any number of concurrent requests
//! over the connection: each call allocates an ID, registers response
//! sinks with the demultiplexer, spawns a writer task for the request
//! streams and a supervisor task that ties writer completion, response
//! completion, and caller cancellation together.
//!
//! # Example
//!
//! ```ignore
//! use fastgate::{Client, Request};
//!
//! let client = Client::connect("tcp", "127.0.0.1:9000", 0).await?;
//! let mut req = Request::new();
//! req.set_param("REQUEST_METHOD", "GET");
//! req.set_param("SCRIPT_FILENAME", "/srv/www/index.php");
//! let pipe = client.do_request(req).await?;
//! pipe.write_to(&mut sink, &mut stderr_log).await?;
//! ```

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::conn::Connection;
use crate::error::{FastgateError, Result};
use crate::id_pool::IdPool;
use crate::protocol::{params, RecordType, Role};
use crate::request::Request;
use crate::response::ResponsePipe;
use crate::transport::{self, ConnFactory};
use crate::BoxFuture;

/// Client for one FastCGI application connection.
///
/// Cheap to clone; all clones share the connection, the ID pool, and the
/// closed state.
#[derive(Clone)]
pub struct Client {
    conn: Arc<Connection>,
    ids: Arc<IdPool>,
}

impl Client {
    /// Wrap an already-connected stream.
    ///
    /// `id_limit` bounds concurrent requests on this connection; 0 selects
    /// the protocol maximum of 65,535.
    pub fn new<S>(stream: S, id_limit: u16) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            conn: Arc::new(Connection::start(stream)),
            ids: Arc::new(IdPool::new(id_limit)),
        }
    }

    /// Dial `(network, address)` and wrap the stream.
    pub async fn connect(network: &str, address: &str, id_limit: u16) -> Result<Self> {
        Ok(Self::new(
            transport::connect(network, address).await?,
            id_limit,
        ))
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Issue one FastCGI request and return its response pipe.
    ///
    /// Returns as soon as the request is registered; the request streams
    /// are written and the response delivered concurrently. Synchronous
    /// failures (validation, closed connection) come back here; anything
    /// later surfaces on the pipe's stderr sink while stdout closes
    /// cleanly.
    pub async fn do_request(&self, req: Request) -> Result<ResponsePipe> {
        if self.conn.is_closed() {
            return Err(FastgateError::ConnectionClosed);
        }
        req.validate()?;

        let id = self.ids.alloc().await;
        let (pipe, stdout_w, stderr_w) = ResponsePipe::new();
        let done_rx = self.conn.register(id, stdout_w, stderr_w).await;

        let cancel = req.cancel_token();
        let write_cancel = cancel.child_token();

        let Request {
            role,
            keep_conn,
            params,
            stdin,
            data,
            ..
        } = req;

        // Writer task: BEGIN_REQUEST, PARAMS, STDIN, and DATA for filters,
        // each stream closed by its zero-length terminator.
        let conn = self.conn.clone();
        let stream_cancel = write_cancel.clone();
        let writer = tokio::spawn(async move {
            let result = async {
                conn.write_begin_request(id, role, keep_conn).await?;
                conn.write_pairs(
                    RecordType::Params,
                    id,
                    params.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                )
                .await?;
                conn.write_stream(RecordType::Stdin, id, stdin, &stream_cancel)
                    .await?;
                if role == Role::Filter {
                    conn.write_stream(RecordType::Data, id, data, &stream_cancel)
                        .await?;
                }
                Ok::<(), FastgateError>(())
            }
            .await;

            if let Err(e) = &result {
                if !matches!(e, FastgateError::Cancelled) {
                    tracing::debug!("request {id} write failed: {e}");
                    let _ = conn.write_abort_request(id).await;
                    if let Some(mut inbox) = conn.remove_inbox(id).await {
                        inbox
                            .note_stderr(&format!("fastgate: request write failed: {e}\n"))
                            .await;
                    }
                }
            }
            result
        });

        // Supervisor task: the only releaser of the request ID.
        let conn = self.conn.clone();
        let ids = self.ids.clone();
        tokio::spawn(async move {
            tokio::select! {
                // Demux closed the inbox: END_REQUEST, connection
                // teardown, or a failed writer dropping it.
                _ = done_rx => {
                    write_cancel.cancel();
                    let _ = writer.await;
                }
                _ = cancel.cancelled() => {
                    write_cancel.cancel();
                    let _ = conn.write_abort_request(id).await;
                    if let Some(mut inbox) = conn.remove_inbox(id).await {
                        inbox.note_stderr("timeout or canceled").await;
                    }
                    let _ = writer.await;
                }
            }
            ids.release(id);
        });

        Ok(pipe)
    }

    /// Query application capabilities via `GET_VALUES`.
    ///
    /// Standard names live in [`crate::protocol::values`].
    pub async fn get_values(&self, names: &[&str]) -> Result<Vec<(String, String)>> {
        let rx = self.conn.write_get_values(names).await?;
        let payload = rx.await.map_err(|_| FastgateError::ConnectionClosed)?;
        params::decode_pairs(&payload)
    }

    /// Close the connection. Idempotent; in-flight requests observe the
    /// teardown through their pipes, and subsequent
    /// [`do_request`](Self::do_request) calls fail with
    /// [`FastgateError::ConnectionClosed`].
    pub async fn close(&self) {
        self.conn.close().await;
    }
}

/// Factory producing fresh, connected [`Client`]s for the pool.
pub type ClientFactory = Arc<dyn Fn() -> BoxFuture<'static, Result<Client>> + Send + Sync>;

/// The standard [`ClientFactory`]: dial through `conn_factory` and wrap
/// each stream in a client with `id_limit` multiplexing slots.
pub fn simple_client_factory(conn_factory: ConnFactory, id_limit: u16) -> ClientFactory {
    Arc::new(move || {
        let conn_factory = conn_factory.clone();
        Box::pin(async move {
            let stream = conn_factory().await?;
            Ok(Client::new(stream, id_limit))
        })
    })
}
