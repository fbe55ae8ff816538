//! Connection: one transport stream, many in-flight requests.
//!
//! A connection serializes record writes behind a mutex and spawns a
//! demultiplex reader task that routes `STDOUT` / `STDERR` / `END_REQUEST`
//! records to per-request inboxes by request ID. The reader task is the
//! only reader of the stream; writes interleave whole records from any
//! number of request writer tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{FastgateError, Result};
use crate::protocol::{
    encode_record, params, BeginRequestBody, EndRequestBody, ProtocolStatus, Record, RecordBuffer,
    RecordType, Role, KEEP_CONN, MANAGEMENT_REQUEST_ID, MAX_CONTENT_LEN,
};

/// Read buffer size for the demultiplex loop.
const READ_BUF_SIZE: usize = 16 * 1024;

/// Chunk size when fragmenting a body stream into records.
const STREAM_CHUNK_SIZE: usize = 32 * 1024;

/// Response sinks for one in-flight request.
pub(crate) struct Inbox {
    stdout: DuplexStream,
    stderr: DuplexStream,
    done: Option<oneshot::Sender<()>>,
}

impl Inbox {
    /// Write a diagnostic line to the request's stderr sink.
    ///
    /// Failure means the consumer is gone; there is nobody left to tell.
    pub(crate) async fn note_stderr(&mut self, msg: &str) {
        let _ = self.stderr.write_all(msg.as_bytes()).await;
    }
}

/// Demux state shared between the connection handle and its reader task.
struct Shared {
    inboxes: Mutex<HashMap<u16, Inbox>>,
    /// Pending `GET_VALUES` caller, if any.
    mgmt: std::sync::Mutex<Option<oneshot::Sender<Bytes>>>,
    closed: AtomicBool,
}

/// One transport connection to a FastCGI application.
pub(crate) struct Connection {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    shared: Arc<Shared>,
}

impl Connection {
    /// Wrap a connected stream and spawn its demultiplex reader task.
    pub(crate) fn start<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            inboxes: Mutex::new(HashMap::new()),
            mgmt: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(demux_loop(read_half, shared.clone()));

        Self {
            writer: Mutex::new(Box::new(write_half)),
            shared,
        }
    }

    /// Whether the connection has been torn down, locally or remotely.
    pub(crate) fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Register response sinks for `request_id`.
    ///
    /// The returned receiver resolves when the demux closes the inbox
    /// (END_REQUEST, connection teardown, or a dead consumer).
    pub(crate) async fn register(
        &self,
        request_id: u16,
        stdout: DuplexStream,
        stderr: DuplexStream,
    ) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let inbox = Inbox {
            stdout,
            stderr,
            done: Some(done_tx),
        };
        self.shared.inboxes.lock().await.insert(request_id, inbox);
        done_rx
    }

    /// Remove and return the inbox for `request_id`, if still present.
    ///
    /// Used by the cancellation path; records for the ID arriving later
    /// are dropped by the demux as unknown.
    pub(crate) async fn remove_inbox(&self, request_id: u16) -> Option<Inbox> {
        self.shared.inboxes.lock().await.remove(&request_id)
    }

    /// Write one complete record. Whole records are the unit of
    /// interleaving; arrival order at the mutex decides wire order.
    pub(crate) async fn send_record(
        &self,
        rtype: RecordType,
        request_id: u16,
        payload: &[u8],
    ) -> Result<()> {
        if self.is_closed() {
            return Err(FastgateError::ConnectionClosed);
        }
        let bytes = encode_record(rtype, request_id, payload);
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(&bytes).await {
            self.shared.closed.store(true, Ordering::Release);
            return Err(e.into());
        }
        writer.flush().await?;
        Ok(())
    }

    /// Write `BEGIN_REQUEST` for a new request.
    pub(crate) async fn write_begin_request(
        &self,
        request_id: u16,
        role: Role,
        keep_conn: bool,
    ) -> Result<()> {
        let body = BeginRequestBody {
            role,
            flags: if keep_conn { KEEP_CONN } else { 0 },
        };
        self.send_record(RecordType::BeginRequest, request_id, &body.encode())
            .await
    }

    /// Write `ABORT_REQUEST` for an in-flight request.
    pub(crate) async fn write_abort_request(&self, request_id: u16) -> Result<()> {
        self.send_record(RecordType::AbortRequest, request_id, &[])
            .await
    }

    /// Write a full name-value pair stream: packed records, then the
    /// zero-length terminator.
    pub(crate) async fn write_pairs<'a, I>(
        &self,
        rtype: RecordType,
        request_id: u16,
        pairs: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for chunk in params::encode_pairs(pairs)? {
            self.send_record(rtype, request_id, &chunk).await?;
        }
        self.send_record(rtype, request_id, &[]).await
    }

    /// Copy `reader` onto the wire as a record stream of `rtype`,
    /// fragmenting at the record content limit, then terminate the stream.
    ///
    /// `None` produces just the terminator. Cancellation interrupts a
    /// blocked read; a partially written record never happens because the
    /// read completes before the record write starts.
    pub(crate) async fn write_stream<R>(
        &self,
        rtype: RecordType,
        request_id: u16,
        reader: Option<R>,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        debug_assert!(STREAM_CHUNK_SIZE <= MAX_CONTENT_LEN);
        if let Some(mut reader) = reader {
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = tokio::select! {
                    _ = cancel.cancelled() => return Err(FastgateError::Cancelled),
                    read = reader.read(&mut buf) => read?,
                };
                if n == 0 {
                    break;
                }
                self.send_record(rtype, request_id, &buf[..n]).await?;
            }
        }
        self.send_record(rtype, request_id, &[]).await
    }

    /// Issue a `GET_VALUES` capability query on the management request ID.
    ///
    /// The returned receiver resolves with the raw `GET_VALUES_RESULT`
    /// pair stream. Only one query may be outstanding per connection.
    pub(crate) async fn write_get_values(
        &self,
        names: &[&str],
    ) -> Result<oneshot::Receiver<Bytes>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.shared.mgmt.lock().expect("mgmt lock poisoned");
            if slot.is_some() {
                return Err(FastgateError::InvalidRequest(
                    "a GET_VALUES query is already outstanding".into(),
                ));
            }
            *slot = Some(tx);
        }
        let query: Vec<(&str, &str)> = names.iter().map(|n| (*n, "")).collect();
        let written = self
            .write_pairs(
                RecordType::GetValues,
                MANAGEMENT_REQUEST_ID,
                query.iter().map(|(n, v)| (*n, *v)),
            )
            .await;
        if let Err(e) = written {
            self.shared.mgmt.lock().expect("mgmt lock poisoned").take();
            return Err(e);
        }
        Ok(rx)
    }

    /// Shut the write side down; the reader task observes EOF and drains
    /// every inbox. Idempotent.
    pub(crate) async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// The demultiplex reader task: the only reader of the stream.
async fn demux_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut rec_buf = RecordBuffer::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    let outcome: Result<()> = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e.into()),
        };
        let records = match rec_buf.push(&buf[..n]) {
            Ok(records) => records,
            Err(e) => break Err(e),
        };
        for record in records {
            route(&shared, record).await;
        }
    };

    if let Err(e) = &outcome {
        tracing::error!("fastcgi demux loop error: {e}");
    }
    shutdown_all(&shared, outcome).await;
}

/// Route one record to its inbox.
async fn route(shared: &Arc<Shared>, record: Record) {
    let id = record.request_id();
    match record.rtype() {
        RecordType::Stdout | RecordType::Stderr => {
            if record.payload.is_empty() {
                // Stream terminator; sinks close on END_REQUEST.
                return;
            }
            let mut inboxes = shared.inboxes.lock().await;
            let Some(inbox) = inboxes.get_mut(&id) else {
                tracing::trace!("dropping {:?} record for unknown request {id}", record.rtype());
                return;
            };
            let sink = match record.rtype() {
                RecordType::Stdout => &mut inbox.stdout,
                _ => &mut inbox.stderr,
            };
            if sink.write_all(&record.payload).await.is_err() {
                // Consumer dropped its readers; stop feeding this request.
                tracing::debug!("response consumer for request {id} is gone");
                inboxes.remove(&id);
            }
        }

        RecordType::EndRequest => {
            let Some(mut inbox) = shared.inboxes.lock().await.remove(&id) else {
                tracing::trace!("dropping END_REQUEST for unknown request {id}");
                return;
            };
            match EndRequestBody::decode(record.payload()) {
                Ok(body) if body.protocol_status != ProtocolStatus::RequestComplete => {
                    inbox
                        .note_stderr(&format!(
                            "fastgate: application ended request with {:?}\n",
                            body.protocol_status
                        ))
                        .await;
                }
                Ok(body) => {
                    tracing::trace!("request {id} complete, app status {}", body.app_status);
                }
                Err(e) => {
                    inbox
                        .note_stderr(&format!("fastgate: bad END_REQUEST body: {e}\n"))
                        .await;
                }
            }
            if let Some(done) = inbox.done.take() {
                let _ = done.send(());
            }
            // Dropping the inbox closes both sinks exactly once.
        }

        RecordType::GetValuesResult => {
            let waiter = shared.mgmt.lock().expect("mgmt lock poisoned").take();
            match waiter {
                Some(tx) => {
                    let _ = tx.send(record.payload);
                }
                None => tracing::debug!("unsolicited GET_VALUES_RESULT"),
            }
        }

        RecordType::UnknownType => {
            tracing::debug!("application does not recognize a record type we sent");
        }

        other => {
            tracing::warn!("unexpected {other:?} record from application for request {id}");
        }
    }
}

/// Tear down every inbox after the reader loop ends.
async fn shutdown_all(shared: &Arc<Shared>, outcome: Result<()>) {
    shared.closed.store(true, Ordering::Release);
    shared.mgmt.lock().expect("mgmt lock poisoned").take();

    let mut inboxes = shared.inboxes.lock().await;
    for (id, mut inbox) in inboxes.drain() {
        let msg = match &outcome {
            Ok(()) => format!("fastgate: connection closed before END_REQUEST (request {id})\n"),
            Err(e) => format!("fastgate: connection error: {e}\n"),
        };
        inbox.note_stderr(&msg).await;
        if let Some(done) = inbox.done.take() {
            let _ = done.send(());
        }
    }
}
