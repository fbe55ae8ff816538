//! Response pipe: the application's stdout/stderr streams for one request.
//!
//! The demultiplexer owns the writer side of both pipes; the HTTP layer
//! drains the reader side through [`ResponsePipe::write_to`], which parses
//! the CGI response headers off stdout, commits status and headers to an
//! [`HttpResponseSink`], streams the body, and copies stderr verbatim to
//! an error sink.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWrite, BufReader, DuplexStream};

use crate::error::{FastgateError, Result};

/// Buffer size of each in-memory response pipe.
const PIPE_BUF_SIZE: usize = 64 * 1024;

/// Maximum accepted CGI header line length, terminator excluded.
const MAX_HEADER_LINE: usize = 1024;

/// Where the parsed HTTP response goes.
///
/// `send_head` is called exactly once, before any body chunk.
#[async_trait]
pub trait HttpResponseSink: Send {
    /// Commit the response status and headers.
    async fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> std::io::Result<()>;

    /// Append one chunk of the response body.
    async fn send_body(&mut self, chunk: Bytes) -> std::io::Result<()>;
}

/// An [`HttpResponseSink`] that buffers everything in memory.
///
/// Used by the authorizer (which must inspect the response before
/// forwarding anything) and by tests.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    /// Committed status, if the head was sent.
    pub status: Option<StatusCode>,
    /// Committed headers.
    pub headers: HeaderMap,
    /// Accumulated body bytes.
    pub body: BytesMut,
}

impl BufferedResponse {
    /// Create an empty buffered response.
    pub fn new() -> Self {
        Self::default()
    }

    /// The committed status, or 200 when no head was ever sent.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    /// The body as a byte slice.
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

#[async_trait]
impl HttpResponseSink for BufferedResponse {
    async fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> std::io::Result<()> {
        self.status = Some(status);
        self.headers = headers;
        Ok(())
    }

    async fn send_body(&mut self, chunk: Bytes) -> std::io::Result<()> {
        self.body.extend_from_slice(&chunk);
        Ok(())
    }
}

/// The pair of byte streams carrying the application's output for one
/// request. Reader halves live here; writer halves belong to the demux.
#[derive(Debug)]
pub struct ResponsePipe {
    stdout: DuplexStream,
    stderr: DuplexStream,
}

impl ResponsePipe {
    /// Create a pipe pair; returns the pipe plus the stdout and stderr
    /// writer halves for inbox registration.
    pub(crate) fn new() -> (Self, DuplexStream, DuplexStream) {
        let (stdout_r, stdout_w) = duplex(PIPE_BUF_SIZE);
        let (stderr_r, stderr_w) = duplex(PIPE_BUF_SIZE);
        (
            Self {
                stdout: stdout_r,
                stderr: stderr_r,
            },
            stdout_w,
            stderr_w,
        )
    }

    /// Drain both streams: parse CGI headers off stdout and stream the
    /// body into `sink`; copy stderr verbatim into `error_sink`.
    ///
    /// Returns when both copies finish. Header problems commit a 500 to
    /// the sink and surface as [`FastgateError::Protocol`].
    pub async fn write_to<S, E>(self, sink: &mut S, error_sink: &mut E) -> Result<()>
    where
        S: HttpResponseSink,
        E: AsyncWrite + Unpin + Send,
    {
        let stdout = self.stdout;
        let mut stderr = self.stderr;

        let (response, _) = tokio::join!(write_response(stdout, sink), async {
            if let Err(e) = tokio::io::copy(&mut stderr, error_sink).await {
                tracing::debug!("stderr copy ended early: {e}");
            }
        });
        response
    }
}

/// Parse the CGI response and stream it into the sink.
async fn write_response<S>(stdout: DuplexStream, sink: &mut S) -> Result<()>
where
    S: HttpResponseSink,
{
    let mut reader = BufReader::with_capacity(MAX_HEADER_LINE, stdout);

    let (status, headers) = match parse_cgi_headers(&mut reader).await {
        Ok(parsed) => parsed,
        Err(e) => {
            let _ = sink
                .send_head(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new())
                .await;
            return Err(e);
        }
    };

    sink.send_head(status, headers).await?;

    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.send_body(Bytes::copy_from_slice(&buf[..n])).await?;
    }
}

/// Read CGI header lines until the blank-line terminator and decide the
/// HTTP status:
///
/// - `Status: NNN ...` sets the code (at least 3 digits required)
/// - `Location:` without a status defaults to 302
/// - no header lines, or EOF before the blank line, is a protocol error
/// - no status and no `Content-Type` is a protocol error
/// - otherwise the status defaults to 200
async fn parse_cgi_headers<R>(reader: &mut R) -> Result<(StatusCode, HeaderMap)>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut headers = HeaderMap::new();
    let mut status: Option<StatusCode> = None;
    let mut header_lines = 0usize;
    let mut saw_blank_line = false;

    while let Some(line) = read_header_line(reader).await? {
        if line.is_empty() {
            saw_blank_line = true;
            break;
        }
        header_lines += 1;

        let text = String::from_utf8_lossy(&line);
        let Some((name, value)) = text.split_once(':') else {
            tracing::warn!("bogus CGI header line: {text:?}");
            continue;
        };
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("Status") {
            status = Some(parse_status(value)?);
            continue;
        }

        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::warn!("unrepresentable CGI header: {text:?}"),
        }
    }

    if header_lines == 0 || !saw_blank_line {
        return Err(FastgateError::Protocol(
            "no CGI headers from application".into(),
        ));
    }

    if status.is_none() && headers.contains_key(http::header::LOCATION) {
        status = Some(StatusCode::FOUND);
    }
    if status.is_none() && !headers.contains_key(http::header::CONTENT_TYPE) {
        return Err(FastgateError::Protocol(
            "missing required Content-Type in CGI headers".into(),
        ));
    }

    Ok((status.unwrap_or(StatusCode::OK), headers))
}

/// Parse the value of a `Status:` header; the first three characters must
/// be digits.
fn parse_status(value: &str) -> Result<StatusCode> {
    let code = value
        .get(0..3)
        .and_then(|s| s.parse::<u16>().ok())
        .and_then(|n| StatusCode::from_u16(n).ok());
    code.ok_or_else(|| FastgateError::Protocol(format!("bogus CGI status: {value:?}")))
}

/// Read one header line, accepting `\r\n` or `\n` terminators.
///
/// Returns `None` on a clean EOF before any byte of a line. A line longer
/// than [`MAX_HEADER_LINE`] is a protocol error.
async fn read_header_line<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = Vec::new();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            // EOF inside a header line; the caller never saw a blank line.
            return Err(FastgateError::Protocol(
                "EOF inside CGI header line".into(),
            ));
        }

        match buf.iter().position(|&b| b == b'\n') {
            Some(i) => {
                line.extend_from_slice(&buf[..i]);
                reader.consume(i + 1);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.len() > MAX_HEADER_LINE {
                    return Err(FastgateError::Protocol(
                        "over-long CGI header line".into(),
                    ));
                }
                return Ok(Some(line));
            }
            None => {
                line.extend_from_slice(buf);
                let n = buf.len();
                reader.consume(n);
                if line.len() > MAX_HEADER_LINE {
                    return Err(FastgateError::Protocol(
                        "over-long CGI header line".into(),
                    ));
                }
            }
        }
    }
}
