//! FastCGI Authorizer composition.
//!
//! An [`Authorizer`] consults a FastCGI application in the Authorizer role
//! before a protected handler runs. On approval (status 200) the
//! application may pass variables downstream via `Variable-*` response
//! headers; on anything else its response is forwarded to the HTTP client
//! verbatim.
//!
//! The composition is HTTP-server-agnostic: the caller buffers the request
//! body, calls [`Authorizer::authorize`], and acts on the returned
//! [`AuthDecision`].

use bytes::Bytes;
use http::{HeaderMap, HeaderName, StatusCode};

use crate::client::ClientFactory;
use crate::error::Result;
use crate::protocol::Role;
use crate::request::{HttpContext, Request};
use crate::response::BufferedResponse;
use crate::session::SessionHandler;

/// Header prefix carrying authorizer-approved variables downstream.
const VARIABLE_PREFIX: &str = "variable-";

/// The authorizer's verdict for one request.
#[derive(Debug)]
pub enum AuthDecision {
    /// Status 200: let the protected handler run. `variables` holds the
    /// `Variable-*` response headers with the prefix stripped; the
    /// authorizer's body is discarded.
    Allowed {
        /// Variables to merge into the downstream request's headers.
        variables: HeaderMap,
    },
    /// Any other status: forward this response to the HTTP client as-is.
    Denied {
        /// Status to forward.
        status: StatusCode,
        /// Headers to forward.
        headers: HeaderMap,
        /// Body to forward.
        body: Bytes,
    },
}

/// Gate requests through a FastCGI authorizer application.
pub struct Authorizer {
    factory: ClientFactory,
    session: SessionHandler,
}

impl Authorizer {
    /// Create an authorizer from a client factory and a session chain
    /// (typically [`crate::session::auth_prepare`] around
    /// [`crate::session::basic_session`]).
    pub fn new(factory: ClientFactory, session: SessionHandler) -> Self {
        Self { factory, session }
    }

    /// Run the authorizer for one HTTP request.
    ///
    /// `body` is the buffered request body; the caller keeps its own copy
    /// for the protected handler. A header-level protocol failure from the
    /// authorizer application comes back as a 500 `Denied`.
    pub async fn authorize(&self, http: HttpContext, body: Bytes) -> Result<AuthDecision> {
        let mut req = Request::from_http(http);
        req.role = Role::Authorizer;
        if !body.is_empty() {
            req.set_stdin(std::io::Cursor::new(body));
        }

        let client = (self.factory)().await?;
        let result = (self.session)(client.clone(), req).await;
        let pipe = match result {
            Ok(pipe) => pipe,
            Err(e) => {
                client.close().await;
                return Err(e);
            }
        };

        let mut sink = BufferedResponse::new();
        let mut stderr = Vec::new();
        let drained = pipe.write_to(&mut sink, &mut stderr).await;
        client.close().await;

        if !stderr.is_empty() {
            tracing::warn!(
                "error stream from authorizer application: {}",
                String::from_utf8_lossy(&stderr)
            );
        }
        if let Err(e) = drained {
            // The sink already carries the 500; forward it.
            tracing::error!("authorizer response unreadable: {e}");
        }

        if sink.status() != StatusCode::OK {
            return Ok(AuthDecision::Denied {
                status: sink.status(),
                headers: sink.headers,
                body: sink.body.freeze(),
            });
        }

        let mut variables = HeaderMap::new();
        for (name, value) in sink.headers.iter() {
            let name = name.as_str();
            if name.len() > VARIABLE_PREFIX.len() && name.starts_with(VARIABLE_PREFIX) {
                if let Ok(stripped) = HeaderName::from_bytes(name[VARIABLE_PREFIX.len()..].as_bytes())
                {
                    variables.append(stripped, value.clone());
                }
            }
        }
        Ok(AuthDecision::Allowed { variables })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ResponsePipe;
    use crate::Client;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    /// A session handler that answers with a canned CGI response instead
    /// of talking to a real application.
    fn scripted_session(stdout: &'static [u8]) -> SessionHandler {
        Arc::new(move |_client: Client, req: Request| {
            Box::pin(async move {
                assert_eq!(req.role, Role::Authorizer);
                let (pipe, mut stdout_w, _stderr_w) = ResponsePipe::new();
                tokio::spawn(async move {
                    stdout_w.write_all(stdout).await.unwrap();
                });
                Ok(pipe)
            })
        })
    }

    fn loopback_factory() -> ClientFactory {
        Arc::new(|| {
            Box::pin(async {
                let (local, remote) = tokio::io::duplex(4096);
                tokio::spawn(async move {
                    let _keep_open = remote;
                    std::future::pending::<()>().await;
                });
                Ok(Client::new(local, 1))
            })
        })
    }

    fn ctx() -> HttpContext {
        HttpContext::new(http::Method::GET, "/protected".parse().unwrap())
    }

    #[tokio::test]
    async fn test_status_200_allows_and_strips_variables() {
        let auth = Authorizer::new(
            loopback_factory(),
            scripted_session(
                b"Status: 200\r\nVariable-User: alice\r\nVariable-Team: core\r\nX-Other: n\r\n\r\nignored",
            ),
        );

        match auth.authorize(ctx(), Bytes::new()).await.unwrap() {
            AuthDecision::Allowed { variables } => {
                assert_eq!(variables["user"], "alice");
                assert_eq!(variables["team"], "core");
                assert!(!variables.contains_key("x-other"));
            }
            other => panic!("expected Allowed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_200_forwards_response() {
        let auth = Authorizer::new(
            loopback_factory(),
            scripted_session(b"Status: 403\r\nContent-Type: text/plain\r\n\r\ndenied"),
        );

        match auth.authorize(ctx(), Bytes::new()).await.unwrap() {
            AuthDecision::Denied {
                status,
                headers,
                body,
            } => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(headers["content-type"], "text/plain");
                assert_eq!(&body[..], b"denied");
            }
            other => panic!("expected Denied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unparseable_response_denies_with_500() {
        let auth = Authorizer::new(loopback_factory(), scripted_session(b""));

        match auth.authorize(ctx(), Bytes::new()).await.unwrap() {
            AuthDecision::Denied { status, .. } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            }
            other => panic!("expected Denied, got {other:?}"),
        }
    }
}
