//! Session middleware: building the CGI parameter set for a request.
//!
//! A [`SessionHandler`] turns a [`Client`] and a [`Request`] into a
//! [`ResponsePipe`]; a [`Middleware`] wraps one session handler in
//! another. The middlewares here populate CGI parameters from the
//! request's HTTP context and select the request role, covering the
//! conventional reverse-proxy parameter surface:
//!
//! ```text
//! fastcgi_param  SCRIPT_FILENAME    $document_root$fastcgi_script_name;
//! fastcgi_param  PATH_INFO          $fastcgi_path_info;
//! fastcgi_param  QUERY_STRING       $query_string;
//! fastcgi_param  REQUEST_METHOD     $request_method;
//! fastcgi_param  CONTENT_TYPE       $content_type;
//! fastcgi_param  CONTENT_LENGTH     $content_length;
//! ...
//! ```
//!
//! # Example
//!
//! ```ignore
//! use fastgate::session::{self, FilesystemRouter};
//!
//! let middleware = session::php_fs("/srv/www");
//! let handler = middleware(session::basic_session());
//! let pipe = handler(client, request).await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use http::header;
use http::HeaderMap;

use crate::client::Client;
use crate::error::{FastgateError, Result};
use crate::protocol::Role;
use crate::request::{Request, DATA_LAST_MOD, DATA_LENGTH};
use crate::response::ResponsePipe;
use crate::BoxFuture;

/// Handles one session: issues `req` through `client` and returns the
/// response pipe.
pub type SessionHandler =
    Arc<dyn Fn(Client, Request) -> BoxFuture<'static, Result<ResponsePipe>> + Send + Sync>;

/// Transforms a [`SessionHandler`] into another, typically by populating
/// request parameters before delegating.
pub type Middleware = Arc<dyn Fn(SessionHandler) -> SessionHandler + Send + Sync>;

/// The innermost session handler: `client.do_request(req)`.
pub fn basic_session() -> SessionHandler {
    Arc::new(|client, req| Box::pin(async move { client.do_request(req).await }))
}

/// Chain middlewares outer-first: the first middleware is the first to see
/// the request and the last to see the response.
pub fn chain(middlewares: impl IntoIterator<Item = Middleware>) -> Middleware {
    let middlewares: Vec<Middleware> = middlewares.into_iter().collect();
    Arc::new(move |inner| {
        let mut out = inner;
        for middleware in middlewares.iter().rev() {
            out = middleware(out);
        }
        out
    })
}

/// Build a middleware from a synchronous request transform.
fn param_middleware<F>(apply: F) -> Middleware
where
    F: Fn(&mut Request) + Send + Sync + 'static,
{
    let apply = Arc::new(apply);
    Arc::new(move |inner: SessionHandler| {
        let apply = apply.clone();
        Arc::new(move |client: Client, mut req: Request| {
            let inner = inner.clone();
            let apply = apply.clone();
            Box::pin(async move {
                apply(&mut req);
                inner(client, req).await
            })
        })
    })
}

/// One header's values joined with `,`, or an empty string.
fn header_str(headers: &HeaderMap, name: &header::HeaderName) -> String {
    let mut values = headers.get_all(name).iter();
    let Some(first) = values.next() else {
        return String::new();
    };
    let mut out = String::from_utf8_lossy(first.as_bytes()).into_owned();
    for value in values {
        out.push(',');
        out.push_str(&String::from_utf8_lossy(value.as_bytes()));
    }
    out
}

/// Split `host:port`, tolerating a bare host and bracketed IPv6 literals.
fn split_host_port(host: &str) -> (String, Option<String>) {
    if let Some(rest) = host.strip_prefix('[') {
        // `[v6]` or `[v6]:port`
        if let Some((name, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .filter(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
                .map(str::to_owned);
            return (name.to_owned(), port);
        }
    }
    if host.matches(':').count() > 1 {
        // Bare IPv6 literal.
        return (host.to_owned(), None);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            (name.to_owned(), Some(port.to_owned()))
        }
        _ => (host.to_owned(), None),
    }
}

/// Map the standard CGI variables from the originating HTTP request.
///
/// Parameters included: `CONTENT_TYPE`, `CONTENT_LENGTH`,
/// `GATEWAY_INTERFACE`, `HTTPS` (TLS only), `REMOTE_ADDR`, `REMOTE_PORT`,
/// `SERVER_NAME`, `SERVER_PORT`, `SERVER_PROTOCOL`, `SERVER_SOFTWARE`,
/// `REDIRECT_STATUS`, `REQUEST_METHOD`, `REQUEST_SCHEME`, `REQUEST_URI`,
/// `QUERY_STRING`.
pub fn basic_params_map() -> Middleware {
    param_middleware(|req| {
        let Some(http) = req.http.clone() else {
            return;
        };

        if http.tls {
            req.set_param("HTTPS", "on");
        }

        let (remote_addr, remote_port) = match http.remote_addr {
            Some(addr) => (addr.ip().to_string(), addr.port().to_string()),
            None => (String::new(), String::new()),
        };

        let (server_name, server_port) = match &http.host {
            Some(host) => split_host_port(host),
            None => (String::new(), None),
        };
        let server_port = server_port.unwrap_or_else(|| {
            if http.tls { "443" } else { "80" }.to_owned()
        });

        req.set_param("CONTENT_TYPE", header_str(&http.headers, &header::CONTENT_TYPE));
        req.set_param(
            "CONTENT_LENGTH",
            header_str(&http.headers, &header::CONTENT_LENGTH),
        );
        req.set_param("GATEWAY_INTERFACE", "CGI/1.1");
        req.set_param("REMOTE_ADDR", remote_addr);
        req.set_param("REMOTE_PORT", remote_port);
        req.set_param("SERVER_NAME", server_name);
        req.set_param("SERVER_PORT", server_port);
        req.set_param("SERVER_PROTOCOL", http.protocol());
        req.set_param("SERVER_SOFTWARE", "fastgate");
        req.set_param("REDIRECT_STATUS", "200");
        req.set_param("REQUEST_SCHEME", http.scheme());
        req.set_param("REQUEST_METHOD", http.method.as_str());
        req.set_param("REQUEST_URI", http.request_uri());
        req.set_param("QUERY_STRING", http.uri.query().unwrap_or(""));
    })
}

/// Map each HTTP header `Some-Name` to `HTTP_SOME_NAME`, joining repeated
/// values with `,`. `Content-Type` and `Content-Length` are skipped; they
/// are already mapped by [`basic_params_map`].
pub fn map_header() -> Middleware {
    param_middleware(|req| {
        let Some(http) = req.http.clone() else {
            return;
        };
        for name in http.headers.keys() {
            let formatted: String = name
                .as_str()
                .chars()
                .map(|c| match c {
                    '-' => '_',
                    c => c.to_ascii_uppercase(),
                })
                .collect();
            if formatted == "CONTENT_TYPE" || formatted == "CONTENT_LENGTH" {
                continue;
            }
            req.set_param(format!("HTTP_{formatted}"), header_str(&http.headers, name));
        }
    })
}

/// Reverse-DNS the HTTP client's address into `REMOTE_HOST`.
///
/// The PTR lookup is blocking, so it runs on the blocking pool. A failed
/// or empty lookup leaves the parameter unset.
pub fn map_remote_host() -> Middleware {
    Arc::new(|inner: SessionHandler| {
        Arc::new(move |client: Client, mut req: Request| {
            let inner = inner.clone();
            Box::pin(async move {
                if let Some(addr) = req.http.as_ref().and_then(|h| h.remote_addr) {
                    let ip = addr.ip();
                    let name = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip))
                        .await
                        .ok()
                        .and_then(|r| r.ok());
                    if let Some(name) = name.filter(|n| !n.is_empty()) {
                        req.set_param("REMOTE_HOST", name.trim_end_matches('.'));
                    }
                }
                inner(client, req).await
            })
        })
    })
}

/// Routes requests to script files under a document root, the classic
/// Apache + mod_php layout.
///
/// Parameters included: `PATH_INFO`, `PATH_TRANSLATED`, `SCRIPT_NAME`,
/// `SCRIPT_FILENAME`, `DOCUMENT_URI`, `DOCUMENT_ROOT`.
#[derive(Debug, Clone)]
pub struct FilesystemRouter {
    /// The ordinary Apache DocumentRoot parameter.
    pub doc_root: String,
    /// Script extensions that split the path (e.g. `["php"]`).
    pub exts: Vec<String>,
    /// Directory index files, tried first-to-last for `/` paths.
    pub dir_index: Vec<String>,
}

impl FilesystemRouter {
    /// Produce the routing middleware.
    pub fn router(self) -> Middleware {
        param_middleware(move |req| {
            let Some(http) = req.http.clone() else {
                return;
            };
            let url_path = http.uri.path().to_owned();

            let (script_name, path_info) = split_path_info(&url_path, &self.exts);

            let script_filename = if url_path.ends_with('/') {
                let index = self.dir_index.first().map(String::as_str).unwrap_or("");
                join_url_path(&self.doc_root, &join_url_path(&url_path, index))
            } else {
                join_url_path(&self.doc_root, &script_name)
            };

            req.set_param("PATH_INFO", path_info.clone());
            req.set_param("PATH_TRANSLATED", join_url_path(&self.doc_root, &path_info));
            req.set_param("SCRIPT_NAME", script_name);
            req.set_param("SCRIPT_FILENAME", script_filename);
            req.set_param("DOCUMENT_URI", url_path);
            req.set_param("DOCUMENT_ROOT", self.doc_root.clone());
        })
    }
}

/// Split a URL path into `(SCRIPT_NAME, PATH_INFO)` on the first matching
/// extension: the longest prefix ending in `.ext` with a non-empty
/// remainder wins, like the conventional `^(.+\.ext)(/?.+)$` split.
fn split_path_info(path: &str, exts: &[String]) -> (String, String) {
    for ext in exts {
        let needle = format!(".{ext}");
        let mut best = None;
        let mut from = 0;
        while let Some(pos) = path[from..].find(&needle) {
            let end = from + pos + needle.len();
            if end < path.len() {
                best = Some(end);
            }
            from += pos + 1;
        }
        if let Some(end) = best {
            return (path[..end].to_owned(), path[end..].to_owned());
        }
    }
    (path.to_owned(), String::new())
}

/// Join a root and a URL path without doubling separators.
fn join_url_path(root: &str, rel: &str) -> String {
    if rel.is_empty() {
        return root.trim_end_matches('/').to_owned();
    }
    let root = root.trim_end_matches('/');
    if rel.starts_with('/') {
        format!("{root}{rel}")
    } else {
        format!("{root}/{rel}")
    }
}

/// Route every request to a single endpoint file, for applications that do
/// their own script routing (web.py style).
///
/// Parameters included: `SCRIPT_NAME`, `SCRIPT_FILENAME`, `DOCUMENT_URI`,
/// `DOCUMENT_ROOT`, `REQUEST_URI`.
pub fn map_endpoint(endpoint_file: impl Into<String>) -> Middleware {
    let endpoint_file = endpoint_file.into();
    let path = Path::new(&endpoint_file);
    let dir = path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let webpath = format!(
        "/{}",
        path.file_name().map(|f| f.to_string_lossy()).unwrap_or_default()
    );

    param_middleware(move |req| {
        let Some(http) = req.http.clone() else {
            return;
        };
        req.set_param("REQUEST_URI", http.request_uri());
        req.set_param("SCRIPT_NAME", webpath.clone());
        req.set_param("SCRIPT_FILENAME", endpoint_file.clone());
        req.set_param("DOCUMENT_URI", http.uri.path());
        req.set_param("DOCUMENT_ROOT", dir.clone());
    })
}

/// Turn the request into a Filter-role request over a file resolved under
/// `root`: sets `FCGI_DATA_LAST_MOD` and `FCGI_DATA_LENGTH` from the
/// file's metadata and opens it as the request's data stream.
///
/// Fails with [`FastgateError::NotFound`] when the file does not exist.
pub fn map_filter_request(root: impl Into<PathBuf>) -> Middleware {
    let root: Arc<PathBuf> = Arc::new(root.into());
    Arc::new(move |inner: SessionHandler| {
        let root = root.clone();
        Arc::new(move |client: Client, mut req: Request| {
            let inner = inner.clone();
            let root = root.clone();
            Box::pin(async move {
                let Some(http) = req.http.clone() else {
                    return Err(FastgateError::InvalidRequest(
                        "filter routing requires an HTTP context".into(),
                    ));
                };

                req.role = Role::Filter;

                let url_path = http.uri.path();
                req.set_param("SCRIPT_NAME", url_path);
                req.set_param("DOCUMENT_URI", url_path);

                let file_path = root.join(url_path.trim_start_matches('/'));
                let meta = tokio::fs::metadata(&file_path)
                    .await
                    .map_err(|_| FastgateError::NotFound(url_path.to_owned()))?;
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);

                req.set_param(DATA_LAST_MOD, mtime.to_string());
                req.set_param(DATA_LENGTH, meta.len().to_string());

                let file = tokio::fs::File::open(&file_path)
                    .await
                    .map_err(|_| FastgateError::NotFound(url_path.to_owned()))?;
                req.set_data(file);

                inner(client, req).await
            })
        })
    })
}

/// Drop the parameters the FastCGI specification forbids in Authorizer
/// requests: `CONTENT_LENGTH`, `PATH_INFO`, `PATH_TRANSLATED`,
/// `SCRIPT_NAME`.
pub fn filter_auth_req_params() -> Middleware {
    param_middleware(|req| {
        for key in ["CONTENT_LENGTH", "PATH_INFO", "PATH_TRANSLATED", "SCRIPT_NAME"] {
            req.params.remove(key);
        }
    })
}

/// Preset: the ordinary PHP hosting session (params, headers, filesystem
/// routing for `.php` with `index.php` directory index).
pub fn php_fs(doc_root: impl Into<String>) -> Middleware {
    let router = FilesystemRouter {
        doc_root: doc_root.into(),
        exts: vec!["php".into()],
        dir_index: vec!["index.php".into()],
    };
    chain([basic_params_map(), map_header(), router.router()])
}

/// Preset: a single-file application endpoint session.
pub fn file_endpoint(endpoint_file: impl Into<String>) -> Middleware {
    chain([basic_params_map(), map_header(), map_endpoint(endpoint_file)])
}

/// Preset: a Filter-role session over files beneath `root`.
pub fn filter_fs(root: impl Into<PathBuf>) -> Middleware {
    chain([basic_params_map(), map_header(), map_filter_request(root)])
}

/// Preset: an Authorizer request session (params and headers, with the
/// forbidden authorizer parameters removed).
pub fn auth_prepare() -> Middleware {
    chain([basic_params_map(), map_header(), filter_auth_req_params()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderValue, Method};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tokio::io::duplex;

    /// A terminal handler that records the request's params and role.
    type Captured = Arc<Mutex<Option<(Role, BTreeMap<String, String>)>>>;

    fn capture() -> (SessionHandler, Captured) {
        let slot: Captured = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        let handler: SessionHandler = Arc::new(move |_client, req| {
            let sink = sink.clone();
            Box::pin(async move {
                *sink.lock().unwrap() = Some((req.role, req.params.clone()));
                let (pipe, _stdout, _stderr) = ResponsePipe::new();
                Ok(pipe)
            })
        });
        (handler, slot)
    }

    fn dummy_client() -> Client {
        let (local, remote) = duplex(1024);
        tokio::spawn(async move {
            let _keep_open = remote;
            std::future::pending::<()>().await;
        });
        Client::new(local, 1)
    }

    async fn run(middleware: Middleware, req: Request) -> (Role, BTreeMap<String, String>) {
        let (inner, captured) = capture();
        let handler = middleware(inner);
        handler(dummy_client(), req).await.unwrap();
        let got = captured.lock().unwrap().take().unwrap();
        got
    }

    fn http_request(uri: &str) -> Request {
        let ctx = crate::HttpContext::new(Method::GET, uri.parse().unwrap())
            .with_remote_addr("203.0.113.7:54321".parse().unwrap())
            .with_host("example.com:8080");
        Request::from_http(ctx)
    }

    #[tokio::test]
    async fn test_basic_params_map() {
        let (_, params) = run(basic_params_map(), http_request("/hello?x=1&y=2")).await;

        assert_eq!(params["REQUEST_METHOD"], "GET");
        assert_eq!(params["REQUEST_URI"], "/hello?x=1&y=2");
        assert_eq!(params["QUERY_STRING"], "x=1&y=2");
        assert_eq!(params["GATEWAY_INTERFACE"], "CGI/1.1");
        assert_eq!(params["REMOTE_ADDR"], "203.0.113.7");
        assert_eq!(params["REMOTE_PORT"], "54321");
        assert_eq!(params["SERVER_NAME"], "example.com");
        assert_eq!(params["SERVER_PORT"], "8080");
        assert_eq!(params["SERVER_PROTOCOL"], "HTTP/1.1");
        assert_eq!(params["REDIRECT_STATUS"], "200");
        assert_eq!(params["REQUEST_SCHEME"], "http");
        assert!(!params.contains_key("HTTPS"));
    }

    #[tokio::test]
    async fn test_basic_params_map_tls_defaults() {
        let ctx = crate::HttpContext::new(Method::GET, "/".parse().unwrap())
            .with_tls(true)
            .with_host("secure.example.com");
        let (_, params) = run(basic_params_map(), Request::from_http(ctx)).await;

        assert_eq!(params["HTTPS"], "on");
        assert_eq!(params["SERVER_NAME"], "secure.example.com");
        assert_eq!(params["SERVER_PORT"], "443");
        assert_eq!(params["REQUEST_SCHEME"], "https");
    }

    #[tokio::test]
    async fn test_map_header_formats_and_skips() {
        let mut req = http_request("/");
        let http = req.http.as_mut().unwrap();
        http.headers
            .insert("X-Hello-World", HeaderValue::from_static("yes"));
        http.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        http.headers
            .append("Accept", HeaderValue::from_static("text/html"));
        http.headers
            .append("Accept", HeaderValue::from_static("text/plain"));

        let (_, params) = run(map_header(), req).await;

        assert_eq!(params["HTTP_X_HELLO_WORLD"], "yes");
        assert_eq!(params["HTTP_ACCEPT"], "text/html,text/plain");
        assert!(!params.contains_key("HTTP_CONTENT_TYPE"));
    }

    #[tokio::test]
    async fn test_filesystem_router_splits_script_and_path_info() {
        let router = FilesystemRouter {
            doc_root: "/srv/www".into(),
            exts: vec!["php".into()],
            dir_index: vec!["index.php".into()],
        };
        let (_, params) = run(router.router(), http_request("/app/run.php/extra/bit?q=1")).await;

        assert_eq!(params["SCRIPT_NAME"], "/app/run.php");
        assert_eq!(params["PATH_INFO"], "/extra/bit");
        assert_eq!(params["SCRIPT_FILENAME"], "/srv/www/app/run.php");
        assert_eq!(params["PATH_TRANSLATED"], "/srv/www/extra/bit");
        assert_eq!(params["DOCUMENT_URI"], "/app/run.php/extra/bit");
        assert_eq!(params["DOCUMENT_ROOT"], "/srv/www");
    }

    #[tokio::test]
    async fn test_filesystem_router_greedy_split() {
        let router = FilesystemRouter {
            doc_root: "/srv".into(),
            exts: vec!["php".into()],
            dir_index: vec![],
        };
        let (_, params) = run(router.router(), http_request("/a.php/b.php/c")).await;
        assert_eq!(params["SCRIPT_NAME"], "/a.php/b.php");
        assert_eq!(params["PATH_INFO"], "/c");
    }

    #[tokio::test]
    async fn test_filesystem_router_directory_index() {
        let router = FilesystemRouter {
            doc_root: "/srv/www".into(),
            exts: vec!["php".into()],
            dir_index: vec!["index.php".into()],
        };
        let (_, params) = run(router.router(), http_request("/admin/")).await;

        assert_eq!(params["SCRIPT_FILENAME"], "/srv/www/admin/index.php");
        assert_eq!(params["PATH_INFO"], "");
    }

    #[tokio::test]
    async fn test_map_endpoint() {
        let (_, params) = run(map_endpoint("/opt/app/main.py"), http_request("/any/route?a=b")).await;

        assert_eq!(params["SCRIPT_NAME"], "/main.py");
        assert_eq!(params["SCRIPT_FILENAME"], "/opt/app/main.py");
        assert_eq!(params["DOCUMENT_ROOT"], "/opt/app");
        assert_eq!(params["DOCUMENT_URI"], "/any/route");
        assert_eq!(params["REQUEST_URI"], "/any/route?a=b");
    }

    #[tokio::test]
    async fn test_filter_auth_req_params_removes_forbidden_keys() {
        let mut req = http_request("/");
        req.set_param("CONTENT_LENGTH", "10");
        req.set_param("PATH_INFO", "/x");
        req.set_param("PATH_TRANSLATED", "/srv/x");
        req.set_param("SCRIPT_NAME", "/x.php");
        req.set_param("REQUEST_METHOD", "GET");

        let (_, params) = run(filter_auth_req_params(), req).await;

        assert!(!params.contains_key("CONTENT_LENGTH"));
        assert!(!params.contains_key("PATH_INFO"));
        assert!(!params.contains_key("PATH_TRANSLATED"));
        assert!(!params.contains_key("SCRIPT_NAME"));
        assert_eq!(params["REQUEST_METHOD"], "GET");
    }

    #[tokio::test]
    async fn test_map_filter_request_resolves_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page.md"), b"hello world").unwrap();

        let (role, params) = run(
            map_filter_request(dir.path().to_path_buf()),
            http_request("/page.md"),
        )
        .await;

        assert_eq!(role, Role::Filter);
        assert_eq!(params[DATA_LENGTH], "11");
        assert!(params[DATA_LAST_MOD].parse::<u64>().unwrap() > 0);
        assert_eq!(params["SCRIPT_NAME"], "/page.md");
    }

    #[tokio::test]
    async fn test_map_filter_request_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (inner, _) = capture();
        let handler = map_filter_request(dir.path().to_path_buf())(inner);

        let err = handler(dummy_client(), http_request("/absent.md"))
            .await
            .unwrap_err();
        assert!(matches!(err, FastgateError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_chain_applies_outer_first() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let mark = |label: &'static str, order: Arc<Mutex<Vec<&'static str>>>| -> Middleware {
            param_middleware(move |_req| order.lock().unwrap().push(label))
        };

        let chained = chain([
            mark("outer", order.clone()),
            mark("middle", order.clone()),
            mark("inner", order.clone()),
        ]);
        run(chained, http_request("/")).await;

        assert_eq!(*order.lock().unwrap(), vec!["outer", "middle", "inner"]);
    }

    #[tokio::test]
    async fn test_php_fs_preset_combines_all() {
        let (_, params) = run(php_fs("/srv/www"), http_request("/index.php?page=2")).await;

        assert_eq!(params["SCRIPT_FILENAME"], "/srv/www/index.php");
        assert_eq!(params["REQUEST_METHOD"], "GET");
        assert_eq!(params["QUERY_STRING"], "page=2");
        assert_eq!(params["DOCUMENT_ROOT"], "/srv/www");
    }
}
