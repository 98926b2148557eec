//! HTTP(S) proxy frontend.
//!
//! Connections are served as HTTP/1.1 only: the `drop` reject action kills
//! the underlying connection mid-exchange, which multiplexed HTTP/2 framing
//! cannot express. Request bodies are buffered once into the entity, so
//! rules can read them any number of times and the same bytes are replayed
//! upstream.
//!
//! Forwarding rewrites scheme/host to the target, strips `Accept-Encoding`
//! (responses stay observable), and appends the peer to `X-Forwarded-For`.

use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::header;
use http::{Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use ricochet_config::{ProxyConfig, RejectAction};
use ricochet_core::{ConnectionTracker, Entity, HttpEntity};
use ricochet_rules::RuleSet;
use ricochet_store::Store;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::pipeline::{Decision, Pipeline};
use crate::tls::load_server_config;
use crate::Proxy;

const ALLOWED_ACTIONS: [RejectAction; 4] = [
    RejectAction::Proxy,
    RejectAction::Redirect,
    RejectAction::Drop,
    RejectAction::None,
];

/// Headers that must not travel to the upstream request.
const STRIPPED_REQUEST_HEADERS: [header::HeaderName; 8] = [
    header::ACCEPT_ENCODING,
    header::HOST,
    header::CONTENT_LENGTH,
    header::CONNECTION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub struct HttpProxy {
    config: ProxyConfig,
    listen: SocketAddr,
    target: reqwest::Url,
    reject_url: Option<reqwest::Url>,
    client: reqwest::Client,
    acceptor: Option<TlsAcceptor>,
    pipeline: Pipeline,
    tracker: ConnectionTracker,
    closing: CancellationToken,
}

impl HttpProxy {
    pub fn new(config: ProxyConfig, rules: &RuleSet, store: Store) -> Result<Self, ProxyError> {
        if !ALLOWED_ACTIONS.contains(&config.reject.action) {
            return Err(ProxyError::ActionNotAllowed {
                proxy: config.name.clone(),
                action: config.reject.action,
            });
        }
        let listen = config
            .listen
            .parse()
            .map_err(|_| ProxyError::BadTarget(config.listen.clone()))?;
        let target = parse_http_url(&config.target)
            .ok_or_else(|| ProxyError::BadTarget(config.target.clone()))?;
        let reject_url = match config.reject.action {
            RejectAction::Proxy | RejectAction::Redirect => {
                let url = config.reject.url.as_deref().unwrap_or_default();
                Some(
                    parse_http_url(url)
                        .ok_or_else(|| ProxyError::BadRejectUrl(url.to_string()))?,
                )
            }
            _ => None,
        };

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .redirect(reqwest::redirect::Policy::none())
            // upstream teamservers run self-signed tls
            .danger_accept_invalid_certs(true)
            .build()?;
        let acceptor = load_server_config(&config.tls)?
            .map(|server| TlsAcceptor::from(Arc::new(server)));
        let pipeline = Pipeline::new(&config, rules, store)?;

        Ok(Self {
            config,
            listen,
            target,
            reject_url,
            client,
            acceptor,
            pipeline,
            tracker: ConnectionTracker::new(),
            closing: CancellationToken::new(),
        })
    }

    async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                biased;

                _ = self.closing.cancelled() => {
                    info!(proxy = %self.config.name, "accept loop stopped");
                    return;
                }

                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(proxy = %self.config.name, error = %err, "accept failed");
                            continue;
                        }
                    };
                    let proxy = self.clone();
                    let guard = self.tracker.guard();
                    tokio::spawn(async move {
                        let _guard = guard;
                        proxy.handle_connection(stream, peer).await;
                    });
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        match &self.acceptor {
            Some(acceptor) => {
                match timeout(self.config.timeout(), acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => self.clone().serve_stream(tls, peer).await,
                    Ok(Err(err)) => {
                        debug!(proxy = %self.config.name, from = %peer.ip(), error = %err, "tls handshake failed");
                    }
                    Err(_) => {
                        debug!(proxy = %self.config.name, from = %peer.ip(), "tls handshake timed out");
                    }
                }
            }
            None => self.clone().serve_stream(stream, peer).await,
        }
    }

    async fn serve_stream<S>(self: Arc<Self>, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        // cancelling this token poisons the connection's writes, so a `drop`
        // verdict closes the socket before any response escapes
        let kill = CancellationToken::new();
        let io = TokioIo::new(GatedStream::new(stream, kill.clone()));

        let proxy = self.clone();
        let service = service_fn(move |request: hyper::Request<Incoming>| {
            let proxy = proxy.clone();
            let kill = kill.clone();
            async move {
                Ok::<_, std::convert::Infallible>(proxy.handle_request(request, peer, kill).await)
            }
        });

        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            debug!(proxy = %self.config.name, from = %peer.ip(), error = %err, "connection ended");
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        request: hyper::Request<Incoming>,
        peer: SocketAddr,
        kill: CancellationToken,
    ) -> Response<Full<Bytes>> {
        let (parts, body) = request.into_parts();
        debug!(
            proxy = %self.config.name,
            from = %peer.ip(),
            method = %parts.method,
            uri = %parts.uri,
            "new request"
        );

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                warn!(proxy = %self.config.name, from = %peer.ip(), error = %err, "error reading body");
                return plain_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let entity = Arc::new(Entity::Http(HttpEntity::new(
            peer.ip(),
            self.config.trust_headers,
            parts.method.clone(),
            &parts.uri,
            parts.version,
            parts.headers.clone(),
            body.clone(),
        )));

        match self.pipeline.decide(&entity).await {
            Decision::Forward => {
                self.forward(self.target.clone(), &parts, body, peer).await
            }
            Decision::Reject => match self.config.reject.action {
                RejectAction::Proxy => {
                    let decoy = self.reject_url.clone().unwrap_or_else(|| self.target.clone());
                    self.forward(decoy, &parts, body, peer).await
                }
                RejectAction::Redirect => {
                    let location = self
                        .reject_url
                        .as_ref()
                        .map(|url| url.to_string())
                        .unwrap_or_default();
                    Response::builder()
                        .status(StatusCode::MOVED_PERMANENTLY)
                        .header(header::LOCATION, location)
                        .body(Full::new(Bytes::new()))
                        .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR))
                }
                RejectAction::Drop => {
                    kill.cancel();
                    // never written: the gated stream refuses further writes
                    plain_response(StatusCode::INTERNAL_SERVER_ERROR)
                }
                RejectAction::None => {
                    warn!(proxy = %self.config.name, "request was filtered, but action is none");
                    self.forward(self.target.clone(), &parts, body, peer).await
                }
            },
        }
    }

    /// Replay the buffered request against `base` and relay the answer.
    async fn forward(
        &self,
        base: reqwest::Url,
        parts: &http::request::Parts,
        body: Bytes,
        peer: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let mut url = base;
        url.set_path(parts.uri.path());
        url.set_query(parts.uri.query());

        let mut headers = parts.headers.clone();
        let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prev) => format!("{prev}, {}", peer.ip()),
            None => peer.ip().to_string(),
        };
        for name in STRIPPED_REQUEST_HEADERS {
            headers.remove(name);
        }
        if let Ok(value) = forwarded_for.parse() {
            headers.insert(X_FORWARDED_FOR, value);
        }

        let result = self
            .client
            .request(parts.method.clone(), url)
            .headers(headers)
            .body(body)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(proxy = %self.config.name, error = %err, "error making proxy request");
                return plain_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let status = response.status();
        let mut response_headers = response.headers().clone();
        for name in [
            header::CONTENT_LENGTH,
            header::TRANSFER_ENCODING,
            header::CONNECTION,
        ] {
            response_headers.remove(name);
        }
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(proxy = %self.config.name, error = %err, "error copying body");
                return plain_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let mut out = Response::new(Full::new(bytes));
        *out.status_mut() = status;
        *out.headers_mut() = response_headers;
        out
    }
}

const X_FORWARDED_FOR: header::HeaderName = header::HeaderName::from_static("x-forwarded-for");

fn plain_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn parse_http_url(value: &str) -> Option<reqwest::Url> {
    let url = reqwest::Url::parse(value).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

/// Stream wrapper whose writes fail once the kill token fires.
///
/// Dropping a connection from inside a request handler needs a path to the
/// socket; poisoning the write side makes the server loop abort without
/// flushing the pending response.
struct GatedStream<S> {
    inner: S,
    kill: CancellationToken,
}

impl<S> GatedStream<S> {
    fn new(inner: S, kill: CancellationToken) -> Self {
        Self { inner, kill }
    }

    fn killed(&self) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection dropped by rule")
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for GatedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.kill.is_cancelled() {
            return Poll::Ready(Err(self.killed()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for GatedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.kill.is_cancelled() {
            return Poll::Ready(Err(self.killed()));
        }
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.kill.is_cancelled() {
            return Poll::Ready(Err(self.killed()));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait::async_trait]
impl Proxy for HttpProxy {
    async fn start(self: Arc<Self>) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.listen).await?;
        info!(
            proxy = %self.config.name,
            listen = %self.listen,
            target = %self.target,
            tls = self.acceptor.is_some(),
            "listening"
        );
        tokio::spawn(self.clone().serve(listener));
        Ok(())
    }

    async fn shutdown(&self, deadline: Duration) -> Result<(), ProxyError> {
        self.closing.cancel();
        if self.tracker.wait_for_zero(deadline).await {
            Ok(())
        } else {
            Err(ProxyError::ShutdownTimeout)
        }
    }
}

impl fmt::Display for HttpProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "http proxy \"{}\" ({}->{})",
            self.config.name, self.config.listen, self.config.target
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ricochet_config::{FilterAction, FilterBinding, Globals, ProxyKind, RejectSettings, RuleConfig};
    use std::io::Write as _;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Minimal canned HTTP upstream; returns the captured request head.
    async fn stub_origin(body: &'static str) -> (SocketAddr, Arc<parking_lot::Mutex<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(String::new()));
        let captured = seen.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    break;
                };
                let captured = captured.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let mut head = Vec::new();
                    loop {
                        let n = conn.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        head.extend_from_slice(&buf[..n]);
                        if head.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    *captured.lock() = String::from_utf8_lossy(&head).into_owned();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = conn.write_all(response.as_bytes()).await;
                });
            }
        });
        (addr, seen)
    }

    fn regexp_rules(store: &Store, pattern: &str) -> RuleSet {
        let mut list = tempfile::NamedTempFile::new().unwrap();
        writeln!(list, "{pattern}").unwrap();
        let configs = [RuleConfig {
            name: "flag".into(),
            kind: "regexp".into(),
            params: serde_yaml::from_str(&format!("{{list: {}}}", list.path().display()))
                .unwrap(),
        }];
        RuleSet::build(store, &configs, &Globals::default()).unwrap()
    }

    fn config(listen: String, target: String, reject: RejectSettings) -> ProxyConfig {
        ProxyConfig {
            name: "http-test".into(),
            kind: ProxyKind::Http,
            listen,
            target,
            timeout: Some(3),
            tls: Vec::new(),
            trust_headers: false,
            filters: vec![FilterBinding {
                rule: "flag".into(),
                action: FilterAction::Reject,
            }],
            reject,
        }
    }

    async fn start_proxy(proxy: HttpProxy) -> (Arc<HttpProxy>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = Arc::new(proxy);
        tokio::spawn(proxy.clone().serve(listener));
        (proxy, addr)
    }

    fn test_client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn clean_request_is_forwarded_with_rewritten_headers() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let rules = regexp_rules(&store, "never-matching");
        let (origin, seen) = stub_origin("origin-body").await;

        let cfg = config(
            "127.0.0.1:0".into(),
            format!("http://{origin}"),
            RejectSettings::default(),
        );
        let (proxy, addr) = start_proxy(HttpProxy::new(cfg, &rules, store.clone()).unwrap()).await;

        let response = test_client()
            .get(format!("http://{addr}/path?q=1"))
            .header("accept-encoding", "gzip")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "origin-body");

        let head = seen.lock().clone();
        assert!(head.starts_with("GET /path?q=1 HTTP/1.1\r\n"));
        let lower = head.to_lowercase();
        assert!(!lower.contains("accept-encoding"));
        assert!(lower.contains("x-forwarded-for: 127.0.0.1"));

        assert_eq!(
            store
                .get_verdict("127.0.0.1".parse().unwrap())
                .unwrap()
                .accepts,
            1
        );
        proxy.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_request_redirects() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let rules = regexp_rules(&store, "GET /secret");

        let cfg = config(
            "127.0.0.1:0".into(),
            "http://127.0.0.1:9".into(),
            RejectSettings {
                action: RejectAction::Redirect,
                url: Some("https://example.com".into()),
                ..Default::default()
            },
        );
        let (proxy, addr) = start_proxy(HttpProxy::new(cfg, &rules, store.clone()).unwrap()).await;

        let response = test_client()
            .get(format!("http://{addr}/secret"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://example.com/"
        );
        assert_eq!(
            store
                .get_verdict("127.0.0.1".parse().unwrap())
                .unwrap()
                .rejects,
            1
        );
        proxy.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_request_proxies_to_decoy() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let rules = regexp_rules(&store, "GET /c2");
        let (decoy, _) = stub_origin("decoy-body").await;

        let cfg = config(
            "127.0.0.1:0".into(),
            "http://127.0.0.1:9".into(),
            RejectSettings {
                action: RejectAction::Proxy,
                url: Some(format!("http://{decoy}")),
                ..Default::default()
            },
        );
        let (proxy, addr) = start_proxy(HttpProxy::new(cfg, &rules, store).unwrap()).await;

        let response = test_client()
            .get(format!("http://{addr}/c2"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "decoy-body");
        proxy.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_request_drops_connection_without_response() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let rules = regexp_rules(&store, "GET /beacon");

        let cfg = config(
            "127.0.0.1:0".into(),
            "http://127.0.0.1:9".into(),
            RejectSettings {
                action: RejectAction::Drop,
                ..Default::default()
            },
        );
        let (proxy, addr) = start_proxy(HttpProxy::new(cfg, &rules, store).unwrap()).await;

        let result = test_client()
            .get(format!("http://{addr}/beacon"))
            .send()
            .await;
        assert!(result.is_err(), "drop must yield no http response");
        proxy.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn upstream_failure_maps_to_500() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let rules = regexp_rules(&store, "never-matching");

        // nothing listens on the target
        let cfg = config(
            "127.0.0.1:0".into(),
            "http://127.0.0.1:9".into(),
            RejectSettings::default(),
        );
        let (proxy, addr) = start_proxy(HttpProxy::new(cfg, &rules, store).unwrap()).await;

        let response = test_client()
            .get(format!("http://{addr}/x"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        proxy.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[test]
    fn non_http_target_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let rules = RuleSet::empty();
        let mut cfg = config(
            "127.0.0.1:0".into(),
            "ftp://127.0.0.1:21".into(),
            RejectSettings::default(),
        );
        cfg.filters.clear();
        assert!(matches!(
            HttpProxy::new(cfg, &rules, store),
            Err(ProxyError::BadTarget(_))
        ));
    }
}
