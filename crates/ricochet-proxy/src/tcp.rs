//! TCP proxy frontend.
//!
//! First-packet analysis runs with an empty buffer so banlist-style rules
//! can kill a connection before any payload flows. Once the upstream leg is
//! open, the ingress side keeps appending bytes to the shared entity and
//! re-evaluates the pipeline on every read; the egress side only resets the
//! buffer. A reject decision closes both legs.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ricochet_config::{ProxyConfig, RejectAction};
use ricochet_core::defaults::DEFAULT_SPLICE_BUF_SIZE;
use ricochet_core::{ConnectionTracker, Entity, RawEntity};
use ricochet_rules::RuleSet;
use ricochet_store::Store;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{rustls, TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::pipeline::{Decision, Pipeline};
use crate::tls::{insecure_client_config, load_server_config};
use crate::Proxy;

const ALLOWED_ACTIONS: [RejectAction; 2] = [RejectAction::Drop, RejectAction::None];

pub struct TcpProxy {
    config: ProxyConfig,
    listen: SocketAddr,
    target: SocketAddr,
    target_tls: bool,
    acceptor: Option<TlsAcceptor>,
    connector: Arc<rustls::ClientConfig>,
    pipeline: Pipeline,
    tracker: ConnectionTracker,
    closing: CancellationToken,
}

/// Split `tcp://addr:port` / `tls://addr:port` (bare means plain tcp).
fn parse_target(target: &str) -> Result<(SocketAddr, bool), ProxyError> {
    let (scheme, rest) = match target.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("tcp", target),
    };
    let is_tls = match scheme {
        "tcp" => false,
        "tls" => true,
        _ => return Err(ProxyError::BadTarget(target.to_string())),
    };
    let addr = rest
        .parse()
        .map_err(|_| ProxyError::BadTarget(target.to_string()))?;
    Ok((addr, is_tls))
}

impl TcpProxy {
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
        let (target, target_tls) = parse_target(&config.target)?;
        let acceptor = load_server_config(&config.tls)?
            .map(|server| TlsAcceptor::from(Arc::new(server)));
        let pipeline = Pipeline::new(&config, rules, store)?;

        Ok(Self {
            config,
            listen,
            target,
            target_tls,
            acceptor,
            connector: Arc::new(insecure_client_config()?),
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
        debug!(proxy = %self.config.name, from = %peer.ip(), "new request");

        let stream = match &self.acceptor {
            Some(acceptor) => match timeout(self.config.timeout(), acceptor.accept(stream)).await {
                Ok(Ok(tls)) => Box::new(tls) as Box<dyn Io>,
                Ok(Err(err)) => {
                    debug!(proxy = %self.config.name, from = %peer.ip(), error = %err, "tls handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(proxy = %self.config.name, from = %peer.ip(), "tls handshake timed out");
                    return;
                }
            },
            None => Box::new(stream) as Box<dyn Io>,
        };

        // first-packet analysis: no bytes read yet
        let entity = Arc::new(Entity::Raw(RawEntity::new(peer.ip(), Vec::new())));
        if self.pipeline.decide(&entity).await == Decision::Reject && self.dropping() {
            debug!(proxy = %self.config.name, from = %peer.ip(), "dropped before connect");
            return;
        }

        let upstream = match timeout(self.config.timeout(), TcpStream::connect(self.target)).await
        {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(err)) => {
                warn!(proxy = %self.config.name, target = %self.target, error = %err, "failed to connect to target");
                return;
            }
            Err(_) => {
                warn!(proxy = %self.config.name, target = %self.target, "target connect timed out");
                return;
            }
        };

        if self.target_tls {
            let connector = TlsConnector::from(self.connector.clone());
            let server_name = ServerName::from(self.target.ip());
            match timeout(
                self.config.timeout(),
                connector.connect(server_name, upstream),
            )
            .await
            {
                Ok(Ok(upstream)) => self.splice(stream, upstream, entity, peer).await,
                Ok(Err(err)) => {
                    warn!(proxy = %self.config.name, target = %self.target, error = %err, "upstream tls failed");
                }
                Err(_) => {
                    warn!(proxy = %self.config.name, target = %self.target, "upstream tls timed out");
                }
            }
        } else {
            self.splice(stream, upstream, entity, peer).await;
        }
    }

    fn dropping(&self) -> bool {
        if self.config.reject.action == RejectAction::Drop {
            true
        } else {
            warn!(proxy = %self.config.name, "request was filtered, but action is none");
            false
        }
    }

    async fn splice<D>(self: Arc<Self>, client: Box<dyn Io>, upstream: D, entity: Arc<Entity>, peer: SocketAddr)
    where
        D: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let conn = self.closing.child_token();
        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

        let ingress = {
            let proxy = self.clone();
            let entity = entity.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; DEFAULT_SPLICE_BUF_SIZE];
                loop {
                    let n = tokio::select! {
                        biased;
                        _ = conn.cancelled() => break,
                        result = timeout(proxy.config.timeout(), client_r.read(&mut buf)) => {
                            match result {
                                Ok(Ok(0)) | Err(_) => break,
                                Ok(Ok(n)) => n,
                                Ok(Err(err)) => {
                                    debug!(proxy = %proxy.config.name, error = %err, "ingress read error");
                                    break;
                                }
                            }
                        }
                    };

                    let raw = entity.as_raw().expect("tcp entity is raw");
                    raw.extend(&buf[..n]);
                    if proxy.pipeline.decide(&entity).await == Decision::Reject
                        && proxy.dropping()
                    {
                        debug!(proxy = %proxy.config.name, from = %peer.ip(), "dropping spliced connection");
                        break;
                    }

                    match timeout(proxy.config.timeout(), upstream_w.write_all(&buf[..n])).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                conn.cancel();
            })
        };

        let egress = {
            let proxy = self.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; DEFAULT_SPLICE_BUF_SIZE];
                loop {
                    let n = tokio::select! {
                        biased;
                        _ = conn.cancelled() => break,
                        result = timeout(proxy.config.timeout(), upstream_r.read(&mut buf)) => {
                            match result {
                                Ok(Ok(0)) | Err(_) => break,
                                Ok(Ok(n)) => n,
                                Ok(Err(err)) => {
                                    debug!(proxy = %proxy.config.name, error = %err, "egress read error");
                                    break;
                                }
                            }
                        }
                    };

                    // a response ended the exchange; the next request starts
                    // a fresh buffer
                    if let Some(raw) = entity.as_raw() {
                        raw.clear();
                    }

                    match timeout(proxy.config.timeout(), client_w.write_all(&buf[..n])).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                conn.cancel();
            })
        };

        let _ = ingress.await;
        let _ = egress.await;
        debug!(proxy = %self.config.name, from = %peer.ip(), "connection closed");
    }
}

/// Boxable bidirectional stream.
trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

#[async_trait::async_trait]
impl Proxy for TcpProxy {
    async fn start(self: Arc<Self>) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.listen).await?;
        info!(proxy = %self.config.name, listen = %self.listen, target = %self.target, "listening");
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

impl fmt::Display for TcpProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tcp proxy \"{}\" ({}->{})",
            self.config.name, self.config.listen, self.config.target
        )
    }
}
