//! DNS proxy frontend.
//!
//! Serves UDP, TCP, and TCP-TLS (DoT). When TLS is configured the UDP
//! listener stays off, since DoT does not listen on UDP. Queries are parsed just
//! far enough to build the entity (questions + source address); forwarding
//! relays the raw message bytes upstream and the raw answer back.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use ricochet_config::{ProxyConfig, RejectAction};
use ricochet_core::defaults::DEFAULT_DNS_UDP_PAYLOAD;
use ricochet_core::{ConnectionTracker, DnsQuestion, Entity};
use ricochet_rules::RuleSet;
use ricochet_store::Store;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::pipeline::{Decision, Pipeline};
use crate::tls::load_server_config;
use crate::Proxy;

const ALLOWED_ACTIONS: [RejectAction; 3] =
    [RejectAction::Proxy, RejectAction::Drop, RejectAction::None];

pub struct DnsProxy {
    config: ProxyConfig,
    listen: SocketAddr,
    target: SocketAddr,
    reject_addr: Option<SocketAddr>,
    acceptor: Option<TlsAcceptor>,
    pipeline: Pipeline,
    tracker: ConnectionTracker,
    closing: CancellationToken,
}

impl DnsProxy {
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
        let target = config
            .target
            .parse()
            .map_err(|_| ProxyError::BadTarget(config.target.clone()))?;
        let reject_addr = match config.reject.action {
            RejectAction::Proxy => Some(
                config
                    .reject
                    .url
                    .as_deref()
                    .unwrap_or_default()
                    .parse()
                    .map_err(|_| {
                        ProxyError::BadRejectUrl(
                            config.reject.url.clone().unwrap_or_default(),
                        )
                    })?,
            ),
            _ => None,
        };
        let acceptor = load_server_config(&config.tls)?
            .map(|server| TlsAcceptor::from(Arc::new(server)));
        let pipeline = Pipeline::new(&config, rules, store)?;

        Ok(Self {
            config,
            listen,
            target,
            reject_addr,
            acceptor,
            pipeline,
            tracker: ConnectionTracker::new(),
            closing: CancellationToken::new(),
        })
    }

    /// Decide a single message and answer with the upstream (or decoy) bytes.
    /// `None` means drop: no response at all.
    async fn process(&self, peer: SocketAddr, data: &[u8]) -> Option<Vec<u8>> {
        let message = match Message::from_bytes(data) {
            Ok(message) => message,
            Err(err) => {
                debug!(proxy = %self.config.name, from = %peer.ip(), error = %err, "unparseable dns message");
                return None;
            }
        };
        let questions: Vec<DnsQuestion> = message
            .queries()
            .iter()
            .map(|q| DnsQuestion {
                qtype: q.query_type().to_string(),
                name: q.name().to_string(),
            })
            .collect();
        for q in &questions {
            debug!(proxy = %self.config.name, from = %peer.ip(), qtype = %q.qtype, name = %q.name, "dns question");
        }

        let entity = Arc::new(Entity::dns(peer.ip(), questions));
        let upstream = match self.pipeline.decide(&entity).await {
            Decision::Forward => self.target,
            Decision::Reject => match self.config.reject.action {
                RejectAction::Proxy => self.reject_addr.unwrap_or(self.target),
                RejectAction::Drop => return None,
                _ => {
                    warn!(proxy = %self.config.name, "request was filtered, but action is none");
                    self.target
                }
            },
        };

        match self.exchange(upstream, data).await {
            Ok(answer) => Some(answer),
            Err(err) => {
                warn!(proxy = %self.config.name, upstream = %upstream, error = %err, "can't make proxy request");
                None
            }
        }
    }

    /// One-shot UDP exchange with the upstream resolver.
    async fn exchange(&self, upstream: SocketAddr, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect(upstream).await?;
        timeout(self.config.timeout(), socket.send(data))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
        let mut buf = vec![0u8; DEFAULT_DNS_UDP_PAYLOAD];
        let n = timeout(self.config.timeout(), socket.recv(&mut buf))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
        buf.truncate(n);
        Ok(buf)
    }

    async fn serve_udp(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; DEFAULT_DNS_UDP_PAYLOAD];
        loop {
            tokio::select! {
                biased;

                _ = self.closing.cancelled() => {
                    info!(proxy = %self.config.name, "udp dns loop stopped");
                    return;
                }

                result = socket.recv_from(&mut buf) => {
                    let (n, peer) = match result {
                        Ok(received) => received,
                        Err(err) => {
                            warn!(proxy = %self.config.name, error = %err, "recv failed");
                            continue;
                        }
                    };
                    let data = buf[..n].to_vec();
                    let proxy = self.clone();
                    let socket = socket.clone();
                    let guard = self.tracker.guard();
                    tokio::spawn(async move {
                        let _guard = guard;
                        if let Some(answer) = proxy.process(peer, &data).await {
                            if let Err(err) = socket.send_to(&answer, peer).await {
                                warn!(proxy = %proxy.config.name, error = %err, "can't make proxy response");
                            }
                        }
                    });
                }
            }
        }
    }

    async fn serve_tcp(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                biased;

                _ = self.closing.cancelled() => {
                    info!(proxy = %self.config.name, "tcp dns loop stopped");
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
                        match &proxy.acceptor {
                            Some(acceptor) => {
                                match timeout(proxy.config.timeout(), acceptor.accept(stream)).await {
                                    Ok(Ok(tls)) => proxy.clone().serve_stream(tls, peer).await,
                                    Ok(Err(err)) => {
                                        debug!(proxy = %proxy.config.name, from = %peer.ip(), error = %err, "tls handshake failed");
                                    }
                                    Err(_) => {
                                        debug!(proxy = %proxy.config.name, from = %peer.ip(), "tls handshake timed out");
                                    }
                                }
                            }
                            None => proxy.clone().serve_stream(stream, peer).await,
                        }
                    });
                }
            }
        }
    }

    /// Length-prefixed DNS over one TCP (or TLS) stream.
    async fn serve_stream<S>(self: Arc<Self>, mut stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        loop {
            let len = tokio::select! {
                biased;
                _ = self.closing.cancelled() => return,
                result = timeout(self.config.timeout(), stream.read_u16()) => {
                    match result {
                        Ok(Ok(len)) => len as usize,
                        // EOF, read error or idle deadline
                        _ => return,
                    }
                }
            };
            if len == 0 {
                return;
            }

            let mut data = vec![0u8; len];
            match timeout(self.config.timeout(), stream.read_exact(&mut data)).await {
                Ok(Ok(_)) => {}
                _ => return,
            }

            match self.process(peer, &data).await {
                Some(answer) => {
                    let write = async {
                        stream.write_u16(answer.len() as u16).await?;
                        stream.write_all(&answer).await
                    };
                    match timeout(self.config.timeout(), write).await {
                        Ok(Ok(())) => {}
                        _ => return,
                    }
                }
                // drop: close the stream without an answer
                None => return,
            }
        }
    }
}

#[async_trait::async_trait]
impl Proxy for DnsProxy {
    async fn start(self: Arc<Self>) -> Result<(), ProxyError> {
        let tcp = TcpListener::bind(self.listen).await?;
        tokio::spawn(self.clone().serve_tcp(tcp));
        // DoT does not listen on UDP
        if self.acceptor.is_none() {
            let udp = Arc::new(UdpSocket::bind(self.listen).await?);
            tokio::spawn(self.clone().serve_udp(udp));
        }
        info!(proxy = %self.config.name, listen = %self.listen, target = %self.target, tls = self.acceptor.is_some(), "listening");
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

impl fmt::Display for DnsProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dns proxy \"{}\" ({}->{})",
            self.config.name, self.config.listen, self.config.target
        )
    }
}
