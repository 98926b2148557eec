//! UDP proxy frontend.
//!
//! A `(src, dst)` connection table maps inbound flows to connected outbound
//! sockets; one reply task per entry forwards answers back through the
//! listener socket. Idle entries die on read deadline.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ricochet_config::{ProxyConfig, RejectAction};
use ricochet_core::defaults::DEFAULT_SPLICE_BUF_SIZE;
use ricochet_core::{ConnectionTracker, Entity, RawEntity};
use ricochet_rules::RuleSet;
use ricochet_store::Store;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::pipeline::{Decision, Pipeline};
use crate::Proxy;

const ALLOWED_ACTIONS: [RejectAction; 2] = [RejectAction::Drop, RejectAction::None];

struct Flow {
    upstream: Arc<UdpSocket>,
    stop: CancellationToken,
}

pub struct UdpProxy {
    config: ProxyConfig,
    listen: SocketAddr,
    target: SocketAddr,
    flows: Mutex<HashMap<SocketAddr, Arc<Flow>>>,
    pipeline: Pipeline,
    tracker: ConnectionTracker,
    closing: CancellationToken,
}

impl UdpProxy {
    pub fn new(config: ProxyConfig, rules: &RuleSet, store: Store) -> Result<Self, ProxyError> {
        if !ALLOWED_ACTIONS.contains(&config.reject.action) {
            return Err(ProxyError::ActionNotAllowed {
                proxy: config.name.clone(),
                action: config.reject.action,
            });
        }
        if !config.tls.is_empty() {
            return Err(ProxyError::Cert(format!(
                "proxy \"{}\": tls is not supported for udp",
                config.name
            )));
        }
        let listen = config
            .listen
            .parse()
            .map_err(|_| ProxyError::BadTarget(config.listen.clone()))?;
        let target = config
            .target
            .parse()
            .map_err(|_| ProxyError::BadTarget(config.target.clone()))?;
        let pipeline = Pipeline::new(&config, rules, store)?;

        Ok(Self {
            config,
            listen,
            target,
            flows: Mutex::new(HashMap::new()),
            pipeline,
            tracker: ConnectionTracker::new(),
            closing: CancellationToken::new(),
        })
    }

    async fn serve(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; DEFAULT_SPLICE_BUF_SIZE];
        loop {
            tokio::select! {
                biased;

                _ = self.closing.cancelled() => {
                    for (_, flow) in self.flows.lock().drain() {
                        flow.stop.cancel();
                    }
                    info!(proxy = %self.config.name, "datagram loop stopped");
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
                        proxy.handle_datagram(socket, peer, data).await;
                    });
                }
            }
        }
    }

    async fn handle_datagram(self: Arc<Self>, listener: Arc<UdpSocket>, peer: SocketAddr, data: Vec<u8>) {
        let entity = Arc::new(Entity::Raw(RawEntity::new(peer.ip(), data.clone())));
        if self.pipeline.decide(&entity).await == Decision::Reject {
            match self.config.reject.action {
                RejectAction::Drop => {
                    if let Some(flow) = self.flows.lock().remove(&peer) {
                        flow.stop.cancel();
                    }
                    debug!(proxy = %self.config.name, from = %peer.ip(), "datagram dropped");
                    return;
                }
                _ => warn!(proxy = %self.config.name, "request was filtered, but action is none"),
            }
        }

        let flow = match self.clone().flow_for(&listener, peer).await {
            Ok(flow) => flow,
            Err(err) => {
                warn!(proxy = %self.config.name, error = %err, "failed to connect to target");
                return;
            }
        };

        match timeout(self.config.timeout(), flow.upstream.send(&data)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(proxy = %self.config.name, error = %err, "proxy connection write"),
            Err(_) => warn!(proxy = %self.config.name, "proxy connection write timed out"),
        }
    }

    async fn flow_for(
        self: Arc<Self>,
        listener: &Arc<UdpSocket>,
        peer: SocketAddr,
    ) -> Result<Arc<Flow>, std::io::Error> {
        if let Some(flow) = self.flows.lock().get(&peer) {
            return Ok(flow.clone());
        }

        debug!(proxy = %self.config.name, from = %peer, "new flow");
        let upstream = UdpSocket::bind(("0.0.0.0", 0)).await?;
        upstream.connect(self.target).await?;
        let flow = Arc::new(Flow {
            upstream: Arc::new(upstream),
            stop: self.closing.child_token(),
        });
        self.flows.lock().insert(peer, flow.clone());

        let proxy = self.clone();
        let listener = listener.clone();
        let reply_flow = flow.clone();
        let guard = self.tracker.guard();
        tokio::spawn(async move {
            let _guard = guard;
            proxy.reply_loop(listener, peer, reply_flow).await;
        });

        Ok(flow)
    }

    async fn reply_loop(self: Arc<Self>, listener: Arc<UdpSocket>, peer: SocketAddr, flow: Arc<Flow>) {
        let mut buf = vec![0u8; DEFAULT_SPLICE_BUF_SIZE];
        loop {
            let n = tokio::select! {
                biased;
                _ = flow.stop.cancelled() => break,
                result = timeout(self.config.timeout(), flow.upstream.recv(&mut buf)) => {
                    match result {
                        // idle deadline: drop the table entry
                        Err(_) => break,
                        Ok(Err(err)) => {
                            warn!(proxy = %self.config.name, error = %err, "flow read error");
                            break;
                        }
                        Ok(Ok(n)) => n,
                    }
                }
            };
            if let Err(err) = listener.send_to(&buf[..n], peer).await {
                warn!(proxy = %self.config.name, error = %err, "proxy connection write");
                break;
            }
        }
        self.flows.lock().remove(&peer);
        debug!(proxy = %self.config.name, from = %peer, "flow closed");
    }
}

#[async_trait::async_trait]
impl Proxy for UdpProxy {
    async fn start(self: Arc<Self>) -> Result<(), ProxyError> {
        let socket = Arc::new(UdpSocket::bind(self.listen).await?);
        info!(proxy = %self.config.name, listen = %self.listen, target = %self.target, "listening");
        tokio::spawn(self.clone().serve(socket));
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

impl fmt::Display for UdpProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "udp proxy \"{}\" ({}->{})",
            self.config.name, self.config.listen, self.config.target
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ricochet_config::{FilterAction, FilterBinding, Globals, ProxyKind, RejectSettings, RuleConfig};
    use std::io::Write as _;

    fn rules(store: &Store, pattern: &str) -> RuleSet {
        let mut list = tempfile::NamedTempFile::new().unwrap();
        writeln!(list, "{pattern}").unwrap();
        let configs = [RuleConfig {
            name: "ban".into(),
            kind: "regexp".into(),
            params: serde_yaml::from_str(&format!("{{list: {}}}", list.path().display()))
                .unwrap(),
        }];
        RuleSet::build(store, &configs, &Globals::default()).unwrap()
    }

    fn config(listen: String, target: String) -> ProxyConfig {
        ProxyConfig {
            name: "udp-test".into(),
            kind: ProxyKind::Udp,
            listen,
            target,
            timeout: Some(1),
            tls: Vec::new(),
            trust_headers: false,
            filters: vec![FilterBinding {
                rule: "ban".into(),
                action: FilterAction::Reject,
            }],
            reject: RejectSettings {
                action: RejectAction::Drop,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn forwards_and_replies() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let rules = rules(&store, "never-matching-pattern");

        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = upstream.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
            upstream.send_to(b"pong", from).await.unwrap();
        });

        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let listen_addr = listener.local_addr().unwrap();
        let proxy = Arc::new(
            UdpProxy::new(
                config(listen_addr.to_string(), upstream_addr.to_string()),
                &rules,
                store,
            )
            .unwrap(),
        );
        tokio::spawn(proxy.clone().serve(listener));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"ping", listen_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = timeout(Duration::from_secs(3), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"pong");
        proxy.shutdown(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn matching_datagram_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let rules = rules(&store, "forbidden");

        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let received = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let received = received.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                while upstream.recv_from(&mut buf).await.is_ok() {
                    received.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            });
        }

        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let listen_addr = listener.local_addr().unwrap();
        let proxy = Arc::new(
            UdpProxy::new(
                config(listen_addr.to_string(), upstream_addr.to_string()),
                &rules,
                store.clone(),
            )
            .unwrap(),
        );
        tokio::spawn(proxy.clone().serve(listener));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"forbidden payload", listen_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(received.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(
            store
                .get_verdict("127.0.0.1".parse().unwrap())
                .unwrap()
                .rejects,
            1
        );
        proxy.shutdown(Duration::from_secs(2)).await.unwrap();
    }
}
