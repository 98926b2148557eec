//! Builds and supervises all configured proxies.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use ricochet_config::{Config, ProxyKind};
use ricochet_rules::RuleSet;
use ricochet_store::Store;
use tracing::{error, info};

use crate::dns::DnsProxy;
use crate::error::ProxyError;
use crate::http::HttpProxy;
use crate::tcp::TcpProxy;
use crate::udp::UdpProxy;
use crate::Proxy;

pub struct ProxyManager {
    proxies: Vec<Arc<dyn Proxy>>,
}

impl ProxyManager {
    /// Build every configured proxy against the shared rule set and store.
    pub fn new(config: &Config, rules: &RuleSet, store: &Store) -> Result<Self, ProxyError> {
        let mut proxies: Vec<Arc<dyn Proxy>> = Vec::with_capacity(config.proxies.len());
        for proxy_config in &config.proxies {
            let proxy: Arc<dyn Proxy> = match proxy_config.kind {
                ProxyKind::Http => {
                    Arc::new(HttpProxy::new(proxy_config.clone(), rules, store.clone())?)
                }
                ProxyKind::Dns => {
                    Arc::new(DnsProxy::new(proxy_config.clone(), rules, store.clone())?)
                }
                ProxyKind::Tcp => {
                    Arc::new(TcpProxy::new(proxy_config.clone(), rules, store.clone())?)
                }
                ProxyKind::Udp => {
                    Arc::new(UdpProxy::new(proxy_config.clone(), rules, store.clone())?)
                }
            };
            proxies.push(proxy);
        }
        Ok(Self { proxies })
    }

    /// Start every proxy in order; on failure, shut down the ones already
    /// running before returning the error.
    pub async fn start_all(&self) -> Result<(), ProxyError> {
        for (i, proxy) in self.proxies.iter().enumerate() {
            info!("starting {proxy}");
            if let Err(err) = proxy.clone().start().await {
                error!(error = %err, "error starting {proxy}");
                for started in &self.proxies[..i] {
                    if let Err(shutdown_err) =
                        started.shutdown(Duration::from_secs(5)).await
                    {
                        error!(error = %shutdown_err, "error shutting down {started} forcefully");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Shut all proxies down concurrently; the first error wins.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ProxyError> {
        let results = join_all(
            self.proxies
                .iter()
                .map(|proxy| async move { (proxy, proxy.shutdown(deadline).await) }),
        )
        .await;

        let mut first_error = None;
        for (proxy, result) in results {
            if let Err(err) = result {
                error!(error = %err, "error shutting down {proxy}");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ricochet_config::Globals;

    #[tokio::test]
    async fn builds_and_cycles_all_proxy_kinds() {
        let yaml = r#"
proxies:
  - name: web
    type: http
    listen: 127.0.0.1:0
    target: http://127.0.0.1:9
  - name: ns
    type: dns
    listen: 127.0.0.1:0
    target: 127.0.0.1:9
  - name: raw
    type: tcp
    listen: 127.0.0.1:0
    target: 127.0.0.1:9
  - name: dgram
    type: udp
    listen: 127.0.0.1:0
    target: 127.0.0.1:9
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let rules = RuleSet::build(&store, &config.rules, &Globals::default()).unwrap();

        let manager = ProxyManager::new(&config, &rules, &store).unwrap();
        assert_eq!(manager.len(), 4);
        manager.start_all().await.unwrap();
        manager.shutdown(Duration::from_secs(2)).await.unwrap();
    }

    #[test]
    fn bad_proxy_config_is_fatal() {
        let yaml = r#"
proxies:
  - name: raw
    type: tcp
    listen: 127.0.0.1:0
    target: 127.0.0.1:9
    reject:
      action: redirect
      url: https://example.com
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let rules = RuleSet::empty();
        assert!(ProxyManager::new(&config, &rules, &store).is_err());
    }
}
