//! PTR (reverse DNS) rule.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use hickory_proto::xfer::Protocol;
use hickory_resolver::config::{NameServerConfig, NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::Resolver;
use regex::Regex;
use ricochet_core::Entity;
use ricochet_store::{ReverseLookup, Store};
use serde::Deserialize;
use tracing::debug;

use crate::error::RuleError;
use crate::list::load_regexps;
use crate::rule::Rule;

#[derive(Debug, Deserialize)]
pub struct ReverseLookupParams {
    /// DNS server to query, `addr:port`.
    pub dns: SocketAddr,
    /// Path to the regexp list file matched against PTR domains.
    pub list: String,
}

/// Fires when any PTR domain of the source IP matches any configured regexp.
///
/// Lookups go to the configured DNS server over UDP and are cached
/// persistently per IP, so `prepare` does the network round-trip once and
/// `apply` reads the cache.
pub struct ReverseLookupRule {
    store: Store,
    path: String,
    dns: SocketAddr,
    list: Vec<Regex>,
    resolver: Resolver<TokioConnectionProvider>,
}

impl ReverseLookupRule {
    pub fn from_params(store: Store, params: serde_yaml::Value) -> Result<Self, RuleError> {
        let params: ReverseLookupParams = serde_yaml::from_value(params)?;
        let list = load_regexps(&params.list)?;

        let servers = NameServerConfigGroup::from(vec![NameServerConfig {
            socket_addr: params.dns,
            protocol: Protocol::Udp,
            tls_dns_name: None,
            http_endpoint: None,
            trust_negative_responses: false,
            bind_addr: None,
        }]);
        let resolver = Resolver::builder_with_config(
            ResolverConfig::from_parts(None, vec![], servers),
            TokioConnectionProvider::default(),
        )
        .build();

        Ok(Self {
            store,
            path: params.list,
            dns: params.dns,
            list,
            resolver,
        })
    }

    async fn domains(&self, ip: IpAddr) -> Result<ReverseLookup, RuleError> {
        if let Some(cached) = self.store.get_ptr(ip)? {
            return Ok(cached);
        }

        let mut record = ReverseLookup::default();
        let response = self.resolver.reverse_lookup(ip).await?;
        for name in response.iter() {
            let mut domain = name.to_string();
            if domain.ends_with('.') {
                domain.pop();
            }
            record.domains.push(domain);
        }

        debug!(ip = %ip, ptr = ?record.domains, "new reverse lookup");
        self.store.put_ptr(ip, &record)?;
        Ok(record)
    }
}

#[async_trait]
impl Rule for ReverseLookupRule {
    async fn prepare(&self, entity: &Entity) -> Result<(), RuleError> {
        self.domains(entity.ip()).await?;
        Ok(())
    }

    async fn apply(&self, entity: &Entity) -> Result<bool, RuleError> {
        let record = self.domains(entity.ip()).await?;
        for domain in &record.domains {
            for re in &self.list {
                if re.is_match(domain) {
                    debug!(domain = %domain, regexp = %re, "reverse lookup match");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

impl fmt::Display for ReverseLookupRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReverseLookup(list={}, dns={})", self.path, self.dns)
    }
}
