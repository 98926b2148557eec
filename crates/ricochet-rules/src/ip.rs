//! Source-IP banlist rule.

use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;
use ricochet_core::Entity;
use serde::Deserialize;
use tracing::debug;

use crate::error::RuleError;
use crate::list::read_lines;
use crate::rule::Rule;

#[derive(Debug, Deserialize)]
pub struct IpParams {
    /// Path to the list file: one address or CIDR prefix per line.
    pub list: String,
}

/// Fires when the source IP is in the configured address or prefix lists.
///
/// Both lists are sorted at construction; `apply` is two binary searches.
/// Addresses are deduplicated exactly, prefixes by overlap (the broadest
/// survives).
pub struct IpRule {
    path: String,
    subnets: Vec<IpNet>,
    ips: Vec<IpAddr>,
}

impl IpRule {
    pub fn from_params(params: serde_yaml::Value) -> Result<Self, RuleError> {
        let params: IpParams = serde_yaml::from_value(params)?;
        Self::from_file(params.list)
    }

    pub fn from_file(path: String) -> Result<Self, RuleError> {
        let mut subnets = Vec::new();
        let mut ips = Vec::new();
        for line in read_lines(&path)? {
            if line.contains('/') {
                let net: IpNet = line
                    .parse()
                    .map_err(|_| RuleError::BadAddr(line.clone()))?;
                subnets.push(net.trunc());
            } else {
                let ip: IpAddr = line
                    .parse()
                    .map_err(|_| RuleError::BadAddr(line.clone()))?;
                ips.push(ip);
            }
        }

        ips.sort();
        ips.dedup();

        subnets.sort_by(|a, b| {
            a.network()
                .cmp(&b.network())
                .then(a.prefix_len().cmp(&b.prefix_len()))
        });
        // overlapping prefixes collapse into the broadest, which sorts first
        subnets.dedup_by(|b, a| a.contains(&b.network()) || b.contains(&a.network()));

        Ok(Self { path, subnets, ips })
    }

    fn in_subnets(&self, ip: IpAddr) -> bool {
        self.subnets
            .binary_search_by(|net| {
                if net.contains(&ip) {
                    Ordering::Equal
                } else {
                    net.network().cmp(&ip)
                }
            })
            .is_ok()
    }
}

#[async_trait]
impl Rule for IpRule {
    async fn apply(&self, entity: &Entity) -> Result<bool, RuleError> {
        let ip = entity.ip();
        if self.in_subnets(ip) {
            debug!(ip = %ip, "subnet match");
            return Ok(true);
        }
        if self.ips.binary_search(&ip).is_ok() {
            debug!(ip = %ip, "ip match");
            return Ok(true);
        }
        Ok(false)
    }
}

impl fmt::Display for IpRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IP(list={})", self.path)
    }
}
