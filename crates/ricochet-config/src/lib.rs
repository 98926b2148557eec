//! Configuration loading and validation.
//!
//! Top-level YAML keys: `rules` (named rule definitions), `proxies` (listener
//! definitions with filter bindings and reject settings), `globals` (provider
//! API keys). Per-rule `params` stay a free-form YAML map here; each rule type
//! deserializes them into its own param struct when the rule set is built.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use std::{fmt, fs};

use ricochet_core::defaults::DEFAULT_PROXY_TIMEOUT_SECS;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
    #[serde(default)]
    pub globals: Globals,
}

/// One named rule definition.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    /// `::`-separated type tokens; the last token picks the base rule,
    /// earlier tokens wrap it (`not::ip`).
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: serde_yaml::Value,
}

/// Listener types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Dns,
    Tcp,
    Udp,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyKind::Http => "http",
            ProxyKind::Dns => "dns",
            ProxyKind::Tcp => "tcp",
            ProxyKind::Udp => "udp",
        };
        f.write_str(s)
    }
}

/// One TLS keypair. `domains` overrides the certificate's own SANs for SNI
/// selection.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsItem {
    pub cert: String,
    pub key: String,
    #[serde(default)]
    pub domains: Vec<String>,
}

/// Binding of a named rule to the action taken when it fires.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterBinding {
    pub rule: String,
    pub action: FilterAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    Accept,
    Reject,
}

/// What happens when a request is rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectAction {
    /// Transparently proxy to the decoy origin at `url`.
    Proxy,
    /// HTTP 301 to `url` (HTTP proxies only).
    Redirect,
    /// Close the connection without an answer.
    Drop,
    /// Observer mode: log and forward to the real target anyway.
    #[default]
    None,
}

impl fmt::Display for RejectAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectAction::Proxy => "proxy",
            RejectAction::Redirect => "redirect",
            RejectAction::Drop => "drop",
            RejectAction::None => "none",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RejectSettings {
    #[serde(default)]
    pub action: RejectAction,
    /// Decoy origin for `proxy`, location for `redirect`.
    #[serde(default)]
    pub url: Option<String>,
    /// After this many accepts, skip rule evaluation for the source. 0 = off.
    #[serde(default)]
    pub no_reject_threshold: u64,
    /// After this many rejects, reject the source outright. 0 = off.
    #[serde(default)]
    pub reject_threshold: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProxyKind,
    pub listen: String,
    pub target: String,
    /// Server read/write/idle and upstream-client timeout, seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub tls: Vec<TlsItem>,
    /// Trust `X-Forwarded-For` / `X-Real-Ip` for the source address (HTTP).
    #[serde(default)]
    pub trust_headers: bool,
    #[serde(default)]
    pub filters: Vec<FilterBinding>,
    #[serde(default)]
    pub reject: RejectSettings,
}

impl ProxyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.unwrap_or(DEFAULT_PROXY_TIMEOUT_SECS))
    }
}

/// Provider API keys and other process-wide settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Globals {
    #[serde(default)]
    pub ipapi_co_key: Option<String>,
    #[serde(default)]
    pub ip_api_com_key: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("validation: {0}")]
    Validation(String),
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let data = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&data)?)
}

/// Shape-level validation. Deeper checks (rule params, reject-action subsets,
/// certificates) happen where the objects are built, still before any
/// listener starts.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut rule_names = HashSet::new();
    for rule in &config.rules {
        if rule.name.trim().is_empty() {
            return Err(ConfigError::Validation("rule with empty name".into()));
        }
        if rule.kind.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "rule \"{}\" has an empty type",
                rule.name
            )));
        }
        if !rule_names.insert(rule.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate rule name \"{}\"",
                rule.name
            )));
        }
    }

    let mut proxy_names = HashSet::new();
    for proxy in &config.proxies {
        if !proxy_names.insert(proxy.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate proxy name \"{}\"",
                proxy.name
            )));
        }
        if proxy.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "proxy \"{}\": listen is not an addr:port",
                proxy.name
            )));
        }
        if proxy.target.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "proxy \"{}\": target is empty",
                proxy.name
            )));
        }
        if proxy.timeout == Some(0) {
            return Err(ConfigError::Validation(format!(
                "proxy \"{}\": timeout must be > 0",
                proxy.name
            )));
        }
        for binding in &proxy.filters {
            if !rule_names.contains(binding.rule.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "proxy \"{}\": unknown rule \"{}\"",
                    proxy.name, binding.rule
                )));
            }
        }
        let needs_url = matches!(
            proxy.reject.action,
            RejectAction::Proxy | RejectAction::Redirect
        );
        if needs_url && proxy.reject.url.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::Validation(format!(
                "proxy \"{}\": reject action \"{}\" requires a url",
                proxy.name, proxy.reject.action
            )));
        }
    }

    Ok(())
}
