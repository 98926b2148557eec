//! Malleable C2 profile rule.
//!
//! Accepts requests that look like beacon traffic of one specific profile and
//! flags everything else: the rule fires (`true`) when the request conforms
//! to **no** profile block, and the binding decides what firing means.

pub mod profile;
pub mod transform;

use std::fmt;
use std::fs;

use async_trait::async_trait;
use regex::Regex;
use ricochet_core::Entity;
use serde::Deserialize;
use tracing::debug;

use crate::error::RuleError;
use crate::rule::Rule;
use profile::Profile;
use transform::{checksum8, decode_chain, match_by_mask, Transform};

#[derive(Debug, Deserialize)]
pub struct MalleableParams {
    /// Path to the Malleable C2 profile.
    pub profile: String,
    /// URL-path regexps that always pass, profile or not.
    #[serde(default)]
    pub exclude: Vec<String>,
}

pub struct MalleableRule {
    path: String,
    exclude: Vec<Regex>,
    profile: Profile,
}

/// Transforms of one block, partitioned by their sink function.
#[derive(Default)]
struct Sinks<'a> {
    uri: Option<&'a [Transform]>,
    parameter: Option<&'a [Transform]>,
    header: Option<&'a [Transform]>,
    body: Option<&'a [Transform]>,
}

impl<'a> Sinks<'a> {
    fn partition(groups: &[&'a [Transform]]) -> Result<Self, RuleError> {
        let mut sinks = Sinks::default();
        for group in groups {
            let Some(last) = group.last() else { continue };
            match last.func.as_str() {
                "header" => sinks.header = Some(group),
                "parameter" => sinks.parameter = Some(group),
                "print" => sinks.body = Some(group),
                "uri-append" => sinks.uri = Some(group),
                other => return Err(RuleError::UnknownTransform(other.to_string())),
            }
        }
        Ok(sinks)
    }
}

impl MalleableRule {
    pub fn from_params(params: serde_yaml::Value) -> Result<Self, RuleError> {
        let params: MalleableParams = serde_yaml::from_value(params)?;
        let source = fs::read_to_string(&params.profile)?;
        let profile = Profile::parse(&source)?;
        let exclude = params
            .exclude
            .iter()
            .map(|p| Regex::new(p).map_err(RuleError::from))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            path: params.profile,
            exclude,
            profile,
        })
    }

    /// Block-list gate; runs before path exclusion.
    fn blocked_user_agent(&self, ua: &[String]) -> bool {
        self.profile
            .http_config
            .block_useragents
            .iter()
            .any(|blocked| ua.iter().any(|u| match_by_mask(u, blocked)))
    }

    /// Allow-list and fixed user-agent gates; run after path exclusion.
    /// `true` means the request is flagged.
    fn unlisted_user_agent(&self, ua: &[String]) -> bool {
        let allow = &self.profile.http_config.allow_useragents;
        if !allow.is_empty()
            && !allow
                .iter()
                .any(|mask| ua.iter().any(|u| match_by_mask(u, mask)))
        {
            debug!("user-agent not in allow list");
            return true;
        }

        if let Some(agent) = &self.profile.user_agent {
            if !ua.iter().any(|u| u == agent) {
                debug!("user-agent differs from profile");
                return true;
            }
        }

        false
    }

    fn verify_block(
        &self,
        entity: &Entity,
        verb: Option<&str>,
        default_verb: &str,
        uris: &[String],
        parameters: &[(String, String)],
        headers: &[(String, String)],
        transform_groups: &[&[Transform]],
    ) -> Result<bool, RuleError> {
        let sinks = Sinks::partition(transform_groups)?;

        let want = verb.filter(|v| !v.is_empty()).unwrap_or(default_verb);
        if entity.method()?.as_str() != want {
            return Ok(false);
        }

        if !self.verify_uri(entity, uris, sinks.uri)? {
            return Ok(false);
        }
        if !self.verify_parameters(entity, parameters, sinks.parameter)? {
            return Ok(false);
        }
        if !self.verify_headers(entity, headers, sinks.header)? {
            return Ok(false);
        }
        if let Some(body_t) = sinks.body {
            if !decode_chain(&entity.body()?, body_t) {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn verify_uri(
        &self,
        entity: &Entity,
        uris: &[String],
        transforms: Option<&[Transform]>,
    ) -> Result<bool, RuleError> {
        let path = entity.path()?;
        for uri in uris {
            match transforms {
                None if uri == path => return Ok(true),
                Some(t) if path.starts_with(uri.as_str()) => {
                    if decode_chain(path[uri.len()..].as_bytes(), t) {
                        return Ok(true);
                    }
                }
                _ => {}
            }
        }
        Ok(false)
    }

    fn verify_parameters(
        &self,
        entity: &Entity,
        parameters: &[(String, String)],
        transforms: Option<&[Transform]>,
    ) -> Result<bool, RuleError> {
        let pairs = entity.query_pairs()?;
        let value_of = |name: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .unwrap_or("")
        };

        for (name, value) in parameters {
            if value_of(name) != value {
                return Ok(false);
            }
        }

        if let Some(t) = transforms {
            let name = t.last().and_then(|s| s.args.first()).map(String::as_str);
            let Some(name) = name else { return Ok(false) };
            return Ok(decode_chain(value_of(name).as_bytes(), t));
        }

        Ok(true)
    }

    fn verify_headers(
        &self,
        entity: &Entity,
        headers: &[(String, String)],
        transforms: Option<&[Transform]>,
    ) -> Result<bool, RuleError> {
        for (name, value) in headers {
            let values = entity.header_values(name)?;
            if !values.iter().any(|v| v.eq_ignore_ascii_case(value)) {
                return Ok(false);
            }
        }

        if let Some(t) = transforms {
            let name = t.last().and_then(|s| s.args.first()).map(String::as_str);
            let Some(name) = name else { return Ok(false) };
            let values = entity.header_values(name)?;
            return Ok(values.iter().any(|v| decode_chain(v.as_bytes(), t)));
        }

        Ok(true)
    }

    /// Staged-payload URL heuristic: the 8-bit checksum of the last path
    /// segment identifies x86 (92) and x64 (93) stager requests.
    fn verify_stager_url(&self, entity: &Entity) -> Result<bool, RuleError> {
        let path = entity.path()?;
        let last = path.rsplit('/').next().unwrap_or("");
        let cs = checksum8(last.as_bytes());
        Ok(cs == 92 || cs == 93)
    }
}

#[async_trait]
impl Rule for MalleableRule {
    async fn apply(&self, entity: &Entity) -> Result<bool, RuleError> {
        let ua = entity.header_values("user-agent")?;
        if self.blocked_user_agent(&ua) {
            debug!("blocked user-agent");
            return Ok(true);
        }

        let path = entity.path()?;
        for exclude in &self.exclude {
            if exclude.is_match(path) {
                return Ok(false);
            }
        }

        if self.unlisted_user_agent(&ua) {
            return Ok(true);
        }

        for block in &self.profile.http_get {
            let groups: [&[Transform]; 1] = [&block.client.metadata];
            if self.verify_block(
                entity,
                block.verb.as_deref(),
                "GET",
                &block.uris,
                &block.client.parameters,
                &block.client.headers,
                &groups,
            )? {
                return Ok(false);
            }
        }

        for block in &self.profile.http_post {
            let groups: [&[Transform]; 2] = [&block.client.id, &block.client.output];
            if self.verify_block(
                entity,
                block.verb.as_deref(),
                "POST",
                &block.uris,
                &block.client.parameters,
                &block.client.headers,
                &groups,
            )? {
                return Ok(false);
            }
        }

        if self.profile.host_stage {
            let uri_append = [Transform::new("uri-append", Vec::new())];
            for block in &self.profile.http_stager {
                let mut uris = block.uri_x64.clone();
                uris.extend(block.uri_x86.iter().cloned());
                let groups: [&[Transform]; 1] = [&uri_append];
                if self.verify_block(
                    entity,
                    None,
                    "GET",
                    &uris,
                    &block.client.parameters,
                    &block.client.headers,
                    &groups,
                )? {
                    return Ok(false);
                }
            }

            if self.verify_stager_url(entity)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn requires_http(&self) -> bool {
        true
    }
}

impl fmt::Display for MalleableRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Malleable(profile={}, exclude={})",
            self.path,
            self.exclude.len()
        )
    }
}
