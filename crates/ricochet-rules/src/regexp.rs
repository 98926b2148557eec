//! Raw-bytes regexp rule.

use std::fmt;

use async_trait::async_trait;
use ricochet_core::Entity;
use serde::Deserialize;
use tracing::debug;

use crate::error::RuleError;
use crate::list::load_byte_regexps;
use crate::rule::Rule;

#[derive(Debug, Deserialize)]
pub struct RegexpParams {
    /// Path to the list file, one regexp per line.
    pub list: String,
}

/// Fires when any configured regexp matches the raw bytes of the entity.
pub struct RegexpRule {
    path: String,
    list: Vec<regex::bytes::Regex>,
}

impl RegexpRule {
    pub fn from_params(params: serde_yaml::Value) -> Result<Self, RuleError> {
        let params: RegexpParams = serde_yaml::from_value(params)?;
        let list = load_byte_regexps(&params.list)?;
        Ok(Self {
            path: params.list,
            list,
        })
    }
}

#[async_trait]
impl Rule for RegexpRule {
    async fn apply(&self, entity: &Entity) -> Result<bool, RuleError> {
        let raw = entity.raw()?;
        for re in &self.list {
            if re.is_match(&raw) {
                debug!(regexp = %re, "regexp match");
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl fmt::Display for RegexpRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Regexp(list={})", self.path)
    }
}
