//! Boolean composites over named child rules.
//!
//! Composites hold references to already-constructed rules, so a composite
//! can only name rules defined earlier in the configuration; cycles are not
//! expressible.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use ricochet_core::Entity;
use serde::Deserialize;

use crate::error::RuleError;
use crate::rule::{NotRule, Rule};
use crate::set::RuleSet;

#[derive(Debug, Deserialize)]
pub struct CompositeParams {
    pub rules: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct NotParams {
    pub rule: String,
}

fn resolve(set: &RuleSet, names: &[String]) -> Result<Vec<Arc<dyn Rule>>, RuleError> {
    names
        .iter()
        .map(|name| {
            set.get(name)
                .ok_or_else(|| RuleError::UnknownRuleName(name.clone()))
        })
        .collect()
}

/// All children must fire; evaluation short-circuits on the first miss.
pub struct AndRule {
    children: Vec<Arc<dyn Rule>>,
}

impl AndRule {
    pub fn from_params(set: &RuleSet, params: serde_yaml::Value) -> Result<Self, RuleError> {
        let params: CompositeParams = serde_yaml::from_value(params)?;
        if params.rules.len() < 2 {
            return Err(RuleError::InvalidArgs(
                "\"and\" needs at least two rules".into(),
            ));
        }
        Ok(Self {
            children: resolve(set, &params.rules)?,
        })
    }
}

#[async_trait]
impl Rule for AndRule {
    async fn prepare(&self, entity: &Entity) -> Result<(), RuleError> {
        for result in join_all(self.children.iter().map(|c| c.prepare(entity))).await {
            result?;
        }
        Ok(())
    }

    async fn apply(&self, entity: &Entity) -> Result<bool, RuleError> {
        for child in &self.children {
            if !child.apply(entity).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn requires_http(&self) -> bool {
        self.children.iter().any(|c| c.requires_http())
    }
}

impl fmt::Display for AndRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.children.iter().map(|c| c.to_string()).collect();
        f.write_str(&parts.join(" and "))
    }
}

/// Any child firing is enough; evaluation short-circuits on the first hit.
pub struct OrRule {
    children: Vec<Arc<dyn Rule>>,
}

impl OrRule {
    pub fn from_params(set: &RuleSet, params: serde_yaml::Value) -> Result<Self, RuleError> {
        let params: CompositeParams = serde_yaml::from_value(params)?;
        if params.rules.len() < 2 {
            return Err(RuleError::InvalidArgs(
                "\"or\" needs at least two rules".into(),
            ));
        }
        Ok(Self {
            children: resolve(set, &params.rules)?,
        })
    }
}

#[async_trait]
impl Rule for OrRule {
    async fn prepare(&self, entity: &Entity) -> Result<(), RuleError> {
        for result in join_all(self.children.iter().map(|c| c.prepare(entity))).await {
            result?;
        }
        Ok(())
    }

    async fn apply(&self, entity: &Entity) -> Result<bool, RuleError> {
        for child in &self.children {
            if child.apply(entity).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn requires_http(&self) -> bool {
        self.children.iter().any(|c| c.requires_http())
    }
}

impl fmt::Display for OrRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.children.iter().map(|c| c.to_string()).collect();
        f.write_str(&parts.join(" or "))
    }
}

/// Negation of exactly one named child.
pub fn not_from_params(set: &RuleSet, params: serde_yaml::Value) -> Result<NotRule, RuleError> {
    let params: NotParams = serde_yaml::from_value(params)?;
    if params.rule.is_empty() {
        return Err(RuleError::InvalidArgs("\"not\" needs a rule".into()));
    }
    let child = set
        .get(&params.rule)
        .ok_or_else(|| RuleError::UnknownRuleName(params.rule.clone()))?;
    Ok(NotRule::new(child))
}
