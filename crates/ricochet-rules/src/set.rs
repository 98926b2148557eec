//! Named rule registry and the rule-type DSL.
//!
//! A rule type is a `::`-separated token stream: the last token picks the
//! base rule, earlier tokens wrap it (only `not` exists today). Rules are
//! built strictly in configuration order, so composites can only reference
//! rules defined before them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ricochet_config::{Globals, RuleConfig};
use ricochet_store::Store;
use tracing::debug;

use crate::composite::{not_from_params, AndRule, OrRule};
use crate::error::RuleError;
use crate::geo::GeoRule;
use crate::ip::IpRule;
use crate::malleable::MalleableRule;
use crate::regexp::RegexpRule;
use crate::reverse_lookup::ReverseLookupRule;
use crate::rule::{NotRule, Rule};
use crate::time::TimeRule;

/// Name → rule map, immutable once built.
pub struct RuleSet {
    rules: HashMap<String, Arc<dyn Rule>>,
}

impl fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.rules.iter().map(|(k, v)| (k, v.to_string())))
            .finish()
    }
}

impl RuleSet {
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: String, rule: Arc<dyn Rule>) {
        self.rules.insert(name, rule);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Rule>> {
        self.rules.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Build all configured rules in order.
    pub fn build(
        store: &Store,
        configs: &[RuleConfig],
        globals: &Globals,
    ) -> Result<Self, RuleError> {
        let mut set = RuleSet::empty();

        for config in configs {
            let tokens: Vec<&str> = config.kind.split("::").collect();
            let base = tokens.last().copied().unwrap_or_default();
            let params = config.params.clone();

            let mut rule: Arc<dyn Rule> = match base {
                "and" => Arc::new(AndRule::from_params(&set, params)?),
                "or" => Arc::new(OrRule::from_params(&set, params)?),
                "not" => Arc::new(not_from_params(&set, params)?),
                "ip" => Arc::new(IpRule::from_params(params)?),
                "geo" => Arc::new(GeoRule::from_params(store.clone(), params, globals)?),
                "reverse_lookup" => {
                    Arc::new(ReverseLookupRule::from_params(store.clone(), params)?)
                }
                "regexp" => Arc::new(RegexpRule::from_params(params)?),
                "malleable" => Arc::new(MalleableRule::from_params(params)?),
                "time" => Arc::new(TimeRule::from_params(params)?),
                other => {
                    return Err(RuleError::UnknownBaseRule {
                        rule: config.name.clone(),
                        token: other.to_string(),
                    })
                }
            };

            for wrapper in tokens[..tokens.len() - 1].iter().rev() {
                rule = match *wrapper {
                    "not" => Arc::new(NotRule::new(rule)),
                    other => {
                        return Err(RuleError::UnknownWrapper {
                            rule: config.name.clone(),
                            token: other.to_string(),
                        })
                    }
                };
            }

            debug!(name = %config.name, rule = %rule, "created new rule");
            set.insert(config.name.clone(), rule);
        }

        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ricochet_core::{Entity, RawEntity};
    use std::io::Write;
    use std::net::{IpAddr, Ipv4Addr};

    fn rule_config(name: &str, kind: &str, params: &str) -> RuleConfig {
        RuleConfig {
            name: name.into(),
            kind: kind.into(),
            params: serde_yaml::from_str(params).unwrap(),
        }
    }

    fn banlist() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10.0.0.0/8").unwrap();
        file
    }

    fn build(configs: &[RuleConfig]) -> Result<RuleSet, RuleError> {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        RuleSet::build(&store, configs, &Globals::default())
    }

    fn entity(ip: [u8; 4]) -> Entity {
        Entity::Raw(RawEntity::new(
            IpAddr::V4(Ipv4Addr::from(ip)),
            Vec::new(),
        ))
    }

    #[tokio::test]
    async fn builds_base_and_wrapped_rules() {
        let list = banlist();
        let set = build(&[
            rule_config("ban", "ip", &format!("{{list: {}}}", list.path().display())),
            rule_config(
                "unban",
                "not::ip",
                &format!("{{list: {}}}", list.path().display()),
            ),
        ])
        .unwrap();
        assert_eq!(set.len(), 2);

        let banned = entity([10, 0, 0, 5]);
        assert!(set.get("ban").unwrap().apply(&banned).await.unwrap());
        assert!(!set.get("unban").unwrap().apply(&banned).await.unwrap());
    }

    #[tokio::test]
    async fn composites_reference_earlier_rules() {
        let list = banlist();
        let list_path = format!("{}", list.path().display());
        let set = build(&[
            rule_config("ban", "ip", &format!("{{list: {list_path}}}")),
            rule_config("work", "time", "{from: '00:00', to: '23:59', timezone: UTC}"),
            rule_config("both", "and", "{rules: [ban, work]}"),
            rule_config("either", "or", "{rules: [ban, work]}"),
            rule_config("inverted", "not", "{rule: ban}"),
        ])
        .unwrap();

        let banned = entity([10, 1, 2, 3]);
        assert!(set.get("both").unwrap().apply(&banned).await.unwrap());
        assert!(set.get("either").unwrap().apply(&banned).await.unwrap());
        assert!(!set.get("inverted").unwrap().apply(&banned).await.unwrap());
    }

    #[test]
    fn forward_reference_is_fatal() {
        let list = banlist();
        let err = build(&[
            rule_config("both", "and", "{rules: [ban, ban2]}"),
            rule_config("ban", "ip", &format!("{{list: {}}}", list.path().display())),
        ])
        .unwrap_err();
        assert!(matches!(err, RuleError::UnknownRuleName(_)));
    }

    #[test]
    fn unknown_base_token_is_fatal() {
        let err = build(&[rule_config("x", "frobnicate", "{}")]).unwrap_err();
        assert!(matches!(err, RuleError::UnknownBaseRule { .. }));
    }

    #[test]
    fn unknown_wrapper_token_is_fatal() {
        let list = banlist();
        let err = build(&[rule_config(
            "x",
            "maybe::ip",
            &format!("{{list: {}}}", list.path().display()),
        )])
        .unwrap_err();
        assert!(matches!(err, RuleError::UnknownWrapper { .. }));
    }
}
