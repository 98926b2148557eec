//! The per-request decision pipeline shared by all proxy frontends.
//!
//! Order of operations for one entity:
//! 1. Threshold gate against the persistent verdict counters.
//! 2. Concurrent `prepare` of every bound rule (enrichment warm-up).
//! 3. Sequential `apply` in binding order; each rule's apply waits only for
//!    its own prepare. The first firing rule decides: `accept` short-circuits
//!    to forwarding, `reject` stops evaluation and rejects.
//! 4. Verdict counter update.
//!
//! Rule errors are never decisions: a failing `prepare` is logged and the
//! rule still applies against whatever cache state exists; a failing `apply`
//! logs a warning and the rule is treated as not fired.

use std::sync::Arc;

use ricochet_config::{FilterAction, ProxyConfig, ProxyKind, RejectSettings};
use ricochet_core::Entity;
use ricochet_rules::{Rule, RuleSet};
use ricochet_store::Store;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ProxyError;

/// Outcome of the pipeline for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Forward to the hidden target.
    Forward,
    /// Dispatch the proxy's reject action.
    Reject,
}

struct Binding {
    name: String,
    rule: Arc<dyn Rule>,
    action: FilterAction,
}

/// Compiled filter bindings plus the verdict store for one proxy.
pub struct Pipeline {
    proxy: String,
    bindings: Vec<Binding>,
    reject: RejectSettings,
    store: Store,
}

impl Pipeline {
    /// Resolve a proxy's filter bindings against the rule set.
    ///
    /// Rules that require the HTTP surface are refused on non-HTTP proxies
    /// here, at startup, instead of erroring on every request.
    pub fn new(config: &ProxyConfig, rules: &RuleSet, store: Store) -> Result<Self, ProxyError> {
        let mut bindings = Vec::with_capacity(config.filters.len());
        for filter in &config.filters {
            let rule = rules
                .get(&filter.rule)
                .ok_or_else(|| ProxyError::UnknownRule {
                    proxy: config.name.clone(),
                    rule: filter.rule.clone(),
                })?;
            if rule.requires_http() && config.kind != ProxyKind::Http {
                return Err(ProxyError::HttpRuleOnly {
                    proxy: config.name.clone(),
                    rule: filter.rule.clone(),
                });
            }
            bindings.push(Binding {
                name: filter.rule.clone(),
                rule,
                action: filter.action,
            });
        }
        Ok(Self {
            proxy: config.name.clone(),
            bindings,
            reject: config.reject.clone(),
            store,
        })
    }

    /// Decide the fate of one request.
    pub async fn decide(&self, entity: &Arc<Entity>) -> Decision {
        let ip = entity.ip();

        let verdict = match self.store.get_verdict(ip) {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(proxy = %self.proxy, ip = %ip, error = %err, "can't read cached verdict");
                Default::default()
            }
        };
        if self.reject.reject_threshold > 0 && verdict.rejects >= self.reject.reject_threshold {
            warn!(proxy = %self.proxy, ip = %ip, rejects = verdict.rejects, "rejected permanently");
            return Decision::Reject;
        }
        if self.reject.no_reject_threshold > 0
            && verdict.accepts >= self.reject.no_reject_threshold
        {
            debug!(proxy = %self.proxy, ip = %ip, accepts = verdict.accepts, "accepted permanently");
            return Decision::Forward;
        }

        let prepared = self.spawn_prepares(entity);

        for (binding, prepare) in self.bindings.iter().zip(prepared) {
            let _ = prepare.await;

            debug!(proxy = %self.proxy, rule = %binding.name, "applying rule");
            let fired = match binding.rule.apply(entity).await {
                Ok(fired) => fired,
                Err(err) => {
                    // an erroring rule is not a decision; the request may pass
                    warn!(proxy = %self.proxy, rule = %binding.name, error = %err, "rule error, skipping");
                    continue;
                }
            };
            if !fired {
                continue;
            }

            match binding.action {
                FilterAction::Reject => {
                    warn!(proxy = %self.proxy, rule = %binding.name, ip = %ip, "rule fired, rejecting");
                    if let Err(err) = self.store.inc_rejects(ip) {
                        warn!(proxy = %self.proxy, ip = %ip, error = %err, "can't increase rejects");
                    }
                    return Decision::Reject;
                }
                FilterAction::Accept => {
                    debug!(proxy = %self.proxy, rule = %binding.name, ip = %ip, "rule fired, accepting");
                    break;
                }
            }
        }

        if let Err(err) = self.store.inc_accepts(ip) {
            warn!(proxy = %self.proxy, ip = %ip, error = %err, "can't increase accepts");
        }
        debug!(proxy = %self.proxy, ip = %ip, "accepted");
        Decision::Forward
    }

    /// Run every binding's `prepare` concurrently; `apply` awaits its slot.
    fn spawn_prepares(&self, entity: &Arc<Entity>) -> Vec<JoinHandle<()>> {
        self.bindings
            .iter()
            .map(|binding| {
                let rule = binding.rule.clone();
                let entity = entity.clone();
                let proxy = self.proxy.clone();
                let name = binding.name.clone();
                tokio::spawn(async move {
                    if let Err(err) = rule.prepare(&entity).await {
                        warn!(proxy = %proxy, rule = %name, error = %err, "prepare error, skipping");
                    }
                })
            })
            .collect()
    }

    /// Reject settings of the owning proxy.
    pub fn reject_settings(&self) -> &RejectSettings {
        &self.reject
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ricochet_config::{FilterBinding, RejectAction};
    use ricochet_core::RawEntity;
    use ricochet_rules::RuleError;
    use std::fmt;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlagRule {
        fires: bool,
        fail: bool,
        applied: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Rule for FlagRule {
        async fn apply(&self, _entity: &Entity) -> Result<bool, RuleError> {
            self.applied.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RuleError::InvalidArgs("boom".into()));
            }
            Ok(self.fires)
        }
    }

    impl fmt::Display for FlagRule {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "flag")
        }
    }

    struct Fixture {
        pipeline: Pipeline,
        counters: Vec<Arc<AtomicUsize>>,
        store: Store,
        _dir: tempfile::TempDir,
    }

    /// Build a pipeline of (fires, fail, action) rules.
    fn fixture(rules: &[(bool, bool, FilterAction)], reject: RejectSettings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let mut set = RuleSet::empty();
        let mut counters = Vec::new();
        let mut filters = Vec::new();
        for (i, (fires, fail, action)) in rules.iter().enumerate() {
            let applied = Arc::new(AtomicUsize::new(0));
            counters.push(applied.clone());
            let name = format!("r{i}");
            set.insert(
                name.clone(),
                Arc::new(FlagRule {
                    fires: *fires,
                    fail: *fail,
                    applied,
                }),
            );
            filters.push(FilterBinding {
                rule: name,
                action: *action,
            });
        }

        let config = ProxyConfig {
            name: "test".into(),
            kind: ProxyKind::Tcp,
            listen: "127.0.0.1:0".into(),
            target: "127.0.0.1:1".into(),
            timeout: None,
            tls: Vec::new(),
            trust_headers: false,
            filters,
            reject,
        };
        let pipeline = Pipeline::new(&config, &set, store.clone()).unwrap();
        Fixture {
            pipeline,
            counters,
            store,
            _dir: dir,
        }
    }

    fn entity(last: u8) -> Arc<Entity> {
        Arc::new(Entity::Raw(RawEntity::new(
            IpAddr::V4(Ipv4Addr::new(203, 0, 113, last)),
            Vec::new(),
        )))
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    #[tokio::test]
    async fn no_rule_fires_forwards_and_counts_accept() {
        let f = fixture(
            &[(false, false, FilterAction::Reject)],
            RejectSettings::default(),
        );
        assert_eq!(f.pipeline.decide(&entity(1)).await, Decision::Forward);
        assert_eq!(f.store.get_verdict(ip(1)).unwrap().accepts, 1);
    }

    #[tokio::test]
    async fn reject_rule_stops_evaluation_and_counts() {
        let f = fixture(
            &[
                (true, false, FilterAction::Reject),
                (true, false, FilterAction::Reject),
            ],
            RejectSettings::default(),
        );
        assert_eq!(f.pipeline.decide(&entity(2)).await, Decision::Reject);
        let verdict = f.store.get_verdict(ip(2)).unwrap();
        assert_eq!(verdict.rejects, 1);
        assert_eq!(verdict.accepts, 0);
        // second rule never ran
        assert_eq!(f.counters[1].load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn accept_rule_short_circuits_remaining_rules() {
        let f = fixture(
            &[
                (true, false, FilterAction::Accept),
                (true, false, FilterAction::Reject),
            ],
            RejectSettings::default(),
        );
        assert_eq!(f.pipeline.decide(&entity(3)).await, Decision::Forward);
        assert_eq!(f.counters[1].load(Ordering::SeqCst), 0);
        assert_eq!(f.store.get_verdict(ip(3)).unwrap().accepts, 1);
    }

    #[tokio::test]
    async fn erroring_rule_is_skipped_not_rejected() {
        let f = fixture(
            &[
                (true, true, FilterAction::Reject),
                (false, false, FilterAction::Reject),
            ],
            RejectSettings::default(),
        );
        assert_eq!(f.pipeline.decide(&entity(4)).await, Decision::Forward);
        assert_eq!(f.counters[1].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reject_threshold_short_circuits_evaluation() {
        let reject = RejectSettings {
            reject_threshold: 3,
            ..Default::default()
        };
        let f = fixture(&[(true, false, FilterAction::Reject)], reject);
        for _ in 0..4 {
            assert_eq!(f.pipeline.decide(&entity(5)).await, Decision::Reject);
        }
        // threshold reached after 3 counted rejects; the 4th decision came
        // from the gate without applying rules
        assert_eq!(f.counters[0].load(Ordering::SeqCst), 3);
        assert_eq!(f.store.get_verdict(ip(5)).unwrap().rejects, 3);
    }

    #[tokio::test]
    async fn accept_threshold_skips_rules_and_forwards() {
        let reject = RejectSettings {
            no_reject_threshold: 1,
            ..Default::default()
        };
        // rule would reject every request, but one prior accept pins the
        // source as friendly
        let f = fixture(&[(true, false, FilterAction::Reject)], reject);
        f.store.inc_accepts(ip(6)).unwrap();
        assert_eq!(f.pipeline.decide(&entity(6)).await, Decision::Forward);
        assert_eq!(f.counters[0].load(Ordering::SeqCst), 0);
        // gate decisions are not counted
        assert_eq!(f.store.get_verdict(ip(6)).unwrap().accepts, 1);
    }

    #[tokio::test]
    async fn reject_threshold_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let reject = RejectSettings {
            reject_threshold: 3,
            ..Default::default()
        };

        let config = ProxyConfig {
            name: "test".into(),
            kind: ProxyKind::Tcp,
            listen: "127.0.0.1:0".into(),
            target: "127.0.0.1:1".into(),
            timeout: None,
            tls: Vec::new(),
            trust_headers: false,
            filters: vec![FilterBinding {
                rule: "r0".into(),
                action: FilterAction::Reject,
            }],
            reject,
        };

        let applied = Arc::new(AtomicUsize::new(0));
        let build_set = |applied: &Arc<AtomicUsize>| {
            let mut set = RuleSet::empty();
            set.insert(
                "r0".into(),
                Arc::new(FlagRule {
                    fires: true,
                    fail: false,
                    applied: applied.clone(),
                }),
            );
            set
        };

        {
            let store = Store::open(dir.path()).unwrap();
            let pipeline = Pipeline::new(&config, &build_set(&applied), store).unwrap();
            for _ in 0..4 {
                assert_eq!(pipeline.decide(&entity(9)).await, Decision::Reject);
            }
        }

        // simulated restart: fresh store handle over the same directory
        let store = Store::open(dir.path()).unwrap();
        let applied_after = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(&config, &build_set(&applied_after), store).unwrap();
        assert_eq!(pipeline.decide(&entity(9)).await, Decision::Reject);
        assert_eq!(applied_after.load(Ordering::SeqCst), 0, "gate must pre-empt rules");
    }

    #[tokio::test]
    async fn binding_order_decides_first_fire() {
        let f = fixture(
            &[
                (false, false, FilterAction::Reject),
                (true, false, FilterAction::Accept),
                (true, false, FilterAction::Reject),
            ],
            RejectSettings::default(),
        );
        assert_eq!(f.pipeline.decide(&entity(7)).await, Decision::Forward);
        assert_eq!(f.counters[2].load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_rule_is_fatal() {
        let set = RuleSet::empty();
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let config = ProxyConfig {
            name: "test".into(),
            kind: ProxyKind::Tcp,
            listen: "127.0.0.1:0".into(),
            target: "127.0.0.1:1".into(),
            timeout: None,
            tls: Vec::new(),
            trust_headers: false,
            filters: vec![FilterBinding {
                rule: "ghost".into(),
                action: FilterAction::Reject,
            }],
            reject: RejectSettings {
                action: RejectAction::Drop,
                ..Default::default()
            },
        };
        assert!(matches!(
            Pipeline::new(&config, &set, store),
            Err(ProxyError::UnknownRule { .. })
        ));
    }
}
