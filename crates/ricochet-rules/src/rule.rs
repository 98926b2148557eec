//! The rule contract and the `not` wrapper.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use ricochet_core::Entity;

use crate::error::RuleError;

/// A predicate over one inbound request.
///
/// Rules are immutable after construction and shared via `Arc`. `prepare` is
/// advisory: it warms per-IP caches so `apply` is cheap, may block on network
/// I/O, and its errors are logged and swallowed by the caller. `apply`
/// returns `true` when the rule matched; whether that means accept or reject
/// is the proxy binding's call.
#[async_trait]
pub trait Rule: fmt::Display + Send + Sync {
    async fn prepare(&self, _entity: &Entity) -> Result<(), RuleError> {
        Ok(())
    }

    async fn apply(&self, entity: &Entity) -> Result<bool, RuleError>;

    /// Whether the rule can only evaluate HTTP entities. Such rules are
    /// refused on non-HTTP proxies at configuration time.
    fn requires_http(&self) -> bool {
        false
    }
}

/// Inverts a rule's `apply`; `prepare` passes through.
pub struct NotRule {
    inner: Arc<dyn Rule>,
}

impl NotRule {
    pub fn new(inner: Arc<dyn Rule>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Rule for NotRule {
    async fn prepare(&self, entity: &Entity) -> Result<(), RuleError> {
        self.inner.prepare(entity).await
    }

    async fn apply(&self, entity: &Entity) -> Result<bool, RuleError> {
        Ok(!self.inner.apply(entity).await?)
    }

    fn requires_http(&self) -> bool {
        self.inner.requires_http()
    }
}

impl fmt::Display for NotRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not ({})", self.inner)
    }
}
