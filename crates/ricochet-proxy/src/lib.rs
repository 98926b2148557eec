//! Proxy frontends: listeners that build entities, run the decision
//! pipeline, and either splice traffic to the hidden target or dispatch the
//! configured reject action.

pub mod dns;
pub mod error;
pub mod http;
pub mod manager;
pub mod pipeline;
pub mod tcp;
pub mod tls;
pub mod udp;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use error::ProxyError;
pub use manager::ProxyManager;
pub use pipeline::{Decision, Pipeline};

/// One running listener.
///
/// `start` binds and spawns the accept loop(s); `shutdown` marks the proxy
/// closing, stops the listeners, and waits for in-flight connections to
/// drain up to the deadline.
#[async_trait]
pub trait Proxy: Send + Sync + fmt::Display {
    async fn start(self: Arc<Self>) -> Result<(), ProxyError>;
    async fn shutdown(&self, deadline: Duration) -> Result<(), ProxyError>;
}
