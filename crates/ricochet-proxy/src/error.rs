//! Proxy error types.

use ricochet_config::RejectAction;

/// Errors from proxy construction and runtime.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
    #[error("certificate: {0}")]
    Cert(String),
    #[error("can't find rule \"{rule}\" for proxy \"{proxy}\"")]
    UnknownRule { proxy: String, rule: String },
    #[error("rule \"{rule}\" needs the http surface, proxy \"{proxy}\" is not http")]
    HttpRuleOnly { proxy: String, rule: String },
    #[error("reject action \"{action}\" is not allowed for proxy \"{proxy}\"")]
    ActionNotAllowed {
        proxy: String,
        action: RejectAction,
    },
    #[error("invalid target \"{0}\"")]
    BadTarget(String),
    #[error("invalid reject url \"{0}\"")]
    BadRejectUrl(String),
    #[error("upstream client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("proxy shutdown timeout")]
    ShutdownTimeout,
}
