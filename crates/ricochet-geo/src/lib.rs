//! Geolocation provider clients.
//!
//! Two free-tier providers with different field vocabularies. Callers
//! round-robin between them to spread quota; both enforce the same
//! per-request deadline.

pub mod ipapico;
pub mod ipapicom;

use std::time::Duration;

/// Per-call deadline for provider requests.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);

/// Geolocation client error.
#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    /// The queried address is reserved or private; there is no location.
    #[error("reserved ip address")]
    ReservedRange,
    /// Provider answered with an error payload.
    #[error("provider: {0}")]
    Provider(String),
}

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .expect("static client configuration")
}
