//! ipapi.co client.

use serde::Deserialize;

use crate::GeoError;

const BASE_URL: &str = "https://ipapi.co";

/// Location record as ipapi.co returns it. Only the fields the matcher
/// consumes are kept.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub region_code: String,
    /// Two-letter country code (the provider calls this `country`).
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub country_name: String,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub asn: String,
    #[serde(default)]
    pub org: String,
    #[serde(default, rename = "error")]
    pub is_error: bool,
    #[serde(default)]
    pub reason: String,
}

/// Client for `https://ipapi.co/<ip>/json/`.
#[derive(Debug, Clone)]
pub struct Client {
    api_key: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new() -> Self {
        Self {
            api_key: None,
            http: crate::http_client(),
        }
    }

    pub fn with_api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            http: crate::http_client(),
        }
    }

    /// Look up the location for an IP.
    ///
    /// Reserved/private addresses come back as [`GeoError::ReservedRange`].
    pub async fn location(&self, ip: &str) -> Result<Location, GeoError> {
        let mut url = format!("{BASE_URL}/{ip}/json/");
        if let Some(key) = &self.api_key {
            url.push_str("?key=");
            url.push_str(key);
        }

        let response = self
            .http
            .get(&url)
            // the provider 403s the default client user-agent
            .header(reqwest::header::USER_AGENT, "ipapi.co/#go")
            .send()
            .await?;

        let status = response.status();
        let location: Location = response.json().await?;

        if !status.is_success() || location.is_error {
            if location.reason.to_lowercase().contains("reserved") {
                return Err(GeoError::ReservedRange);
            }
            return Err(GeoError::Provider(location.reason));
        }
        Ok(location)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
