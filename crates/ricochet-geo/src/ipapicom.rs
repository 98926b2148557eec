//! ip-api.com client.

use serde::Deserialize;

use crate::GeoError;

const BASE_URL: &str = "http://ip-api.com/json";

/// Location record as ip-api.com returns it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub country_code: String,
    /// Region code (the provider calls this `region`).
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub region_name: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub isp: String,
    #[serde(default)]
    pub org: String,
    /// `"AS15169 Google LLC"`-style AS description.
    #[serde(default, rename = "as")]
    pub as_desc: String,
}

/// Client for `http://ip-api.com/json/<ip>`.
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
        let mut url = format!("{BASE_URL}/{ip}");
        if let Some(key) = &self.api_key {
            url.push_str("?key=");
            url.push_str(key);
        }

        let location: Location = self.http.get(&url).send().await?.json().await?;

        if location.status == "fail" {
            let reason = location.message.to_lowercase();
            if reason.contains("reserved") || reason.contains("private") {
                return Err(GeoError::ReservedRange);
            }
            return Err(GeoError::Provider(location.message));
        }
        Ok(location)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
