//! Geolocation rule: enrichment first, match second.
//!
//! Lookups consult the persistent geo cache, then round-robin between two
//! providers (even counter values go to ipapi.co, odd to ip-api.com) so that
//! neither free tier burns alone. Reserved and private addresses cache an
//! empty record so repeated lookups stay local.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use regex::Regex;
use ricochet_config::Globals;
use ricochet_core::Entity;
use ricochet_geo::{ipapico, ipapicom, GeoError};
use ricochet_store::{Geolocation, Store};
use serde::Deserialize;
use tracing::debug;

use crate::error::RuleError;
use crate::list::load_regexps;
use crate::rule::Rule;

#[derive(Debug, Default, Deserialize)]
pub struct GeoGroupParams {
    #[serde(default)]
    pub organisation: Vec<String>,
    #[serde(default)]
    pub country_code: Vec<String>,
    #[serde(default)]
    pub country: Vec<String>,
    #[serde(default)]
    pub region_code: Vec<String>,
    #[serde(default)]
    pub region: Vec<String>,
    #[serde(default)]
    pub city: Vec<String>,
    #[serde(default)]
    pub timezone: Vec<String>,
    #[serde(default)]
    pub asn: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GeoParams {
    /// Optional flat regexp list file, matched against every populated field.
    #[serde(default)]
    pub list: Option<String>,
    /// Field-grouped regexps; a group fires when all its populated fields
    /// match.
    #[serde(default)]
    pub geolocations: Vec<GeoGroupParams>,
}

/// Compiled per-field regexps of one group.
struct GeoGroup {
    organisation: Vec<Regex>,
    country_code: Vec<Regex>,
    country: Vec<Regex>,
    region_code: Vec<Regex>,
    region: Vec<Regex>,
    city: Vec<Regex>,
    timezone: Vec<Regex>,
    asn: Vec<Regex>,
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, RuleError> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(RuleError::from))
        .collect()
}

impl GeoGroup {
    fn from_params(params: &GeoGroupParams) -> Result<Self, RuleError> {
        Ok(Self {
            organisation: compile(&params.organisation)?,
            country_code: compile(&params.country_code)?,
            country: compile(&params.country)?,
            region_code: compile(&params.region_code)?,
            region: compile(&params.region)?,
            city: compile(&params.city)?,
            timezone: compile(&params.timezone)?,
            asn: compile(&params.asn)?,
        })
    }

    /// Pair each field's regexps with the record's values for that field.
    fn fields<'a>(&'a self, geo: &'a Geolocation) -> [(Vec<&'a str>, &'a [Regex]); 8] {
        [
            (
                geo.organisations.iter().map(String::as_str).collect(),
                &self.organisation,
            ),
            (field(&geo.country_code), &self.country_code),
            (field(&geo.country), &self.country),
            (field(&geo.region_code), &self.region_code),
            (field(&geo.region), &self.region),
            (field(&geo.city), &self.city),
            (field(&geo.timezone), &self.timezone),
            (field(&geo.asn), &self.asn),
        ]
    }

    /// All populated fields carrying regexps must match; a group that checks
    /// nothing never fires.
    fn matches(&self, geo: &Geolocation) -> bool {
        let mut checked = false;
        for (values, regexps) in self.fields(geo) {
            if values.is_empty() || regexps.is_empty() {
                continue;
            }
            let hit = regexps
                .iter()
                .any(|re| values.iter().any(|v| re.is_match(v)));
            if !hit {
                return false;
            }
            checked = true;
        }
        checked
    }
}

fn field(value: &str) -> Vec<&str> {
    if value.is_empty() {
        Vec::new()
    } else {
        vec![value]
    }
}

/// Fires when the source's geolocation record matches any group or any flat
/// regexp.
pub struct GeoRule {
    store: Store,
    path: Option<String>,
    list: Vec<Regex>,
    groups: Vec<GeoGroup>,
    counter: AtomicU32,
    ipapi_co: ipapico::Client,
    ip_api_com: ipapicom::Client,
}

impl GeoRule {
    pub fn from_params(
        store: Store,
        params: serde_yaml::Value,
        globals: &Globals,
    ) -> Result<Self, RuleError> {
        let params: GeoParams = serde_yaml::from_value(params)?;

        let list = match &params.list {
            Some(path) => load_regexps(path)?,
            None => Vec::new(),
        };
        let groups = params
            .geolocations
            .iter()
            .map(GeoGroup::from_params)
            .collect::<Result<_, _>>()?;

        let ipapi_co = match &globals.ipapi_co_key {
            Some(key) => ipapico::Client::with_api_key(key),
            None => ipapico::Client::new(),
        };
        let ip_api_com = match &globals.ip_api_com_key {
            Some(key) => ipapicom::Client::with_api_key(key),
            None => ipapicom::Client::new(),
        };

        Ok(Self {
            store,
            path: params.list,
            list,
            groups,
            counter: AtomicU32::new(0),
            ipapi_co,
            ip_api_com,
        })
    }

    async fn geo_info(&self, ip: IpAddr) -> Result<Geolocation, RuleError> {
        if let Some(cached) = self.store.get_geo(ip)? {
            return Ok(cached);
        }

        let ip_str = ip.to_string();
        let result = if self.counter.fetch_add(1, Ordering::Relaxed) % 2 == 0 {
            self.ipapi_co.location(&ip_str).await.map(map_ipapico)
        } else {
            self.ip_api_com.location(&ip_str).await.map(map_ipapicom)
        };

        let geo = match result {
            Ok(geo) => geo,
            // reserved/private address: cache the empty record so the
            // provider is not asked again
            Err(GeoError::ReservedRange) => Geolocation::default(),
            Err(err) => return Err(err.into()),
        };

        debug!(ip = %ip, ?geo, "new geo lookup");
        self.store.put_geo(ip, &geo)?;
        Ok(geo)
    }

    fn matches_flat(&self, geo: &Geolocation) -> bool {
        if self.list.is_empty() {
            return false;
        }
        let mut values: Vec<&str> = geo.organisations.iter().map(String::as_str).collect();
        for v in [
            &geo.country_code,
            &geo.country,
            &geo.region_code,
            &geo.region,
            &geo.city,
            &geo.timezone,
            &geo.asn,
        ] {
            if !v.is_empty() {
                values.push(v);
            }
        }
        self.list
            .iter()
            .any(|re| values.iter().any(|v| re.is_match(v)))
    }
}

fn map_ipapico(location: ipapico::Location) -> Geolocation {
    Geolocation {
        organisations: non_empty(vec![location.org]),
        country_code: location.country,
        country: location.country_name,
        region_code: location.region_code,
        region: location.region,
        city: location.city,
        timezone: location.timezone,
        asn: location.asn,
    }
}

fn map_ipapicom(location: ipapicom::Location) -> Geolocation {
    let asn = location
        .as_desc
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();
    Geolocation {
        organisations: non_empty(vec![location.org, location.isp, location.as_desc.clone()]),
        country_code: location.country_code,
        country: location.country,
        region_code: location.region,
        region: location.region_name,
        city: location.city,
        timezone: location.timezone,
        asn,
    }
}

fn non_empty(values: Vec<String>) -> Vec<String> {
    values.into_iter().filter(|v| !v.is_empty()).collect()
}

#[async_trait]
impl Rule for GeoRule {
    async fn prepare(&self, entity: &Entity) -> Result<(), RuleError> {
        self.geo_info(entity.ip()).await?;
        Ok(())
    }

    async fn apply(&self, entity: &Entity) -> Result<bool, RuleError> {
        let geo = self.geo_info(entity.ip()).await?;
        if self.matches_flat(&geo) {
            debug!(ip = %entity.ip(), "geo regexp match");
            return Ok(true);
        }
        for group in &self.groups {
            if group.matches(&geo) {
                debug!(ip = %entity.ip(), "geo group match");
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl fmt::Display for GeoRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Geo(list={}, geolocations={})",
            self.path.as_deref().unwrap_or("-"),
            self.groups.len()
        )
    }
}
