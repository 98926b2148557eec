//! Persisted record shapes.
//!
//! Field names and types are fixed: values must round-trip stably across
//! restarts.

use serde::{Deserialize, Serialize};

/// Accept/reject counters for one source IP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub accepts: u64,
    pub rejects: u64,
}

/// Cached geolocation record for one source IP.
///
/// Different providers populate different subsets; empty strings and empty
/// lists mean "unknown". A fully empty record is a valid cache entry (reserved
/// or private addresses resolve to it).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geolocation {
    pub organisations: Vec<String>,
    pub country_code: String,
    pub country: String,
    pub region_code: String,
    pub region: String,
    pub city: String,
    pub timezone: String,
    pub asn: String,
}

/// Cached PTR lookup result for one source IP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseLookup {
    pub domains: Vec<String>,
}
