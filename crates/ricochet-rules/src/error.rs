//! Rule engine errors.

use ricochet_core::EntityError;
use ricochet_geo::GeoError;
use ricochet_store::StoreError;

/// Errors raised while building or evaluating rules.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    // construction
    #[error("unknown rule type for \"{rule}\": {token}")]
    UnknownBaseRule { rule: String, token: String },
    #[error("unknown rule wrapper for \"{rule}\": {token}")]
    UnknownWrapper { rule: String, token: String },
    #[error("invalid rule name: {0}")]
    UnknownRuleName(String),
    #[error("invalid rule arguments: {0}")]
    InvalidArgs(String),
    #[error("can't decode params: {0}")]
    Params(#[from] serde_yaml::Error),
    #[error("unknown day of week: {0}")]
    UnknownDayOfWeek(String),
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
    #[error("can't parse time \"{0}\": expected HH:MM")]
    BadTime(String),
    #[error("can't parse regexp: {0}")]
    Regexp(#[from] regex::Error),
    #[error("malleable profile: {0}")]
    Profile(String),
    #[error("unknown transform: {0}")]
    UnknownTransform(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("can't parse ip/subnet \"{0}\"")]
    BadAddr(String),

    // evaluation
    #[error("entity: {0}")]
    Entity(#[from] EntityError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("geolocation: {0}")]
    Geo(#[from] GeoError),
    #[error("reverse lookup: {0}")]
    Resolve(#[from] hickory_resolver::ResolveError),
    #[error("data length is odd or equal zero")]
    OddOrZero,
    #[error("case mismatch")]
    CaseMismatch,
}
