//! Working-hours window rule.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use ricochet_core::Entity;
use serde::Deserialize;

use crate::error::RuleError;
use crate::rule::Rule;

#[derive(Debug, Deserialize)]
pub struct TimeParams {
    /// Window start, `HH:MM` in `timezone`.
    pub from: String,
    /// Window end, `HH:MM` in `timezone`.
    pub to: String,
    pub timezone: String,
    /// Full weekday names. Empty means every day.
    #[serde(default)]
    pub weekdays: Vec<String>,
}

/// Fires when the current local time falls inside the configured window on a
/// configured weekday. Windows with `from > to` cross midnight.
pub struct TimeRule {
    from: NaiveTime,
    to: NaiveTime,
    tz: Tz,
    weekdays: HashSet<Weekday>,
}

const ALL_WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

fn parse_weekday(name: &str) -> Result<Weekday, RuleError> {
    match name {
        "Monday" => Ok(Weekday::Mon),
        "Tuesday" => Ok(Weekday::Tue),
        "Wednesday" => Ok(Weekday::Wed),
        "Thursday" => Ok(Weekday::Thu),
        "Friday" => Ok(Weekday::Fri),
        "Saturday" => Ok(Weekday::Sat),
        "Sunday" => Ok(Weekday::Sun),
        other => Err(RuleError::UnknownDayOfWeek(other.to_string())),
    }
}

fn parse_hhmm(value: &str) -> Result<NaiveTime, RuleError> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| RuleError::BadTime(value.to_string()))
}

impl TimeRule {
    pub fn from_params(params: serde_yaml::Value) -> Result<Self, RuleError> {
        let params: TimeParams = serde_yaml::from_value(params)?;
        let tz: Tz = params
            .timezone
            .parse()
            .map_err(|_| RuleError::UnknownTimezone(params.timezone.clone()))?;

        let weekdays = if params.weekdays.is_empty() {
            ALL_WEEKDAYS.into_iter().collect()
        } else {
            params
                .weekdays
                .iter()
                .map(|d| parse_weekday(d))
                .collect::<Result<_, _>>()?
        };

        Ok(Self {
            from: parse_hhmm(&params.from)?,
            to: parse_hhmm(&params.to)?,
            tz,
            weekdays,
        })
    }

    fn fires_at(&self, now: DateTime<Tz>) -> bool {
        if !self.weekdays.contains(&now.weekday()) {
            return false;
        }
        // minute resolution, boundaries inclusive
        let t = NaiveTime::from_hms_opt(now.hour(), now.minute(), 0).unwrap_or(self.from);
        let outside = if self.from < self.to {
            t < self.from || t > self.to
        } else if self.from > self.to {
            t < self.from && t > self.to
        } else {
            false
        };
        !outside
    }
}

#[async_trait]
impl Rule for TimeRule {
    async fn apply(&self, _entity: &Entity) -> Result<bool, RuleError> {
        Ok(self.fires_at(Utc::now().with_timezone(&self.tz)))
    }
}

impl fmt::Display for TimeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Time(from={}, to={}, timezone={})",
            self.from.format("%H:%M"),
            self.to.format("%H:%M"),
            self.tz
        )
    }
}
