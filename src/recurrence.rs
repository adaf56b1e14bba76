use std::fmt::{Display, Formatter};
use std::str::FromStr;
use anyhow::{anyhow, bail};
use chrono::{Datelike, Months, NaiveDate, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use crate::impl_sqlx_json_text_type_and_decode;

/// Fixed set of supported schedules, stored as TEXT in the sessions table.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
pub enum RecurrencePattern {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
    Custom,
}
impl Display for RecurrencePattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RecurrencePattern::Daily => f.write_str("daily"),
            RecurrencePattern::Weekly => f.write_str("weekly"),
            RecurrencePattern::Biweekly => f.write_str("biweekly"),
            RecurrencePattern::Monthly => f.write_str("monthly"),
            RecurrencePattern::Custom => f.write_str("custom"),
        }
    }
}
impl FromStr for RecurrencePattern {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(RecurrencePattern::Daily),
            "weekly" => Ok(RecurrencePattern::Weekly),
            "biweekly" => Ok(RecurrencePattern::Biweekly),
            "monthly" => Ok(RecurrencePattern::Monthly),
            "custom" => Ok(RecurrencePattern::Custom),
            _ => Err(anyhow!("Invalid recurrence pattern: {s}")),
        }
    }
}
impl<DB: sqlx::Database> sqlx::Type<DB> for RecurrencePattern
where
    str: sqlx::Type<DB>,
{
    fn type_info() -> <DB as sqlx::Database>::TypeInfo {
        // TEXT columns only
        <&str as sqlx::Type<DB>>::type_info()
    }
}
impl<'r, DB: sqlx::Database> sqlx::Decode<'r, DB> for RecurrencePattern
where
    &'r str: sqlx::Decode<'r, DB>,
{
    fn decode(value: <DB as sqlx::Database>::ValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let value = <&str as sqlx::Decode<DB>>::decode(value)?;
        Ok(Self::from_str(value)?)
    }
}

/// Weekday numbers for the custom pattern, 0=Sunday .. 6=Saturday,
/// stored as a JSON array in the custom_days column.
#[derive(Serialize, Deserialize, PartialEq, Default, Clone, Debug)]
pub struct CustomDays(pub Vec<u8>);
impl_sqlx_json_text_type_and_decode!(CustomDays);

impl CustomDays {
    fn matches(&self, date: NaiveDate) -> bool {
        self.0.contains(&(date.weekday().num_days_from_sunday() as u8))
    }
}

/// Materializes the occurrence instants of one recurring series that fall
/// into [window_start, window_end]. Pure and deterministic, the returned
/// list is strictly increasing and every instant keeps the anchor's
/// time-of-day. An optional repeat_until date bounds the series, inclusive
/// of its own day at the anchor time.
pub fn expand(
    anchor: NaiveDateTime,
    pattern: RecurrencePattern,
    repeat_until: Option<NaiveDate>,
    custom_days: Option<&CustomDays>,
    window_start: NaiveDateTime,
    window_end: NaiveDateTime,
) -> anyhow::Result<Vec<NaiveDateTime>> {
    let cutoff = match repeat_until.map(|d| d.and_time(anchor.time())) {
        Some(series_end) if series_end < window_end => series_end,
        _ => window_end,
    };
    match pattern {
        RecurrencePattern::Daily => Ok(fixed_step(anchor, 1, window_start, cutoff)),
        RecurrencePattern::Weekly => Ok(fixed_step(anchor, 7, window_start, cutoff)),
        RecurrencePattern::Biweekly => Ok(fixed_step(anchor, 14, window_start, cutoff)),
        RecurrencePattern::Monthly => Ok(monthly(anchor, window_start, cutoff)),
        RecurrencePattern::Custom => {
            let Some(days) = custom_days else {
                bail!("Custom recurrence pattern without a weekday set");
            };
            Ok(weekday_set(anchor, days, window_start, cutoff))
        }
    }
}

/// Daily/weekly/biweekly stepping. The initial jump to the window start is
/// closed-form, so a series anchored years in the past costs the same as a
/// fresh one.
fn fixed_step(anchor: NaiveDateTime, interval_days: i64, window_start: NaiveDateTime, cutoff: NaiveDateTime) -> Vec<NaiveDateTime> {
    let mut t = anchor;
    if t < window_start {
        let skipped = (window_start - t).num_days() / interval_days;
        t += TimeDelta::days(skipped * interval_days);
        while t < window_start {
            t += TimeDelta::days(interval_days);
        }
    }
    let mut occurrences = Vec::new();
    while t <= cutoff {
        occurrences.push(t);
        t += TimeDelta::days(interval_days);
    }
    occurrences
}

/// Calendar-month stepping. chrono clamps the day of month, an anchor on
/// Jan 31 lands on Feb 28/29. The month-count jump may undershoot by one,
/// the emit loop skips any leading instants still before the window.
fn monthly(anchor: NaiveDateTime, window_start: NaiveDateTime, cutoff: NaiveDateTime) -> Vec<NaiveDateTime> {
    let mut n: u32 = 0;
    if anchor < window_start {
        let months_apart = (window_start.year() as i64 - anchor.year() as i64) * 12
            + window_start.month() as i64
            - anchor.month() as i64;
        n = months_apart.max(1).saturating_sub(1) as u32;
    }
    let mut occurrences = Vec::new();
    loop {
        let Some(t) = anchor.checked_add_months(Months::new(n)) else {
            break;
        };
        if t > cutoff {
            break;
        }
        if t >= window_start {
            occurrences.push(t);
        }
        n += 1;
    }
    occurrences
}

/// Custom pattern: every date in the window whose weekday is in the set,
/// at the anchor's time-of-day. An empty set yields no occurrences.
fn weekday_set(anchor: NaiveDateTime, days: &CustomDays, window_start: NaiveDateTime, cutoff: NaiveDateTime) -> Vec<NaiveDateTime> {
    let mut occurrences = Vec::new();
    let mut date = window_start.date().max(anchor.date());
    while date.and_time(anchor.time()) <= cutoff {
        if days.matches(date) {
            let t = date.and_time(anchor.time());
            if t >= window_start && t >= anchor {
                occurrences.push(t);
            }
        }
        let Some(next) = date.succ_opt() else { break };
        date = next;
    }
    occurrences
}
