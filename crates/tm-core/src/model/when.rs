//! Deferral and deadline values.
//!
//! A point in time arrives either as an absolute millisecond timestamp or as
//! a local-time tuple (`[y, m, d]` or `[y, m, d, h, min]`). Tuples resolve in
//! the local time zone at the moment they are evaluated, so "deferred until
//! Tuesday" means Tuesday wherever the client runs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};

const MILLIS_PER_DAY: i64 = 86_400_000;

/// A concrete instant, absolute or in local wall-clock terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireWhen", into = "WireWhen")]
pub enum When {
    /// Milliseconds since the Unix epoch.
    At(i64),
    /// Local midnight of a calendar day.
    Date { year: i32, month: u32, day: u32 },
    /// Local wall-clock minute.
    DateTime {
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
    },
}

impl When {
    /// Resolve to milliseconds since the epoch. Tuples that name a
    /// nonexistent local time (bad calendar date, DST gap) resolve to `None`.
    #[must_use]
    pub fn resolve(&self) -> Option<i64> {
        match *self {
            Self::At(ms) => Some(ms),
            Self::Date { year, month, day } => local_millis(year, month, day, 0, 0),
            Self::DateTime {
                year,
                month,
                day,
                hour,
                minute,
            } => local_millis(year, month, day, hour, minute),
        }
    }
}

fn local_millis(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Option<i64> {
    Local
        .with_ymd_and_hms(year, month, day, hour, minute, 0)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// Named holding buckets for deferred tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeferBucket {
    Later,
    Someday,
    Waiting,
}

impl DeferBucket {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Later => "later",
            Self::Someday => "someday",
            Self::Waiting => "waiting",
        }
    }
}

impl fmt::Display for DeferBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeferBucket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "later" => Ok(Self::Later),
            "someday" => Ok(Self::Someday),
            "waiting" => Ok(Self::Waiting),
            other => Err(format!("unknown defer bucket '{other}'")),
        }
    }
}

/// Why a task is hidden from active views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireWhen", into = "WireWhen")]
pub enum Deferral {
    Bucket(DeferBucket),
    Until(When),
}

impl Deferral {
    /// True for any bucket, or for a concrete instant strictly after `now`.
    #[must_use]
    pub fn is_active(&self, now_millis: i64) -> bool {
        match self {
            Self::Bucket(_) => true,
            Self::Until(when) => when.resolve().is_some_and(|at| at > now_millis),
        }
    }

    /// The concrete instant, if this deferral has one.
    #[must_use]
    pub fn until_millis(&self) -> Option<i64> {
        match self {
            Self::Bucket(_) => None,
            Self::Until(when) => when.resolve(),
        }
    }
}

/// Deadline urgency relative to now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeadlineStatus {
    OnTime,
    PushingIt,
    Overdue,
}

/// Classify `deadline_millis` against `now_millis`.
///
/// Overdue once `now >= deadline`. Pushing-it from local midnight of the day
/// `window_days` before the deadline's calendar day.
#[must_use]
pub fn deadline_status(deadline_millis: i64, now_millis: i64, window_days: u32) -> DeadlineStatus {
    if now_millis >= deadline_millis {
        return DeadlineStatus::Overdue;
    }
    let threshold = pushing_it_threshold(deadline_millis, window_days)
        .unwrap_or_else(|| deadline_millis.saturating_sub(i64::from(window_days) * MILLIS_PER_DAY));
    if now_millis >= threshold {
        DeadlineStatus::PushingIt
    } else {
        DeadlineStatus::OnTime
    }
}

fn pushing_it_threshold(deadline_millis: i64, window_days: u32) -> Option<i64> {
    let deadline: DateTime<Local> = Local.timestamp_millis_opt(deadline_millis).single()?;
    let day: NaiveDate = deadline
        .date_naive()
        .checked_sub_signed(Duration::days(i64::from(window_days)))?;
    Local
        .from_local_datetime(&day.and_hms_opt(0, 0, 0)?)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

// ---------------------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------------------

/// JSON shape shared by deadlines and deferrals: a number, a bucket name, or
/// a 3- or 5-element local-time tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WireWhen {
    Millis(i64),
    Named(String),
    Tuple(Vec<i64>),
}

fn tuple_to_when(parts: &[i64]) -> Result<When, String> {
    if parts.len() != 3 && parts.len() != 5 {
        return Err(format!("date tuple must have 3 or 5 elements, got {}", parts.len()));
    }
    let field = |i: usize| -> Result<u32, String> {
        u32::try_from(parts[i]).map_err(|_| format!("negative date component {}", parts[i]))
    };
    let year = i32::try_from(parts[0]).map_err(|_| format!("year out of range: {}", parts[0]))?;
    match parts.len() {
        3 => Ok(When::Date {
            year,
            month: field(1)?,
            day: field(2)?,
        }),
        5 => Ok(When::DateTime {
            year,
            month: field(1)?,
            day: field(2)?,
            hour: field(3)?,
            minute: field(4)?,
        }),
        n => Err(format!("date tuple must have 3 or 5 elements, got {n}")),
    }
}

impl TryFrom<WireWhen> for When {
    type Error = String;

    fn try_from(wire: WireWhen) -> Result<Self, Self::Error> {
        match wire {
            WireWhen::Millis(ms) => Ok(Self::At(ms)),
            WireWhen::Tuple(parts) => tuple_to_when(&parts),
            WireWhen::Named(name) => Err(format!("'{name}' is not a point in time")),
        }
    }
}

impl From<When> for WireWhen {
    fn from(when: When) -> Self {
        match when {
            When::At(ms) => Self::Millis(ms),
            When::Date { year, month, day } => {
                Self::Tuple(vec![i64::from(year), i64::from(month), i64::from(day)])
            }
            When::DateTime {
                year,
                month,
                day,
                hour,
                minute,
            } => Self::Tuple(vec![
                i64::from(year),
                i64::from(month),
                i64::from(day),
                i64::from(hour),
                i64::from(minute),
            ]),
        }
    }
}

impl TryFrom<WireWhen> for Deferral {
    type Error = String;

    fn try_from(wire: WireWhen) -> Result<Self, Self::Error> {
        match wire {
            WireWhen::Named(name) => name.parse().map(Self::Bucket),
            other => When::try_from(other).map(Self::Until),
        }
    }
}

impl From<Deferral> for WireWhen {
    fn from(deferral: Deferral) -> Self {
        match deferral {
            Deferral::Bucket(bucket) => Self::Named(bucket.as_str().to_string()),
            Deferral::Until(when) => when.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_760_000_000_000;

    #[test]
    fn wire_forms_decode() {
        let at: When = serde_json::from_str("1700000000000").unwrap();
        assert_eq!(at, When::At(1_700_000_000_000));

        let date: When = serde_json::from_str("[2026, 3, 14]").unwrap();
        assert_eq!(date, When::Date { year: 2026, month: 3, day: 14 });

        let dt: Deferral = serde_json::from_str("[2026, 3, 14, 9, 30]").unwrap();
        assert_eq!(
            dt,
            Deferral::Until(When::DateTime { year: 2026, month: 3, day: 14, hour: 9, minute: 30 })
        );

        let bucket: Deferral = serde_json::from_str("\"waiting\"").unwrap();
        assert_eq!(bucket, Deferral::Bucket(DeferBucket::Waiting));
    }

    #[test]
    fn malformed_wire_forms_are_rejected() {
        assert!(serde_json::from_str::<When>("\"someday\"").is_err());
        assert!(serde_json::from_str::<When>("[2026, 3]").is_err());
        assert!(serde_json::from_str::<Deferral>("\"tomorrow\"").is_err());
    }

    #[test]
    fn wire_forms_encode() {
        let json = serde_json::to_string(&When::Date { year: 2026, month: 1, day: 2 }).unwrap();
        assert_eq!(json, "[2026,1,2]");
        let json = serde_json::to_string(&Deferral::Bucket(DeferBucket::Someday)).unwrap();
        assert_eq!(json, "\"someday\"");
        let json = serde_json::to_string(&Deferral::Until(When::At(42))).unwrap();
        assert_eq!(json, "42");
    }

    #[test]
    fn invalid_calendar_date_resolves_to_none() {
        assert_eq!(When::Date { year: 2026, month: 2, day: 30 }.resolve(), None);
    }

    #[test]
    fn deferral_activity() {
        assert!(Deferral::Bucket(DeferBucket::Later).is_active(NOW));
        assert!(Deferral::Until(When::At(NOW + 1)).is_active(NOW));
        assert!(!Deferral::Until(When::At(NOW)).is_active(NOW));
        assert!(!Deferral::Until(When::At(NOW - 1)).is_active(NOW));
    }

    #[test]
    fn deadline_classification() {
        let day = MILLIS_PER_DAY;
        assert_eq!(deadline_status(NOW + 10 * day, NOW, 3), DeadlineStatus::OnTime);
        assert_eq!(deadline_status(NOW + 2 * day, NOW, 3), DeadlineStatus::PushingIt);
        assert_eq!(deadline_status(NOW, NOW, 3), DeadlineStatus::Overdue);
        assert_eq!(deadline_status(NOW - day, NOW, 3), DeadlineStatus::Overdue);
    }

    #[test]
    fn extreme_windows_and_instants_do_not_panic() {
        let day = MILLIS_PER_DAY;
        assert_eq!(deadline_status(NOW + day, NOW, u32::MAX), DeadlineStatus::PushingIt);
        assert_eq!(
            deadline_status(i64::MIN + 1, i64::MIN, 3),
            DeadlineStatus::PushingIt
        );
        assert_eq!(deadline_status(i64::MAX, NOW, 0), DeadlineStatus::OnTime);
    }

    #[test]
    fn pushing_it_starts_at_midnight() {
        let deadline = Local.with_ymd_and_hms(2026, 5, 20, 17, 0, 0).earliest().unwrap();
        let window_start = Local.with_ymd_and_hms(2026, 5, 17, 0, 0, 0).earliest().unwrap();
        let just_before = window_start.timestamp_millis() - 1;

        let d = deadline.timestamp_millis();
        assert_eq!(deadline_status(d, just_before, 3), DeadlineStatus::OnTime);
        assert_eq!(
            deadline_status(d, window_start.timestamp_millis(), 3),
            DeadlineStatus::PushingIt
        );
    }
}
