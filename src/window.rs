// Calendar window arithmetic
// Quota windows and budget periods are anchored to UTC calendar boundaries;
// this module derives window labels and window end instants from a timestamp
//
// Numan Thabit 2025 Nov

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Quota window granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Day,
    Month,
}

impl WindowKind {
    pub const ALL: [WindowKind; 2] = [WindowKind::Day, WindowKind::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Day => "day",
            WindowKind::Month => "month",
        }
    }

    /// Canonical period label, e.g. `2026-10-18` or `2026-10`
    pub fn window_key(&self, ts: DateTime<Utc>) -> String {
        match self {
            WindowKind::Day => ts.format("%Y-%m-%d").to_string(),
            WindowKind::Month => ts.format("%Y-%m").to_string(),
        }
    }

    /// First instant after the window containing `ts`
    pub fn window_end(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            WindowKind::Day => ts
                .date_naive()
                .succ_opt()
                .map(midnight)
                .unwrap_or_else(|| saturating_add(ts, Duration::days(1))),
            WindowKind::Month => {
                let (year, month) = if ts.month() == 12 {
                    (ts.year() + 1, 1)
                } else {
                    (ts.year(), ts.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1)
                    .map(midnight)
                    .unwrap_or_else(|| saturating_add(ts, Duration::days(31)))
            }
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Budget periods are calendar months
pub fn budget_period_id(ts: DateTime<Utc>) -> String {
    WindowKind::Month.window_key(ts)
}

/// `ts + delta`, pinned to the last representable instant instead of
/// overflowing
pub fn saturating_add(ts: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    ts.checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}
