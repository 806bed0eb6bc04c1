//! Cached values served by the CC info timer.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Reporting window a client asks about
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum TimeRange {
    #[default]
    Today,
    Week,
    Month,
}

impl TimeRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRange::Today => "today",
            TimeRange::Week => "week",
            TimeRange::Month => "month",
        }
    }

    /// Parse a client-supplied range; missing or unknown values mean `today`
    pub fn parse_or_default(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("week") => TimeRange::Week,
            Some("month") => TimeRange::Month,
            _ => TimeRange::Today,
        }
    }

    /// Window from the start of this range until now
    pub fn window(&self) -> TimeWindow {
        self.window_at(Local::now())
    }

    /// Window from the start of this range until `now`.
    ///
    /// `today` starts at local midnight, `week` on Monday, `month` on the 1st.
    pub fn window_at(&self, now: DateTime<Local>) -> TimeWindow {
        let today = now.date_naive();
        let start_date = match self {
            TimeRange::Today => today,
            TimeRange::Week => {
                today - ChronoDuration::days(i64::from(now.weekday().num_days_from_monday()))
            }
            TimeRange::Month => today.with_day(1).unwrap_or(today),
        };
        TimeWindow {
            since: local_midnight(start_date).unwrap_or(now),
            until: now,
        }
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local midnight of `date`; the earliest instant if DST makes it ambiguous
fn local_midnight(date: NaiveDate) -> Option<DateTime<Local>> {
    let naive = date.and_hms_opt(0, 0, 0)?;
    Local.from_local_datetime(&naive).earliest()
}

/// Half-open time window sent to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub since: DateTime<Local>,
    pub until: DateTime<Local>,
}

impl TimeWindow {
    pub fn since_rfc3339(&self) -> String {
        self.since.to_rfc3339()
    }

    pub fn until_rfc3339(&self) -> String {
        self.until.to_rfc3339()
    }
}

/// Cached cost for one time range
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CcInfoCache {
    pub total_cost_usd: f64,
    pub total_session_seconds: i64,
    /// `None` until the first successful fetch
    pub fetched_at: Option<DateTime<Utc>>,
}

impl CcInfoCache {
    /// Fetch time, or the Unix epoch when never fetched
    pub fn cached_at(&self) -> DateTime<Utc> {
        self.fetched_at.unwrap_or_default()
    }
}

/// Anthropic subscription utilisation windows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnthropicRateLimitData {
    pub five_hour_utilization: f64,
    pub five_hour_resets_at: Option<String>,
    pub seven_day_utilization: f64,
    pub seven_day_resets_at: Option<String>,
}
