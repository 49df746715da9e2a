use std::str::FromStr;

use chrono::{DateTime, Local, Months, NaiveDate, TimeDelta, TimeZone};

use crate::sync::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Relative span of history ending now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Overall,
    SevenDays,
    OneMonth,
    ThreeMonths,
    SixMonths,
    TwelveMonths,
}

impl Period {
    /// 2001-01-01, local midnight. No scrobble is older.
    pub fn overall_start() -> DateTime<Local> {
        NaiveDate::from_ymd_opt(2001, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .and_then(|dt| Local.from_local_datetime(&dt).earliest())
            .unwrap_or_else(|| {
                DateTime::from_timestamp(978_307_200, 0)
                    .unwrap_or_default()
                    .with_timezone(&Local)
            })
    }

    /// Start of the period when it ends at `now`.
    pub fn start_from(&self, now: DateTime<Local>) -> DateTime<Local> {
        let months = match self {
            Period::Overall => return Self::overall_start(),
            Period::SevenDays => return now - TimeDelta::days(7),
            Period::OneMonth => 1,
            Period::ThreeMonths => 3,
            Period::SixMonths => 6,
            Period::TwelveMonths => 12,
        };
        now.checked_sub_months(Months::new(months))
            .unwrap_or_else(Self::overall_start)
    }
}

impl FromStr for Period {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "overall" => Ok(Period::Overall),
            "7day" => Ok(Period::SevenDays),
            "1month" => Ok(Period::OneMonth),
            "3month" => Ok(Period::ThreeMonths),
            "6month" => Ok(Period::SixMonths),
            "12month" => Ok(Period::TwelveMonths),
            other => Err(SyncError::InvalidRange(format!(
                "unknown period '{}', expected one of overall, 7day, 1month, 3month, 6month, 12month",
                other
            ))),
        }
    }
}
