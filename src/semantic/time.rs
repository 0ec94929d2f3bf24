//! Relative Time Expressions
//!
//! Canonical names (`last_month`, `last_7_days`, ...) resolved against a
//! reference date into half-open `[start, end)` date ranges.

use chrono::{Datelike, Duration, NaiveDate};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref LAST_N_DAYS_RE: Regex =
        Regex::new(r"(?i)^(?:last|past)_(\d{1,4})_days?$").expect("last n days pattern");
    static ref PHRASE_N_DAYS_RE: Regex =
        Regex::new(r"(?i)(?:最近|过去|近)(\d{1,4})天|(?:last|past)\s+(\d{1,4})\s+days?")
            .expect("phrase n days pattern");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelativeTime {
    Today,
    Yesterday,
    ThisWeek,
    ThisMonth,
    LastMonth,
    ThisYear,
    LastYear,
    LastNDays(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    /// Exclusive.
    pub end: NaiveDate,
}

impl DateRange {
    /// Predicate over a date column, e.g. `created_at >= '2024-05-01' AND ...`.
    pub fn to_sql_predicate(&self, column: &str) -> String {
        format!(
            "{col} >= '{}' AND {col} < '{}'",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d"),
            col = column
        )
    }
}

impl RelativeTime {
    /// Parse a canonical glossary target such as `this_month` or
    /// `last_30_days`.
    pub fn parse(canonical: &str) -> Option<Self> {
        let key = canonical.trim().to_lowercase();
        let parsed = match key.as_str() {
            "today" => RelativeTime::Today,
            "yesterday" => RelativeTime::Yesterday,
            "this_week" => RelativeTime::ThisWeek,
            "this_month" => RelativeTime::ThisMonth,
            "last_month" => RelativeTime::LastMonth,
            "this_year" => RelativeTime::ThisYear,
            "last_year" => RelativeTime::LastYear,
            _ => {
                let caps = LAST_N_DAYS_RE.captures(&key)?;
                RelativeTime::LastNDays(caps[1].parse().ok()?)
            }
        };
        Some(parsed)
    }

    /// Inverse of [`RelativeTime::parse`].
    pub fn canonical(&self) -> String {
        match self {
            RelativeTime::Today => "today".to_string(),
            RelativeTime::Yesterday => "yesterday".to_string(),
            RelativeTime::ThisWeek => "this_week".to_string(),
            RelativeTime::ThisMonth => "this_month".to_string(),
            RelativeTime::LastMonth => "last_month".to_string(),
            RelativeTime::ThisYear => "this_year".to_string(),
            RelativeTime::LastYear => "last_year".to_string(),
            RelativeTime::LastNDays(n) => format!("last_{}_days", n),
        }
    }

    /// Find a relative time phrase directly in question text. Used when the
    /// glossary declares none.
    pub fn detect(question: &str) -> Option<Self> {
        if let Some(caps) = PHRASE_N_DAYS_RE.captures(question) {
            let n = caps.get(1).or_else(|| caps.get(2))?.as_str().parse().ok()?;
            return Some(RelativeTime::LastNDays(n));
        }
        let lower = question.to_lowercase();
        const PHRASES: &[(&str, RelativeTime)] = &[
            ("上个月", RelativeTime::LastMonth),
            ("上月", RelativeTime::LastMonth),
            ("last month", RelativeTime::LastMonth),
            ("本月", RelativeTime::ThisMonth),
            ("这个月", RelativeTime::ThisMonth),
            ("this month", RelativeTime::ThisMonth),
            ("本周", RelativeTime::ThisWeek),
            ("this week", RelativeTime::ThisWeek),
            ("去年", RelativeTime::LastYear),
            ("last year", RelativeTime::LastYear),
            ("今年", RelativeTime::ThisYear),
            ("this year", RelativeTime::ThisYear),
            ("昨天", RelativeTime::Yesterday),
            ("yesterday", RelativeTime::Yesterday),
            ("今天", RelativeTime::Today),
            ("today", RelativeTime::Today),
        ];
        PHRASES
            .iter()
            .find(|(phrase, _)| lower.contains(phrase))
            .map(|(_, rt)| *rt)
    }

    pub fn resolve(&self, today: NaiveDate) -> DateRange {
        let tomorrow = today + Duration::days(1);
        match self {
            RelativeTime::Today => DateRange {
                start: today,
                end: tomorrow,
            },
            RelativeTime::Yesterday => DateRange {
                start: today - Duration::days(1),
                end: today,
            },
            RelativeTime::ThisWeek => {
                let offset = today.weekday().num_days_from_monday() as i64;
                DateRange {
                    start: today - Duration::days(offset),
                    end: tomorrow,
                }
            }
            RelativeTime::ThisMonth => DateRange {
                start: first_of_month(today.year(), today.month()),
                end: tomorrow,
            },
            RelativeTime::LastMonth => {
                let this_month = first_of_month(today.year(), today.month());
                let (y, m) = if today.month() == 1 {
                    (today.year() - 1, 12)
                } else {
                    (today.year(), today.month() - 1)
                };
                DateRange {
                    start: first_of_month(y, m),
                    end: this_month,
                }
            }
            RelativeTime::ThisYear => DateRange {
                start: first_of_month(today.year(), 1),
                end: tomorrow,
            },
            RelativeTime::LastYear => DateRange {
                start: first_of_month(today.year() - 1, 1),
                end: first_of_month(today.year(), 1),
            },
            RelativeTime::LastNDays(n) => DateRange {
                start: tomorrow - Duration::days(*n as i64),
                end: tomorrow,
            },
        }
    }
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    // Day 1 exists for every month in chrono's supported year range.
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
}
