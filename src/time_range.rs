//! Time Range Resolver
//!
//! Turns relative time expressions and plan time windows into explicit
//! `[start, end)` date bounds anchored to a caller-supplied "today".
//! All bounds fall on the first day of a month, so month arithmetic
//! never has to clamp a day-of-month.

use crate::error::{NqlError, Result};
use crate::nql::model::TimeWindow;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open date interval: `start <= d < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start >= end {
            return Err(NqlError::InvalidRange(format!(
                "start {} must be before exclusive end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Same window moved by `delta` months (both bounds).
    pub fn shift_months(&self, delta: i32) -> Result<Self> {
        Self::new(shift_month(self.start, delta)?, shift_month(self.end, delta)?)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Relative range tokens understood by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelativeRange {
    LastYear,
    YearToDate,
    TrailingMonths(i64),
}

impl RelativeRange {
    /// Parse `last_year`, `year_to_date` / `ytd`, or `trailing_<n>_months`.
    pub fn parse(token: &str) -> Result<Self> {
        let token = token.trim().to_lowercase();
        match token.as_str() {
            "last_year" => return Ok(RelativeRange::LastYear),
            "year_to_date" | "ytd" => return Ok(RelativeRange::YearToDate),
            _ => {}
        }
        let count = token
            .strip_prefix("trailing_")
            .and_then(|rest| rest.strip_suffix("_months").or_else(|| rest.strip_suffix("_month")));
        if let Some(count) = count {
            let n: i64 = count
                .parse()
                .map_err(|_| NqlError::InvalidRange(format!("bad month count in '{}'", token)))?;
            return Ok(RelativeRange::TrailingMonths(n));
        }
        Err(NqlError::InvalidRange(format!("unknown relative range '{}'", token)))
    }

    pub fn resolve(&self, anchor: Option<NaiveDate>) -> Result<TimeRange> {
        let anchor = anchor.ok_or_else(|| {
            NqlError::InvalidRange("relative range requested without an anchor date".to_string())
        })?;
        match *self {
            RelativeRange::LastYear => last_year(anchor),
            RelativeRange::YearToDate => year_to_date(anchor),
            RelativeRange::TrailingMonths(n) => trailing_n_months(anchor, n),
        }
    }
}

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// First day of the month `delta` months away from `anchor`'s month.
pub fn shift_month(anchor: NaiveDate, delta: i32) -> Result<NaiveDate> {
    let total = anchor.year() * 12 + anchor.month0() as i32 + delta;
    let year = total.div_euclid(12);
    let month = total.rem_euclid(12) as u32 + 1;
    NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| {
        NqlError::InvalidRange(format!("shifting {} by {} months leaves the calendar", anchor, delta))
    })
}

pub fn next_month(anchor: NaiveDate) -> Result<NaiveDate> {
    shift_month(anchor, 1)
}

/// Same calendar month one year back through the anchor's month (13 months).
pub fn last_year(anchor: NaiveDate) -> Result<TimeRange> {
    TimeRange::new(shift_month(anchor, -12)?, next_month(anchor)?)
}

pub fn year_to_date(anchor: NaiveDate) -> Result<TimeRange> {
    let start = NaiveDate::from_ymd_opt(anchor.year(), 1, 1)
        .ok_or_else(|| NqlError::InvalidRange(format!("no January 1st for {}", anchor)))?;
    TimeRange::new(start, next_month(anchor)?)
}

pub fn trailing_n_months(anchor: NaiveDate, n: i64) -> Result<TimeRange> {
    if n < 0 {
        return Err(NqlError::InvalidRange(format!("negative month count {}", n)));
    }
    let n = i32::try_from(n)
        .map_err(|_| NqlError::InvalidRange(format!("month count {} too large", n)))?;
    TimeRange::new(shift_month(anchor, -n)?, next_month(anchor)?)
}

/// The `n` complete months before the anchor's month.
pub fn complete_months(anchor: NaiveDate, n: i64) -> Result<TimeRange> {
    if n < 1 {
        return Err(NqlError::InvalidRange(format!("relative_months needs n >= 1, got {}", n)));
    }
    let n = i32::try_from(n)
        .map_err(|_| NqlError::InvalidRange(format!("month count {} too large", n)))?;
    let end = month_start(anchor);
    TimeRange::new(shift_month(end, -n)?, end)
}

pub fn is_quarter_start(date: NaiveDate) -> bool {
    date.day() == 1 && date.month0() % 3 == 0
}

/// Resolve a plan time window against `today`.
pub fn resolve_window(window: &TimeWindow, today: NaiveDate) -> Result<TimeRange> {
    match window {
        TimeWindow::SingleMonth(date) => {
            let start = month_start(*date);
            TimeRange::new(start, next_month(start)?)
        }
        TimeWindow::Quarter(start) => {
            if !is_quarter_start(*start) {
                return Err(NqlError::InvalidRange(format!(
                    "quarter window must start on a quarter boundary, got {}",
                    start
                )));
            }
            TimeRange::new(*start, shift_month(*start, 3)?)
        }
        TimeWindow::Absolute { start, end } => TimeRange::new(*start, *end),
        TimeWindow::RelativeMonths(n) => complete_months(today, *n),
        TimeWindow::TrailingMonths(n) => RelativeRange::TrailingMonths(*n).resolve(Some(today)),
        TimeWindow::Ytd => RelativeRange::YearToDate.resolve(Some(today)),
        TimeWindow::LastYear => RelativeRange::LastYear.resolve(Some(today)),
    }
}

/// Length in months of windows that have a fixed month span.
pub fn window_span_months(window: &TimeWindow) -> Option<i32> {
    match window {
        TimeWindow::SingleMonth(_) => Some(1),
        TimeWindow::Quarter(_) => Some(3),
        TimeWindow::RelativeMonths(n) => i32::try_from(*n).ok(),
        _ => None,
    }
}
