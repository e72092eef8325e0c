//! Calendar arithmetic for challenge periods.
//!
//! Every function is pure: the result depends only on its arguments. Dates are
//! already truncated to day granularity in UTC (see [`truncate_to_day`]).

use time::{Date, Duration, OffsetDateTime, UtcOffset};

use crate::{EngineError, Period};

/// Day-granularity UTC date of an instant.
#[must_use]
pub fn truncate_to_day(instant: OffsetDateTime) -> Date {
    instant.to_offset(UtcOffset::UTC).date()
}

fn ensure_supported(period: Period) -> Result<(), EngineError> {
    match period {
        Period::EveryDay => Ok(()),
        Period::EveryWeek | Period::EveryMonth => Err(EngineError::UnsupportedPeriod(period)),
    }
}

fn shift(date: Date, period: Period, periods: i64) -> Result<Date, EngineError> {
    ensure_supported(period)?;
    date.checked_add(Duration::days(periods))
        .ok_or(EngineError::DateOutOfRange { date, periods })
}

/// Date `n` periods before `date`.
///
/// # Errors
/// Returns [`EngineError::UnsupportedPeriod`] for non-daily periods and
/// [`EngineError::DateOutOfRange`] when the result leaves the calendar range.
pub fn step_back(date: Date, period: Period, n: u32) -> Result<Date, EngineError> {
    shift(date, period, -i64::from(n))
}

/// Date `n` periods after `date`.
///
/// # Errors
/// Same failure modes as [`step_back`].
pub fn step_forward(date: Date, period: Period, n: u32) -> Result<Date, EngineError> {
    shift(date, period, i64::from(n))
}

/// Whether `date` is a boundary of `period`. Every day is a daily boundary.
///
/// # Errors
/// Returns [`EngineError::UnsupportedPeriod`] for non-daily periods.
pub fn is_aligned(_date: Date, period: Period) -> Result<bool, EngineError> {
    ensure_supported(period)?;
    Ok(true)
}

/// Every period boundary in `(from, to]`, ascending. Empty when `to <= from`.
///
/// # Errors
/// Returns [`EngineError::UnsupportedPeriod`] for non-daily periods.
pub fn missing_dates(from: Date, to: Date, period: Period) -> Result<Vec<Date>, EngineError> {
    ensure_supported(period)?;
    let mut dates = Vec::new();
    let mut cursor = from;
    while let Some(next) = cursor.next_day() {
        if next > to {
            break;
        }
        dates.push(next);
        cursor = next;
    }
    Ok(dates)
}

/// The `n` most recent period boundaries at or before `anchor`, oldest first.
///
/// # Errors
/// Same failure modes as [`step_back`].
pub fn backward_list(anchor: Date, period: Period, n: u32) -> Result<Vec<Date>, EngineError> {
    if n == 0 {
        ensure_supported(period)?;
        return Ok(Vec::new());
    }
    let oldest = step_back(anchor, period, n - 1)?;
    let mut dates = vec![oldest];
    dates.extend(missing_dates(oldest, anchor, period)?);
    Ok(dates)
}

/// First and last day of the calendar month containing `date`.
#[must_use]
pub fn month_bounds(date: Date) -> (Date, Date) {
    let first = date.replace_day(1).unwrap_or(date);
    let last = (28..=31).rev().find_map(|day| date.replace_day(day).ok()).unwrap_or(date);
    (first, last)
}
