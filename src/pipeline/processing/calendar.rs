use chrono::{Datelike, NaiveDate};
use serde::Serialize;

/// One row of the date dimension
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalendarDay {
    /// `YYYYMMDD` as an integer
    pub date_id: i64,
    pub full_date: NaiveDate,
    pub year: i32,
    pub month: u32,
    pub month_name: String,
    pub day: u32,
    /// ISO week number
    pub week: u32,
}

impl CalendarDay {
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            date_id: i64::from(date.year()) * 10_000 + i64::from(date.month()) * 100 + i64::from(date.day()),
            full_date: date,
            year: date.year(),
            month: date.month(),
            month_name: date.format("%B").to_string(),
            day: date.day(),
            week: date.iso_week().week(),
        }
    }
}

/// Every day from `start` to `end`, both inclusive. Empty if `start > end`.
pub fn calendar_days(start: NaiveDate, end: NaiveDate) -> Vec<CalendarDay> {
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .map(CalendarDay::from_date)
        .collect()
}

/// Pick the calendar span: configured bounds win, gaps are filled from the
/// earliest and latest sale dates.
pub fn calendar_span(
    configured_start: Option<NaiveDate>,
    configured_end: Option<NaiveDate>,
    sale_dates: impl IntoIterator<Item = NaiveDate>,
) -> Option<(NaiveDate, NaiveDate)> {
    let (mut min, mut max) = (None::<NaiveDate>, None::<NaiveDate>);
    for date in sale_dates {
        min = Some(min.map_or(date, |m| m.min(date)));
        max = Some(max.map_or(date, |m| m.max(date)));
    }
    let start = configured_start.or(min)?;
    let end = configured_end.or(max)?;
    Some((start, end))
}
