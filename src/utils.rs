/// Utility functions for timestamps and CSV formatting
use std::borrow::Cow;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time};

const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");
const TIME_FORMAT: &[FormatItem<'static>] = format_description!("[hour]:[minute]:[second]");

/// Marker written to the logs for a field the device did not send
pub const MISSING: &str = "N/A";

/// Capture timestamp for a record decoded right now
///
/// Uses the local clock so log rows line up with the wall time of the
/// recording session; falls back to UTC when the local offset is unknown
/// (the `time` crate refuses to read it from a multi-threaded process on
/// some platforms). Sub-second precision is dropped because the logs only
/// keep `HH:MM:SS`.
pub fn capture_timestamp() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let now = now.replace_nanosecond(0).unwrap_or(now);
    PrimitiveDateTime::new(now.date(), now.time())
}

/// Format a date as YYYY-MM-DD
pub fn format_date(date: Date) -> String {
    date.format(DATE_FORMAT).unwrap_or_else(|_| date.to_string())
}

/// Format a time of day as HH:MM:SS
pub fn format_time(time: Time) -> String {
    time.format(TIME_FORMAT).unwrap_or_else(|_| time.to_string())
}

#[cfg(test)]
pub fn parse_date(text: &str) -> Option<Date> {
    Date::parse(text, DATE_FORMAT).ok()
}

#[cfg(test)]
pub fn parse_time(text: &str) -> Option<Time> {
    Time::parse(text, TIME_FORMAT).ok()
}

/// Render an optional reading as a log cell
pub fn format_value(value: Option<f64>) -> Cow<'static, str> {
    match value {
        Some(v) => Cow::Owned(v.to_string()),
        None => Cow::Borrowed(MISSING),
    }
}

/// Inverse of [`format_value`]. Returns `Err(())` for a cell that is neither
/// a number nor the missing marker.
#[cfg(test)]
pub fn parse_value(cell: &str) -> Result<Option<f64>, ()> {
    let cell = cell.trim();
    if cell == MISSING {
        return Ok(None);
    }
    cell.parse::<f64>().map(Some).map_err(|_| ())
}

/// Quote a CSV field when it contains a separator, quote or line break
pub fn csv_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

/// Join already-rendered cells into one CSV line (without the newline)
pub fn csv_line<'a, I>(cells: I) -> String
where
    I: IntoIterator<Item = Cow<'a, str>>,
{
    cells.into_iter().collect::<Vec<_>>().join(",")
}
