use std::fmt::Write;

use chrono::{
    format::{Item, StrftimeItems},
    DateTime, Datelike, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone, Utc,
};

use crate::conditions::Value;

pub(crate) const RFC3339: &str = "%Y-%m-%dT%H:%M:%S%.f%:z";
pub(crate) const RFC822: &str = "%d %b %y %H:%M %Z";
pub(crate) const RFC822Z: &str = "%d %b %y %H:%M %z";
pub(crate) const RFC850: &str = "%A, %d-%b-%y %H:%M:%S %Z";
pub(crate) const RFC1123: &str = "%a, %d %b %Y %H:%M:%S %Z";
pub(crate) const RFC1123Z: &str = "%a, %d %b %Y %H:%M:%S %z";
pub(crate) const DATE_WITH_TZ_FORMAT: &str = "%Y-%m-%d%:z";
pub(crate) const DATE_AND_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";

/// Named format strings resolvable as identifiers in conditions.
pub(crate) const CONSTANTS: &[(&str, &str)] = &[
    ("RFC3339", RFC3339),
    ("RFC822", RFC822),
    ("RFC850", RFC850),
    ("RFC1123", RFC1123),
    ("RFC822Z", RFC822Z),
    ("RFC1123Z", RFC1123Z),
    ("date_with_tz_format", DATE_WITH_TZ_FORMAT),
    ("date_and_time_format", DATE_AND_TIME_FORMAT),
    ("date_format", DATE_FORMAT),
];

pub(crate) fn constant(name: &str) -> Option<&'static str> {
    CONSTANTS
        .iter()
        .find(|(constant, _)| *constant == name)
        .map(|(_, value)| *value)
}

const MILLIS_PER_SECOND: i64 = 1000;

/// Duration helpers return milliseconds so they compose with `now()` and time arithmetic.
pub(crate) fn duration_millis(unit: &str, amount: &Value) -> Option<i64> {
    let seconds_per_unit = match unit {
        "seconds" => 1,
        "minutes" => 60,
        "hours" => 60 * 60,
        "days" => 24 * 60 * 60,
        _ => return None,
    };
    let millis_per_unit = seconds_per_unit * MILLIS_PER_SECOND;
    match amount {
        Value::Int(i) => i.checked_mul(millis_per_unit),
        Value::Float(f) => Some((f * millis_per_unit as f64).round() as i64),
        _ => None,
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn unix_time(unit: &str, amount: i64) -> Option<Value> {
    let millis = match unit {
        "unixTimeNanoseconds" => amount.div_euclid(1_000_000),
        "unixTimeMilliseconds" => amount,
        "unixTimeSeconds" => amount.checked_mul(MILLIS_PER_SECOND)?,
        _ => return None,
    };
    Some(Value::Time(millis))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Zone {
    Local,
    Utc,
    Fixed(FixedOffset),
}

impl Zone {
    /// `Local`, `UTC` or a fixed offset such as `+07:00`. Named regions are not supported.
    pub(crate) fn parse(name: &str) -> Option<Zone> {
        match name {
            "Local" => Some(Zone::Local),
            "UTC" | "Z" => Some(Zone::Utc),
            offset => parse_offset(offset).map(Zone::Fixed),
        }
    }

    fn resolve(self, naive: NaiveDateTime) -> Option<i64> {
        let millis = match self {
            Zone::Local => Local.from_local_datetime(&naive).earliest()?.timestamp_millis(),
            Zone::Utc => naive.and_utc().timestamp_millis(),
            Zone::Fixed(offset) => offset.from_local_datetime(&naive).single()?.timestamp_millis(),
        };
        Some(millis)
    }
}

fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

const SHORTCUT_FORMATS: &[(&str, &str)] = &[
    ("dow_short", "%a"),
    ("dow_long", "%A"),
    ("dom", "%d"),
    ("hod", "%H"),
    ("moh", "%M"),
    ("ampm", "%p"),
    ("month", "%m"),
    ("month_short", "%b"),
    ("month_long", "%B"),
    ("year", "%Y"),
];

/// Format a time for comparison in conditions. The result is an int when the formatted text is
/// a number, a string otherwise, and nil when the format or zone is invalid. Zone defaults to
/// the device's local zone.
pub(crate) fn format_time(millis: i64, format: &str, zone: Option<&str>) -> Value {
    let zone = match zone {
        None | Some("") => Zone::Local,
        Some(name) => match Zone::parse(name) {
            Some(zone) => zone,
            None => return Value::Nil,
        },
    };
    let Some(utc) = DateTime::from_timestamp_millis(millis) else {
        return Value::Nil;
    };

    let formatted = match zone {
        Zone::Local => format_in(utc.with_timezone(&Local), format),
        Zone::Utc => format_in(utc, format),
        Zone::Fixed(offset) => format_in(utc.with_timezone(&offset), format),
    };

    match formatted {
        Some(s) if s.is_empty() => Value::Nil,
        Some(s) => match s.parse::<i64>() {
            Ok(i) => Value::Int(i),
            Err(_) => Value::String(s),
        },
        None => Value::Nil,
    }
}

fn format_in<Tz: TimeZone>(time: DateTime<Tz>, format: &str) -> Option<String>
where
    Tz::Offset: std::fmt::Display,
{
    if format == "dow" {
        return Some(time.weekday().num_days_from_sunday().to_string());
    }
    let format = SHORTCUT_FORMATS
        .iter()
        .find(|(shortcut, _)| *shortcut == format)
        .map_or(format, |(_, strftime)| *strftime);

    let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return None;
    }
    let mut out = String::new();
    write!(out, "{}", time.format_with_items(items.iter())).ok()?;
    Some(out)
}

/// Parse a date string to epoch milliseconds.
///
/// Without a format this accepts RFC 3339 (fractional seconds and offset optional), a date with
/// a zone suffix (`2000-01-29Z`), a date and time without zone, or a bare date. Values without
/// an explicit offset are read in `zone`, which defaults to the local time zone.
pub(crate) fn parse_date(s: &str, format: Option<&str>, zone: Option<&str>) -> Option<i64> {
    let zone = match zone {
        None | Some("") => Zone::Local,
        Some(name) => Zone::parse(name)?,
    };

    match format {
        None | Some("") => parse_any(s, zone),
        Some(RFC3339) => parse_rfc3339(s),
        Some(DATE_WITH_TZ_FORMAT) => parse_date_with_zone(s),
        Some(format) => {
            if let Ok(time) = DateTime::parse_from_str(s, format) {
                return Some(time.timestamp_millis());
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                return zone.resolve(naive);
            }
            let date = NaiveDate::parse_from_str(s, format).ok()?;
            zone.resolve(date.and_hms_opt(0, 0, 0)?)
        }
    }
}

fn parse_any(s: &str, zone: Zone) -> Option<i64> {
    if let Some(millis) = parse_rfc3339(s) {
        return Some(millis);
    }
    if let Some(millis) = parse_date_with_zone(s) {
        return Some(millis);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", DATE_AND_TIME_FORMAT] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return zone.resolve(naive);
        }
    }
    let date = NaiveDate::parse_from_str(s, DATE_FORMAT).ok()?;
    zone.resolve(date.and_hms_opt(0, 0, 0)?)
}

fn parse_rfc3339(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|time| time.timestamp_millis())
}

fn parse_date_with_zone(s: &str) -> Option<i64> {
    let date = NaiveDate::parse_from_str(s.get(..10)?, DATE_FORMAT).ok()?;
    let zone = match s.get(10..)? {
        "Z" => Zone::Utc,
        offset => Zone::Fixed(parse_offset(offset)?),
    };
    zone.resolve(date.and_hms_opt(0, 0, 0)?)
}
