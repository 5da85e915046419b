//! Conversions between CDX 14-digit timestamps and unix time.
//!
//! "Timestamp" in this crate always means the CDX `YYYYMMDDhhmmss` string
//! convention, never unix seconds. Unix seconds are plain `i64` values.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

const TIMESTAMP_FMT: &str = "%Y%m%d%H%M%S";
const TIMESTAMP_LOW: &str = "19780101000000";
const TIMESTAMP_HIGH: &str = "29991231235959";

// If you ask for Feb we'll pad it to the 28th even in a leap year.
const DAYS_IN_MONTH: [u32; 13] = [0, 31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} and friends are not unix timestamps, use a 14-digit YYYYMMDDhhmmss timestamp")]
    LooksLikeUnixTime(String),
    #[error("cannot parse timestamp {0}, is it a valid cdx timestamp?")]
    BadTimestamp(String),
    #[error("cannot parse {value} as a {what}")]
    BadValue { what: &'static str, value: String },
}

/// Pad a short timestamp down to the earliest instant it could mean.
pub fn pad_timestamp(ts: &str) -> String {
    let mut padded = ts.to_string();
    if ts.len() < TIMESTAMP_LOW.len() {
        padded.push_str(&TIMESTAMP_LOW[ts.len()..]);
    }
    padded
}

/// Pad a short timestamp up to the latest instant it could mean, clamping
/// the day of month to the last valid day (February is always 28).
pub fn pad_timestamp_up(ts: &str) -> Result<String, Error> {
    let mut padded = ts.to_string();
    if ts.len() < TIMESTAMP_HIGH.len() {
        padded.push_str(&TIMESTAMP_HIGH[ts.len()..]);
    }

    let month: usize = padded[4..6]
        .parse()
        .map_err(|_| Error::BadTimestamp(ts.to_string()))?;
    if month == 0 || month > 12 {
        return Err(Error::BadTimestamp(ts.to_string()));
    }
    let day: u32 = padded[6..8]
        .parse()
        .map_err(|_| Error::BadTimestamp(ts.to_string()))?;
    let clamped = day.min(DAYS_IN_MONTH[month]);

    Ok(format!("{}{:02}{}", &padded[..6], clamped, &padded[8..]))
}

/// Parse a (possibly short) CDX timestamp into unix seconds, UTC.
pub fn timestamp_to_time(ts: &str) -> Result<i64, Error> {
    let padded = pad_timestamp(ts);
    match NaiveDateTime::parse_from_str(&padded, TIMESTAMP_FMT) {
        Ok(naive) => Ok(naive.and_utc().timestamp()),
        Err(_) => {
            // A 9- or 10-digit number in the unix range (~1973 to ~2033) is
            // almost certainly someone passing unix seconds by accident.
            if let Ok(v) = ts.parse::<u64>() {
                if (9..=10).contains(&ts.len()) && (100_000_000..2_000_000_000).contains(&v) {
                    return Err(Error::LooksLikeUnixTime(ts.to_string()));
                }
            }
            log::error!("cannot parse timestamp, is it a legal date?: {}", padded);
            Err(Error::BadTimestamp(ts.to_string()))
        }
    }
}

/// Format unix seconds as a 14-digit CDX timestamp, UTC.
pub fn time_to_timestamp(t: i64) -> String {
    match Utc.timestamp_opt(t, 0) {
        chrono::LocalResult::Single(dt) => dt.format(TIMESTAMP_FMT).to_string(),
        _ => TIMESTAMP_LOW.to_string(),
    }
}

/// Reject obviously malformed `from`/`to`/`closest` values before any HTTP.
pub fn validate_timestamp(value: &str) -> Result<(), Error> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::BadTimestamp(value.to_string()));
    }
    Ok(())
}

/// Decode a weekly Common Crawl index name (`YYYY-WW`) to the unix time of
/// the Sunday ending that crawl week. Weeks are numbered with Monday as the
/// first day; week 1 begins on the year's first Monday.
pub fn cc_index_to_time(name: &str) -> Result<i64, Error> {
    let bad = || Error::BadValue {
        what: "crawl week",
        value: name.to_string(),
    };
    let (year_s, week_s) = name.split_once('-').ok_or_else(bad)?;
    let year: i32 = year_s.parse().map_err(|_| bad())?;
    let week: i64 = week_s.parse().map_err(|_| bad())?;

    let jan1 = NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(bad)?;
    let days_to_monday = (8 - jan1.weekday().number_from_monday() as i64) % 7;
    let first_monday = jan1 + Duration::days(days_to_monday);
    let sunday = first_monday + Duration::days((week - 1) * 7 + 6);

    Ok(sunday
        .and_hms_opt(0, 0, 0)
        .ok_or_else(bad)?
        .and_utc()
        .timestamp())
}

/// End-of-data times for the pre-2013 crawls, which don't use week names.
pub fn cc_index_to_time_special(name: &str) -> Option<i64> {
    let ts = match name {
        "2012" => "20121231235959",
        "2009-2010" => "20101231235959",
        "2008-2009" => "20091231235959",
        _ => return None,
    };
    timestamp_to_time(ts).ok()
}

/// Parse an HTTP `Date:`-style header (RFC 2822).
pub fn http_date_to_time(value: &str) -> Result<i64, Error> {
    DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.timestamp())
        .map_err(|_| Error::BadValue {
            what: "http date",
            value: value.to_string(),
        })
}

/// Format unix seconds as the ISO-8601 form WARC headers use.
pub fn time_to_iso_date(t: i64) -> String {
    match Utc.timestamp_opt(t, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        _ => "1970-01-01T00:00:00Z".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding() {
        assert_eq!(pad_timestamp("1998"), "19980101000000");
        assert_eq!(pad_timestamp_up("199802").unwrap(), "19980228235959");
        assert_eq!(pad_timestamp_up("199812").unwrap(), "19981231235959");
        // a fully specified valid day is preserved
        assert_eq!(pad_timestamp_up("19980205112233").unwrap(), "19980205112233");
    }

    #[test]
    fn time_and_timestamp() {
        let tests = [
            ("1978", 252460800),
            ("1999", 915148800),
            ("19981231235959", 915148799),
        ];
        for (ts, t) in tests {
            assert_eq!(timestamp_to_time(ts).unwrap(), t);
            assert_eq!(time_to_timestamp(t), pad_timestamp(ts));
        }

        // invalid day of month
        assert!(matches!(
            timestamp_to_time("19990231"),
            Err(Error::BadTimestamp(_))
        ));
        assert!(matches!(
            timestamp_to_time("1598411009"),
            Err(Error::LooksLikeUnixTime(_))
        ));
        assert!(matches!(timestamp_to_time("x"), Err(Error::BadTimestamp(_))));
    }

    #[test]
    fn validate() {
        assert!(validate_timestamp("asdf").is_err());
        assert!(validate_timestamp("").is_err());
        assert!(validate_timestamp("12345").is_ok());
    }

    #[test]
    fn cc_weeks() {
        // Sundays at the end of the named crawl weeks.
        let tests = [
            ("2013-20", "20130526"),
            ("2017-51", "20171224"),
            ("2018-05", "20180204"),
            ("2018-09", "20180304"),
            ("2018-13", "20180401"),
        ];
        for (name, day) in tests {
            assert_eq!(
                cc_index_to_time(name).unwrap(),
                timestamp_to_time(day).unwrap()
            );
        }
    }

    #[test]
    fn cc_specials() {
        assert_eq!(
            cc_index_to_time_special("2012"),
            Some(timestamp_to_time("20121231235959").unwrap())
        );
        assert!(cc_index_to_time_special("2013-20").is_none());
    }

    #[test]
    fn iso_dates() {
        assert_eq!(time_to_iso_date(915148799), "1998-12-31T23:59:59Z");
        assert_eq!(
            http_date_to_time("Fri, 01 Jan 1999 00:00:00 GMT").unwrap(),
            915148800
        );
    }
}
