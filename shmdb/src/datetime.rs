// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! Calendar helpers for the Date and Time value kinds.
//!
//! Date is a signed day count on chrono's proleptic Gregorian grid
//! (0001-01-01 = day 1); Time is hundredths of a second since midnight.
//! Both fit the inline payload of an encoded word.

use crate::error::{DbError, Result};
use chrono::{Datelike, Local, NaiveDate, NaiveTime, Timelike, Utc};

/// Upper bound (exclusive) of the Time scalar: 24h in centiseconds.
pub const TIME_GRID: i32 = 8_640_000;

pub fn ymd_to_date(year: i32, month: u32, day: u32) -> Result<i32> {
    NaiveDate::from_ymd_opt(year, month, day)
        .map(|d| d.num_days_from_ce())
        .ok_or(DbError::Encode("invalid calendar date"))
}

pub fn date_to_ymd(date: i32) -> Result<(i32, u32, u32)> {
    let d = NaiveDate::from_num_days_from_ce_opt(date)
        .ok_or(DbError::Encode("day count out of range"))?;
    Ok((d.year(), d.month(), d.day()))
}

pub fn hms_to_time(hour: u32, minute: u32, second: u32, centisec: u32) -> Result<i32> {
    if hour > 23 || minute > 59 || second > 59 || centisec > 99 {
        return Err(DbError::Encode("invalid time of day"));
    }
    Ok(((hour * 3600 + minute * 60 + second) * 100 + centisec) as i32)
}

pub fn time_to_hms(time: i32) -> Result<(u32, u32, u32, u32)> {
    if !(0..TIME_GRID).contains(&time) {
        return Err(DbError::Encode("time scalar out of range"));
    }
    let centi = (time % 100) as u32;
    let secs = (time / 100) as u32;
    Ok((secs / 3600, secs / 60 % 60, secs % 60, centi))
}

pub fn current_utc_date() -> i32 {
    Utc::now().date_naive().num_days_from_ce()
}

pub fn current_local_date() -> i32 {
    Local::now().date_naive().num_days_from_ce()
}

fn time_scalar(t: NaiveTime) -> i32 {
    (t.num_seconds_from_midnight() * 100 + t.nanosecond() / 10_000_000) as i32
}

pub fn current_utc_time() -> i32 {
    time_scalar(Utc::now().time())
}

pub fn current_local_time() -> i32 {
    time_scalar(Local::now().time())
}

/// Parse `YYYY-MM-DD` into a Date scalar.
pub fn parse_iso_date(buf: &str) -> Result<i32> {
    NaiveDate::parse_from_str(buf, "%Y-%m-%d")
        .map(|d| d.num_days_from_ce())
        .map_err(|_| DbError::Encode("not an ISO 8601 date"))
}

/// Parse `HH:MM:SS` (with optional fraction) into a Time scalar.
pub fn parse_iso_time(buf: &str) -> Result<i32> {
    NaiveTime::parse_from_str(buf, "%H:%M:%S%.f")
        .map(time_scalar)
        .map_err(|_| DbError::Encode("not an ISO 8601 time"))
}

/// Format a (date, time) pair as `YYYY-MM-DDTHH:MM:SS`.
pub fn format_iso_datetime(date: i32, time: i32) -> Result<String> {
    let (y, mo, d) = date_to_ymd(date)?;
    let (h, mi, s, _) = time_to_hms(time)?;
    Ok(format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ymd_round_trip() {
        let d = ymd_to_date(2024, 2, 29).unwrap();
        assert_eq!((2024, 2, 29), date_to_ymd(d).unwrap());
        // Day 1 of the grid.
        assert_eq!(1, ymd_to_date(1, 1, 1).unwrap());
    }

    #[test]
    fn test_date_rejects_bad_calendar_days() {
        assert!(ymd_to_date(2023, 2, 29).is_err());
        assert!(ymd_to_date(2024, 13, 1).is_err());
    }

    #[test]
    fn test_hms_round_trip() {
        let t = hms_to_time(13, 45, 59, 25).unwrap();
        assert_eq!((13, 45, 59, 25), time_to_hms(t).unwrap());
        assert_eq!(0, hms_to_time(0, 0, 0, 0).unwrap());
        assert_eq!(TIME_GRID - 1, hms_to_time(23, 59, 59, 99).unwrap());
    }

    #[test]
    fn test_iso_parse_and_format() {
        let d = parse_iso_date("1999-12-31").unwrap();
        let t = parse_iso_time("23:59:01").unwrap();
        assert_eq!("1999-12-31T23:59:01", format_iso_datetime(d, t).unwrap());
        assert_eq!(t + 50, parse_iso_time("23:59:01.5").unwrap());
        assert!(parse_iso_date("12/31/1999").is_err());
    }

    #[test]
    fn test_ordering_matches_chronology() {
        assert!(ymd_to_date(2024, 1, 1).unwrap() < ymd_to_date(2024, 1, 2).unwrap());
        assert!(hms_to_time(1, 0, 0, 0).unwrap() < hms_to_time(1, 0, 0, 1).unwrap());
    }
}
