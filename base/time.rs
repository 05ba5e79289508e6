// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! Time, durations, and recording schedules for the recorder's internal format.

use crate::{bail, err, Error};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while_m_n};
use nom::combinator::{map, map_res, opt};
use nom::sequence::{preceded, tuple};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops;
use std::str::FromStr;

type IResult<'a, I, O> = nom::IResult<I, O, nom::error::VerboseError<&'a str>>;

pub const TIME_UNITS_PER_SEC: i64 = 90_000;

/// The zone to use for all time handling (recording-file day buckets, schedule grids).
///
/// In normal operation this is assigned from `jiff::tz::TimeZone::system()` at
/// startup, but tests set it to a known political time zone instead. It's
/// fixed for the entire run, so `YYYY/MM/DD` directory bucketing stays
/// self-consistent even if the system zone database is reloaded mid-run.
static GLOBAL_ZONE: std::sync::OnceLock<jiff::tz::TimeZone> = std::sync::OnceLock::new();

pub fn init_zone<F: FnOnce() -> jiff::tz::TimeZone>(f: F) {
    GLOBAL_ZONE.get_or_init(f);
}

pub fn global_zone() -> jiff::tz::TimeZone {
    GLOBAL_ZONE
        .get()
        .expect("global zone should be initialized")
        .clone()
}

/// A time specified as 90,000ths of a second since 1970-01-01 00:00:00 UTC.
///
/// Recording and detection timestamps are stored in the database as plain
/// RFC 3339 strings (§3), but the segment writer and ring buffer work in
/// this fixed-point unit internally so that sample-accurate arithmetic
/// (mp4 `stts` deltas, GOP boundaries) never touches floating point.
#[derive(Clone, Copy, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Time(pub i64);

fn fixed_len_num<'a, T: FromStr>(len: usize) -> impl FnMut(&'a str) -> IResult<'a, &'a str, T> {
    map_res(
        take_while_m_n(len, len, |c: char| c.is_ascii_digit()),
        |input: &str| input.parse(),
    )
}

fn parse_datepart(input: &str) -> IResult<&str, (i16, i8, i8)> {
    tuple((
        fixed_len_num(4),
        preceded(tag("-"), fixed_len_num(2)),
        preceded(tag("-"), fixed_len_num(2)),
    ))(input)
}

fn parse_timepart(input: &str) -> IResult<&str, (i8, i8, i8, i32)> {
    let (input, (hr, _, min)) = tuple((fixed_len_num(2), tag(":"), fixed_len_num(2)))(input)?;
    let (input, stuff) = opt(tuple((
        preceded(tag(":"), fixed_len_num(2)),
        opt(preceded(tag(":"), fixed_len_num(5))),
    )))(input)?;
    let (sec, opt_subsec) = stuff.unwrap_or((0, None));
    Ok((input, (hr, min, sec, opt_subsec.unwrap_or(0))))
}

fn parse_zone(input: &str) -> IResult<&str, i32> {
    alt((
        nom::combinator::value(0, tag("Z")),
        map(
            tuple((
                opt(nom::character::complete::one_of(&b"+-"[..])),
                fixed_len_num::<i32>(2),
                tag(":"),
                fixed_len_num::<i32>(2),
            )),
            |(sign, hr, _, min)| {
                let off = hr * 3600 + min * 60;
                if sign == Some('-') {
                    -off
                } else {
                    off
                }
            },
        ),
    ))(input)
}

impl Time {
    pub const MIN: Self = Time(i64::MIN);
    pub const MAX: Self = Time(i64::MAX);

    /// Parses a time as either 90,000ths of a second since epoch or a RFC 3339-like string.
    pub fn parse(input: &str) -> Result<Self, Error> {
        if let Ok(i) = i64::from_str(input) {
            return Ok(Time(i));
        }

        let (remaining, ((tm_year, tm_mon, tm_mday), opt_time, opt_zone)) = tuple((
            parse_datepart,
            opt(preceded(tag("T"), parse_timepart)),
            opt(parse_zone),
        ))(input)
        .map_err(|e| match e {
            nom::Err::Incomplete(_) => err!(InvalidArgument, msg("incomplete")),
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                err!(InvalidArgument, source(nom::error::convert_error(input, e)))
            }
        })?;
        if !remaining.is_empty() {
            bail!(
                InvalidArgument,
                msg("unexpected suffix {remaining:?} following time string")
            );
        }
        let (tm_hour, tm_min, tm_sec, subsec) = opt_time.unwrap_or((0, 0, 0, 0));
        let dt = jiff::civil::DateTime::new(tm_year, tm_mon, tm_mday, tm_hour, tm_min, tm_sec, 0)
            .map_err(|e| err!(InvalidArgument, source(e)))?;
        let tz = if let Some(off) = opt_zone {
            jiff::tz::TimeZone::fixed(jiff::tz::Offset::from_seconds(off).map_err(|e| {
                err!(InvalidArgument, msg("invalid time zone offset"), source(e))
            })?)
        } else {
            global_zone()
        };
        let sec = tz
            .into_ambiguous_zoned(dt)
            .compatible()
            .map_err(|e| err!(InvalidArgument, source(e)))?
            .timestamp()
            .as_second();
        Ok(Time(sec * TIME_UNITS_PER_SEC + i64::from(subsec)))
    }

    pub fn unix_seconds(&self) -> i64 {
        self.0 / TIME_UNITS_PER_SEC
    }
}

impl From<jiff::Timestamp> for Time {
    fn from(tm: jiff::Timestamp) -> Self {
        Time((tm.as_nanosecond() * 9 / 100_000) as i64)
    }
}

impl std::str::FromStr for Time {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl ops::Sub for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl ops::AddAssign<Duration> for Time {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0
    }
}

impl ops::Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl ops::Sub<Duration> for Time {
    type Output = Time;
    fn sub(self, rhs: Duration) -> Time {
        Time(self.0 - rhs.0)
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} /* {} */", self.0, self)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let tm = jiff::Zoned::new(
            jiff::Timestamp::from_second(self.0 / TIME_UNITS_PER_SEC).map_err(|_| fmt::Error)?,
            global_zone(),
        );
        write!(
            f,
            "{}:{:05}{}",
            tm.strftime("%FT%T"),
            self.0 % TIME_UNITS_PER_SEC,
            tm.strftime("%:z"),
        )
    }
}

/// A duration specified in 1/90,000ths of a second.
#[derive(Clone, Copy, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Duration(pub i64);

impl From<Duration> for jiff::SignedDuration {
    fn from(d: Duration) -> Self {
        jiff::SignedDuration::from_nanos(d.0 * 100_000 / 9)
    }
}

impl TryFrom<Duration> for std::time::Duration {
    type Error = std::num::TryFromIntError;

    fn try_from(value: Duration) -> Result<Self, Self::Error> {
        Ok(std::time::Duration::from_nanos(
            u64::try_from(value.0)? * 100_000 / 9,
        ))
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} /* {} */", self.0, self)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut seconds = self.0 / TIME_UNITS_PER_SEC;
        const MINUTE_IN_SECONDS: i64 = 60;
        const HOUR_IN_SECONDS: i64 = 60 * MINUTE_IN_SECONDS;
        const DAY_IN_SECONDS: i64 = 24 * HOUR_IN_SECONDS;
        let days = seconds / DAY_IN_SECONDS;
        seconds %= DAY_IN_SECONDS;
        let hours = seconds / HOUR_IN_SECONDS;
        seconds %= HOUR_IN_SECONDS;
        let minutes = seconds / MINUTE_IN_SECONDS;
        seconds %= MINUTE_IN_SECONDS;
        let mut have_written = if days > 0 {
            write!(f, "{} day{}", days, if days == 1 { "" } else { "s" })?;
            true
        } else {
            false
        };
        if hours > 0 {
            write!(
                f,
                "{}{} hour{}",
                if have_written { " " } else { "" },
                hours,
                if hours == 1 { "" } else { "s" }
            )?;
            have_written = true;
        }
        if minutes > 0 {
            write!(
                f,
                "{}{} minute{}",
                if have_written { " " } else { "" },
                minutes,
                if minutes == 1 { "" } else { "s" }
            )?;
            have_written = true;
        }
        if seconds > 0 || !have_written {
            write!(
                f,
                "{}{} second{}",
                if have_written { " " } else { "" },
                seconds,
                if seconds == 1 { "" } else { "s" }
            )?;
        }
        Ok(())
    }
}

impl std::convert::TryFrom<std::time::Duration> for Duration {
    type Error = std::num::TryFromIntError;

    fn try_from(value: std::time::Duration) -> Result<Self, Self::Error> {
        Ok(Self(i64::try_from(value.as_nanos() * 9 / 100_000)?))
    }
}

impl ops::Mul<i64> for Duration {
    type Output = Self;
    fn mul(self, rhs: i64) -> Self::Output {
        Duration(self.0 * rhs)
    }
}

impl std::ops::Neg for Duration {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Duration(-self.0)
    }
}

impl ops::Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl ops::AddAssign for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0
    }
}

impl ops::SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Duration) {
        self.0 -= rhs.0
    }
}

/// One entry of a recording schedule: the days and minute-of-day windows it
/// covers, optionally evaluated in a fixed UTC offset rather than the
/// process-wide zone (so a schedule written for one site's local hours stays
/// correct if the recorder itself runs in a different zone).
#[derive(Clone, Debug, Eq, PartialEq)]
struct ScheduleGridEntry {
    days: [bool; 7],
    windows: Vec<(u32, u32)>, // minutes-since-midnight, [start, end)
    tz_offset_minutes: Option<i32>,
}

impl ScheduleGridEntry {
    fn contains(&self, zoned: &jiff::Zoned) -> bool {
        let local = match self.tz_offset_minutes {
            Some(m) => match jiff::tz::Offset::from_seconds(m * 60) {
                Ok(off) => zoned
                    .timestamp()
                    .to_zoned(jiff::tz::TimeZone::fixed(off)),
                Err(_) => return false,
            },
            None => zoned.clone(),
        };
        let weekday_idx = local.weekday().to_monday_zero_offset() as usize;
        if !self.days[weekday_idx] {
            return false;
        }
        let minutes = local.hour() as u32 * 60 + local.minute() as u32;
        self.windows.iter().any(|&(s, e)| minutes >= s && minutes < e)
    }
}

/// A union of one or more [`ScheduleGridEntry`] values, used by a recording
/// schedule (§4.E `Stream.schedule`) to decide whether the controller should
/// be armed at a given wall-clock moment.
///
/// Grammar: one or more `;`-separated entries, each
/// `DAY_MASK HH:MM-HH:MM[,HH:MM-HH:MM...] [tz-offset-minutes]`, where
/// `DAY_MASK` is seven characters of `.` or a day letter (`MTWRFSU`, Monday
/// first) marking which days of the week the windows apply to, e.g.
/// `MTWRF.. 08:00-18:00` for weekday business hours. An all-day schedule is
/// `MTWRFSU 00:00-24:00`. An active minute is the union of every entry;
/// overlapping entries (including across the `;` separator) are OR'd. The
/// optional trailing `tz-offset-minutes` evaluates that entry's day/window
/// match in a fixed UTC offset instead of the recorder's local zone.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScheduleGrid {
    entries: Vec<ScheduleGridEntry>,
}

const DAY_LETTERS: [u8; 7] = [b'M', b'T', b'W', b'R', b'F', b'S', b'U'];

impl ScheduleGrid {
    /// A schedule that is always active; used when a stream has no `schedule` set.
    pub fn always() -> Self {
        ScheduleGrid {
            entries: vec![ScheduleGridEntry {
                days: [true; 7],
                windows: vec![(0, 24 * 60)],
                tz_offset_minutes: None,
            }],
        }
    }

    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut entries = Vec::new();
        for entry_str in input.split(';') {
            let entry_str = entry_str.trim();
            if entry_str.is_empty() {
                bail!(InvalidArgument, msg("schedule {input:?} has an empty entry"));
            }
            entries.push(parse_entry(entry_str)?);
        }
        if entries.is_empty() {
            bail!(InvalidArgument, msg("empty schedule"));
        }
        Ok(ScheduleGrid { entries })
    }

    /// Returns whether the schedule is active at the given local time.
    pub fn contains(&self, zoned: &jiff::Zoned) -> bool {
        self.entries.iter().any(|e| e.contains(zoned))
    }
}

fn parse_entry(input: &str) -> Result<ScheduleGridEntry, Error> {
    let mut parts = input.split_ascii_whitespace();
    let mask = parts
        .next()
        .ok_or_else(|| err!(InvalidArgument, msg("empty schedule entry")))?;
    if mask.len() != 7 {
        bail!(
            InvalidArgument,
            msg("day mask {mask:?} must be exactly 7 characters")
        );
    }
    let mut days = [false; 7];
    for (i, b) in mask.bytes().enumerate() {
        days[i] = if b == b'.' {
            false
        } else if b == DAY_LETTERS[i] {
            true
        } else {
            bail!(
                InvalidArgument,
                msg("day mask byte {i} must be '.' or {:?}", DAY_LETTERS[i] as char)
            );
        };
    }
    let windows_str = parts
        .next()
        .ok_or_else(|| err!(InvalidArgument, msg("schedule entry missing time windows")))?;
    let tz_offset_minutes = match parts.next() {
        Some(tok) => Some(
            tok.parse::<i32>()
                .map_err(|e| err!(InvalidArgument, msg("bad tz-offset-minutes {tok:?}"), source(e)))?,
        ),
        None => None,
    };
    if parts.next().is_some() {
        bail!(InvalidArgument, msg("schedule entry {input:?} has too many fields"));
    }
    let mut windows = Vec::new();
    for w in windows_str.split(',') {
        let (start, end) = w
            .split_once('-')
            .ok_or_else(|| err!(InvalidArgument, msg("window {w:?} missing '-'")))?;
        let start = parse_hhmm(start)?;
        let end = parse_hhmm_end(end)?;
        if end <= start {
            bail!(InvalidArgument, msg("window {w:?} end must be after start"));
        }
        windows.push((start, end));
    }
    if windows.is_empty() {
        bail!(InvalidArgument, msg("schedule entry {input:?} has no windows"));
    }
    Ok(ScheduleGridEntry {
        days,
        windows,
        tz_offset_minutes,
    })
}

fn parse_hhmm(s: &str) -> Result<u32, Error> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| err!(InvalidArgument, msg("time {s:?} missing ':'")))?;
    let h: u32 = h
        .parse()
        .map_err(|e| err!(InvalidArgument, msg("bad hour in {s:?}"), source(e)))?;
    let m: u32 = m
        .parse()
        .map_err(|e| err!(InvalidArgument, msg("bad minute in {s:?}"), source(e)))?;
    if h > 23 || m > 59 {
        bail!(InvalidArgument, msg("time {s:?} out of range"));
    }
    Ok(h * 60 + m)
}

/// Like `parse_hhmm`, but allows `24:00` as an end-of-day sentinel.
fn parse_hhmm_end(s: &str) -> Result<u32, Error> {
    if s == "24:00" {
        return Ok(24 * 60);
    }
    parse_hhmm(s)
}

pub mod testutil {
    pub fn init_zone() {
        super::init_zone(|| {
            jiff::tz::TimeZone::get("America/Los_Angeles")
                .expect("America/Los_Angeles should exist")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Duration, ScheduleGrid, Time, TIME_UNITS_PER_SEC};
    use std::convert::TryFrom;

    #[test]
    fn test_parse_time() {
        super::testutil::init_zone();
        #[rustfmt::skip]
        let tests = &[
            ("2006-01-02T15:04:05-07:00",       102261550050000),
            ("2006-01-02T15:04:05:00001-07:00", 102261550050001),
            ("2006-01-02T15:04:05-08:00",       102261874050000),
            ("2006-01-02T15:04:05",             102261874050000), // implied -08:00
            ("2006-01-02T15:04",                102261873600000), // implied -08:00
            ("2006-01-02T15:04:05:00001",       102261874050001), // implied -08:00
            ("2006-01-02T15:04:05-00:00",       102259282050000),
            ("2006-01-02T15:04:05Z",            102259282050000),
            ("2006-01-02-08:00",                102256992000000), // implied -08:00
            ("2006-01-02",                      102256992000000), // implied -08:00
            ("2006-01-02Z",                     102254400000000),
            ("102261550050000",                 102261550050000),
        ];
        for test in tests {
            assert_eq!(test.1, Time::parse(test.0).unwrap().0, "parsing {}", test.0);
        }
    }

    #[test]
    fn test_display_duration() {
        let tests = &[
            ("0 seconds", 0),
            ("1 second", 1),
            ("1 minute", 60),
            ("1 minute 1 second", 61),
            ("2 minutes", 120),
            ("1 hour", 3600),
            ("1 hour 1 minute", 3660),
            ("2 hours", 7200),
            ("1 day", 86400),
            ("1 day 1 hour", 86400 + 3600),
            ("2 days", 2 * 86400),
        ];
        for test in tests {
            assert_eq!(test.0, format!("{}", Duration(test.1 * TIME_UNITS_PER_SEC)));
        }
    }

    #[test]
    fn test_duration_from_std_duration() {
        assert_eq!(
            Duration::try_from(std::time::Duration::new(1, 11111)),
            Ok(Duration(90_000))
        );
        Duration::try_from(std::time::Duration::new(u64::MAX, 0)).unwrap_err();
    }

    #[test]
    fn schedule_always() {
        super::testutil::init_zone();
        let g = ScheduleGrid::always();
        let z = jiff::Timestamp::from_second(0)
            .unwrap()
            .to_zoned(super::global_zone());
        assert!(g.contains(&z));
    }

    #[test]
    fn schedule_business_hours() {
        let g = ScheduleGrid::parse("MTWRF.. 08:00-18:00").unwrap();
        let tz = jiff::tz::TimeZone::fixed(jiff::tz::Offset::from_seconds(0).unwrap());
        // 2024-01-01 is a Monday.
        let noon = jiff::civil::date(2024, 1, 1)
            .at(12, 0, 0, 0)
            .to_zoned(tz.clone())
            .unwrap();
        assert!(g.contains(&noon));
        let midnight = jiff::civil::date(2024, 1, 1)
            .at(0, 0, 0, 0)
            .to_zoned(tz.clone())
            .unwrap();
        assert!(!g.contains(&midnight));
        // 2024-01-06 is a Saturday.
        let saturday_noon = jiff::civil::date(2024, 1, 6)
            .at(12, 0, 0, 0)
            .to_zoned(tz)
            .unwrap();
        assert!(!g.contains(&saturday_noon));
    }

    #[test]
    fn schedule_rejects_bad_mask() {
        ScheduleGrid::parse("XTWRFSU 00:00-24:00").unwrap_err();
        ScheduleGrid::parse("MTWRFSU 24:00-00:00").unwrap_err();
        ScheduleGrid::parse("MTWRFSU").unwrap_err();
    }

    #[test]
    fn schedule_unions_multiple_entries() {
        // Weekday mornings plus weekend afternoons; an active minute is the
        // union of both entries.
        let g = ScheduleGrid::parse("MTWRF.. 06:00-09:00;.....SU 13:00-18:00").unwrap();
        let tz = jiff::tz::TimeZone::fixed(jiff::tz::Offset::from_seconds(0).unwrap());
        // 2024-01-01 is a Monday.
        let monday_morning = jiff::civil::date(2024, 1, 1).at(7, 0, 0, 0).to_zoned(tz.clone()).unwrap();
        assert!(g.contains(&monday_morning));
        let monday_afternoon = jiff::civil::date(2024, 1, 1).at(14, 0, 0, 0).to_zoned(tz.clone()).unwrap();
        assert!(!g.contains(&monday_afternoon));
        // 2024-01-06 is a Saturday.
        let saturday_afternoon = jiff::civil::date(2024, 1, 6).at(14, 0, 0, 0).to_zoned(tz).unwrap();
        assert!(g.contains(&saturday_afternoon));
    }

    #[test]
    fn schedule_entry_tz_offset_is_independent_of_local_zone() {
        // Entry is written for UTC+09:00 business hours; evaluated against a
        // UTC instant that's morning in that offset but still the prior
        // evening in UTC.
        let g = ScheduleGrid::parse("MTWRFSU 09:00-17:00 540").unwrap();
        let utc = jiff::tz::TimeZone::fixed(jiff::tz::Offset::from_seconds(0).unwrap());
        // 2024-01-01 00:30 UTC == 2024-01-01 09:30 at UTC+09:00.
        let z = jiff::civil::date(2024, 1, 1).at(0, 30, 0, 0).to_zoned(utc).unwrap();
        assert!(g.contains(&z));
    }

    #[test]
    fn schedule_rejects_empty_entry() {
        ScheduleGrid::parse("MTWRFSU 00:00-24:00;").unwrap_err();
        ScheduleGrid::parse("MTWRFSU 00:00-24:00 not-a-number").unwrap_err();
    }
}
