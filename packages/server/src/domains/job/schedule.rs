//! Schedule model: recurrence rules and due-time computation.
//!
//! A schedule matches calendar minutes. Due-time evaluation walks backwards
//! from "now" minute-by-minute to the year of the job's last schedule check;
//! the first (most recent) matching minute wins. A match in the past is
//! intended: it means "this should have run then; run it now".

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::error::{ServerError, ServerResult};
use crate::common::types::ArchiveType;

/// Date rule: each component either a concrete value or any (`*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScheduleDate {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
}

impl ScheduleDate {
    pub const ANY: ScheduleDate = ScheduleDate {
        year: None,
        month: None,
        day: None,
    };

    /// Parse `<year|*>-<month|*>-<day|*>`.
    pub fn parse(text: &str) -> ServerResult<Self> {
        let parts: Vec<&str> = text.split('-').collect();
        if parts.len() != 3 {
            return Err(ServerError::ParseDate(text.to_string()));
        }
        let year = parse_component::<i32>(parts[0], 0, 9999)
            .map_err(|_| ServerError::ParseDate(text.to_string()))?;
        let month = parse_component::<u32>(parts[1], 1, 12)
            .map_err(|_| ServerError::ParseDate(text.to_string()))?;
        let day = parse_component::<u32>(parts[2], 1, 31)
            .map_err(|_| ServerError::ParseDate(text.to_string()))?;
        Ok(Self { year, month, day })
    }

    pub fn format(&self) -> String {
        format!(
            "{}-{}-{}",
            self.year.map_or("*".to_string(), |y| y.to_string()),
            self.month.map_or("*".to_string(), |m| format!("{m:02}")),
            self.day.map_or("*".to_string(), |d| format!("{d:02}")),
        )
    }

    fn matches(&self, t: DateTime<Utc>) -> bool {
        self.year.is_none_or(|y| y == t.year())
            && self.month.is_none_or(|m| m == t.month())
            && self.day.is_none_or(|d| d == t.day())
    }
}

/// Weekday rule: a set of days, or any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekDaySet {
    mask: u8,
}

const ALL_DAYS: u8 = 0b0111_1111;
const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

impl Default for WeekDaySet {
    fn default() -> Self {
        Self::ANY
    }
}

impl WeekDaySet {
    pub const ANY: WeekDaySet = WeekDaySet { mask: ALL_DAYS };

    /// Parse `*` or a comma list of `Mon,Tue,…` (case-insensitive).
    pub fn parse(text: &str) -> ServerResult<Self> {
        if text == "*" {
            return Ok(Self::ANY);
        }
        let mut mask = 0u8;
        for name in text.split(',') {
            let index = DAY_NAMES
                .iter()
                .position(|d| d.eq_ignore_ascii_case(name.trim()))
                .ok_or_else(|| ServerError::ParseWeekdays(text.to_string()))?;
            mask |= 1 << index;
        }
        if mask == 0 {
            return Err(ServerError::ParseWeekdays(text.to_string()));
        }
        Ok(Self { mask })
    }

    pub fn format(&self) -> String {
        if self.mask == ALL_DAYS {
            return "*".to_string();
        }
        DAY_NAMES
            .iter()
            .enumerate()
            .filter(|(i, _)| self.mask & (1 << i) != 0)
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.mask & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_any(&self) -> bool {
        self.mask == ALL_DAYS
    }
}

/// Time rule: hour and minute, each concrete or any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScheduleTime {
    pub hour: Option<u32>,
    pub minute: Option<u32>,
}

impl ScheduleTime {
    pub const ANY: ScheduleTime = ScheduleTime {
        hour: None,
        minute: None,
    };

    /// Parse `<hour|*>:<minute|*>`.
    pub fn parse(text: &str) -> ServerResult<Self> {
        let (hour_text, minute_text) = text
            .split_once(':')
            .ok_or_else(|| ServerError::ParseTime(text.to_string()))?;
        let hour = parse_component::<u32>(hour_text, 0, 23)
            .map_err(|_| ServerError::ParseTime(text.to_string()))?;
        let minute = parse_component::<u32>(minute_text, 0, 59)
            .map_err(|_| ServerError::ParseTime(text.to_string()))?;
        Ok(Self { hour, minute })
    }

    pub fn format(&self) -> String {
        format!(
            "{}:{}",
            self.hour.map_or("*".to_string(), |h| format!("{h:02}")),
            self.minute.map_or("*".to_string(), |m| format!("{m:02}")),
        )
    }
}

fn parse_component<T: std::str::FromStr + PartialOrd>(
    text: &str,
    min: T,
    max: T,
) -> Result<Option<T>, ()> {
    if text == "*" {
        return Ok(None);
    }
    let value: T = text.trim().parse().map_err(|_| ())?;
    if value < min || value > max {
        return Err(());
    }
    Ok(Some(value))
}

/// A recurrence rule owned by a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub uuid: Uuid,
    pub date: ScheduleDate,
    pub week_days: WeekDaySet,
    pub time: ScheduleTime,
    pub archive_type: ArchiveType,
    /// Minimum minutes between two continuous runs.
    pub interval_minutes: u32,
    pub custom_text: String,
    pub test_created: bool,
    pub no_storage: bool,
    pub enabled: bool,
    pub last_executed: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn new(archive_type: ArchiveType) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            date: ScheduleDate::ANY,
            week_days: WeekDaySet::ANY,
            time: ScheduleTime::ANY,
            archive_type,
            interval_minutes: 0,
            custom_text: String::new(),
            test_created: false,
            no_storage: false,
            enabled: true,
            last_executed: None,
        }
    }

    fn matches_minute(&self, t: DateTime<Utc>) -> bool {
        let continuous = self.archive_type == ArchiveType::Continuous;
        self.date.matches(t)
            && self.week_days.contains(t.weekday())
            && (continuous || self.time.hour.is_none_or(|h| h == t.hour()))
            && (continuous || self.time.minute.is_none_or(|m| m == t.minute()))
    }
}

/// Floor a timestamp to its minute boundary.
pub fn floor_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(t.timestamp() - t.timestamp() % 60, 0).unwrap()
}

/// Walk backwards from `now` to the start of `earliest_year` and return the
/// most recent minute the schedule should have fired at.
///
/// `has_pending` reports whether the continuous change log holds at least
/// one entry for this schedule; non-continuous types ignore it.
pub fn due_at(
    schedule: &Schedule,
    now: DateTime<Utc>,
    earliest_year: i32,
    has_pending: bool,
) -> Option<DateTime<Utc>> {
    if !schedule.enabled {
        return None;
    }

    let continuous = schedule.archive_type == ArchiveType::Continuous;
    if continuous && !has_pending {
        return None;
    }

    let last_executed = schedule
        .last_executed
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
    let earliest = Utc
        .with_ymd_and_hms(earliest_year, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());

    let mut t = floor_to_minute(now);
    while t >= earliest {
        if t <= last_executed {
            // Nothing older can qualify: every candidate must be after the
            // last execution.
            return None;
        }
        if schedule.matches_minute(t) {
            if !continuous
                || t >= last_executed + Duration::minutes(schedule.interval_minutes as i64)
            {
                return Some(t);
            }
        }
        t -= Duration::minutes(1);
    }
    None
}

/// Walk forward from `now` for up to seven days and return the next future
/// minute the schedule will fire at. Continuous schedules are ignored; they
/// react to the change log, not the calendar.
pub fn next_due_at(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !schedule.enabled || schedule.archive_type == ArchiveType::Continuous {
        return None;
    }

    let horizon = now + Duration::days(7);
    let mut t = floor_to_minute(now) + Duration::minutes(1);
    while t <= horizon {
        if schedule.matches_minute(t) {
            return Some(t);
        }
        t += Duration::minutes(1);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn full_at_0330() -> Schedule {
        let mut schedule = Schedule::new(ArchiveType::Full);
        schedule.time = ScheduleTime {
            hour: Some(3),
            minute: Some(30),
        };
        schedule
    }

    #[test]
    fn test_date_parse_format_round_trip() {
        for text in ["*-*-*", "2024-06-01", "*-12-24", "2024-*-15"] {
            assert_eq!(ScheduleDate::parse(text).unwrap().format(), text);
        }
    }

    #[test]
    fn test_date_parse_rejects_invalid() {
        assert!(ScheduleDate::parse("2024-13-01").is_err());
        assert!(ScheduleDate::parse("2024-06").is_err());
        assert!(ScheduleDate::parse("hello").is_err());
    }

    #[test]
    fn test_time_parse_format_round_trip() {
        for text in ["*:*", "03:30", "23:59", "*:00"] {
            assert_eq!(ScheduleTime::parse(text).unwrap().format(), text);
        }
        assert!(ScheduleTime::parse("24:00").is_err());
        assert!(ScheduleTime::parse("0330").is_err());
    }

    #[test]
    fn test_weekdays_parse_format_round_trip() {
        for text in ["*", "Mon", "Mon,Tue,Fri", "Sat,Sun"] {
            assert_eq!(WeekDaySet::parse(text).unwrap().format(), text);
        }
        assert!(WeekDaySet::parse("Mon,Funday").is_err());
        assert!(WeekDaySet::parse("").is_err());
    }

    #[test]
    fn test_due_fires_at_exact_minute() {
        let schedule = full_at_0330();
        let now = utc(2024, 6, 1, 3, 30);
        assert_eq!(due_at(&schedule, now, 2024, false), Some(now));
    }

    #[test]
    fn test_due_finds_missed_run_in_past() {
        let schedule = full_at_0330();
        // The daemon was busy at 03:30; at 06:12 the run is still due.
        let now = utc(2024, 6, 1, 6, 12);
        assert_eq!(
            due_at(&schedule, now, 2024, false),
            Some(utc(2024, 6, 1, 3, 30))
        );
    }

    #[test]
    fn test_due_respects_last_executed() {
        let mut schedule = full_at_0330();
        schedule.last_executed = Some(utc(2024, 6, 1, 3, 30));
        // One minute later nothing new is due.
        assert_eq!(due_at(&schedule, utc(2024, 6, 1, 3, 31), 2024, false), None);
        // Next day it fires again.
        assert_eq!(
            due_at(&schedule, utc(2024, 6, 2, 3, 30), 2024, false),
            Some(utc(2024, 6, 2, 3, 30))
        );
    }

    #[test]
    fn test_due_weekday_filter() {
        let mut schedule = full_at_0330();
        schedule.week_days = WeekDaySet::parse("Mon").unwrap();
        // 2024-06-01 is a Saturday; the most recent Monday is 05-27.
        assert_eq!(
            due_at(&schedule, utc(2024, 6, 1, 12, 0), 2024, false),
            Some(utc(2024, 5, 27, 3, 30))
        );
    }

    #[test]
    fn test_due_disabled_schedule_never_fires() {
        let mut schedule = full_at_0330();
        schedule.enabled = false;
        assert_eq!(due_at(&schedule, utc(2024, 6, 1, 3, 30), 2024, false), None);
    }

    #[test]
    fn test_continuous_requires_pending_changes() {
        let mut schedule = Schedule::new(ArchiveType::Continuous);
        schedule.interval_minutes = 10;
        schedule.last_executed = Some(utc(2024, 6, 1, 12, 0));

        let now = utc(2024, 6, 1, 12, 30);
        assert_eq!(due_at(&schedule, now, 2024, false), None);
        assert_eq!(due_at(&schedule, now, 2024, true), Some(now));
    }

    #[test]
    fn test_continuous_respects_interval() {
        let mut schedule = Schedule::new(ArchiveType::Continuous);
        schedule.interval_minutes = 60;
        schedule.last_executed = Some(utc(2024, 6, 1, 12, 0));

        // 30 minutes after the last run the interval blocks it.
        assert_eq!(due_at(&schedule, utc(2024, 6, 1, 12, 30), 2024, true), None);
        // At one hour it fires.
        assert_eq!(
            due_at(&schedule, utc(2024, 6, 1, 13, 0), 2024, true),
            Some(utc(2024, 6, 1, 13, 0))
        );
    }

    #[test]
    fn test_continuous_ignores_time_fields() {
        let mut schedule = Schedule::new(ArchiveType::Continuous);
        schedule.time = ScheduleTime {
            hour: Some(3),
            minute: Some(30),
        };
        let now = utc(2024, 6, 1, 17, 45);
        assert_eq!(due_at(&schedule, now, 2024, true), Some(now));
    }

    #[test]
    fn test_next_due_looks_forward() {
        let schedule = full_at_0330();
        let now = utc(2024, 6, 1, 4, 0);
        assert_eq!(next_due_at(&schedule, now), Some(utc(2024, 6, 2, 3, 30)));
    }

    #[test]
    fn test_next_due_gives_up_after_seven_days() {
        let mut schedule = full_at_0330();
        schedule.date = ScheduleDate::parse("2030-01-01").unwrap();
        assert_eq!(next_due_at(&schedule, utc(2024, 6, 1, 0, 0)), None);
    }

    #[test]
    fn test_next_due_ignores_continuous() {
        let schedule = Schedule::new(ArchiveType::Continuous);
        assert_eq!(next_due_at(&schedule, utc(2024, 6, 1, 0, 0)), None);
    }

    #[test]
    fn test_floor_to_minute() {
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 3, 30, 59).unwrap();
        assert_eq!(floor_to_minute(t), utc(2024, 6, 1, 3, 30));
    }
}
