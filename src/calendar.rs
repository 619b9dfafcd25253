//! Occurrence source: recurrence expressions and the instants they produce.
//!
//! [`RecurrenceSpec`] is the seam the trigger compilers work against. [`CalendarEvent`]
//! is the concrete implementation, built on the `cron` crate. It accepts:
//!
//! | Form                         | Example                    |
//! |------------------------------|----------------------------|
//! | ISO date or date-time        | `2024-05-01 04:30`         |
//! | `[weekdays] [Y-M-D] H:M[:S]` | `Sat,Sun 0,12:00`          |
//! | shorthand keyword            | `daily`, `hourly`          |
//! | 5, 6 or 7 field cron         | `0 3 * * *`                |

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, TimeZone, Weekday};
use cron::{Schedule, TimeUnitSpec};

use crate::error::{Result, ScheduleError};

/// Calendar field a recurrence can be restricted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    DayOfMonth,
    Month,
    /// 0 = Sunday .. 6 = Saturday
    Weekday,
}

pub trait RecurrenceSpec {
    /// The raw expression, as written by the user.
    fn expression(&self) -> &str;

    /// First occurrence strictly after `after`.
    fn next(&self, after: DateTime<Local>) -> Option<DateTime<Local>>;

    /// All occurrences in `[start, end)`, strictly increasing.
    fn occurrences_between(&self, start: DateTime<Local>, end: DateTime<Local>) -> Vec<DateTime<Local>>;

    /// The instant, when the expression denotes a single non-repeating point in time.
    fn as_single_instant(&self) -> Option<DateTime<Local>>;

    /// Values allowed for `unit`, or `None` when every value is allowed.
    fn constraint(&self, unit: TimeUnit) -> Option<Vec<u32>>;

    /// True when the expression pins specific years.
    fn restricts_year(&self) -> bool;

    fn weekdays(&self) -> Option<Vec<Weekday>> {
        self.constraint(TimeUnit::Weekday)
            .map(|days| days.into_iter().filter_map(weekday_from_sunday0).collect())
    }

    fn months(&self) -> Option<Vec<u32>> {
        self.constraint(TimeUnit::Month)
    }

    fn days_of_month(&self) -> Option<Vec<u32>> {
        self.constraint(TimeUnit::DayOfMonth)
    }
}

fn weekday_from_sunday0(value: u32) -> Option<Weekday> {
    match value {
        0 => Some(Weekday::Sun),
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        _ => None,
    }
}

#[derive(Debug, Clone)]
enum EventKind {
    Once(DateTime<Local>),
    Recurring {
        schedule: Box<Schedule>,
        year_field: String,
    },
}

/// A parsed recurrence expression.
#[derive(Debug, Clone)]
pub struct CalendarEvent {
    expression: String,
    kind: EventKind,
}

impl CalendarEvent {
    pub fn parse(expression: &str) -> Result<Self> {
        expression.parse()
    }
}

impl fmt::Display for CalendarEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl FromStr for CalendarEvent {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self> {
        let expression = s.trim();
        let invalid = |reason: String| ScheduleError::InvalidSchedule {
            expression: expression.to_string(),
            reason,
        };

        if expression.is_empty() {
            return Err(invalid("empty schedule".to_string()));
        }

        if let Some(at) = parse_instant(expression) {
            return Ok(Self {
                expression: expression.to_string(),
                kind: EventKind::Once(at),
            });
        }

        let cron_expr = to_cron_expression(expression).map_err(invalid)?;
        let schedule = Schedule::from_str(&cron_expr).map_err(|e| invalid(e.to_string()))?;
        let year_field = cron_expr
            .split_whitespace()
            .nth(6)
            .unwrap_or("*")
            .to_string();

        Ok(Self {
            expression: expression.to_string(),
            kind: EventKind::Recurring {
                schedule: Box::new(schedule),
                year_field,
            },
        })
    }
}

/// `None` when the field allows all `$all` values.
macro_rules! restricted {
    ($field:expr, $all:expr) => {{
        let field = $field;
        if field.count() >= $all {
            None
        } else {
            Some(field.iter().collect::<Vec<u32>>())
        }
    }};
}

impl RecurrenceSpec for CalendarEvent {
    fn expression(&self) -> &str {
        &self.expression
    }

    fn next(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        match &self.kind {
            EventKind::Once(at) => (*at > after).then_some(*at),
            EventKind::Recurring { schedule, .. } => schedule.after(&after).next(),
        }
    }

    fn occurrences_between(&self, start: DateTime<Local>, end: DateTime<Local>) -> Vec<DateTime<Local>> {
        match &self.kind {
            EventKind::Once(at) => {
                if *at >= start && *at < end {
                    vec![*at]
                } else {
                    Vec::new()
                }
            }
            EventKind::Recurring { schedule, .. } => schedule
                .after(&(start - Duration::seconds(1)))
                .skip_while(|t| *t < start)
                .take_while(|t| *t < end)
                .collect(),
        }
    }

    fn as_single_instant(&self) -> Option<DateTime<Local>> {
        match &self.kind {
            EventKind::Once(at) => Some(*at),
            EventKind::Recurring { .. } => None,
        }
    }

    fn constraint(&self, unit: TimeUnit) -> Option<Vec<u32>> {
        let schedule = match &self.kind {
            EventKind::Once(at) => return Some(vec![instant_field(at, unit)]),
            EventKind::Recurring { schedule, .. } => schedule,
        };
        match unit {
            TimeUnit::Second => restricted!(schedule.seconds(), 60),
            TimeUnit::Minute => restricted!(schedule.minutes(), 60),
            TimeUnit::Hour => restricted!(schedule.hours(), 24),
            TimeUnit::DayOfMonth => restricted!(schedule.days_of_month(), 31),
            TimeUnit::Month => restricted!(schedule.months(), 12),
            // cron counts Sunday as 1
            TimeUnit::Weekday => restricted!(schedule.days_of_week(), 7)
                .map(|days| days.into_iter().map(|d| d - 1).collect()),
        }
    }

    fn restricts_year(&self) -> bool {
        match &self.kind {
            EventKind::Once(_) => true,
            EventKind::Recurring { year_field, .. } => year_field != "*",
        }
    }
}

fn instant_field(at: &DateTime<Local>, unit: TimeUnit) -> u32 {
    use chrono::{Datelike, Timelike};
    match unit {
        TimeUnit::Second => at.second(),
        TimeUnit::Minute => at.minute(),
        TimeUnit::Hour => at.hour(),
        TimeUnit::DayOfMonth => at.day(),
        TimeUnit::Month => at.month(),
        TimeUnit::Weekday => at.weekday().num_days_from_sunday(),
    }
}

fn parse_instant(expression: &str) -> Option<DateTime<Local>> {
    const FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ];
    let naive = FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(expression, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(expression, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })?;
    Local.from_local_datetime(&naive).earliest()
}

/// Translate any accepted form into a 7-field cron expression.
fn to_cron_expression(expression: &str) -> std::result::Result<String, String> {
    let keyword = match expression.to_ascii_lowercase().as_str() {
        "minutely" => Some("0 * * * * * *"),
        "hourly" => Some("0 0 * * * * *"),
        "daily" => Some("0 0 0 * * * *"),
        "weekly" => Some("0 0 0 * * Mon *"),
        "monthly" => Some("0 0 0 1 * * *"),
        "yearly" | "annually" => Some("0 0 0 1 1 * *"),
        _ => None,
    };
    if let Some(keyword) = keyword {
        return Ok(keyword.to_string());
    }

    let tokens: Vec<&str> = expression.split_whitespace().collect();
    match tokens.len() {
        5 => Ok(format!("0 {} *", expression)),
        6 => Ok(format!("{} *", expression)),
        7 => Ok(expression.to_string()),
        1..=3 => calendar_to_cron(&tokens),
        _ => Err("unrecognised calendar expression".to_string()),
    }
}

/// `[weekdays] [Y-M-D|M-D] [H:M[:S]]` in the systemd calendar style.
fn calendar_to_cron(tokens: &[&str]) -> std::result::Result<String, String> {
    let mut weekdays = "*".to_string();
    let (mut year, mut month, mut day) = ("*".to_string(), "*".to_string(), "*".to_string());
    let (mut hour, mut minute, mut second) = ("0".to_string(), "0".to_string(), "0".to_string());

    let mut rest = tokens;
    if let Some(first) = rest.first() {
        if first.starts_with(|c: char| c.is_ascii_alphabetic()) {
            weekdays = weekday_field(first)?;
            rest = &rest[1..];
        }
    }
    if let Some(token) = rest.first() {
        if token.contains('-') && !token.contains(':') {
            let parts: Vec<&str> = token.split('-').collect();
            match parts.as_slice() {
                [y, m, d] => {
                    year = range_field(y);
                    month = range_field(m);
                    day = range_field(d);
                }
                [m, d] => {
                    month = range_field(m);
                    day = range_field(d);
                }
                _ => return Err(format!("invalid date {:?}", token)),
            }
            rest = &rest[1..];
        }
    }
    if let Some(token) = rest.first() {
        let parts: Vec<&str> = token.split(':').collect();
        match parts.as_slice() {
            [h, m] => {
                hour = range_field(h);
                minute = range_field(m);
            }
            [h, m, s] => {
                hour = range_field(h);
                minute = range_field(m);
                second = range_field(s);
            }
            _ => return Err(format!("invalid time {:?}", token)),
        }
        rest = &rest[1..];
    }
    if !rest.is_empty() {
        return Err(format!("unexpected {:?}", rest.join(" ")));
    }

    Ok(format!(
        "{} {} {} {} {} {} {}",
        second, minute, hour, day, month, weekdays, year
    ))
}

fn range_field(value: &str) -> String {
    value.replace("..", "-")
}

fn weekday_field(token: &str) -> std::result::Result<String, String> {
    if !token
        .chars()
        .all(|c| c.is_ascii_alphabetic() || c == ',' || c == '.')
    {
        return Err(format!("invalid weekday list {:?}", token));
    }
    let normalised: Vec<String> = token
        .split(',')
        .map(|item| {
            item.split("..")
                .map(capitalise)
                .collect::<Vec<_>>()
                .join("-")
        })
        .collect();
    Ok(normalised.join(","))
}

fn capitalise(word: &str) -> String {
    let lower = word.to_ascii_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Next `count` occurrences after `from`.
pub fn upcoming(spec: &dyn RecurrenceSpec, from: DateTime<Local>, count: usize) -> Vec<DateTime<Local>> {
    let mut times = Vec::with_capacity(count);
    let mut cursor = from;
    while times.len() < count {
        match spec.next(cursor) {
            Some(next) => {
                times.push(next);
                cursor = next;
            }
            None => break,
        }
    }
    times
}

/// Parse every raw schedule of a job.
pub fn parse_schedules(expressions: &[String]) -> Result<Vec<CalendarEvent>> {
    expressions.iter().map(|e| CalendarEvent::parse(e)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_time_of_day_is_daily() {
        let event = CalendarEvent::parse("03:00").unwrap();
        assert_eq!(event.next(at(2024, 1, 15, 10, 0)), Some(at(2024, 1, 16, 3, 0)));
        assert!(event.as_single_instant().is_none());
        assert!(event.weekdays().is_none());
        assert!(event.months().is_none());
        assert!(event.days_of_month().is_none());
        assert!(!event.restricts_year());
    }

    #[test]
    fn test_occurrences_include_start_exclude_end() {
        let event = CalendarEvent::parse("1..4,6,8:00").unwrap();
        let start = at(2024, 1, 15, 1, 0);
        let times = event.occurrences_between(start, start + Duration::hours(24));
        let hours: Vec<u32> = times.iter().map(|t| t.hour()).collect();
        assert_eq!(hours, vec![1, 2, 3, 4, 6, 8]);

        let times = event.occurrences_between(start, at(2024, 1, 15, 8, 0));
        assert_eq!(times.len(), 5);
    }

    #[test]
    fn test_date_is_single_instant() {
        let event = CalendarEvent::parse("2020-01-01").unwrap();
        assert_eq!(event.as_single_instant(), Some(at(2020, 1, 1, 0, 0)));
        assert_eq!(event.next(at(2019, 6, 1, 0, 0)), Some(at(2020, 1, 1, 0, 0)));
        assert_eq!(event.next(at(2021, 1, 1, 0, 0)), None);

        let event = CalendarEvent::parse("2024-05-01 04:30").unwrap();
        assert_eq!(event.as_single_instant(), Some(at(2024, 5, 1, 4, 30)));
    }

    #[test]
    fn test_weekday_restriction() {
        let event = CalendarEvent::parse("Sat,Sun 0,12:00").unwrap();
        assert_eq!(event.weekdays(), Some(vec![Weekday::Sun, Weekday::Sat]));
        // Monday 2024-01-15 → Saturday 2024-01-20
        assert_eq!(event.next(at(2024, 1, 15, 10, 0)), Some(at(2024, 1, 20, 0, 0)));

        let event = CalendarEvent::parse("mon..fri 08:30").unwrap();
        assert_eq!(event.weekdays().map(|d| d.len()), Some(5));
    }

    #[test]
    fn test_month_and_day_restrictions() {
        let event = CalendarEvent::parse("mon *-1..10-*").unwrap();
        assert_eq!(event.months(), Some((1..=10).collect()));
        assert_eq!(event.weekdays(), Some(vec![Weekday::Mon]));

        let event = CalendarEvent::parse("*-*-1").unwrap();
        assert_eq!(event.days_of_month(), Some(vec![1]));
        assert!(event.months().is_none());
    }

    #[test]
    fn test_cron_and_keywords() {
        let event = CalendarEvent::parse("30 2 * * *").unwrap();
        assert_eq!(event.next(at(2024, 1, 15, 10, 0)), Some(at(2024, 1, 16, 2, 30)));
        assert_eq!(event.constraint(TimeUnit::Minute), Some(vec![30]));
        assert_eq!(event.constraint(TimeUnit::Second), Some(vec![0]));

        let event = CalendarEvent::parse("hourly").unwrap();
        assert_eq!(event.next(at(2024, 1, 15, 10, 5)), Some(at(2024, 1, 15, 11, 0)));

        let event = CalendarEvent::parse("0 0 0 1 1 * 2030").unwrap();
        assert!(event.restricts_year());
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(CalendarEvent::parse("").is_err());
        assert!(CalendarEvent::parse("whenever you like").is_err());
        assert!(CalendarEvent::parse("25:99").is_err());
        assert!(CalendarEvent::parse("1 2 3 4 5 6 7 8").is_err());
    }

    #[test]
    fn test_upcoming() {
        let event = CalendarEvent::parse("*:0/15").unwrap();
        let times = upcoming(&event, at(2024, 1, 15, 10, 0), 3);
        assert_eq!(
            times,
            vec![at(2024, 1, 15, 10, 15), at(2024, 1, 15, 10, 30), at(2024, 1, 15, 10, 45)]
        );
    }
}
