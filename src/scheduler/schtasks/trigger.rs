//! Compiles recurrence expressions into Task Scheduler triggers.
//!
//! Task Scheduler has no free-form calendar: a trigger is a start boundary, an optional
//! repetition (interval + duration) and a container restricting the days it applies to.
//! Schedules sharing the same day restrictions are merged, then the occurrences of one
//! day are turned into a repetition pattern.

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, TimeZone, Weekday};
use thiserror::Error;
use tracing::{debug, warn};

use crate::calendar::RecurrenceSpec;

/// Maximum number of triggers Task Scheduler accepts on one task.
pub const MAX_TRIGGERS: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("schedule {0:?} has no future occurrence")]
    ZeroOccurrences(String),

    #[error("schedule {0:?} runs more often than once a minute")]
    BelowResolution(String),

    #[error("schedule {0:?} restricts both weekdays and days of the month, which cannot be expressed as a task trigger")]
    UnsupportedCombination(String),

    #[error("schedule {0:?} restricts years, which cannot be expressed as a task trigger")]
    YearRestriction(String),

    #[error("{count} triggers needed but a task accepts at most {MAX_TRIGGERS}")]
    TooManyTriggers { count: usize },

    #[error("no schedule could be compiled into a task trigger")]
    NoTriggers,
}

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Membership flags, one per weekday.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeekdaySet([bool; 7]);

impl WeekdaySet {
    pub fn all() -> Self {
        Self([true; 7])
    }

    pub fn from_days(days: &[Weekday]) -> Self {
        let mut set = Self::default();
        for day in days {
            set.0[day.num_days_from_monday() as usize] = true;
        }
        set
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0[day.num_days_from_monday() as usize]
    }

    /// Monday first.
    pub fn days(&self) -> Vec<Weekday> {
        WEEKDAYS.into_iter().filter(|d| self.contains(*d)).collect()
    }
}

/// Membership flags, one per month (1 = January).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonthSet([bool; 12]);

impl MonthSet {
    pub fn all() -> Self {
        Self([true; 12])
    }

    pub fn from_months(months: &[u32]) -> Self {
        let mut set = Self::default();
        for month in months.iter().filter(|m| (1..=12).contains(*m)) {
            set.0[*month as usize - 1] = true;
        }
        set
    }

    pub fn contains(&self, month: u32) -> bool {
        (1..=12).contains(&month) && self.0[month as usize - 1]
    }

    pub fn months(&self) -> Vec<u32> {
        (1..=12).filter(|m| self.contains(*m)).collect()
    }
}

/// Membership flags, one per day of the month (1..=31).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaySet([bool; 31]);

impl Default for DaySet {
    fn default() -> Self {
        Self([false; 31])
    }
}

impl DaySet {
    pub fn all() -> Self {
        Self([true; 31])
    }

    pub fn from_days(days: &[u32]) -> Self {
        let mut set = Self::default();
        for day in days.iter().filter(|d| (1..=31).contains(*d)) {
            set.0[*day as usize - 1] = true;
        }
        set
    }

    pub fn contains(&self, day: u32) -> bool {
        (1..=31).contains(&day) && self.0[day as usize - 1]
    }

    pub fn days(&self) -> Vec<u32> {
        (1..=31).filter(|d| self.contains(*d)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeekOfMonth {
    First,
    Second,
    Third,
    Fourth,
    Last,
}

impl WeekOfMonth {
    pub const ALL: [WeekOfMonth; 5] = [
        WeekOfMonth::First,
        WeekOfMonth::Second,
        WeekOfMonth::Third,
        WeekOfMonth::Fourth,
        WeekOfMonth::Last,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WeekOfMonth::First => "1",
            WeekOfMonth::Second => "2",
            WeekOfMonth::Third => "3",
            WeekOfMonth::Fourth => "4",
            WeekOfMonth::Last => "Last",
        }
    }

    fn matches(&self, date: NaiveDate) -> bool {
        let ordinal = (date.day() - 1) / 7;
        match self {
            WeekOfMonth::First => ordinal == 0,
            WeekOfMonth::Second => ordinal == 1,
            WeekOfMonth::Third => ordinal == 2,
            WeekOfMonth::Fourth => ordinal == 3,
            WeekOfMonth::Last => date
                .checked_add_signed(Duration::days(7))
                .map(|later| later.month() != date.month())
                .unwrap_or(true),
        }
    }
}

/// Membership flags, one per week ordinal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeekSet([bool; 5]);

impl WeekSet {
    pub fn all() -> Self {
        Self([true; 5])
    }

    pub fn contains(&self, week: WeekOfMonth) -> bool {
        self.0[week as usize]
    }

    pub fn weeks(&self) -> Vec<WeekOfMonth> {
        WeekOfMonth::ALL
            .into_iter()
            .filter(|w| self.contains(*w))
            .collect()
    }
}

/// Repeat every `interval` for `duration` after each start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repetition {
    pub interval: Duration,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompiledTrigger {
    OneTime {
        at: DateTime<Local>,
    },
    /// Every day at the time of `start`.
    Daily {
        start: DateTime<Local>,
        repetition: Option<Repetition>,
    },
    Weekly {
        start: DateTime<Local>,
        repetition: Option<Repetition>,
        days: WeekdaySet,
    },
    MonthlyByDay {
        start: DateTime<Local>,
        repetition: Option<Repetition>,
        months: MonthSet,
        days: DaySet,
    },
    MonthlyByWeekday {
        start: DateTime<Local>,
        repetition: Option<Repetition>,
        months: MonthSet,
        days: WeekdaySet,
        weeks: WeekSet,
    },
}

impl CompiledTrigger {
    pub fn start(&self) -> DateTime<Local> {
        match self {
            CompiledTrigger::OneTime { at } => *at,
            CompiledTrigger::Daily { start, .. }
            | CompiledTrigger::Weekly { start, .. }
            | CompiledTrigger::MonthlyByDay { start, .. }
            | CompiledTrigger::MonthlyByWeekday { start, .. } => *start,
        }
    }

    pub fn repetition(&self) -> Option<Repetition> {
        match self {
            CompiledTrigger::OneTime { .. } => None,
            CompiledTrigger::Daily { repetition, .. }
            | CompiledTrigger::Weekly { repetition, .. }
            | CompiledTrigger::MonthlyByDay { repetition, .. }
            | CompiledTrigger::MonthlyByWeekday { repetition, .. } => *repetition,
        }
    }

    fn applies_on(&self, date: NaiveDate) -> bool {
        match self {
            CompiledTrigger::OneTime { at } => at.date_naive() == date,
            CompiledTrigger::Daily { .. } => true,
            CompiledTrigger::Weekly { days, .. } => days.contains(date.weekday()),
            CompiledTrigger::MonthlyByDay { months, days, .. } => {
                months.contains(date.month()) && days.contains(date.day())
            }
            CompiledTrigger::MonthlyByWeekday {
                months,
                days,
                weeks,
                ..
            } => {
                months.contains(date.month())
                    && days.contains(date.weekday())
                    && weeks.weeks().iter().any(|w| w.matches(date))
            }
        }
    }

    /// Instants this trigger fires at in `[from, until)`.
    pub fn fire_times(&self, from: DateTime<Local>, until: DateTime<Local>) -> Vec<DateTime<Local>> {
        let start = self.start();
        let mut times = Vec::new();
        let mut date = from.date_naive().max(start.date_naive());
        while date <= until.date_naive() {
            if self.applies_on(date) {
                if let Some(anchor) = local(date.and_time(start.time())) {
                    let repetition = self.repetition();
                    let mut offset = Duration::zero();
                    loop {
                        let at = anchor + offset;
                        if at >= start && at >= from && at < until {
                            times.push(at);
                        }
                        match repetition {
                            Some(r) if r.interval > Duration::zero() && offset + r.interval <= r.duration => {
                                offset += r.interval;
                            }
                            _ => break,
                        }
                    }
                }
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        times.sort();
        times.dedup();
        times
    }
}

fn local(naive: chrono::NaiveDateTime) -> Option<DateTime<Local>> {
    Local.from_local_datetime(&naive).earliest()
}

/// Day restrictions of a schedule; schedules with equal containers are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Daily,
    Weekly(WeekdaySet),
    MonthlyByDay(MonthSet, DaySet),
    MonthlyByWeekday(MonthSet, WeekdaySet),
}

impl Container {
    fn of(spec: &dyn RecurrenceSpec) -> Result<Self, CompileError> {
        let weekdays = spec.weekdays();
        let months = spec.months();
        let days = spec.days_of_month();

        match (weekdays, months, days) {
            (Some(_), _, Some(_)) => Err(CompileError::UnsupportedCombination(
                spec.expression().to_string(),
            )),
            (Some(weekdays), None, None) => Ok(Container::Weekly(WeekdaySet::from_days(&weekdays))),
            (Some(weekdays), Some(months), None) => Ok(Container::MonthlyByWeekday(
                MonthSet::from_months(&months),
                WeekdaySet::from_days(&weekdays),
            )),
            (None, None, None) => Ok(Container::Daily),
            (None, months, days) => Ok(Container::MonthlyByDay(
                months.map(|m| MonthSet::from_months(&m)).unwrap_or_else(MonthSet::all),
                days.map(|d| DaySet::from_days(&d)).unwrap_or_else(DaySet::all),
            )),
        }
    }

    fn trigger(&self, start: DateTime<Local>, repetition: Option<Repetition>) -> CompiledTrigger {
        match *self {
            Container::Daily => CompiledTrigger::Daily { start, repetition },
            Container::Weekly(days) => CompiledTrigger::Weekly {
                start,
                repetition,
                days,
            },
            Container::MonthlyByDay(months, days) => CompiledTrigger::MonthlyByDay {
                start,
                repetition,
                months,
                days,
            },
            Container::MonthlyByWeekday(months, days) => CompiledTrigger::MonthlyByWeekday {
                start,
                repetition,
                months,
                days,
                weeks: WeekSet::all(),
            },
        }
    }
}

/// Outcome of compiling the schedules of one job.
#[derive(Debug, Default)]
pub struct CompileReport {
    pub triggers: Vec<CompiledTrigger>,
    /// Schedules that could not be compiled, with the reason.
    pub skipped: Vec<(String, CompileError)>,
}

impl CompileReport {
    /// The triggers, or the first reason nothing compiled.
    pub fn into_triggers(self) -> Result<Vec<CompiledTrigger>, CompileError> {
        if !self.triggers.is_empty() {
            return Ok(self.triggers);
        }
        Err(self
            .skipped
            .into_iter()
            .next()
            .map(|(_, err)| err)
            .unwrap_or(CompileError::NoTriggers))
    }
}

/// Both the list of differences between consecutive instants, and the same list with
/// consecutive equal values collapsed.
///
/// `01:00, 02:00, 03:00, 04:00, 06:00, 08:00` gives `[1h, 1h, 1h, 2h, 2h]` and `[1h, 2h]`.
pub fn compile_differences(occurrences: &[DateTime<Local>]) -> (Vec<Duration>, Vec<Duration>) {
    let differences: Vec<Duration> = occurrences.windows(2).map(|w| w[1] - w[0]).collect();
    let mut compact: Vec<Duration> = Vec::with_capacity(differences.len());
    for difference in &differences {
        if compact.last() != Some(difference) {
            compact.push(*difference);
        }
    }
    (differences, compact)
}

/// Span from the first to the last occurrence. A span of 23h59m is widened to a full
/// day so the final occurrence is still inside the repetition window.
pub fn repetition_duration(first: DateTime<Local>, last: DateTime<Local>) -> Duration {
    let duration = last - first;
    if duration == Duration::minutes(1439) {
        Duration::minutes(1440)
    } else {
        duration
    }
}

/// Compile every schedule of a job, anchored at `now`.
pub fn compile(specs: &[&dyn RecurrenceSpec], now: DateTime<Local>) -> Result<CompileReport, CompileError> {
    let mut report = CompileReport::default();
    let mut groups: Vec<(Container, Vec<&dyn RecurrenceSpec>)> = Vec::new();

    for spec in specs.iter().copied() {
        if let Some(at) = spec.as_single_instant() {
            report.triggers.push(CompiledTrigger::OneTime { at });
            continue;
        }
        if spec.restricts_year() {
            report
                .skipped
                .push((spec.expression().to_string(), CompileError::YearRestriction(spec.expression().to_string())));
            continue;
        }
        match Container::of(spec) {
            Ok(container) => match groups.iter_mut().find(|(c, _)| *c == container) {
                Some((_, members)) => members.push(spec),
                None => groups.push((container, vec![spec])),
            },
            Err(err) => report.skipped.push((spec.expression().to_string(), err)),
        }
    }

    for (container, members) in &groups {
        compile_group(container, members, now, &mut report);
    }

    for (expression, err) in &report.skipped {
        warn!(schedule = %expression, "skipping schedule: {}", err);
    }

    if report.triggers.len() > MAX_TRIGGERS {
        return Err(CompileError::TooManyTriggers {
            count: report.triggers.len(),
        });
    }
    Ok(report)
}

fn compile_group(
    container: &Container,
    specs: &[&dyn RecurrenceSpec],
    now: DateTime<Local>,
    report: &mut CompileReport,
) {
    let mut live = Vec::with_capacity(specs.len());
    let mut earliest: Option<DateTime<Local>> = None;
    for spec in specs {
        match spec.next(now) {
            Some(next) => {
                earliest = Some(earliest.map_or(next, |e| e.min(next)));
                live.push(*spec);
            }
            None => report.skipped.push((
                spec.expression().to_string(),
                CompileError::ZeroOccurrences(spec.expression().to_string()),
            )),
        }
    }
    let Some(earliest) = earliest else {
        return;
    };

    // One whole calendar day, so the pattern is anchored at its first time of day.
    let day = earliest.date_naive();
    let window_start = day.and_hms_opt(0, 0, 0).and_then(local).unwrap_or(earliest);
    let window_end = day
        .succ_opt()
        .and_then(|next| next.and_hms_opt(0, 0, 0))
        .and_then(local)
        .unwrap_or(window_start + Duration::days(1));

    let mut occurrences: Vec<DateTime<Local>> = live
        .iter()
        .flat_map(|spec| spec.occurrences_between(window_start, window_end))
        .collect();
    occurrences.sort();
    occurrences.dedup();

    let expressions = || live.iter().map(|s| s.expression()).collect::<Vec<_>>().join(", ");

    let (first, last) = match (occurrences.first(), occurrences.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => {
            report
                .skipped
                .push((expressions(), CompileError::ZeroOccurrences(expressions())));
            return;
        }
    };

    if occurrences.len() == 1 {
        report.triggers.push(container.trigger(first, None));
        return;
    }

    let (_, compact) = compile_differences(&occurrences);
    if compact.iter().any(|d| *d < Duration::minutes(1)) {
        report
            .skipped
            .push((expressions(), CompileError::BelowResolution(expressions())));
        return;
    }

    if let [interval] = compact.as_slice() {
        let repetition = Repetition {
            interval: *interval,
            duration: repetition_duration(first, last),
        };
        debug!(schedules = %expressions(), ?repetition, "compiled repeating trigger");
        report.triggers.push(container.trigger(first, Some(repetition)));
        return;
    }

    // Irregular within the day: one trigger per time of day.
    warn!(
        schedules = %expressions(),
        count = occurrences.len(),
        "irregular schedule, creating one trigger per occurrence"
    );
    report
        .triggers
        .extend(occurrences.into_iter().map(|at| container.trigger(at, None)));
}
