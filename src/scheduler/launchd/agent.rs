//! launchd job definitions: calendar intervals and the plist keys we manage.

use std::collections::BTreeMap;

use crate::calendar::{RecurrenceSpec, TimeUnit};
use crate::permission::Permission;

use super::plist::{self, Dict, Value};

/// One `StartCalendarInterval` entry. Missing keys are wildcards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalendarInterval {
    pub month: Option<u32>,
    pub day: Option<u32>,
    /// 0 = Sunday
    pub weekday: Option<u32>,
    pub hour: Option<u32>,
    pub minute: Option<u32>,
}

impl CalendarInterval {
    fn fields(&self) -> [(&'static str, Option<u32>); 5] {
        [
            ("Month", self.month),
            ("Day", self.day),
            ("Weekday", self.weekday),
            ("Hour", self.hour),
            ("Minute", self.minute),
        ]
    }

    fn to_value(self) -> Value {
        Value::Dict(
            self.fields()
                .iter()
                .filter_map(|(key, value)| value.map(|v| (key.to_string(), Value::Integer(i64::from(v)))))
                .collect(),
        )
    }

    fn from_dict(dict: &Dict) -> Self {
        let field = |key: &str| {
            plist::get(dict, key)
                .and_then(Value::as_int)
                .and_then(|v| u32::try_from(v).ok())
        };
        CalendarInterval {
            month: field("Month"),
            day: field("Day"),
            // 7 is Sunday as well
            weekday: field("Weekday").map(|d| d % 7),
            hour: field("Hour"),
            minute: field("Minute"),
        }
    }

    /// Cron fields (`minute hour day month weekday`) describing the same interval.
    pub fn cron_fields(&self) -> String {
        let field = |value: Option<u32>| value.map_or_else(|| "*".to_string(), |v| v.to_string());
        format!(
            "{} {} {} {} {}",
            field(self.minute),
            field(self.hour),
            field(self.day),
            field(self.month),
            field(self.weekday)
        )
    }
}

/// Expand a recurrence into the calendar intervals that fire on the same minutes.
///
/// Each restricted field multiplies the number of intervals.
pub fn calendar_intervals(spec: &dyn RecurrenceSpec) -> Result<Vec<CalendarInterval>, String> {
    if spec.as_single_instant().is_some() {
        return Err("launchd cannot run a job once at a fixed instant".to_string());
    }
    if spec.restricts_year() {
        return Err("launchd calendar intervals cannot restrict years".to_string());
    }
    if spec.constraint(TimeUnit::Second) != Some(vec![0]) {
        return Err("launchd calendar intervals cannot fire on seconds".to_string());
    }
    // launchd fires when either field matches
    if spec.constraint(TimeUnit::Weekday).is_some() && spec.constraint(TimeUnit::DayOfMonth).is_some() {
        return Err("a calendar interval cannot require both a weekday and a day of the month".to_string());
    }

    let values = |unit: TimeUnit| -> Vec<Option<u32>> {
        match spec.constraint(unit) {
            Some(values) => values.into_iter().map(Some).collect(),
            None => vec![None],
        }
    };
    let mut intervals = Vec::new();
    for month in values(TimeUnit::Month) {
        for day in values(TimeUnit::DayOfMonth) {
            for weekday in values(TimeUnit::Weekday) {
                for hour in values(TimeUnit::Hour) {
                    for minute in values(TimeUnit::Minute) {
                        intervals.push(CalendarInterval {
                            month,
                            day,
                            weekday,
                            hour,
                            minute,
                        });
                    }
                }
            }
        }
    }
    Ok(intervals)
}

/// `LimitLoadToSessionType`, which also tells the permission back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    /// Logged-on GUI session.
    Aqua,
    Background,
    System,
}

impl SessionType {
    pub fn for_permission(permission: Permission) -> Self {
        match permission {
            Permission::System => SessionType::System,
            Permission::UserBackground => SessionType::Background,
            Permission::UserLoggedOn | Permission::Unspecified => SessionType::Aqua,
        }
    }

    pub fn permission(self) -> Permission {
        match self {
            SessionType::Aqua => Permission::UserLoggedOn,
            SessionType::Background => Permission::UserBackground,
            SessionType::System => Permission::System,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            SessionType::Aqua => "Aqua",
            SessionType::Background => "Background",
            SessionType::System => "System",
        }
    }

    /// launchd defaults to Aqua when the key is missing.
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("Background") => SessionType::Background,
            Some("System") => SessionType::System,
            _ => SessionType::Aqua,
        }
    }
}

/// The subset of a launchd job definition this tool writes and reads back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchdJob {
    pub label: String,
    pub program_arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub working_directory: String,
    /// Receives both stdout and stderr.
    pub log_path: String,
    pub intervals: Vec<CalendarInterval>,
    pub session_type: SessionType,
    pub background: bool,
    pub nice: i32,
}

impl LaunchdJob {
    pub fn to_plist(&self) -> String {
        let mut dict: Dict = vec![("Label".to_string(), Value::from(self.label.as_str()))];
        if let Some(program) = self.program_arguments.first() {
            dict.push(("Program".to_string(), Value::from(program.as_str())));
        }
        dict.push((
            "ProgramArguments".to_string(),
            Value::Array(self.program_arguments.iter().map(|a| Value::from(a.as_str())).collect()),
        ));
        if !self.environment.is_empty() {
            dict.push((
                "EnvironmentVariables".to_string(),
                Value::Dict(
                    self.environment
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                        .collect(),
                ),
            ));
        }
        if !self.working_directory.is_empty() {
            dict.push(("WorkingDirectory".to_string(), Value::from(self.working_directory.as_str())));
        }
        dict.push(("StandardOutPath".to_string(), Value::from(self.log_path.as_str())));
        dict.push(("StandardErrorPath".to_string(), Value::from(self.log_path.as_str())));
        dict.push((
            "StartCalendarInterval".to_string(),
            Value::Array(self.intervals.iter().map(|i| i.to_value()).collect()),
        ));
        dict.push((
            "LimitLoadToSessionType".to_string(),
            Value::from(self.session_type.as_str()),
        ));
        let process_type = if self.background { "Background" } else { "Standard" };
        dict.push(("ProcessType".to_string(), Value::from(process_type)));
        dict.push(("Nice".to_string(), Value::Integer(i64::from(self.nice))));
        if self.background {
            dict.push(("LowPriorityIO".to_string(), Value::Bool(true)));
            dict.push(("LowPriorityBackgroundIO".to_string(), Value::Bool(true)));
        }
        plist::to_document(&dict)
    }

    pub fn from_plist(content: &str) -> Result<Self, String> {
        let dict = plist::parse(content)?;
        let string = |key: &str| {
            plist::get(&dict, key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let label = string("Label");
        if label.is_empty() {
            return Err("no Label".to_string());
        }

        let program_arguments = plist::get(&dict, "ProgramArguments")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let environment = plist::get(&dict, "EnvironmentVariables")
            .and_then(Value::as_dict)
            .map(|env| {
                env.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        // a single dict is accepted in place of an array
        let intervals = match plist::get(&dict, "StartCalendarInterval") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_dict)
                .map(CalendarInterval::from_dict)
                .collect(),
            Some(Value::Dict(interval)) => vec![CalendarInterval::from_dict(interval)],
            _ => Vec::new(),
        };
        let session_type = SessionType::parse(plist::get(&dict, "LimitLoadToSessionType").and_then(Value::as_str));

        Ok(LaunchdJob {
            label,
            program_arguments,
            environment,
            working_directory: string("WorkingDirectory"),
            log_path: string("StandardOutPath"),
            intervals,
            session_type,
            background: string("ProcessType") == "Background",
            nice: plist::get(&dict, "Nice")
                .and_then(Value::as_int)
                .and_then(|n| i32::try_from(n).ok())
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::CalendarEvent;

    fn intervals(expression: &str) -> Result<Vec<CalendarInterval>, String> {
        calendar_intervals(&CalendarEvent::parse(expression).unwrap())
    }

    fn at(hour: u32, minute: u32) -> CalendarInterval {
        CalendarInterval {
            hour: Some(hour),
            minute: Some(minute),
            ..Default::default()
        }
    }

    #[test]
    fn test_daily_time() {
        assert_eq!(intervals("03:00").unwrap(), vec![at(3, 0)]);
        assert_eq!(intervals("daily").unwrap(), vec![at(0, 0)]);
    }

    #[test]
    fn test_lists_expand_to_every_combination() {
        let got = intervals("Sat,Sun 0,12:30").unwrap();
        let weekend = |weekday: u32, hour: u32| CalendarInterval {
            weekday: Some(weekday),
            ..at(hour, 30)
        };
        assert_eq!(got, vec![weekend(0, 0), weekend(0, 12), weekend(6, 0), weekend(6, 12)]);

        let got = intervals("*-*-01 04:00").unwrap();
        assert_eq!(
            got,
            vec![CalendarInterval {
                day: Some(1),
                ..at(4, 0)
            }]
        );
    }

    #[test]
    fn test_hourly_leaves_hour_open() {
        let got = intervals("hourly").unwrap();
        assert_eq!(
            got,
            vec![CalendarInterval {
                minute: Some(0),
                ..Default::default()
            }]
        );
        assert_eq!(got[0].cron_fields(), "0 * * * *");
    }

    #[test]
    fn test_rejected_expressions() {
        assert!(intervals("2030-01-01 00:00").is_err());
        assert!(intervals("*:*:30").is_err());
        assert!(intervals("Mon *-*-1 03:00").is_err());
        assert!(intervals("0 3 1 * Mon").is_err());
    }

    fn job(session_type: SessionType, background: bool) -> LaunchdJob {
        LaunchdJob {
            label: "resticsched.backup.home".to_string(),
            program_arguments: vec![
                "/usr/local/bin/resticprofile".to_string(),
                "--name".to_string(),
                "home".to_string(),
                "backup".to_string(),
            ],
            environment: BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
            working_directory: "/Users/bob".to_string(),
            log_path: "resticsched.backup.home.log".to_string(),
            intervals: vec![at(3, 0), at(15, 0)],
            session_type,
            background,
            nice: if background { 5 } else { 0 },
        }
    }

    #[test]
    fn test_plist_content() {
        let content = job(SessionType::Background, true).to_plist();
        assert!(content.contains("\t<key>Program</key>\n\t<string>/usr/local/bin/resticprofile</string>\n"));
        assert!(content.contains(
            "\t<key>StartCalendarInterval</key>\n\t<array>\n\t\t<dict>\n\t\t\t<key>Hour</key>\n\t\t\t<integer>3</integer>\n\t\t\t<key>Minute</key>\n\t\t\t<integer>0</integer>\n\t\t</dict>\n"
        ));
        assert!(content.contains("<key>LimitLoadToSessionType</key>\n\t<string>Background</string>"));
        assert!(content.contains("<key>ProcessType</key>\n\t<string>Background</string>"));
        assert!(content.contains("<key>LowPriorityIO</key>\n\t<true/>"));

        let content = job(SessionType::Aqua, false).to_plist();
        assert!(content.contains("<key>ProcessType</key>\n\t<string>Standard</string>"));
        assert!(content.contains("<key>Nice</key>\n\t<integer>0</integer>"));
        assert!(!content.contains("LowPriorityIO"));
    }

    #[test]
    fn test_plist_reads_back() {
        for (session_type, background) in [(SessionType::System, true), (SessionType::Aqua, false)] {
            let job = job(session_type, background);
            assert_eq!(LaunchdJob::from_plist(&job.to_plist()).unwrap(), job);
        }
    }

    #[test]
    fn test_foreign_plist() {
        let content = r#"<plist version="1.0"><dict>
            <key>Label</key><string>resticsched.check.home</string>
            <key>StartCalendarInterval</key><dict><key>Weekday</key><integer>7</integer><key>Hour</key><integer>2</integer></dict>
        </dict></plist>"#;
        let job = LaunchdJob::from_plist(content).unwrap();
        assert_eq!(job.session_type, SessionType::Aqua);
        assert_eq!(job.session_type.permission(), Permission::UserLoggedOn);
        assert_eq!(job.intervals[0].cron_fields(), "* 2 * * 0");

        assert!(LaunchdJob::from_plist("<plist><dict></dict></plist>").is_err());
    }
}
