use chrono::{DateTime, Duration, Local, Weekday};

use crate::job::{JobDescriptor, Priority};
use crate::permission::Permission;
use crate::scheduler::escape_xml;
use crate::scheduler::schtasks::trigger::{CompiledTrigger, Repetition};

const TASK_SCHEMA: &str = "http://schemas.microsoft.com/windows/2004/02/mit/task";
const TASK_SCHEMA_VERSION: &str = "1.4";
const SERVICE_ACCOUNT: &str = "SYSTEM";
/// Administrators and SYSTEM get full access, authenticated users can read the task status.
pub const SECURITY_DESCRIPTOR: &str = "D:AI(A;;FA;;;BA)(A;;FA;;;SY)(A;;FRFX;;;LS)(A;;FR;;;AU)";
const STANDARD_PRIORITY: u8 = 5;
const BACKGROUND_PRIORITY: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogonType {
    /// Service for user: runs without storing a password.
    ServiceForUser,
    InteractiveToken,
    Password,
}

impl LogonType {
    fn as_str(&self) -> &'static str {
        match self {
            LogonType::ServiceForUser => "S4U",
            LogonType::InteractiveToken => "InteractiveToken",
            LogonType::Password => "Password",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLevel {
    LeastPrivilege,
    HighestAvailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Option<String>,
    pub logon_type: LogonType,
    pub run_level: RunLevel,
}

impl Principal {
    pub fn for_permission(permission: Permission) -> Self {
        match permission {
            Permission::System => Principal {
                user_id: Some(SERVICE_ACCOUNT.to_string()),
                logon_type: LogonType::ServiceForUser,
                run_level: RunLevel::HighestAvailable,
            },
            Permission::UserLoggedOn => Principal {
                user_id: None,
                logon_type: LogonType::InteractiveToken,
                run_level: RunLevel::LeastPrivilege,
            },
            Permission::UserBackground | Permission::Unspecified => Principal {
                user_id: None,
                logon_type: LogonType::Password,
                run_level: RunLevel::LeastPrivilege,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSettings {
    pub disallow_start_on_batteries: bool,
    pub stop_on_batteries: bool,
    pub hidden: bool,
    /// 0 (highest) to 10 (lowest).
    pub priority: u8,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            disallow_start_on_batteries: false,
            stop_on_batteries: false,
            hidden: false,
            priority: STANDARD_PRIORITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecAction {
    pub command: String,
    pub arguments: String,
    pub working_directory: String,
}

/// A task registered in the Task Scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinition {
    pub uri: String,
    pub description: String,
    pub author: String,
    pub security_descriptor: Option<String>,
    pub triggers: Vec<CompiledTrigger>,
    pub principal: Principal,
    pub settings: TaskSettings,
    pub action: ExecAction,
}

impl TaskDefinition {
    pub fn new(
        uri: &str,
        job: &JobDescriptor,
        triggers: Vec<CompiledTrigger>,
        permission: Permission,
        mut settings: TaskSettings,
    ) -> Self {
        if job.priority == Priority::Background {
            settings.priority = BACKGROUND_PRIORITY;
        }
        let security_descriptor =
            (permission == Permission::System).then(|| SECURITY_DESCRIPTOR.to_string());

        Self {
            uri: uri.to_string(),
            description: job.job_description.clone(),
            author: whoami::username(),
            security_descriptor,
            triggers,
            principal: Principal::for_permission(permission),
            settings,
            action: ExecAction {
                command: job.command.clone(),
                arguments: crate::job::join_command_line(&job.effective_arguments()),
                working_directory: job.working_directory.clone(),
            },
        }
    }

    /// Task Scheduler XML (schema 1.4).
    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str(&format!(
            "<Task version=\"{}\" xmlns=\"{}\">\n",
            TASK_SCHEMA_VERSION, TASK_SCHEMA
        ));

        xml.push_str("  <RegistrationInfo>\n");
        xml.push_str(&element(4, "Author", &self.author));
        xml.push_str(&element(4, "Description", &self.description));
        xml.push_str(&element(4, "URI", &self.uri));
        if let Some(sd) = &self.security_descriptor {
            xml.push_str(&element(4, "SecurityDescriptor", sd));
        }
        xml.push_str("  </RegistrationInfo>\n");

        xml.push_str("  <Triggers>\n");
        for trigger in &self.triggers {
            xml.push_str(&render_trigger(trigger));
        }
        xml.push_str("  </Triggers>\n");

        xml.push_str("  <Principals>\n    <Principal id=\"Author\">\n");
        if let Some(user) = &self.principal.user_id {
            xml.push_str(&element(6, "UserId", user));
        }
        xml.push_str(&element(6, "LogonType", self.principal.logon_type.as_str()));
        let run_level = match self.principal.run_level {
            RunLevel::LeastPrivilege => "LeastPrivilege",
            RunLevel::HighestAvailable => "HighestAvailable",
        };
        xml.push_str(&element(6, "RunLevel", run_level));
        xml.push_str("    </Principal>\n  </Principals>\n");

        let s = &self.settings;
        xml.push_str(&format!(
            r#"  <Settings>
    <MultipleInstancesPolicy>IgnoreNew</MultipleInstancesPolicy>
    <DisallowStartIfOnBatteries>{}</DisallowStartIfOnBatteries>
    <StopIfGoingOnBatteries>{}</StopIfGoingOnBatteries>
    <AllowHardTerminate>true</AllowHardTerminate>
    <StartWhenAvailable>false</StartWhenAvailable>
    <RunOnlyIfNetworkAvailable>false</RunOnlyIfNetworkAvailable>
    <IdleSettings>
      <StopOnIdleEnd>true</StopOnIdleEnd>
      <RestartOnIdle>false</RestartOnIdle>
    </IdleSettings>
    <AllowStartOnDemand>true</AllowStartOnDemand>
    <Enabled>true</Enabled>
    <Hidden>{}</Hidden>
    <RunOnlyIfIdle>false</RunOnlyIfIdle>
    <WakeToRun>false</WakeToRun>
    <ExecutionTimeLimit>PT0S</ExecutionTimeLimit>
    <Priority>{}</Priority>
  </Settings>
"#,
            s.disallow_start_on_batteries, s.stop_on_batteries, s.hidden, s.priority
        ));

        xml.push_str("  <Actions Context=\"Author\">\n    <Exec>\n");
        xml.push_str(&element(6, "Command", &self.action.command));
        if !self.action.arguments.is_empty() {
            xml.push_str(&element(6, "Arguments", &self.action.arguments));
        }
        if !self.action.working_directory.is_empty() {
            xml.push_str(&element(6, "WorkingDirectory", &self.action.working_directory));
        }
        xml.push_str("    </Exec>\n  </Actions>\n");
        xml.push_str("</Task>\n");
        xml
    }
}

fn element(indent: usize, name: &str, value: &str) -> String {
    format!("{:indent$}<{name}>{}</{name}>\n", "", escape_xml(value), indent = indent, name = name)
}

fn empty_elements(indent: usize, names: &[&str]) -> String {
    names
        .iter()
        .map(|name| format!("{:indent$}<{} />\n", "", name, indent = indent))
        .collect()
}

fn render_trigger(trigger: &CompiledTrigger) -> String {
    if let CompiledTrigger::OneTime { at } = trigger {
        return format!(
            "    <TimeTrigger>\n{}{}    </TimeTrigger>\n",
            element(6, "StartBoundary", &format_boundary(at)),
            element(6, "Enabled", "true")
        );
    }

    let mut xml = String::from("    <CalendarTrigger>\n");
    if let Some(Repetition { interval, duration }) = trigger.repetition() {
        xml.push_str("      <Repetition>\n");
        xml.push_str(&element(8, "Interval", &iso_duration(interval)));
        xml.push_str(&element(8, "Duration", &iso_duration(duration)));
        xml.push_str(&element(8, "StopAtDurationEnd", "false"));
        xml.push_str("      </Repetition>\n");
    }
    xml.push_str(&element(6, "StartBoundary", &format_boundary(&trigger.start())));
    xml.push_str(&element(6, "Enabled", "true"));

    match trigger {
        CompiledTrigger::Daily { .. } => {
            xml.push_str("      <ScheduleByDay>\n");
            xml.push_str(&element(8, "DaysInterval", "1"));
            xml.push_str("      </ScheduleByDay>\n");
        }
        CompiledTrigger::Weekly { days, .. } => {
            xml.push_str("      <ScheduleByWeek>\n        <DaysOfWeek>\n");
            xml.push_str(&empty_elements(10, &weekday_names(&days.days())));
            xml.push_str("        </DaysOfWeek>\n");
            xml.push_str(&element(8, "WeeksInterval", "1"));
            xml.push_str("      </ScheduleByWeek>\n");
        }
        CompiledTrigger::MonthlyByDay { months, days, .. } => {
            xml.push_str("      <ScheduleByMonth>\n        <DaysOfMonth>\n");
            for day in days.days() {
                xml.push_str(&element(10, "Day", &day.to_string()));
            }
            xml.push_str("        </DaysOfMonth>\n        <Months>\n");
            xml.push_str(&empty_elements(10, &month_names(&months.months())));
            xml.push_str("        </Months>\n      </ScheduleByMonth>\n");
        }
        CompiledTrigger::MonthlyByWeekday {
            months,
            days,
            weeks,
            ..
        } => {
            xml.push_str("      <ScheduleByMonthDayOfWeek>\n        <Weeks>\n");
            for week in weeks.weeks() {
                xml.push_str(&element(10, "Week", week.as_str()));
            }
            xml.push_str("        </Weeks>\n        <DaysOfWeek>\n");
            xml.push_str(&empty_elements(10, &weekday_names(&days.days())));
            xml.push_str("        </DaysOfWeek>\n        <Months>\n");
            xml.push_str(&empty_elements(10, &month_names(&months.months())));
            xml.push_str("        </Months>\n      </ScheduleByMonthDayOfWeek>\n");
        }
        CompiledTrigger::OneTime { .. } => {}
    }
    xml.push_str("    </CalendarTrigger>\n");
    xml
}

fn weekday_names(days: &[Weekday]) -> Vec<&'static str> {
    days.iter()
        .map(|day| match day {
            Weekday::Mon => "Monday",
            Weekday::Tue => "Tuesday",
            Weekday::Wed => "Wednesday",
            Weekday::Thu => "Thursday",
            Weekday::Fri => "Friday",
            Weekday::Sat => "Saturday",
            Weekday::Sun => "Sunday",
        })
        .collect()
}

fn month_names(months: &[u32]) -> Vec<&'static str> {
    const NAMES: [&str; 12] = [
        "January", "February", "March", "April", "May", "June", "July", "August", "September",
        "October", "November", "December",
    ];
    months
        .iter()
        .filter_map(|m| NAMES.get((*m as usize).wrapping_sub(1)).copied())
        .collect()
}

pub fn format_boundary(at: &DateTime<Local>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

/// ISO 8601 duration, e.g. `PT15M`, `PT12H`, `P1D`.
pub fn iso_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    if total == 0 {
        return "PT0S".to_string();
    }
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    let mut text = String::from("P");
    if days > 0 {
        text.push_str(&format!("{}D", days));
    }
    if hours > 0 || minutes > 0 || seconds > 0 {
        text.push('T');
        if hours > 0 {
            text.push_str(&format!("{}H", hours));
        }
        if minutes > 0 {
            text.push_str(&format!("{}M", minutes));
        }
        if seconds > 0 {
            text.push_str(&format!("{}S", seconds));
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::schtasks::trigger::{MonthSet, WeekSet, WeekdaySet};
    use chrono::TimeZone;

    fn at(h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 15, h, mi, 0).unwrap()
    }

    fn job() -> JobDescriptor {
        let mut job = JobDescriptor::new("home", "backup", r"C:\bin\resticprofile.exe");
        job.arguments = vec!["--name".to_string(), "home & away".to_string(), "backup".to_string()];
        job.job_description = "backup <home>".to_string();
        job.working_directory = r"C:\Users\bob".to_string();
        job
    }

    #[test]
    fn test_iso_duration() {
        assert_eq!(iso_duration(Duration::minutes(15)), "PT15M");
        assert_eq!(iso_duration(Duration::hours(12)), "PT12H");
        assert_eq!(iso_duration(Duration::minutes(1440)), "P1D");
        assert_eq!(iso_duration(Duration::minutes(1425)), "PT23H45M");
        assert_eq!(iso_duration(Duration::seconds(90)), "PT1M30S");
        assert_eq!(iso_duration(Duration::zero()), "PT0S");
    }

    #[test]
    fn test_system_task_xml() {
        let trigger = CompiledTrigger::Daily {
            start: at(3, 0),
            repetition: Some(Repetition {
                interval: Duration::hours(12),
                duration: Duration::hours(12),
            }),
        };
        let task = TaskDefinition::new(
            r"\resticsched backup\home backup",
            &job(),
            vec![trigger],
            Permission::System,
            TaskSettings::default(),
        );
        let xml = task.to_xml();

        assert!(xml.contains(r"<URI>\resticsched backup\home backup</URI>"));
        assert!(xml.contains(&format!("<SecurityDescriptor>{}</SecurityDescriptor>", SECURITY_DESCRIPTOR)));
        assert!(xml.contains("<Description>backup &lt;home&gt;</Description>"));
        assert!(xml.contains("<Interval>PT12H</Interval>"));
        assert!(xml.contains("<Duration>PT12H</Duration>"));
        assert!(xml.contains("<StartBoundary>2024-01-15T03:00:00"));
        assert!(xml.contains("<DaysInterval>1</DaysInterval>"));
        assert!(xml.contains("<UserId>SYSTEM</UserId>"));
        assert!(xml.contains("<LogonType>S4U</LogonType>"));
        assert!(xml.contains("<RunLevel>HighestAvailable</RunLevel>"));
        assert!(xml.contains("<Arguments>--name &quot;home &amp; away&quot; backup</Arguments>"));
        assert!(xml.contains(r"<WorkingDirectory>C:\Users\bob</WorkingDirectory>"));
        assert!(xml.contains("<Priority>5</Priority>"));
    }

    #[test]
    fn test_user_task_principal_and_background_priority() {
        let mut job = job();
        job.priority = Priority::Background;
        let task = TaskDefinition::new(
            r"\resticsched backup\home backup",
            &job,
            vec![CompiledTrigger::OneTime { at: at(4, 30) }],
            Permission::UserLoggedOn,
            TaskSettings::default(),
        );
        let xml = task.to_xml();
        assert!(xml.contains("<LogonType>InteractiveToken</LogonType>"));
        assert!(!xml.contains("<UserId>"));
        assert!(!xml.contains("SecurityDescriptor"));
        assert!(xml.contains("<TimeTrigger>"));
        assert!(xml.contains("<Priority>8</Priority>"));

        let principal = Principal::for_permission(Permission::UserBackground);
        assert_eq!(principal.logon_type, LogonType::Password);
    }

    #[test]
    fn test_monthly_by_weekday_xml() {
        let trigger = CompiledTrigger::MonthlyByWeekday {
            start: at(2, 0),
            repetition: None,
            months: MonthSet::from_months(&[1, 12]),
            days: WeekdaySet::from_days(&[Weekday::Mon]),
            weeks: WeekSet::all(),
        };
        let xml = render_trigger(&trigger);
        assert!(xml.contains("<ScheduleByMonthDayOfWeek>"));
        assert!(xml.contains("<Week>Last</Week>"));
        assert!(xml.contains("<Monday />"));
        assert!(xml.contains("<January />"));
        assert!(xml.contains("<December />"));
        assert!(!xml.contains("<March />"));
        assert!(!xml.contains("<Repetition>"));
    }
}
