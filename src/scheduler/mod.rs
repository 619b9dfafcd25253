use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::calendar::{self, RecurrenceSpec};
use crate::config::Settings;
use crate::credentials::CredentialSession;
use crate::error::{Result, ScheduleError};
use crate::job::JobDescriptor;
use crate::permission::{Permission, PermissionResolution, ProcessUser};
use crate::process::CommandRunner;

pub mod crond;
pub mod launchd;
pub mod schtasks;
pub mod systemd;

/// Number of upcoming runs shown when previewing a schedule.
const PREVIEW_COUNT: usize = 5;

/// Lifecycle contract shared by every scheduler backend.
pub trait Handler: Send + Sync {
    /// Human-readable name of the backend.
    fn name(&self) -> &'static str;

    /// Verify the backend's tooling is available.
    fn init(&self) -> Result<()>;

    /// Install (or replace) the native entity for `job` and activate it.
    ///
    /// Steps are not rolled back: when one fails, the error names it and earlier steps stay applied.
    fn create_job(
        &self,
        job: &JobDescriptor,
        permission: Permission,
        session: &mut CredentialSession,
    ) -> Result<()>;

    /// Stop, disable and delete the native entity. Fails with `JobNotFound` when it is not installed.
    fn remove_job(&self, job: &JobDescriptor, permission: Permission) -> Result<()>;

    /// Native state plus recent diagnostics for one job.
    fn display_job_status(&self, job: &JobDescriptor, out: &mut dyn Write) -> Result<()>;

    /// Installed jobs whose profile matches `profile_filter` (a glob, empty for all).
    fn scheduled(&self, profile_filter: &str) -> Result<Vec<JobDescriptor>>;

    fn detect_schedule_permission(&self, declared: Permission) -> PermissionResolution;

    fn check_permission(&self, permission: Permission) -> bool;

    /// Backend-wide summary for a profile.
    fn display_status(&self, _profile: &str, _out: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    /// Preview of the next runs of each schedule of `job`.
    fn display_schedules(&self, job: &JobDescriptor, out: &mut dyn Write) -> Result<()> {
        let events = calendar::parse_schedules(&job.schedules)?;
        let now = Local::now();
        for event in &events {
            write_line(out, &format!("Schedule for {}: {}", job.display_name(), event.expression()))?;
            for at in calendar::upcoming(event, now, PREVIEW_COUNT) {
                write_line(out, &format!("  {}", at.format("%a %Y-%m-%d %H:%M:%S")))?;
            }
        }
        Ok(())
    }
}

/// Which native scheduler to drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    #[default]
    Auto,
    Systemd,
    Crond,
    Launchd,
    #[serde(alias = "schtasks", alias = "windows")]
    TaskScheduler,
}

impl SchedulerKind {
    /// Resolve `Auto` for the running system.
    pub fn resolve(self) -> SchedulerKind {
        match self {
            SchedulerKind::Auto if cfg!(windows) => SchedulerKind::TaskScheduler,
            SchedulerKind::Auto if cfg!(target_os = "macos") => SchedulerKind::Launchd,
            SchedulerKind::Auto if Path::new("/run/systemd/system").exists() => SchedulerKind::Systemd,
            SchedulerKind::Auto => SchedulerKind::Crond,
            other => other,
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerKind::Auto => "auto",
            SchedulerKind::Systemd => "systemd",
            SchedulerKind::Crond => "crond",
            SchedulerKind::Launchd => "launchd",
            SchedulerKind::TaskScheduler => "taskscheduler",
        };
        f.write_str(name)
    }
}

/// Build the handler selected by the settings.
pub fn create_handler(settings: &Settings, runner: Arc<dyn CommandRunner>) -> Box<dyn Handler> {
    let user = ProcessUser::detect(runner.as_ref());
    match settings.scheduler.resolve() {
        SchedulerKind::Systemd => Box::new(systemd::SystemdHandler::new(
            settings.systemd.clone(),
            &settings.app_name,
            user,
            runner,
        )),
        SchedulerKind::Launchd => Box::new(launchd::LaunchdHandler::new(
            settings.launchd.clone(),
            &settings.app_name,
            user,
            runner,
        )),
        SchedulerKind::TaskScheduler => {
            let store = Arc::new(schtasks::store::SchtasksStore::new(runner));
            Box::new(schtasks::SchtasksHandler::new(
                settings.taskscheduler.clone(),
                &settings.app_name,
                user,
                store,
            ))
        }
        SchedulerKind::Crond | SchedulerKind::Auto => Box::new(crond::CrondHandler::new(
            settings.crond.clone(),
            &settings.app_name,
            user,
            runner,
        )),
    }
}

/// Compiled profile-name glob; `None` matches everything.
pub(crate) fn profile_matcher(filter: &str) -> Result<Option<Pattern>> {
    let filter = filter.trim();
    if filter.is_empty() {
        return Ok(None);
    }
    Pattern::new(filter)
        .map(Some)
        .map_err(|e| ScheduleError::Config(format!("invalid profile filter {:?}: {}", filter, e)))
}

pub(crate) fn profile_matches(matcher: &Option<Pattern>, profile: &str) -> bool {
    matcher.as_ref().map_or(true, |p| p.matches(profile))
}

pub(crate) fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

/// `&amp;` goes last so escaped entities are not decoded twice.
pub(crate) fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

pub(crate) fn write_line(out: &mut dyn Write, line: &str) -> Result<()> {
    writeln!(out, "{}", line).map_err(|e| ScheduleError::io("output", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_matcher() {
        let all = profile_matcher("").unwrap();
        assert!(profile_matches(&all, "anything"));

        let some = profile_matcher("home*").unwrap();
        assert!(profile_matches(&some, "home"));
        assert!(profile_matches(&some, "homework"));
        assert!(!profile_matches(&some, "office"));

        assert!(profile_matcher("[").is_err());
    }

    #[test]
    fn test_xml_escaping() {
        let text = r#"a <b> & "c" 'd' &lt;"#;
        let escaped = escape_xml(text);
        assert_eq!(escaped, "a &lt;b&gt; &amp; &quot;c&quot; &apos;d&apos; &amp;lt;");
        assert_eq!(unescape_xml(&escaped), text);
    }

    #[test]
    fn test_explicit_kind_is_kept() {
        assert_eq!(SchedulerKind::Crond.resolve(), SchedulerKind::Crond);
        assert_ne!(SchedulerKind::Auto.resolve(), SchedulerKind::Auto);
        if cfg!(target_os = "macos") {
            assert_eq!(SchedulerKind::Auto.resolve(), SchedulerKind::Launchd);
        }
    }

    #[test]
    fn test_kind_from_config_name() {
        let kind: SchedulerKind = serde_json::from_str("\"taskscheduler\"").unwrap();
        assert_eq!(kind, SchedulerKind::TaskScheduler);
        let kind: SchedulerKind = serde_json::from_str("\"schtasks\"").unwrap();
        assert_eq!(kind, SchedulerKind::TaskScheduler);
        assert_eq!(SchedulerKind::Systemd.to_string(), "systemd");
        let kind: SchedulerKind = serde_json::from_str("\"launchd\"").unwrap();
        assert_eq!(kind, SchedulerKind::Launchd);
        assert_eq!(kind.to_string(), "launchd");
    }
}
