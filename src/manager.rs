use std::collections::BTreeSet;
use std::io::Write;

use tracing::{debug, error, info, warn};

use crate::credentials::CredentialSession;
use crate::error::{Result, ScheduleError};
use crate::job::{JobDescriptor, FLAG_NO_START};
use crate::permission::Permission;
use crate::scheduler::{write_line, Handler};

/// Which configured jobs a command applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    /// `profile` or `profile.command`
    Target {
        profile: String,
        command: Option<String>,
    },
}

impl Selection {
    pub fn parse(target: &str) -> Self {
        match target.rsplit_once('.') {
            Some((profile, command)) if !profile.is_empty() && !command.is_empty() => Selection::Target {
                profile: profile.to_string(),
                command: Some(command.to_string()),
            },
            _ => Selection::Target {
                profile: target.to_string(),
                command: None,
            },
        }
    }

    fn is_all(&self) -> bool {
        matches!(self, Selection::All)
    }

    fn matches(&self, job: &JobDescriptor) -> bool {
        match self {
            Selection::All => true,
            Selection::Target { profile, command } => {
                job.profile_name == *profile && command.as_ref().map_or(true, |c| job.command_name == *c)
            }
        }
    }
}

/// Drives a [`Handler`] over the configured jobs: permission gating and sequencing.
pub struct JobManager {
    handler: Box<dyn Handler>,
    jobs: Vec<JobDescriptor>,
}

impl JobManager {
    pub fn new(handler: Box<dyn Handler>, jobs: Vec<JobDescriptor>) -> Self {
        Self { handler, jobs }
    }

    pub fn handler(&self) -> &dyn Handler {
        self.handler.as_ref()
    }

    fn select(&self, selection: &Selection) -> Result<Vec<&JobDescriptor>> {
        let selected: Vec<&JobDescriptor> = self.jobs.iter().filter(|j| selection.matches(j)).collect();
        if selected.is_empty() && !selection.is_all() {
            return Err(ScheduleError::Config(format!("no job configured for {:?}", selection)));
        }
        Ok(selected)
    }

    /// Resolved permission for `job`, refused when the current process cannot manage it.
    pub fn permission_for(&self, job: &JobDescriptor) -> Result<Permission> {
        let resolution = self.handler.detect_schedule_permission(job.permission);
        let permission = resolution.permission();
        if !resolution.is_certain() {
            warn!(
                job = %job.display_name(),
                %permission,
                "no permission declared, guessed from the current user: the job may get too much or too little file access"
            );
        }
        if !self.handler.check_permission(permission) {
            return Err(ScheduleError::AccessDenied(format!(
                "{} needs elevated privileges for {} permission",
                job.display_name(),
                permission
            )));
        }
        Ok(permission)
    }

    /// Install the selected jobs one after the other, stopping at the first failure.
    ///
    /// Returns how many jobs were scheduled.
    pub fn schedule(&self, selection: &Selection, no_start: bool, session: &mut CredentialSession) -> Result<usize> {
        let mut count = 0;
        for job in self.select(selection)? {
            if !job.has_schedules() {
                if selection.is_all() {
                    debug!(job = %job.display_name(), "no schedule, skipped");
                    continue;
                }
                return Err(ScheduleError::InvalidSchedule {
                    expression: String::new(),
                    reason: format!("{} has no schedule", job.display_name()),
                });
            }
            let permission = self.permission_for(job)?;
            let mut job = job.clone();
            if no_start {
                job.set_flag(FLAG_NO_START, "");
            }
            self.handler.create_job(&job, permission, session)?;
            info!(job = %job.display_name(), %permission, scheduler = self.handler.name(), "job scheduled");
            count += 1;
        }
        Ok(count)
    }

    /// Remove the selected jobs.
    ///
    /// With [`Selection::All`], every failure is logged and the loop goes on; installed jobs
    /// missing from the configuration are removed too. A single target returns its error.
    pub fn unschedule(&self, selection: &Selection) -> Result<usize> {
        let mut removed = 0;
        let mut seen = BTreeSet::new();
        for job in self.select(selection)? {
            seen.insert((job.profile_name.clone(), job.command_name.clone()));
            let result = self
                .permission_for(job)
                .and_then(|permission| self.handler.remove_job(job, permission));
            match result {
                Ok(()) => removed += 1,
                Err(e) if selection.is_all() && e.is_not_found() => {
                    debug!(job = %job.display_name(), "not scheduled");
                }
                Err(e) if selection.is_all() => {
                    error!(job = %job.display_name(), error = %e, "cannot remove job");
                }
                Err(e) => return Err(e),
            }
        }

        if selection.is_all() {
            removed += self.remove_orphans(&seen);
        }
        Ok(removed)
    }

    fn remove_orphans(&self, configured: &BTreeSet<(String, String)>) -> usize {
        let installed = match self.handler.scheduled("") {
            Ok(installed) => installed,
            Err(e) => {
                error!(error = %e, "cannot list installed jobs");
                return 0;
            }
        };
        let mut removed = 0;
        for found in installed {
            if configured.contains(&(found.profile_name.clone(), found.command_name.clone())) {
                continue;
            }
            let mut job = JobDescriptor::remove_only(&found.profile_name, &found.command_name);
            job.permission = found.permission;
            let result = self
                .permission_for(&job)
                .and_then(|permission| self.handler.remove_job(&job, permission));
            match result {
                Ok(()) => {
                    info!(job = %job.display_name(), "removed job missing from the configuration");
                    removed += 1;
                }
                Err(e) => error!(job = %job.display_name(), error = %e, "cannot remove job"),
            }
        }
        removed
    }

    /// Status of the selected jobs, preceded by a summary per profile.
    pub fn status(&self, selection: &Selection, out: &mut dyn Write) -> Result<()> {
        let jobs = self.select(selection)?;
        let profiles: BTreeSet<&str> = jobs.iter().map(|j| j.profile_name.as_str()).collect();
        for profile in profiles {
            self.handler.display_status(profile, out)?;
        }

        for job in jobs.into_iter().filter(|j| j.has_schedules()) {
            write_line(out, &format!("{} ({})", job.display_name(), self.handler.name()))?;
            if let Err(e) = self.handler.display_schedules(job, out) {
                warn!(job = %job.display_name(), error = %e, "cannot preview schedules");
            }
            match self.handler.display_job_status(job, out) {
                Ok(()) => {}
                Err(e) if selection.is_all() && e.is_not_found() => {
                    write_line(out, "not scheduled")?;
                }
                Err(e) if selection.is_all() => {
                    error!(job = %job.display_name(), error = %e, "cannot display status");
                }
                Err(e) => return Err(e),
            }
            write_line(out, "")?;
        }
        Ok(())
    }

    /// Installed jobs, as read back from the scheduler.
    pub fn list(&self, profile_filter: &str, out: &mut dyn Write) -> Result<usize> {
        let jobs = self.handler.scheduled(profile_filter)?;
        for job in &jobs {
            write_line(
                out,
                &format!(
                    "{:<20} {:<10} {:<15} {}",
                    job.profile_name,
                    job.command_name,
                    job.permission,
                    job.schedules.join(", ")
                ),
            )?;
        }
        Ok(jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::credentials::testing::session;
    use crate::error::ErrorKind;
    use crate::permission::PermissionResolution;

    /// Records every call and fails on the configured profiles.
    #[derive(Default)]
    struct RecordingHandler {
        elevated: bool,
        failing: Vec<String>,
        installed: Vec<JobDescriptor>,
        calls: Mutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn outcome(&self, job: &JobDescriptor) -> Result<()> {
            if self.failing.contains(&job.profile_name) {
                Err(ScheduleError::JobNotFound(job.display_name()))
            } else {
                Ok(())
            }
        }
    }

    impl Handler for std::sync::Arc<RecordingHandler> {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn init(&self) -> Result<()> {
            Ok(())
        }

        fn create_job(&self, job: &JobDescriptor, permission: Permission, _session: &mut CredentialSession) -> Result<()> {
            self.record(format!("create {} {} {}", job.display_name(), permission, job.has_flag(FLAG_NO_START)));
            self.outcome(job)
        }

        fn remove_job(&self, job: &JobDescriptor, _permission: Permission) -> Result<()> {
            self.record(format!("remove {} {}", job.display_name(), job.remove_only));
            self.outcome(job)
        }

        fn display_job_status(&self, job: &JobDescriptor, _out: &mut dyn Write) -> Result<()> {
            self.record(format!("status {}", job.display_name()));
            self.outcome(job)
        }

        fn scheduled(&self, _profile_filter: &str) -> Result<Vec<JobDescriptor>> {
            Ok(self.installed.clone())
        }

        fn detect_schedule_permission(&self, declared: Permission) -> PermissionResolution {
            if declared.is_specified() {
                PermissionResolution::Declared(declared)
            } else {
                PermissionResolution::Guessed(Permission::UserLoggedOn)
            }
        }

        fn check_permission(&self, permission: Permission) -> bool {
            permission == Permission::UserLoggedOn || self.elevated
        }

        fn display_schedules(&self, _job: &JobDescriptor, _out: &mut dyn Write) -> Result<()> {
            Ok(())
        }
    }

    fn job(profile: &str, command: &str, scheduled: bool) -> JobDescriptor {
        let mut job = JobDescriptor::new(profile, command, "rp");
        if scheduled {
            job.schedules = vec!["daily".to_string()];
        }
        job
    }

    fn manager(handler: RecordingHandler, jobs: Vec<JobDescriptor>) -> (JobManager, std::sync::Arc<RecordingHandler>) {
        let handler = std::sync::Arc::new(handler);
        (JobManager::new(Box::new(handler.clone()), jobs), handler)
    }

    fn calls(handler: &RecordingHandler) -> Vec<String> {
        handler.calls.lock().unwrap().clone()
    }

    #[test]
    fn test_selection_parse() {
        assert_eq!(
            Selection::parse("home.backup"),
            Selection::Target {
                profile: "home".to_string(),
                command: Some("backup".to_string())
            }
        );
        assert_eq!(
            Selection::parse("home"),
            Selection::Target {
                profile: "home".to_string(),
                command: None
            }
        );
    }

    #[test]
    fn test_schedule_all_skips_jobs_without_schedule() {
        let jobs = vec![job("home", "backup", true), job("home", "check", false), job("office", "backup", true)];
        let (manager, handler) = manager(RecordingHandler::default(), jobs);
        let (mut session, _) = session("x");

        let count = manager.schedule(&Selection::All, true, &mut session).unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            calls(&handler),
            vec!["create backup@home user_logged_on true", "create backup@office user_logged_on true"]
        );
    }

    #[test]
    fn test_schedule_single_without_schedule_fails() {
        let (manager, handler) = manager(RecordingHandler::default(), vec![job("home", "check", false)]);
        let (mut session, _) = session("x");
        let err = manager
            .schedule(&Selection::parse("home.check"), false, &mut session)
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidSchedule { .. }));
        assert!(calls(&handler).is_empty());
    }

    #[test]
    fn test_schedule_aborts_on_failure() {
        let handler = RecordingHandler {
            failing: vec!["home".to_string()],
            ..Default::default()
        };
        let jobs = vec![job("home", "backup", true), job("office", "backup", true)];
        let (manager, handler) = manager(handler, jobs);
        let (mut session, _) = session("x");
        assert!(manager.schedule(&Selection::All, false, &mut session).is_err());
        assert_eq!(calls(&handler).len(), 1);
    }

    #[test]
    fn test_system_job_needs_elevation() {
        let mut system = job("home", "backup", true);
        system.permission = Permission::System;
        let (manager, handler) = manager(RecordingHandler::default(), vec![system]);
        let (mut session, _) = session("x");
        let err = manager.schedule(&Selection::All, false, &mut session).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        assert!(calls(&handler).is_empty());
    }

    #[test]
    fn test_unschedule_all_continues_and_removes_orphans() {
        let handler = RecordingHandler {
            failing: vec!["home".to_string()],
            installed: vec![job("office", "backup", true), job("old", "prune", true)],
            ..Default::default()
        };
        let jobs = vec![job("home", "backup", true), job("office", "backup", true)];
        let (manager, handler) = manager(handler, jobs);

        let removed = manager.unschedule(&Selection::All).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            calls(&handler),
            vec!["remove backup@home false", "remove backup@office false", "remove prune@old true"]
        );
    }

    #[test]
    fn test_unschedule_single_returns_not_found() {
        let handler = RecordingHandler {
            failing: vec!["home".to_string()],
            ..Default::default()
        };
        let (manager, _) = manager(handler, vec![job("home", "backup", true)]);
        let err = manager.unschedule(&Selection::parse("home")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_unknown_target() {
        let (manager, _) = manager(RecordingHandler::default(), vec![job("home", "backup", true)]);
        assert!(matches!(
            manager.unschedule(&Selection::parse("office")),
            Err(ScheduleError::Config(_))
        ));
    }

    #[test]
    fn test_status_all_reports_missing_jobs() {
        let handler = RecordingHandler {
            failing: vec!["home".to_string()],
            ..Default::default()
        };
        let jobs = vec![job("home", "backup", true), job("office", "backup", true)];
        let (manager, handler) = manager(handler, jobs);
        let mut out = Vec::new();
        manager.status(&Selection::All, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("backup@home (recording)\nnot scheduled\n"));
        assert_eq!(calls(&handler), vec!["status backup@home", "status backup@office"]);
    }

    #[test]
    fn test_list() {
        let handler = RecordingHandler {
            installed: vec![job("home", "backup", true)],
            ..Default::default()
        };
        let (manager, _) = manager(handler, Vec::new());
        let mut out = Vec::new();
        assert_eq!(manager.list("", &mut out).unwrap(), 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("home"));
        assert!(text.contains("daily"));
    }
}
