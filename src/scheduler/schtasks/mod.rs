//! Task Scheduler backend: one registered task per job under `\<app> backup\`.

use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::calendar::{self, RecurrenceSpec};
use crate::config::TaskSchedulerSettings;
use crate::credentials::CredentialSession;
use crate::error::{Result, ScheduleError, Step, StepContext};
use crate::job::{join_command_line, JobDescriptor};
use crate::permission::{Permission, PermissionResolution, ProcessUser};
use crate::process::lookup_binary;
use crate::scheduler::{profile_matcher, profile_matches, write_line, Handler};

pub mod store;
pub mod task;
pub mod trigger;

use store::{TaskInfo, TaskStore, SCHTASKS_BINARY};
use task::{TaskDefinition, TaskSettings};

const HEADLESS_HOST: &str = "conhost.exe";
const HEADLESS_FLAG: &str = "--headless";
const SYSTEM_ACCOUNT: &str = "SYSTEM";

/// Fields of the verbose query shown by `status`, with their labels.
const STATUS_FIELDS: &[(&str, &str)] = &[
    ("Task", "TaskName"),
    ("User", "Run As User"),
    ("Working Dir", "Start In"),
    ("Command", "Task To Run"),
    ("Status", "Status"),
    ("Last Run Time", "Last Run Time"),
    ("Last Result", "Last Result"),
    ("Next Run Time", "Next Run Time"),
];

pub struct SchtasksHandler {
    settings: TaskSchedulerSettings,
    app_name: String,
    user: ProcessUser,
    store: Arc<dyn TaskStore>,
    reference_time: Option<DateTime<Local>>,
}

impl SchtasksHandler {
    pub fn new(
        settings: TaskSchedulerSettings,
        app_name: &str,
        user: ProcessUser,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            settings,
            app_name: app_name.to_string(),
            user,
            store,
            reference_time: None,
        }
    }

    /// Anchor trigger compilation on a fixed instant instead of the clock.
    pub fn with_reference_time(mut self, now: DateTime<Local>) -> Self {
        self.reference_time = Some(now);
        self
    }

    fn now(&self) -> DateTime<Local> {
        self.reference_time.unwrap_or_else(Local::now)
    }

    /// `\<app> backup\`
    pub fn folder(&self) -> String {
        format!("\\{} backup\\", self.app_name)
    }

    /// `\<app> backup\<profile> <command>`
    pub fn task_path(&self, job: &JobDescriptor) -> String {
        format!("{}{} {}", self.folder(), job.profile_name, job.command_name)
    }

    /// `(profile, command)` of a task in our folder. The command never contains a space.
    fn parse_task_path(&self, path: &str) -> Option<(String, String)> {
        let name = path.strip_prefix(&self.folder())?;
        let (profile, command) = name.rsplit_once(' ')?;
        if profile.is_empty() || command.is_empty() {
            return None;
        }
        Some((profile.to_string(), command.to_string()))
    }

    /// Executable and arguments of the task action.
    fn action(&self, job: &JobDescriptor, permission: Permission) -> JobDescriptor {
        let mut action = job.clone();
        if !self.settings.hide_window {
            return action;
        }
        if permission != Permission::UserLoggedOn {
            warn!("hiding the window only makes sense with \"user_logged_on\" permission");
        }
        action.command = HEADLESS_HOST.to_string();
        action.arguments = vec![HEADLESS_FLAG.to_string(), job.command.clone()];
        action.arguments.extend(job.arguments.iter().cloned());
        action
    }

    fn task_settings(&self) -> TaskSettings {
        TaskSettings {
            disallow_start_on_batteries: self.settings.disallow_start_on_batteries,
            stop_on_batteries: self.settings.stop_on_batteries,
            hidden: self.settings.hide_window,
            ..Default::default()
        }
    }

    fn read_job(&self, profile: &str, command: &str, info: &TaskInfo) -> JobDescriptor {
        let field = |name: &str| info.get(name).map(|v| v.trim().to_string()).unwrap_or_default();

        let mut job = JobDescriptor::new(profile, command, "");
        job.apply_command_line(&field("Task To Run"));
        if job.command.eq_ignore_ascii_case(HEADLESS_HOST)
            && job.arguments.first().map(String::as_str) == Some(HEADLESS_FLAG)
        {
            let inner = join_command_line(&job.arguments[1..]);
            job.apply_command_line(&inner);
        }
        job.working_directory = field("Start In");
        job.job_description = field("Comment");
        job.permission = permission_from_info(info);
        job
    }
}

/// Run-as account and logon mode of a registered task, mapped back to a permission.
fn permission_from_info(info: &TaskInfo) -> Permission {
    let run_as = info.get("Run As User").map(|v| v.trim()).unwrap_or_default();
    let logon_mode = info.get("Logon Mode").map(|v| v.trim()).unwrap_or_default();
    if run_as.eq_ignore_ascii_case(SYSTEM_ACCOUNT) {
        Permission::System
    } else if logon_mode.eq_ignore_ascii_case("Interactive only") {
        Permission::UserLoggedOn
    } else if logon_mode.is_empty() {
        Permission::Unspecified
    } else {
        Permission::UserBackground
    }
}

impl Handler for SchtasksHandler {
    fn name(&self) -> &'static str {
        "taskscheduler"
    }

    fn init(&self) -> Result<()> {
        lookup_binary("the task scheduler", SCHTASKS_BINARY).map(|_| ())
    }

    fn create_job(&self, job: &JobDescriptor, permission: Permission, session: &mut CredentialSession) -> Result<()> {
        job.validate_identity()?;
        let permission = self.detect_schedule_permission(permission).permission();

        let events = calendar::parse_schedules(&job.schedules)?;
        let specs: Vec<&dyn RecurrenceSpec> = events.iter().map(|e| e as &dyn RecurrenceSpec).collect();
        let report = trigger::compile(&specs, self.now())?;
        for (expression, reason) in &report.skipped {
            warn!(schedule = %expression, %reason, "schedule cannot be represented by the task scheduler, skipped");
        }
        let triggers = report.into_triggers()?;
        debug!(count = triggers.len(), job = %job.display_name(), "compiled triggers");

        let path = self.task_path(job);
        let mut definition = TaskDefinition::new(
            &path,
            &self.action(job, permission),
            triggers,
            permission,
            self.task_settings(),
        );
        if definition.description.is_empty() {
            definition.description = format!(
                "{} {} for profile {}",
                self.app_name, job.command_name, job.profile_name
            );
        }

        let credentials = if permission == Permission::UserBackground {
            let credentials = session.credentials_for(self.user.effective_username())?;
            definition.principal.user_id = Some(credentials.username.clone());
            Some(credentials)
        } else {
            None
        };

        self.store
            .register(&definition, credentials.as_ref())
            .step(Step::Register)?;
        self.store.set_enabled(&path, true).step(Step::Enable)?;
        info!(task = %path, "task scheduled");
        Ok(())
    }

    fn remove_job(&self, job: &JobDescriptor, _permission: Permission) -> Result<()> {
        let path = self.task_path(job);

        match self.store.info(&path) {
            Ok(_) => {}
            Err(e) if job.remove_only => warn!(task = %path, error = %e, "cannot query task, removing anyway"),
            Err(e) if e.is_not_found() => return Err(ScheduleError::JobNotFound(path)),
            Err(e) => return Err(e).step(Step::Query),
        }

        if let Err(e) = self.store.end(&path) {
            debug!(task = %path, error = %e, "no running instance stopped");
        }
        match self.store.set_enabled(&path, false) {
            Ok(()) => {}
            Err(e) if job.remove_only => warn!(task = %path, error = %e, "cannot disable task"),
            Err(e) => return Err(e).step(Step::Disable),
        }
        match self.store.delete(&path) {
            Ok(()) => {}
            Err(e) if job.remove_only && e.is_not_found() => warn!(task = %path, "task already gone"),
            Err(e) => return Err(e).step(Step::Delete),
        }
        info!(task = %path, "task removed");
        Ok(())
    }

    fn display_job_status(&self, job: &JobDescriptor, out: &mut dyn Write) -> Result<()> {
        let path = self.task_path(job);
        let info = self.store.info(&path).step(Step::Query)?;
        for (label, field) in STATUS_FIELDS {
            let value = info.get(*field).map(String::as_str).unwrap_or("");
            write_line(out, &format!("{:<15}{}", format!("{}:", label), value))?;
        }
        write_line(out, "")
    }

    fn scheduled(&self, profile_filter: &str) -> Result<Vec<JobDescriptor>> {
        let matcher = profile_matcher(profile_filter)?;
        let mut jobs = Vec::new();
        for path in self.store.list()? {
            let Some((profile, command)) = self.parse_task_path(&path) else {
                continue;
            };
            if !profile_matches(&matcher, &profile) {
                continue;
            }
            match self.store.info(&path) {
                Ok(info) => jobs.push(self.read_job(&profile, &command, &info)),
                Err(e) => warn!(task = %path, error = %e, "cannot read task"),
            }
        }
        Ok(jobs)
    }

    fn detect_schedule_permission(&self, declared: Permission) -> PermissionResolution {
        self.user.resolve(declared)
    }

    fn check_permission(&self, permission: Permission) -> bool {
        self.user.can_manage(permission)
    }
}
