//! Service-manager backend: one `.service`/`.timer` pair per job, driven through `systemctl`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::config::SystemdSettings;
use crate::credentials::CredentialSession;
use crate::error::{classify, ErrorKind, Result, Rule, ScheduleError, Step, StepContext};
use crate::job::{JobDescriptor, Priority, FLAG_NO_START};
use crate::permission::{Permission, PermissionResolution, ProcessUser};
use crate::process::{args, lookup_binary, CommandOutput, CommandRunner};
use crate::scheduler::{profile_matcher, profile_matches, write_line, Handler};

pub mod unit;

use unit::{ServiceOptions, UnitNames, UnitScope};

pub const SYSTEMCTL_BINARY: &str = "systemctl";
pub const JOURNALCTL_BINARY: &str = "journalctl";
pub const ANALYZE_BINARY: &str = "systemd-analyze";

const FLAG_NO_PAGER: &str = "--no-pager";
const UNIT_NOT_FOUND: &str = "not-found";

/// Exit codes from the systemctl manual; `stop` returning 5 is undocumented.
pub static SYSTEMCTL_RULES: &[Rule] = &[
    Rule::exit("status", 3, ErrorKind::JobNotRunning),
    Rule::exit("status", 4, ErrorKind::JobNotFound),
    Rule::exit("stop", 5, ErrorKind::JobNotFound),
    Rule::stderr("Access denied", ErrorKind::AccessDenied),
    Rule::stderr("Interactive authentication required", ErrorKind::AccessDenied),
    Rule::stderr("does not exist", ErrorKind::JobNotFound),
];

/// One entry of `systemctl list-units --output json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListedUnit {
    pub unit: String,
    pub load: String,
    #[serde(default)]
    pub active: String,
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub description: String,
}

impl ListedUnit {
    fn is_loaded(&self) -> bool {
        self.load != UNIT_NOT_FOUND
    }
}

pub struct SystemdHandler {
    settings: SystemdSettings,
    app_name: String,
    user: ProcessUser,
    runner: Arc<dyn CommandRunner>,
    system_dir: PathBuf,
    user_dir: PathBuf,
}

impl SystemdHandler {
    pub fn new(settings: SystemdSettings, app_name: &str, user: ProcessUser, runner: Arc<dyn CommandRunner>) -> Self {
        let system_dir = settings.system_unit_dir.clone();
        let user_dir = settings.user_unit_dir();
        Self {
            settings,
            app_name: app_name.to_string(),
            user,
            runner,
            system_dir,
            user_dir,
        }
    }

    /// Unit scope and `User=` for a permission.
    pub fn scope_for(&self, permission: Permission) -> (UnitScope, Option<String>) {
        match permission {
            Permission::System => (UnitScope::System, None),
            Permission::UserBackground => (UnitScope::System, Some(self.user.effective_username().to_string())),
            Permission::UserLoggedOn => (UnitScope::User, None),
            Permission::Unspecified if self.user.elevated => (UnitScope::System, None),
            Permission::Unspecified => (UnitScope::User, None),
        }
    }

    pub fn unit_dir(&self, scope: UnitScope) -> &Path {
        match scope {
            UnitScope::System => &self.system_dir,
            UnitScope::User => &self.user_dir,
        }
    }

    fn user_flags(&self) -> Vec<String> {
        let mut flags = args(["--user"]);
        if let Some(sudo_user) = &self.user.sudo_user {
            flags.push("-M".to_string());
            flags.push(format!("{}@", sudo_user));
        }
        flags
    }

    /// Run `systemctl [--user] --no-pager <extra> <verb> <unit>` without classifying the exit code.
    fn systemctl_raw(&self, scope: UnitScope, verb: &str, extra: &[&str], unit: &str) -> Result<CommandOutput> {
        let mut arguments = Vec::new();
        if scope == UnitScope::User {
            arguments.extend(self.user_flags());
        }
        arguments.push(FLAG_NO_PAGER.to_string());
        arguments.extend(args(extra.iter().copied()));
        arguments.push(verb.to_string());
        if !unit.is_empty() {
            arguments.push(unit.to_string());
        }
        self.runner.run(SYSTEMCTL_BINARY, &arguments)
    }

    fn systemctl(&self, scope: UnitScope, verb: &str, extra: &[&str], unit: &str) -> Result<CommandOutput> {
        let output = self.systemctl_raw(scope, verb, extra, unit)?;
        if output.success() {
            Ok(output)
        } else {
            Err(classify(SYSTEMCTL_RULES, verb, unit, &output))
        }
    }

    fn reload(&self, scope: UnitScope) -> Result<()> {
        self.systemctl(scope, "daemon-reload", &[], "")?;
        Ok(())
    }

    fn list_units(&self, scope: UnitScope) -> Result<Vec<ListedUnit>> {
        let pattern = format!("{}-*@profile-*.service", self.app_name);
        let output = self.systemctl(scope, "list-units", &["--all", "--output", "json"], &pattern)?;
        let stdout = output.stdout.trim();
        if stdout.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(stdout).map_err(|e| ScheduleError::Decode {
            program: SYSTEMCTL_BINARY.to_string(),
            reason: e.to_string(),
        })
    }

    fn unit_loaded(&self, scope: UnitScope, service: &str) -> Result<bool> {
        Ok(self
            .list_units(scope)?
            .iter()
            .any(|unit| unit.unit == service && unit.is_loaded()))
    }

    fn environment(&self, job: &JobDescriptor) -> std::collections::BTreeMap<String, String> {
        let mut environment = job.environment.clone();
        if let Some(home) = &self.user.home {
            environment
                .entry("HOME".to_string())
                .or_insert_with(|| home.to_string_lossy().to_string());
        }
        if let Some(sudo_user) = &self.user.sudo_user {
            environment
                .entry("SUDO_USER".to_string())
                .or_insert_with(|| sudo_user.clone());
        }
        environment
    }

    fn service_options(&self, job: &JobDescriptor, run_as: Option<String>) -> ServiceOptions {
        let background = job.priority == Priority::Background;
        ServiceOptions {
            run_as,
            nice: background.then_some(self.settings.nice),
            io_scheduling_class: self.settings.io_scheduling_class.filter(|_| background),
            io_scheduling_priority: self.settings.io_scheduling_priority.filter(|_| background),
            environment: self.environment(job),
        }
    }

    /// A job moved to another scope must not stay installed in the old one.
    fn remove_from_other_scope(&self, job: &JobDescriptor, scope: UnitScope, names: &UnitNames) -> Result<()> {
        let other = scope.other();
        match self.unit_loaded(other, &names.service) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => {
                warn!(scope = ?other, error = %e, "cannot list units, previous scope left untouched");
                return Ok(());
            }
        }
        info!(unit = %names.timer, "removing existing unit with different permission");
        self.systemctl(other, "disable", &["--now", "--quiet"], &names.timer)
            .step(Step::Disable)?;
        unit::remove_files(self.unit_dir(other), names);
        self.reload(other).step(Step::Reload)?;
        debug!(job = %job.display_name(), "previous scope cleaned up");
        Ok(())
    }

    fn display_journal(&self, scope: UnitScope, names: &UnitNames, out: &mut dyn Write) -> Result<()> {
        let unit = names.timer.trim_end_matches(".timer");
        let lines = self.settings.journal_lines.to_string();
        let mut arguments = args([
            "--since",
            "1 month ago",
            FLAG_NO_PAGER,
            "--priority",
            "warning",
            "--lines",
            lines.as_str(),
            "--unit",
            unit,
        ]);
        if scope == UnitScope::User {
            arguments.push("--user".to_string());
        }
        let output = self.runner.run(JOURNALCTL_BINARY, &arguments)?;
        if !output.success() {
            return Err(classify(&[], "journal", unit, &output));
        }
        write_line(out, "Recent log (>= warning in the last month)")?;
        write_line(out, "==========================================")?;
        write_line(out, output.stdout.trim_end())?;
        write_line(out, "")
    }
}

impl Handler for SystemdHandler {
    fn name(&self) -> &'static str {
        "systemd"
    }

    fn init(&self) -> Result<()> {
        lookup_binary("systemd", SYSTEMCTL_BINARY).map(|_| ())
    }

    fn create_job(&self, job: &JobDescriptor, permission: Permission, _session: &mut CredentialSession) -> Result<()> {
        job.validate_identity()?;
        let (scope, run_as) = self.scope_for(permission);
        if scope == UnitScope::User && job.after_network_online {
            return Err(ScheduleError::Unsupported(
                "after_network_online is not available for \"user_logged_on\" permission schedules".to_string(),
            ));
        }

        let names = UnitNames::for_job(&self.app_name, job);
        self.remove_from_other_scope(job, scope, &names)?;

        let dir = self.unit_dir(scope);
        let service = unit::render_service(&self.app_name, job, &self.service_options(job, run_as));
        let timer = unit::render_timer(job, &names);
        unit::write_unit_file(&dir.join(&names.service), &service).step(Step::WriteDefinition)?;
        unit::write_unit_file(&dir.join(&names.timer), &timer).step(Step::WriteDefinition)?;
        unit::sync_drop_ins(dir, &self.app_name, &names, &job.drop_in_files).step(Step::WriteDefinition)?;

        self.reload(scope).step(Step::Reload)?;
        self.systemctl(scope, "enable", &["--quiet"], &names.timer)
            .step(Step::Enable)?;
        if job.has_flag(FLAG_NO_START) {
            info!(timer = %names.timer, "timer enabled, not started");
        } else {
            self.systemctl(scope, "start", &[], &names.timer)
                .step(Step::Start)?;
            info!(timer = %names.timer, "timer enabled and started");
        }
        Ok(())
    }

    fn remove_job(&self, job: &JobDescriptor, permission: Permission) -> Result<()> {
        let (scope, _) = self.scope_for(permission);
        let names = UnitNames::for_job(&self.app_name, job);

        let loaded = match self.unit_loaded(scope, &names.service) {
            Ok(loaded) => loaded,
            Err(e) if job.remove_only => {
                warn!(error = %e, "cannot list units, removing anyway");
                false
            }
            Err(e) => return Err(e).step(Step::Query),
        };
        if !loaded && !job.remove_only {
            return Err(ScheduleError::JobNotFound(names.service));
        }

        let disabled = self.systemctl(scope, "disable", &["--now", "--quiet"], &names.timer);
        match disabled {
            Ok(_) => {}
            Err(e) if job.remove_only => warn!(timer = %names.timer, error = %e, "cannot disable timer"),
            Err(e) => return Err(e).step(Step::Disable),
        }

        unit::remove_files(self.unit_dir(scope), &names);
        self.reload(scope).step(Step::Reload)?;
        info!(job = %job.display_name(), "removed systemd units");
        Ok(())
    }

    fn display_job_status(&self, job: &JobDescriptor, out: &mut dyn Write) -> Result<()> {
        let permission = self.detect_schedule_permission(job.permission).permission();
        let (scope, _) = self.scope_for(permission);
        let names = UnitNames::for_job(&self.app_name, job);

        if !self.unit_loaded(scope, &names.service).step(Step::Query)? {
            return Err(ScheduleError::JobNotFound(names.service));
        }

        if scope == UnitScope::User && self.user.elevated {
            warn!("cannot load the journal from a user service as root");
        } else if let Err(e) = self.display_journal(scope, &names, out) {
            warn!(error = %e, "cannot read the journal");
        }

        let output = self.systemctl_raw(scope, "status", &[], &names.timer)?;
        write_line(out, "Systemd timer status")?;
        write_line(out, "=====================")?;
        write_line(out, output.stdout.trim_end())?;
        if output.success() {
            Ok(())
        } else {
            Err(classify(SYSTEMCTL_RULES, "status", &names.timer, &output))
        }
    }

    fn scheduled(&self, profile_filter: &str) -> Result<Vec<JobDescriptor>> {
        let matcher = profile_matcher(profile_filter)?;
        let mut jobs = Vec::new();

        for scope in [UnitScope::System, UnitScope::User] {
            let units = match self.list_units(scope) {
                Ok(units) => units,
                Err(e) => {
                    error!(?scope, error = %e, "cannot list units");
                    continue;
                }
            };
            for listed in units.iter().filter(|u| u.is_loaded()) {
                let (profile, command) = match UnitNames::parse(&self.app_name, &listed.unit) {
                    Ok(identity) => identity,
                    Err(e) => {
                        error!(unit = %listed.unit, error = %e, "cannot read unit name");
                        continue;
                    }
                };
                if !profile_matches(&matcher, &profile) {
                    continue;
                }
                let names = UnitNames::new(&self.app_name, &profile, &command);
                match unit::read_job(self.unit_dir(scope), &self.app_name, &names, scope) {
                    Ok(job) => jobs.push(job),
                    Err(e) => error!(unit = %listed.unit, error = %e, "cannot read information from unit"),
                }
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

    fn display_status(&self, profile: &str, out: &mut dyn Write) -> Result<()> {
        let scope = if self.user.elevated { UnitScope::System } else { UnitScope::User };
        let pattern = format!("{}-*@profile-{}.timer", self.app_name, profile);
        let status = match self.systemctl_raw(scope, "list-timers", &["--all"], &pattern) {
            Ok(output) if output.success() => output.stdout,
            _ => return Ok(()),
        };
        if status.trim().is_empty() || status.contains("0 timers") {
            return Ok(());
        }
        write_line(out, "")?;
        write_line(out, "Timers summary")?;
        write_line(out, "===============")?;
        write_line(out, status.trim_end())
    }

    fn display_schedules(&self, job: &JobDescriptor, out: &mut dyn Write) -> Result<()> {
        let total = job.schedules.len();
        for (index, schedule) in job.schedules.iter().enumerate() {
            if schedule.trim().is_empty() {
                return Err(ScheduleError::InvalidSchedule {
                    expression: schedule.clone(),
                    reason: "empty schedule".to_string(),
                });
            }
            write_line(
                out,
                &format!("Schedule {}/{} for {}", index + 1, total, job.display_name()),
            )?;
            let output = self.runner.run(ANALYZE_BINARY, &args(["calendar", schedule.as_str()]))?;
            if !output.success() {
                return Err(classify(&[], "calendar", schedule, &output));
            }
            write_line(out, output.stdout.trim_end())?;
        }
        Ok(())
    }
}
