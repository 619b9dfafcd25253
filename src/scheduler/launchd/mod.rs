//! launchd backend: one plist per job, daemons for system jobs and agents for the rest.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::calendar;
use crate::config::LaunchdSettings;
use crate::credentials::CredentialSession;
use crate::error::{classify, ErrorKind, Result, Rule, ScheduleError, Step, StepContext};
use crate::job::{JobDescriptor, Priority};
use crate::permission::{Permission, PermissionResolution, ProcessUser};
use crate::process::{args, lookup_binary, CommandOutput, CommandRunner};
use crate::scheduler::{profile_matcher, profile_matches, write_line, Handler};

pub mod agent;
pub mod plist;

use agent::{calendar_intervals, LaunchdJob, SessionType};

const LAUNCHCTL_BINARY: &str = "launchctl";
/// Exit code of `launchctl` for an unknown service.
const CODE_SERVICE_NOT_FOUND: i32 = 113;
const AGENT_EXTENSION: &str = ".agent.plist";
const DAEMON_EXTENSION: &str = ".plist";

pub static LAUNCHCTL_RULES: &[Rule] = &[
    Rule::exit("list", CODE_SERVICE_NOT_FOUND, ErrorKind::JobNotFound),
    Rule::exit("bootout", CODE_SERVICE_NOT_FOUND, ErrorKind::JobNotFound),
    Rule::stderr("Could not find service", ErrorKind::JobNotFound),
    Rule::stderr("No such process", ErrorKind::JobNotFound),
    Rule::stderr("Operation not permitted", ErrorKind::AccessDenied),
];

/// A definition file found on disk.
struct Installed {
    path: PathBuf,
    permission: Permission,
}

pub struct LaunchdHandler {
    settings: LaunchdSettings,
    app_name: String,
    user: ProcessUser,
    runner: Arc<dyn CommandRunner>,
}

impl LaunchdHandler {
    pub fn new(settings: LaunchdSettings, app_name: &str, user: ProcessUser, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            settings,
            app_name: app_name.to_string(),
            user,
            runner,
        }
    }

    /// `<app>.<command>.<profile>`
    pub fn label(&self, job: &JobDescriptor) -> String {
        format!("{}.{}.{}", self.app_name, job.command_name, job.profile_name)
    }

    /// `(profile, command)` of one of our labels. Profiles may contain dots, commands may not.
    fn identity(&self, label: &str) -> Option<(String, String)> {
        let rest = label.strip_prefix(&self.app_name)?.strip_prefix('.')?;
        let (command, profile) = rest.split_once('.')?;
        if command.is_empty() || profile.is_empty() {
            return None;
        }
        Some((profile.to_string(), command.to_string()))
    }

    fn plist_path(&self, label: &str, permission: Permission) -> PathBuf {
        match permission {
            Permission::System => self.settings.daemon_dir.join(format!("{}{}", label, DAEMON_EXTENSION)),
            _ => self.settings.agent_dir().join(format!("{}{}", label, AGENT_EXTENSION)),
        }
    }

    /// The definition of `label` wherever it was installed.
    fn find_installed(&self, label: &str) -> Option<Installed> {
        [Permission::UserLoggedOn, Permission::System]
            .into_iter()
            .map(|p| self.plist_path(label, p))
            .find(|path| path.exists())
            .map(|path| {
                let permission = fs::read_to_string(&path)
                    .ok()
                    .and_then(|content| LaunchdJob::from_plist(&content).ok())
                    .map(|job| job.session_type.permission())
                    .unwrap_or_else(|| {
                        if path.starts_with(&self.settings.daemon_dir) {
                            Permission::System
                        } else {
                            Permission::UserLoggedOn
                        }
                    });
                Installed { path, permission }
            })
    }

    /// launchctl domain: `system`, `user/<uid>` or `gui/<uid>`.
    fn domain(&self, permission: Permission) -> Result<String> {
        let kind = match permission {
            Permission::System => return Ok("system".to_string()),
            Permission::UserBackground => "user",
            Permission::UserLoggedOn | Permission::Unspecified => "gui",
        };
        let uid = self
            .user
            .effective_uid()
            .ok_or_else(|| ScheduleError::Unsupported("cannot determine the user id for launchctl".to_string()))?;
        Ok(format!("{}/{}", kind, uid))
    }

    fn launchctl(&self, verb: &str, arguments: &[String], subject: &str) -> Result<CommandOutput> {
        let mut all = vec![verb.to_string()];
        all.extend_from_slice(arguments);
        let output = self.runner.run(LAUNCHCTL_BINARY, &all)?;
        if output.success() {
            Ok(output)
        } else {
            Err(classify(LAUNCHCTL_RULES, verb, subject, &output))
        }
    }

    fn bootout(&self, label: &str, permission: Permission) -> Result<()> {
        let target = format!("{}/{}", self.domain(permission)?, label);
        self.launchctl("bootout", &[target], label).map(|_| ())
    }

    fn definition(&self, job: &JobDescriptor, label: &str, permission: Permission) -> Result<LaunchdJob> {
        let mut intervals = Vec::new();
        for event in calendar::parse_schedules(&job.schedules)? {
            match calendar_intervals(&event) {
                Ok(found) => intervals.extend(found),
                Err(reason) => warn!(schedule = %event, %reason, "schedule skipped"),
            }
        }
        if intervals.is_empty() {
            return Err(ScheduleError::Unsupported(format!(
                "no schedule of {} can be written as a launchd calendar interval",
                job.display_name()
            )));
        }

        let mut environment = job.environment.clone();
        if !environment.contains_key("PATH") {
            if let Ok(path) = std::env::var("PATH") {
                environment.insert("PATH".to_string(), path);
            }
        }
        let mut program_arguments = vec![job.command.clone()];
        program_arguments.extend(job.effective_arguments());
        let background = job.priority == Priority::Background;

        Ok(LaunchdJob {
            label: label.to_string(),
            program_arguments,
            environment,
            working_directory: job.working_directory.clone(),
            log_path: format!("{}.log", label),
            intervals,
            session_type: SessionType::for_permission(permission),
            background,
            nice: if background { self.settings.nice } else { 0 },
        })
    }

    fn read_job(&self, path: &Path) -> Result<JobDescriptor> {
        let content = fs::read_to_string(path).map_err(|e| ScheduleError::io(path, e))?;
        let definition = LaunchdJob::from_plist(&content).map_err(|reason| ScheduleError::Decode {
            program: path.display().to_string(),
            reason,
        })?;
        let (profile, command) = self.identity(&definition.label).ok_or_else(|| ScheduleError::Decode {
            program: path.display().to_string(),
            reason: format!("unexpected label {:?}", definition.label),
        })?;

        let mut job = JobDescriptor::new(&profile, &command, "");
        job.apply_command_line(&crate::job::join_command_line(&definition.program_arguments));
        job.working_directory = definition.working_directory;
        job.environment = definition.environment;
        job.schedules = definition.intervals.iter().map(|i| i.cron_fields()).collect();
        job.permission = definition.session_type.permission();
        job.priority = if definition.background {
            Priority::Background
        } else {
            Priority::Standard
        };
        Ok(job)
    }

    /// Definition files with our prefix in `dir`.
    fn definitions_in(&self, dir: &Path, extension: &str) -> Vec<PathBuf> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot list launchd definitions");
                return Vec::new();
            }
        };
        let prefix = format!("{}.", self.app_name);
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map_or(false, |name| {
                        name.starts_with(&prefix)
                            && name.ends_with(extension)
                            // agents share the daemon extension
                            && (extension == AGENT_EXTENSION || !name.ends_with(AGENT_EXTENSION))
                    })
            })
            .collect();
        paths.sort();
        paths
    }
}

/// A missing agent directory is created private to the user.
fn write_definition(path: &Path, content: &str, private_dir: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| ScheduleError::io(parent, e))?;
            if private_dir {
                restrict_to_owner(parent);
            }
        }
    }
    fs::write(path, content).map_err(|e| ScheduleError::io(path, e))
}

#[cfg(unix)]
fn restrict_to_owner(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
        debug!(dir = %dir.display(), error = %e, "cannot restrict directory permissions");
    }
}

#[cfg(not(unix))]
fn restrict_to_owner(_dir: &Path) {}

/// `LastExitStatus` gives `Last Exit Status`.
fn spaced_title(key: &str) -> String {
    let mut title = String::with_capacity(key.len() + 4);
    let mut previous_lower = false;
    for c in key.chars() {
        if previous_lower && c.is_ascii_uppercase() {
            title.push(' ');
        }
        previous_lower = c.is_ascii_lowercase();
        title.push(c);
    }
    title
}

/// `"Key" = value;` lines of `launchctl list <label>`, sorted by key.
fn parse_list_output(output: &str) -> Vec<(String, String)> {
    let mut status: Vec<(String, String)> = output
        .lines()
        .filter_map(|line| {
            let line = line.trim().strip_suffix(';')?;
            let (key, value) = line.split_once('=')?;
            let key = key.trim().strip_prefix('"')?.strip_suffix('"')?;
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return None;
            }
            Some((key.to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect();
    status.sort();
    status
}

impl Handler for LaunchdHandler {
    fn name(&self) -> &'static str {
        "launchd"
    }

    fn init(&self) -> Result<()> {
        lookup_binary("launchd", LAUNCHCTL_BINARY).map(|_| ())
    }

    /// Bootstrapping loads the job for its next calendar interval, so `no-start` changes nothing.
    fn create_job(&self, job: &JobDescriptor, permission: Permission, _session: &mut CredentialSession) -> Result<()> {
        job.validate_identity()?;
        if job.command_name.contains('.') {
            return Err(ScheduleError::InvalidIdentity(format!(
                "{}: command name cannot contain '.'",
                job.display_name()
            )));
        }
        let permission = self.user.resolve(permission).permission();
        let label = self.label(job);
        let definition = self.definition(job, &label, permission)?;

        if let Some(existing) = self.find_installed(&label) {
            info!(job = %job.display_name(), path = %existing.path.display(), "replacing existing definition");
            if let Err(e) = self.bootout(&label, existing.permission) {
                debug!(error = %e, "previous definition was not loaded");
            }
            fs::remove_file(&existing.path)
                .map_err(|e| ScheduleError::io(&existing.path, e))
                .step(Step::Delete)?;
        }

        let path = self.plist_path(&label, permission);
        if let Err(e) = write_definition(&path, &definition.to_plist(), permission != Permission::System) {
            let _ = fs::remove_file(&path);
            return Err(e).step(Step::WriteDefinition);
        }
        let domain = self.domain(permission)?;
        self.launchctl("bootstrap", &[domain, path.to_string_lossy().to_string()], &label)
            .step(Step::Register)?;
        info!(job = %job.display_name(), %label, "launchd job loaded");
        Ok(())
    }

    fn remove_job(&self, job: &JobDescriptor, _permission: Permission) -> Result<()> {
        let label = self.label(job);
        let installed = match self.find_installed(&label) {
            Some(installed) => installed,
            None if job.remove_only => {
                warn!(job = %job.display_name(), "no launchd definition to remove");
                return Ok(());
            }
            None => return Err(ScheduleError::JobNotFound(label)),
        };

        match self.bootout(&label, installed.permission) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => warn!(%label, "job was not loaded"),
            Err(e) if job.remove_only => warn!(%label, error = %e, "cannot unload job"),
            Err(e) => return Err(e).step(Step::Stop),
        }
        fs::remove_file(&installed.path)
            .map_err(|e| ScheduleError::io(&installed.path, e))
            .step(Step::Delete)?;
        info!(job = %job.display_name(), "launchd job removed");
        Ok(())
    }

    fn display_job_status(&self, job: &JobDescriptor, out: &mut dyn Write) -> Result<()> {
        let label = self.label(job);
        let output = self.launchctl("list", &args([label.as_str()]), &label)?;
        let status = parse_list_output(&output.stdout);
        if status.is_empty() {
            return write_line(out, output.stdout.trim_end());
        }
        let titles: Vec<String> = status.iter().map(|(key, _)| spaced_title(key)).collect();
        let width = titles.iter().map(String::len).max().unwrap_or_default();
        for (title, (_, value)) in titles.iter().zip(&status) {
            write_line(out, &format!("{:>width$}: {}", title, value, width = width))?;
        }
        Ok(())
    }

    fn scheduled(&self, profile_filter: &str) -> Result<Vec<JobDescriptor>> {
        let matcher = profile_matcher(profile_filter)?;
        let mut paths = self.definitions_in(&self.settings.daemon_dir, DAEMON_EXTENSION);
        paths.extend(self.definitions_in(&self.settings.agent_dir(), AGENT_EXTENSION));

        let mut jobs = Vec::new();
        for path in paths {
            match self.read_job(&path) {
                Ok(job) if profile_matches(&matcher, &job.profile_name) => jobs.push(job),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "skipping launchd definition"),
            }
        }
        Ok(jobs)
    }

    fn detect_schedule_permission(&self, declared: Permission) -> PermissionResolution {
        self.user.resolve(declared)
    }

    /// User agents live in the user's own domain; only daemons need root.
    fn check_permission(&self, permission: Permission) -> bool {
        match permission {
            Permission::System => self.user.elevated,
            _ => true,
        }
    }
}
