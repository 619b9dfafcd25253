//! Service and timer unit files: naming, rendering, reading back and drop-ins.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::error::{Result, ScheduleError};
use crate::job::{JobDescriptor, Priority};
use crate::permission::Permission;

/// Where a unit pair is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitScope {
    System,
    User,
}

impl UnitScope {
    pub fn other(self) -> UnitScope {
        match self {
            UnitScope::System => UnitScope::User,
            UnitScope::User => UnitScope::System,
        }
    }
}

/// File names of the unit pair of one job: `<app>-<command>@profile-<profile>.{service,timer}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitNames {
    pub service: String,
    pub timer: String,
}

impl UnitNames {
    pub fn new(app_name: &str, profile_name: &str, command_name: &str) -> Self {
        let stem = format!("{}-{}@profile-{}", app_name, command_name, profile_name);
        Self {
            service: format!("{}.service", stem),
            timer: format!("{}.timer", stem),
        }
    }

    pub fn for_job(app_name: &str, job: &JobDescriptor) -> Self {
        Self::new(app_name, &job.profile_name, &job.command_name)
    }

    /// Recover `(profile, command)` from a service file name.
    pub fn parse(app_name: &str, service: &str) -> Result<(String, String)> {
        let invalid = || ScheduleError::InvalidIdentity(service.to_string());
        let stem = service
            .strip_suffix(".service")
            .and_then(|s| s.strip_prefix(app_name))
            .and_then(|s| s.strip_prefix('-'))
            .ok_or_else(invalid)?;
        let (command, instance) = stem.split_once('@').ok_or_else(invalid)?;
        let profile = instance.strip_prefix("profile-").ok_or_else(invalid)?;
        if command.is_empty() || profile.is_empty() {
            return Err(invalid());
        }
        Ok((profile.to_string(), command.to_string()))
    }

    pub fn service_drop_in_dir(&self) -> String {
        format!("{}.d", self.service)
    }

    pub fn timer_drop_in_dir(&self) -> String {
        format!("{}.d", self.timer)
    }

    /// Every path owned by the pair inside `dir`.
    pub fn paths(&self, dir: &Path) -> [PathBuf; 4] {
        [
            dir.join(&self.timer),
            dir.join(&self.service),
            dir.join(self.timer_drop_in_dir()),
            dir.join(self.service_drop_in_dir()),
        ]
    }
}

/// Service-level settings computed by the handler.
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// `User=` of a system unit running as a regular user.
    pub run_as: Option<String>,
    pub nice: Option<i32>,
    pub io_scheduling_class: Option<u8>,
    pub io_scheduling_priority: Option<u8>,
    /// Full environment, defaults already merged in.
    pub environment: BTreeMap<String, String>,
}

pub fn default_job_description(app_name: &str, job: &JobDescriptor) -> String {
    format!("{} {} for profile {}", app_name, job.command_name, job.profile_name)
}

pub fn default_timer_description(job: &JobDescriptor) -> String {
    format!("{} timer for profile {}", job.command_name, job.profile_name)
}

pub fn render_service(app_name: &str, job: &JobDescriptor, options: &ServiceOptions) -> String {
    let description = if job.job_description.is_empty() {
        default_job_description(app_name, job)
    } else {
        job.job_description.clone()
    };

    let mut text = String::new();
    text.push_str("[Unit]\n");
    text.push_str(&format!("Description={}\n", escape_specifiers(&description)));
    if job.after_network_online {
        text.push_str("After=network-online.target\n");
        text.push_str("Wants=network-online.target\n");
    }
    text.push('\n');

    text.push_str("[Service]\n");
    text.push_str("Type=oneshot\n");
    if !job.working_directory.is_empty() {
        text.push_str(&format!("WorkingDirectory={}\n", job.working_directory));
    }
    text.push_str(&format!("ExecStart={}\n", escape_specifiers(&job.command_line())));
    if let Some(user) = &options.run_as {
        text.push_str(&format!("User={}\n", user));
    }
    if let Some(nice) = options.nice {
        text.push_str(&format!("Nice={}\n", nice));
    }
    if let Some(class) = options.io_scheduling_class {
        text.push_str(&format!("IOSchedulingClass={}\n", class));
    }
    if let Some(priority) = options.io_scheduling_priority {
        text.push_str(&format!("IOSchedulingPriority={}\n", priority));
    }
    for (key, value) in &options.environment {
        text.push_str(&format!("Environment=\"{}={}\"\n", key, escape_quoted(value)));
    }
    text
}

/// One `OnCalendar=` line per schedule, passed through untouched.
pub fn render_timer(job: &JobDescriptor, names: &UnitNames) -> String {
    let description = if job.timer_description.is_empty() {
        default_timer_description(job)
    } else {
        job.timer_description.clone()
    };

    let mut text = String::new();
    text.push_str("[Unit]\n");
    text.push_str(&format!("Description={}\n\n", escape_specifiers(&description)));
    text.push_str("[Timer]\n");
    for schedule in job.schedules.iter().filter(|s| !s.trim().is_empty()) {
        text.push_str(&format!("OnCalendar={}\n", schedule.trim()));
    }
    text.push_str(&format!("Unit={}\n", names.service));
    text.push_str("Persistent=true\n\n");
    text.push_str("[Install]\n");
    text.push_str("WantedBy=timers.target\n");
    text
}

fn escape_specifiers(value: &str) -> String {
    value.replace('%', "%%")
}

fn escape_quoted(value: &str) -> String {
    escape_specifiers(&value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn unescape_quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out.replace("%%", "%")
}

/// Minimal INI reader for unit files. Keys may repeat.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnitFile {
    entries: Vec<(String, String, String)>,
}

impl UnitFile {
    pub fn parse(text: &str) -> Self {
        let mut entries = Vec::new();
        let mut section = String::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                section = line[1..line.len() - 1].trim().to_string();
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                entries.push((section.clone(), key.trim().to_string(), value.trim().to_string()));
            }
        }
        Self { entries }
    }

    /// Last value of `key` in `section`.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.get_all(section, key).pop()
    }

    pub fn get_all(&self, section: &str, key: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(s, k, _)| s == section && k == key)
            .map(|(_, _, v)| v.as_str())
            .collect()
    }
}

/// Rebuild the descriptor of an installed unit pair.
pub fn read_job(dir: &Path, app_name: &str, names: &UnitNames, scope: UnitScope) -> Result<JobDescriptor> {
    let (profile, command) = UnitNames::parse(app_name, &names.service)?;
    let service = UnitFile::parse(&read_file(&dir.join(&names.service))?);
    let timer = UnitFile::parse(&read_file(&dir.join(&names.timer))?);

    let mut job = JobDescriptor::new(&profile, &command, "");
    job.job_description = service
        .get("Unit", "Description")
        .map(|d| d.replace("%%", "%"))
        .unwrap_or_default();
    job.timer_description = timer
        .get("Unit", "Description")
        .map(|d| d.replace("%%", "%"))
        .unwrap_or_default();
    job.working_directory = service.get("Service", "WorkingDirectory").unwrap_or_default().to_string();
    job.after_network_online = service.get("Unit", "After") == Some("network-online.target");
    if let Some(exec) = service.get("Service", "ExecStart") {
        job.apply_command_line(&exec.replace("%%", "%"));
    }
    for value in service.get_all("Service", "Environment") {
        let value = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(value);
        if let Some((key, value)) = unescape_quoted(value).split_once('=') {
            job.environment.insert(key.to_string(), value.to_string());
        }
    }
    if service.get("Service", "Nice").is_some() {
        job.priority = Priority::Background;
    }
    job.permission = match (scope, service.get("Service", "User")) {
        (UnitScope::System, Some(_)) => Permission::UserBackground,
        (UnitScope::System, None) => Permission::System,
        (UnitScope::User, _) => Permission::UserLoggedOn,
    };
    job.schedules = timer
        .get_all("Timer", "OnCalendar")
        .into_iter()
        .map(str::to_string)
        .collect();
    Ok(job)
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| ScheduleError::io(path, e))
}

/// Write a unit file readable by everyone (0644).
pub fn write_unit_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ScheduleError::io(parent, e))?;
    }
    fs::write(path, content).map_err(|e| ScheduleError::io(path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644)).map_err(|e| ScheduleError::io(path, e))?;
    }
    info!(path = %path.display(), "written unit file");
    Ok(())
}

/// Delete the pair and its drop-in directories. Failures are logged, never returned.
pub fn remove_files(dir: &Path, names: &UnitNames) {
    for path in names.paths(dir) {
        let res = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match res {
            Ok(()) => debug!(path = %path.display(), "removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => error!(path = %path.display(), error = %e, "failed removing path, please remove it manually"),
        }
    }
}

/// Name a configured drop-in gets once copied: `<stem>.<app>.conf`.
pub fn owned_drop_in_name(app_name: &str, source: &Path) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    format!("{}.{}.conf", stem, app_name)
}

/// Drop-ins carrying a `[Timer]` section belong to the timer unit.
pub fn is_timer_drop_in(content: &str) -> bool {
    content.lines().any(|line| line.trim().eq_ignore_ascii_case("[timer]"))
}

/// Copy the configured drop-ins next to the unit pair and delete owned ones no longer configured.
pub fn sync_drop_ins(dir: &Path, app_name: &str, names: &UnitNames, files: &[PathBuf]) -> Result<()> {
    let service_dir = dir.join(names.service_drop_in_dir());
    let timer_dir = dir.join(names.timer_drop_in_dir());
    let owned_suffix = format!(".{}.conf", app_name);

    let mut wanted = Vec::with_capacity(files.len());
    for source in files {
        let content = read_file(source)?;
        let target_dir = if is_timer_drop_in(&content) { &timer_dir } else { &service_dir };
        wanted.push((target_dir.join(owned_drop_in_name(app_name, source)), content));
    }

    for drop_in_dir in [&service_dir, &timer_dir] {
        let Ok(entries) = fs::read_dir(drop_in_dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let owned = path
                .file_name()
                .map(|n| n.to_string_lossy().ends_with(&owned_suffix))
                .unwrap_or(false);
            if owned && !wanted.iter().any(|(p, _)| p == &path) {
                fs::remove_file(&path).map_err(|e| ScheduleError::io(&path, e))?;
                info!(path = %path.display(), "removed orphaned drop-in");
            }
        }
    }

    for (path, content) in &wanted {
        write_unit_file(path, content)?;
    }
    Ok(())
}
