use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScheduleError};
use crate::job::JobDescriptor;
use crate::scheduler::SchedulerKind;

pub const DEFAULT_APP_NAME: &str = "resticsched";
pub const CONFIG_ENV: &str = "RESTICSCHED_CONFIG";
const ENV_PREFIX: &str = "RESTICSCHED_";
const CONFIG_FILE: &str = "resticsched.toml";

/// Top-level settings (resticsched.toml + RESTICSCHED_* env overrides).
///
/// Nested keys use a double underscore in the environment, e.g. `RESTICSCHED_SYSTEMD__NICE=10`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub scheduler: SchedulerKind,
    /// Prefix of every native name (unit files, task folder, crontab markers).
    pub app_name: String,
    pub systemd: SystemdSettings,
    pub crond: CrondSettings,
    pub taskscheduler: TaskSchedulerSettings,
    pub launchd: LaunchdSettings,
    pub jobs: Vec<JobDescriptor>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scheduler: SchedulerKind::Auto,
            app_name: DEFAULT_APP_NAME.to_string(),
            systemd: SystemdSettings::default(),
            crond: CrondSettings::default(),
            taskscheduler: TaskSchedulerSettings::default(),
            launchd: LaunchdSettings::default(),
            jobs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemdSettings {
    /// `Nice=` applied to background jobs.
    pub nice: i32,
    /// 1 (realtime), 2 (best-effort) or 3 (idle).
    pub io_scheduling_class: Option<u8>,
    /// 0 (highest) to 7 (lowest).
    pub io_scheduling_priority: Option<u8>,
    pub system_unit_dir: PathBuf,
    /// Defaults to `<config dir>/systemd/user`.
    pub user_unit_dir: Option<PathBuf>,
    /// Journal lines shown by `status`.
    pub journal_lines: u32,
}

impl Default for SystemdSettings {
    fn default() -> Self {
        Self {
            nice: 15,
            io_scheduling_class: None,
            io_scheduling_priority: None,
            system_unit_dir: PathBuf::from("/etc/systemd/system"),
            user_unit_dir: None,
            journal_lines: 10,
        }
    }
}

impl SystemdSettings {
    pub fn user_unit_dir(&self) -> PathBuf {
        self.user_unit_dir.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(".config"))
                .join("systemd")
                .join("user")
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrondSettings {
    /// `crontab` binary used to read and write the user table.
    pub binary: String,
    /// Write to this file (e.g. `/etc/cron.d/resticsched`) instead of the user table.
    /// Lines then carry a user column.
    pub file: Option<PathBuf>,
    /// User column in file mode, defaults to the current user.
    pub user: Option<String>,
}

impl Default for CrondSettings {
    fn default() -> Self {
        Self {
            binary: "crontab".to_string(),
            file: None,
            user: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSchedulerSettings {
    pub disallow_start_on_batteries: bool,
    pub stop_on_batteries: bool,
    /// Run through `conhost.exe --headless` so no console window shows up.
    pub hide_window: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchdSettings {
    /// Where system jobs go, as daemons.
    pub daemon_dir: PathBuf,
    /// Defaults to `~/Library/LaunchAgents`.
    pub agent_dir: Option<PathBuf>,
    /// `Nice` applied to background jobs.
    pub nice: i32,
}

impl Default for LaunchdSettings {
    fn default() -> Self {
        Self {
            daemon_dir: PathBuf::from("/Library/LaunchDaemons"),
            agent_dir: None,
            nice: 5,
        }
    }
}

impl LaunchdSettings {
    pub fn agent_dir(&self) -> PathBuf {
        self.agent_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("Library")
                .join("LaunchAgents")
        })
    }
}

impl Settings {
    /// Load settings, checking in order:
    ///   1. Explicit path argument
    ///   2. `$RESTICSCHED_CONFIG`
    ///   3. `<config dir>/resticsched/resticsched.toml`
    ///
    /// A missing file leaves the defaults in place.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let path = config_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(default_config_path);

        let settings: Settings = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ScheduleError::Config(e.to_string()))?;

        if settings.app_name.trim().is_empty() {
            return Err(ScheduleError::Config("app_name cannot be empty".to_string()));
        }
        Ok(settings)
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_APP_NAME)
        .join(CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Priority;
    use crate::permission::Permission;
    use figment::Jail;

    #[test]
    fn test_defaults_without_file() {
        Jail::expect_with(|_jail| {
            let settings = Settings::load(Some(Path::new("missing.toml"))).unwrap();
            assert_eq!(settings, Settings::default());
            assert_eq!(settings.app_name, "resticsched");
            assert_eq!(settings.systemd.nice, 15);
            assert_eq!(settings.crond.binary, "crontab");
            assert_eq!(settings.launchd.daemon_dir, PathBuf::from("/Library/LaunchDaemons"));
            assert!(settings.launchd.agent_dir().ends_with("Library/LaunchAgents"));
            Ok(())
        });
    }

    #[test]
    fn test_load_file_with_jobs() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "resticsched.toml",
                r#"
scheduler = "systemd"

[systemd]
io_scheduling_class = 3

[[jobs]]
profile_name = "home"
command_name = "backup"
command = "/usr/local/bin/resticprofile"
arguments = ["--name", "home", "backup"]
schedules = ["03:00", "15:00"]
permission = "user"
priority = "background"
environment = { RESTIC_CACHE_DIR = "/var/cache/restic" }
"#,
            )?;
            let settings = Settings::load(Some(Path::new("resticsched.toml"))).unwrap();
            assert_eq!(settings.scheduler, SchedulerKind::Systemd);
            assert_eq!(settings.systemd.io_scheduling_class, Some(3));
            assert_eq!(settings.systemd.nice, 15);

            let job = &settings.jobs[0];
            assert_eq!(job.display_name(), "backup@home");
            assert_eq!(job.schedules, vec!["03:00", "15:00"]);
            assert_eq!(job.permission, Permission::UserBackground);
            assert_eq!(job.priority, Priority::Background);
            assert_eq!(
                job.environment.get("RESTIC_CACHE_DIR").map(String::as_str),
                Some("/var/cache/restic")
            );
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", "app_name = \"fromfile\"\n")?;
            jail.set_env("RESTICSCHED_CONFIG", "custom.toml");
            jail.set_env("RESTICSCHED_SYSTEMD__NICE", "5");
            let settings = Settings::load(None).unwrap();
            assert_eq!(settings.app_name, "fromfile");
            assert_eq!(settings.systemd.nice, 5);

            jail.set_env("RESTICSCHED_APP_NAME", "backupd");
            let settings = Settings::load(None).unwrap();
            assert_eq!(settings.app_name, "backupd");
            Ok(())
        });
    }

    #[test]
    fn test_launchd_section() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "resticsched.toml",
                "scheduler = \"launchd\"\n\n[launchd]\nagent_dir = \"/tmp/agents\"\nnice = 10\n",
            )?;
            let settings = Settings::load(Some(Path::new("resticsched.toml"))).unwrap();
            assert_eq!(settings.scheduler, SchedulerKind::Launchd);
            assert_eq!(settings.launchd.agent_dir(), PathBuf::from("/tmp/agents"));
            assert_eq!(settings.launchd.nice, 10);
            assert_eq!(settings.launchd.daemon_dir, PathBuf::from("/Library/LaunchDaemons"));
            Ok(())
        });
    }

    #[test]
    fn test_empty_app_name_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("resticsched.toml", "app_name = \"\"\n")?;
            assert!(Settings::load(Some(Path::new("resticsched.toml"))).is_err());
            Ok(())
        });
    }
}
