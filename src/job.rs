use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScheduleError};
use crate::permission::Permission;

/// Flag preventing `CreateJob` from starting the job right away.
pub const FLAG_NO_START: &str = "no-start";

/// Scheduling priority hint for the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Priority {
    Background,
    #[default]
    Standard,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Background => "background",
            Priority::Standard => "standard",
        }
    }
}

impl From<String> for Priority {
    /// Anything other than "background" is standard priority.
    fn from(value: String) -> Self {
        if value.trim().eq_ignore_ascii_case("background") {
            Priority::Background
        } else {
            Priority::Standard
        }
    }
}

impl From<Priority> for String {
    fn from(value: Priority) -> Self {
        value.as_str().to_string()
    }
}

/// How the scheduled run deals with the repository lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    #[default]
    Default,
    Fail,
    Ignore,
}

/// Everything needed to (un)schedule one job.
///
/// Identity is the pair `(profile_name, command_name)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobDescriptor {
    pub profile_name: String,
    pub command_name: String,
    pub schedules: Vec<String>,
    pub permission: Permission,
    pub working_directory: String,
    pub command: String,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub job_description: String,
    pub timer_description: String,
    pub priority: Priority,
    pub lock_mode: LockMode,
    /// Seconds to wait for the lock before giving up.
    pub lock_wait: Option<u64>,
    pub config_file: String,
    pub flags: BTreeMap<String, String>,
    pub after_network_online: bool,
    pub drop_in_files: Vec<PathBuf>,
    #[serde(skip)]
    pub remove_only: bool,
}

impl JobDescriptor {
    pub fn new(profile_name: &str, command_name: &str, command: &str) -> Self {
        Self {
            profile_name: profile_name.to_string(),
            command_name: command_name.to_string(),
            command: command.to_string(),
            ..Default::default()
        }
    }

    /// A descriptor that only carries an identity, used to remove a job whose
    /// configuration is gone.
    pub fn remove_only(profile_name: &str, command_name: &str) -> Self {
        Self {
            profile_name: profile_name.to_string(),
            command_name: command_name.to_string(),
            remove_only: true,
            ..Default::default()
        }
    }

    /// `command@profile`, used in messages.
    pub fn display_name(&self) -> String {
        format!("{}@{}", self.command_name, self.profile_name)
    }

    pub fn flag(&self, name: &str) -> Option<&str> {
        self.flags.get(name).map(String::as_str)
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }

    pub fn set_flag(&mut self, name: &str, value: &str) {
        self.flags.insert(name.to_string(), value.to_string());
    }

    pub fn has_schedules(&self) -> bool {
        self.schedules.iter().any(|s| !s.trim().is_empty())
    }

    /// Native names are built from the identity, so both parts must be safe to embed.
    pub fn validate_identity(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(ScheduleError::InvalidIdentity(format!(
                "{}: {}",
                self.display_name(),
                reason
            )))
        };
        if self.profile_name.trim().is_empty() {
            return invalid("empty profile name");
        }
        if self.command_name.trim().is_empty() {
            return invalid("empty command name");
        }
        if self.command_name.chars().any(|c| c.is_whitespace() || c == '@') {
            return invalid("command name cannot contain spaces or '@'");
        }
        if self
            .profile_name
            .chars()
            .any(|c| matches!(c, '@' | '/' | '\\' | '\n' | '\r' | '\t'))
        {
            return invalid("profile name contains a reserved character");
        }
        Ok(())
    }

    /// Arguments with the lock policy appended.
    pub fn effective_arguments(&self) -> Vec<String> {
        let mut args = self.arguments.clone();
        match (self.lock_mode, self.lock_wait) {
            (LockMode::Ignore, _) => args.push("--no-lock".to_string()),
            (LockMode::Default, Some(wait)) if wait > 0 => {
                args.push("--lock-wait".to_string());
                args.push(format!("{}s", wait));
            }
            _ => {}
        }
        args
    }

    /// Full command line, quoted.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.command.clone()];
        parts.extend(self.effective_arguments());
        join_command_line(&parts)
    }

    /// Fill command, arguments, lock policy and config file back from a command line
    /// read out of a native definition. Inverse of [`JobDescriptor::command_line`].
    pub fn apply_command_line(&mut self, line: &str) {
        let mut parts = split_command_line(line).into_iter();
        self.command = parts.next().unwrap_or_default();
        let mut args: Vec<String> = parts.collect();

        if args.last().map(String::as_str) == Some("--no-lock") {
            args.pop();
            self.lock_mode = LockMode::Ignore;
        } else if args.len() >= 2 && args[args.len() - 2] == "--lock-wait" {
            let wait = args.pop().unwrap_or_default();
            args.pop();
            self.lock_wait = wait.trim_end_matches('s').parse().ok();
        }

        if let Some(pos) = args.iter().position(|a| a == "--config") {
            if let Some(file) = args.get(pos + 1) {
                self.config_file = file.clone();
            }
        }
        self.arguments = args;
    }
}

/// Quote one argument when it contains whitespace, quotes or is empty.
///
/// Unquoted arguments keep their backslashes, so Windows paths pass through as written.
pub fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.chars().any(|c| c.is_whitespace() || c == '"') {
        return arg.to_string();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

pub fn join_command_line<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(|p| quote_arg(p.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Inverse of [`join_command_line`]: split on whitespace, honouring double quotes.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    parts.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        parts.push(current);
    }
    parts
}
