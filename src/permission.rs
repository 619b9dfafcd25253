use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::process::{args, CommandRunner};

/// Security context a job runs under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Permission {
    /// Runs as the administrative account.
    System,
    /// Runs as the invoking user whether or not they are logged on.
    UserBackground,
    /// Runs as the invoking user only while they are logged on.
    UserLoggedOn,
    /// Left to the backend to guess.
    #[default]
    Unspecified,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::System => "system",
            Permission::UserBackground => "user",
            Permission::UserLoggedOn => "user_logged_on",
            Permission::Unspecified => "auto",
        }
    }

    pub fn is_specified(&self) -> bool {
        *self != Permission::Unspecified
    }
}

impl From<String> for Permission {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "system" => Permission::System,
            "user" | "user_background" => Permission::UserBackground,
            "user_logged_on" | "user_logged_in" => Permission::UserLoggedOn,
            _ => Permission::Unspecified,
        }
    }
}

impl From<Permission> for String {
    fn from(value: Permission) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission chosen by a backend, remembering whether it was a guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionResolution {
    Declared(Permission),
    Guessed(Permission),
}

impl PermissionResolution {
    pub fn permission(&self) -> Permission {
        match self {
            PermissionResolution::Declared(p) | PermissionResolution::Guessed(p) => *p,
        }
    }

    pub fn is_certain(&self) -> bool {
        matches!(self, PermissionResolution::Declared(_))
    }
}

/// Well-known SID of the high mandatory integrity level, present in elevated tokens.
const HIGH_INTEGRITY_SID: &str = "S-1-16-12288";

/// The account this process runs as.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessUser {
    pub username: String,
    pub uid: Option<u32>,
    /// Root on unix, elevated token on Windows.
    pub elevated: bool,
    /// Set when started through sudo: the user who ran it.
    pub sudo_user: Option<String>,
    pub sudo_uid: Option<u32>,
    pub home: Option<PathBuf>,
}

impl ProcessUser {
    pub fn detect(runner: &dyn CommandRunner) -> Self {
        let (uid, elevated) = if cfg!(windows) {
            (None, Self::windows_elevated(runner))
        } else {
            let uid = Self::unix_uid(runner);
            (uid, uid == Some(0))
        };

        let user = ProcessUser {
            username: whoami::username(),
            uid,
            elevated,
            sudo_user: std::env::var("SUDO_USER").ok().filter(|u| !u.is_empty() && u != "root"),
            sudo_uid: std::env::var("SUDO_UID").ok().and_then(|uid| uid.parse().ok()),
            home: dirs::home_dir(),
        };
        debug!(username = %user.username, elevated = user.elevated, sudo_user = ?user.sudo_user, "detected process user");
        user
    }

    fn unix_uid(runner: &dyn CommandRunner) -> Option<u32> {
        let output = runner.run("id", &args(["-u"])).ok()?;
        if !output.success() {
            return None;
        }
        output.stdout.trim().parse().ok()
    }

    fn windows_elevated(runner: &dyn CommandRunner) -> bool {
        runner
            .run("whoami", &args(["/groups"]))
            .map(|output| output.success() && output.stdout.contains(HIGH_INTEGRITY_SID))
            .unwrap_or(false)
    }

    /// The user a job should belong to: the sudo caller when there is one.
    pub fn effective_username(&self) -> &str {
        self.sudo_user.as_deref().unwrap_or(&self.username)
    }

    /// Uid of the user a job should belong to, looking through sudo.
    pub fn effective_uid(&self) -> Option<u32> {
        self.sudo_uid.or(self.uid)
    }

    /// Declared permissions are kept; otherwise guess from elevation.
    pub fn resolve(&self, declared: Permission) -> PermissionResolution {
        if declared.is_specified() {
            return PermissionResolution::Declared(declared);
        }
        if self.elevated {
            PermissionResolution::Guessed(Permission::System)
        } else {
            PermissionResolution::Guessed(Permission::UserLoggedOn)
        }
    }

    /// Only logged-on user jobs can be managed without elevation.
    pub fn can_manage(&self, permission: Permission) -> bool {
        match permission {
            Permission::UserLoggedOn => true,
            _ => self.elevated,
        }
    }
}
