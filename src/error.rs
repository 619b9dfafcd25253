use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::process::CommandOutput;
use crate::scheduler::schtasks::trigger::CompileError;

/// Coarse classification of a [`ScheduleError`], stable across step wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    JobNotFound,
    JobNotRunning,
    InvalidIdentity,
    AccessDenied,
    AlreadyExists,
    ExternalToolFailure,
    Other,
}

/// One step of a multi-step lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    WriteDefinition,
    Register,
    Reload,
    Enable,
    Start,
    Stop,
    Disable,
    Delete,
    Query,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::WriteDefinition => "writing the job definition",
            Step::Register => "registering the job",
            Step::Reload => "reloading the scheduler",
            Step::Enable => "enabling the job",
            Step::Start => "starting the job",
            Step::Stop => "stopping the job",
            Step::Disable => "disabling the job",
            Step::Delete => "deleting the job",
            Step::Query => "querying the job",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The native entity is absent.
    #[error("scheduled job not found: {0}")]
    JobNotFound(String),

    /// The native entity exists but is inactive.
    #[error("scheduled job is not running: {0}")]
    JobNotRunning(String),

    #[error("invalid job identity: {0}")]
    InvalidIdentity(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("scheduled job already exists: {0}")]
    AlreadyExists(String),

    /// Anything the backend rule table could not classify.
    #[error("{program} failed (exit code {}): {stderr}", code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()))]
    ExternalTool {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("it doesn't look like {name} is installed on your system (cannot find {binary:?} in PATH)")]
    MissingBinary { name: String, binary: String },

    #[error("invalid schedule {expression:?}: {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("{0}")]
    Unsupported(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot decode output of {program}: {reason}")]
    Decode { program: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{step} failed: {source}")]
    Step {
        step: Step,
        #[source]
        source: Box<ScheduleError>,
    },
}

pub type Result<T> = std::result::Result<T, ScheduleError>;

impl ScheduleError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ScheduleError::Io {
            path: path.into(),
            source,
        }
    }

    /// Kind of the innermost error, looking through step wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScheduleError::JobNotFound(_) => ErrorKind::JobNotFound,
            ScheduleError::JobNotRunning(_) => ErrorKind::JobNotRunning,
            ScheduleError::InvalidIdentity(_) => ErrorKind::InvalidIdentity,
            ScheduleError::AccessDenied(_) => ErrorKind::AccessDenied,
            ScheduleError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ScheduleError::ExternalTool { .. } => ErrorKind::ExternalToolFailure,
            ScheduleError::Step { source, .. } => source.kind(),
            _ => ErrorKind::Other,
        }
    }

    /// The step that failed, if this error came out of a lifecycle step.
    pub fn failed_step(&self) -> Option<Step> {
        match self {
            ScheduleError::Step { step, .. } => Some(*step),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::JobNotFound
    }
}

/// Attach the failing lifecycle step to an error, the way `anyhow::Context` attaches a message.
pub trait StepContext<T> {
    fn step(self, step: Step) -> Result<T>;
}

impl<T> StepContext<T> for Result<T> {
    fn step(self, step: Step) -> Result<T> {
        self.map_err(|source| ScheduleError::Step {
            step,
            source: Box::new(source),
        })
    }
}

/// What part of a failed invocation a [`Rule`] looks at.
#[derive(Debug, Clone, Copy)]
pub enum Matcher {
    ExitCode(i32),
    Stderr(&'static str),
}

/// One line of a backend's failure lookup table.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    /// Restrict the rule to one verb of the tool (`None` matches every verb).
    pub verb: Option<&'static str>,
    pub matcher: Matcher,
    pub kind: ErrorKind,
}

impl Rule {
    pub const fn exit(verb: &'static str, code: i32, kind: ErrorKind) -> Self {
        Rule {
            verb: Some(verb),
            matcher: Matcher::ExitCode(code),
            kind,
        }
    }

    pub const fn stderr(pattern: &'static str, kind: ErrorKind) -> Self {
        Rule {
            verb: None,
            matcher: Matcher::Stderr(pattern),
            kind,
        }
    }

    fn matches(&self, verb: &str, output: &CommandOutput) -> bool {
        if let Some(expected) = self.verb {
            if expected != verb {
                return false;
            }
        }
        match self.matcher {
            Matcher::ExitCode(code) => output.code == Some(code),
            Matcher::Stderr(pattern) => output.stderr.contains(pattern),
        }
    }
}

/// Turn a failed invocation into a typed error using a backend rule table.
///
/// `subject` names the native entity and ends up in the error message.
pub fn classify(rules: &[Rule], verb: &str, subject: &str, output: &CommandOutput) -> ScheduleError {
    let kind = rules
        .iter()
        .find(|rule| rule.matches(verb, output))
        .map(|rule| rule.kind);

    let subject = subject.to_string();
    match kind {
        Some(ErrorKind::JobNotFound) => ScheduleError::JobNotFound(subject),
        Some(ErrorKind::JobNotRunning) => ScheduleError::JobNotRunning(subject),
        Some(ErrorKind::InvalidIdentity) => ScheduleError::InvalidIdentity(subject),
        Some(ErrorKind::AccessDenied) => ScheduleError::AccessDenied(output.diagnostic()),
        Some(ErrorKind::AlreadyExists) => ScheduleError::AlreadyExists(subject),
        _ => ScheduleError::ExternalTool {
            program: output.program.clone(),
            code: output.code,
            stderr: output.diagnostic(),
        },
    }
}
