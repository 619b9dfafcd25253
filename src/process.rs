use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

use crate::error::{Result, ScheduleError};

/// Captured result of one external process run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub program: String,
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Best diagnostic text: stderr, or stdout when the tool reports errors there.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Runs a backend's command-line tool and captures both output streams.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Runs real processes, blocking until they exit.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!(command = %display_command(program, args), "starting command");

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| ScheduleError::io(program, e))?;

        Ok(CommandOutput {
            program: program.to_string(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Command line suitable for logs: the value following a password flag is masked.
pub fn display_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    let mut mask_next = false;
    for arg in args {
        line.push(' ');
        if mask_next {
            line.push_str("***");
            mask_next = false;
            continue;
        }
        line.push_str(arg);
        mask_next = arg.eq_ignore_ascii_case("/rp");
    }
    line
}

/// Verify `binary` can be found in the `PATH`.
pub fn lookup_binary(name: &str, binary: &str) -> Result<PathBuf> {
    which::which(binary).map_err(|_| ScheduleError::MissingBinary {
        name: name.to_string(),
        binary: binary.to_string(),
    })
}

/// Build an owned argument list from string slices.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
