use std::fmt;
use std::io::{self, Write};

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

use crate::error::{Result, ScheduleError};

/// Account and password used to register a background job.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Asks the user for the password of an account.
pub trait PasswordPrompt {
    fn ask_password(&mut self, username: &str) -> Result<String>;
}

/// Reads a password from the terminal without echoing it.
pub struct TerminalPrompt;

impl PasswordPrompt for TerminalPrompt {
    fn ask_password(&mut self, username: &str) -> Result<String> {
        let mut stderr = io::stderr();
        write!(stderr, "Password for {}: ", username).map_err(|e| ScheduleError::io("stderr", e))?;
        stderr.flush().map_err(|e| ScheduleError::io("stderr", e))?;

        enable_raw_mode().map_err(|e| ScheduleError::io("terminal", e))?;
        let res = read_hidden_line();
        disable_raw_mode().map_err(|e| ScheduleError::io("terminal", e))?;
        eprintln!();
        res
    }
}

fn read_hidden_line() -> Result<String> {
    let mut password = String::new();
    loop {
        let ev = event::read().map_err(|e| ScheduleError::io("terminal", e))?;
        let Event::Key(key) = ev else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Enter => return Ok(password),
            KeyCode::Backspace => {
                password.pop();
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return Err(ScheduleError::Unsupported(
                    "password entry cancelled".to_string(),
                ));
            }
            KeyCode::Esc => {
                return Err(ScheduleError::Unsupported(
                    "password entry cancelled".to_string(),
                ));
            }
            KeyCode::Char(c) => password.push(c),
            _ => {}
        }
    }
}

/// Per-invocation credential cache: the prompt runs at most once per account.
pub struct CredentialSession {
    prompt: Box<dyn PasswordPrompt>,
    cached: Option<Credentials>,
}

impl CredentialSession {
    pub fn new(prompt: Box<dyn PasswordPrompt>) -> Self {
        Self {
            prompt,
            cached: None,
        }
    }

    pub fn terminal() -> Self {
        Self::new(Box::new(TerminalPrompt))
    }

    pub fn credentials_for(&mut self, username: &str) -> Result<Credentials> {
        if let Some(cached) = &self.cached {
            if cached.username == username {
                return Ok(cached.clone());
            }
        }
        let password = self.prompt.ask_password(username)?;
        let credentials = Credentials {
            username: username.to_string(),
            password,
        };
        self.cached = Some(credentials.clone());
        Ok(credentials)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Answers with a fixed password and counts how often it was asked.
    pub struct FixedPrompt {
        pub password: String,
        pub asked: Arc<AtomicUsize>,
    }

    impl PasswordPrompt for FixedPrompt {
        fn ask_password(&mut self, _username: &str) -> Result<String> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            Ok(self.password.clone())
        }
    }

    pub fn session(password: &str) -> (CredentialSession, Arc<AtomicUsize>) {
        let asked = Arc::new(AtomicUsize::new(0));
        let prompt = FixedPrompt {
            password: password.to_string(),
            asked: Arc::clone(&asked),
        };
        (CredentialSession::new(Box::new(prompt)), asked)
    }
}
