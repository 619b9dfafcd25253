use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use tracing::{debug, info};

use crate::credentials::Credentials;
use crate::error::{classify, ErrorKind, Result, Rule, ScheduleError};
use crate::process::{args, CommandOutput, CommandRunner};
use crate::scheduler::schtasks::task::TaskDefinition;

pub const SCHTASKS_BINARY: &str = "schtasks.exe";

/// `schtasks.exe` reports every failure with exit code 1, so only stderr tells them apart.
pub static SCHTASKS_RULES: &[Rule] = &[
    Rule::stderr("The system cannot find the", ErrorKind::JobNotFound),
    Rule::stderr("does not exist in the system", ErrorKind::JobNotFound),
    Rule::stderr(
        "The filename, directory name, or volume label syntax is incorrect",
        ErrorKind::InvalidIdentity,
    ),
    Rule::stderr("Access is denied", ErrorKind::AccessDenied),
    Rule::stderr("already exists", ErrorKind::AlreadyExists),
];

/// One row of `schtasks /query /v`, keyed by column header.
pub type TaskInfo = BTreeMap<String, String>;

/// Where registered tasks live. The trigger compiler and task rendering are shared;
/// only this seam touches the native store.
pub trait TaskStore: Send + Sync {
    /// Create the task, replacing any task registered under the same path.
    fn register(&self, task: &TaskDefinition, credentials: Option<&Credentials>) -> Result<()>;

    fn delete(&self, task_path: &str) -> Result<()>;

    fn info(&self, task_path: &str) -> Result<TaskInfo>;

    /// Paths of every registered task.
    fn list(&self) -> Result<Vec<String>>;

    fn set_enabled(&self, task_path: &str, enabled: bool) -> Result<()>;

    /// Stop the running instance, if any.
    fn end(&self, task_path: &str) -> Result<()>;
}

/// Manages tasks through `schtasks.exe`.
pub struct SchtasksStore {
    runner: Arc<dyn CommandRunner>,
}

impl SchtasksStore {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn run(&self, verb: &str, subject: &str, arguments: Vec<String>) -> Result<CommandOutput> {
        let output = self.runner.run(SCHTASKS_BINARY, &arguments)?;
        if output.success() {
            Ok(output)
        } else {
            Err(classify(SCHTASKS_RULES, verb, subject, &output))
        }
    }
}

impl TaskStore for SchtasksStore {
    fn register(&self, task: &TaskDefinition, credentials: Option<&Credentials>) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix("resticsched-")
            .suffix(".xml")
            .tempfile()
            .map_err(|e| ScheduleError::io(std::env::temp_dir(), e))?;
        file.write_all(task.to_xml().as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| ScheduleError::io(file.path(), e))?;

        let mut arguments = args(["/create", "/f", "/tn", task.uri.as_str(), "/xml"]);
        arguments.push(file.path().to_string_lossy().to_string());
        if let Some(credentials) = credentials {
            arguments.extend(args(["/ru", credentials.username.as_str(), "/rp", credentials.password.as_str()]));
        }

        self.run("create", &task.uri, arguments)?;
        info!(task = %task.uri, "registered task");
        Ok(())
    }

    fn delete(&self, task_path: &str) -> Result<()> {
        self.run("delete", task_path, args(["/delete", "/f", "/tn", task_path]))?;
        Ok(())
    }

    fn info(&self, task_path: &str) -> Result<TaskInfo> {
        let output = self.run("query", task_path, args(["/query", "/fo", "csv", "/v", "/tn", task_path]))?;
        let rows = parse_csv(&output.stdout);
        match rows.as_slice() {
            [header, row, ..] => Ok(header.iter().cloned().zip(row.iter().cloned()).collect()),
            _ => Err(ScheduleError::JobNotFound(task_path.to_string())),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let output = self.run("query", "", args(["/query", "/nh", "/fo", "csv"]))?;
        let mut paths: Vec<String> = parse_csv(&output.stdout)
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .filter(|path| path.starts_with('\\'))
            .collect();
        paths.sort();
        paths.dedup();
        debug!(count = paths.len(), "listed registered tasks");
        Ok(paths)
    }

    fn set_enabled(&self, task_path: &str, enabled: bool) -> Result<()> {
        let flag = if enabled { "/enable" } else { "/disable" };
        self.run("change", task_path, args(["/change", "/tn", task_path, flag]))?;
        Ok(())
    }

    fn end(&self, task_path: &str) -> Result<()> {
        self.run("end", task_path, args(["/end", "/tn", task_path]))?;
        Ok(())
    }
}

/// Minimal CSV reader for `schtasks /fo csv`: quoted fields with `""` escapes.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut quoted = false;
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '"' if quoted && chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => quoted = !quoted,
                ',' if !quoted => fields.push(std::mem::take(&mut field)),
                c => field.push(c),
            }
        }
        fields.push(field);
        rows.push(fields);
    }
    rows
}

#[cfg(test)]
pub(crate) mod memory {
    use std::sync::Mutex;

    use super::*;
    use crate::scheduler::schtasks::task::LogonType;

    /// Registered tasks kept in memory, with the credentials they were registered with.
    #[derive(Default)]
    pub struct MemoryStore {
        pub tasks: Mutex<BTreeMap<String, (TaskDefinition, Option<Credentials>, bool)>>,
    }

    impl MemoryStore {
        pub fn task(&self, path: &str) -> Option<TaskDefinition> {
            self.tasks.lock().unwrap().get(path).map(|(t, _, _)| t.clone())
        }

        pub fn credentials(&self, path: &str) -> Option<Credentials> {
            self.tasks.lock().unwrap().get(path).and_then(|(_, c, _)| c.clone())
        }

        pub fn enabled(&self, path: &str) -> bool {
            self.tasks.lock().unwrap().get(path).map(|(_, _, e)| *e).unwrap_or(false)
        }

        pub fn len(&self) -> usize {
            self.tasks.lock().unwrap().len()
        }
    }

    impl TaskStore for MemoryStore {
        fn register(&self, task: &TaskDefinition, credentials: Option<&Credentials>) -> Result<()> {
            self.tasks
                .lock()
                .unwrap()
                .insert(task.uri.clone(), (task.clone(), credentials.cloned(), true));
            Ok(())
        }

        fn delete(&self, task_path: &str) -> Result<()> {
            self.tasks
                .lock()
                .unwrap()
                .remove(task_path)
                .map(|_| ())
                .ok_or_else(|| ScheduleError::JobNotFound(task_path.to_string()))
        }

        fn info(&self, task_path: &str) -> Result<TaskInfo> {
            let tasks = self.tasks.lock().unwrap();
            let (task, _, enabled) = tasks
                .get(task_path)
                .ok_or_else(|| ScheduleError::JobNotFound(task_path.to_string()))?;
            let mut info = TaskInfo::new();
            info.insert("TaskName".to_string(), task.uri.clone());
            info.insert(
                "Task To Run".to_string(),
                format!("{} {}", task.action.command, task.action.arguments).trim().to_string(),
            );
            info.insert("Start In".to_string(), task.action.working_directory.clone());
            info.insert("Comment".to_string(), task.description.clone());
            info.insert(
                "Run As User".to_string(),
                task.principal.user_id.clone().unwrap_or_default(),
            );
            let logon_mode = match task.principal.logon_type {
                LogonType::InteractiveToken => "Interactive only",
                LogonType::Password => "Interactive/Background",
                LogonType::ServiceForUser => "Background only",
            };
            info.insert("Logon Mode".to_string(), logon_mode.to_string());
            info.insert(
                "Scheduled Task State".to_string(),
                if *enabled { "Enabled" } else { "Disabled" }.to_string(),
            );
            info.insert("Status".to_string(), "Ready".to_string());
            Ok(info)
        }

        fn list(&self) -> Result<Vec<String>> {
            Ok(self.tasks.lock().unwrap().keys().cloned().collect())
        }

        fn set_enabled(&self, task_path: &str, enabled: bool) -> Result<()> {
            let mut tasks = self.tasks.lock().unwrap();
            let entry = tasks
                .get_mut(task_path)
                .ok_or_else(|| ScheduleError::JobNotFound(task_path.to_string()))?;
            entry.2 = enabled;
            Ok(())
        }

        fn end(&self, task_path: &str) -> Result<()> {
            if self.tasks.lock().unwrap().contains_key(task_path) {
                Ok(())
            } else {
                Err(ScheduleError::JobNotFound(task_path.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::ScriptedRunner;

    const INFO: &str = "\"HostName\",\"TaskName\",\"Next Run Time\",\"Status\",\"Task To Run\",\"Start In\"\r\n\
\"PC\",\"\\resticsched backup\\home backup\",\"16/01/2024 03:00:00\",\"Ready\",\"C:\\bin\\rp.exe --name \"\"home\"\" backup\",\"C:\\Users\\bob\"\r\n";

    #[test]
    fn test_parse_csv_quotes() {
        let rows = parse_csv(INFO);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][1], r"\resticsched backup\home backup");
        assert_eq!(rows[1][4], r#"C:\bin\rp.exe --name "home" backup"#);
    }

    #[test]
    fn test_info_zips_header_and_row() {
        let runner = Arc::new(ScriptedRunner::new().on("/query /fo csv /v", 0, INFO, ""));
        let store = SchtasksStore::new(runner);
        let info = store.info(r"\resticsched backup\home backup").unwrap();
        assert_eq!(info.get("Status").map(String::as_str), Some("Ready"));
        assert_eq!(info.get("Start In").map(String::as_str), Some(r"C:\Users\bob"));
    }

    #[test]
    fn test_not_found_is_classified() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "/delete",
            1,
            "",
            "ERROR: The system cannot find the file specified.\r\n",
        ));
        let store = SchtasksStore::new(runner);
        let err = store.delete(r"\resticsched backup\nothing backup").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_access_denied_keeps_message() {
        let runner = Arc::new(ScriptedRunner::new().on("/change", 1, "", "ERROR: Access is denied.\r\n"));
        let store = SchtasksStore::new(runner);
        let err = store.set_enabled(r"\resticsched backup\home backup", true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        assert!(err.to_string().contains("Access is denied"));
    }

    #[test]
    fn test_list_keeps_task_paths_only() {
        let listing = "\"\\resticsched backup\\home backup\",\"N/A\",\"Ready\"\r\n\
\"\\resticsched backup\\home backup\",\"N/A\",\"Ready\"\r\n\
\"\\Microsoft\\Windows\\Defrag\",\"N/A\",\"Ready\"\r\n\
\"INFO: There are no scheduled tasks presently available at your access level.\"\r\n";
        let runner = Arc::new(ScriptedRunner::new().on("/query /nh", 0, listing, ""));
        let store = SchtasksStore::new(runner);
        let paths = store.list().unwrap();
        assert_eq!(
            paths,
            vec![r"\Microsoft\Windows\Defrag", r"\resticsched backup\home backup"]
        );
    }
}
