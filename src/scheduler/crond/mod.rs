//! Cron backend: jobs live in a marked section of the user crontab (or of a cron file).

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::calendar;
use crate::config::CrondSettings;
use crate::credentials::CredentialSession;
use crate::error::{classify, ErrorKind, Result, Rule, ScheduleError, Step, StepContext};
use crate::job::JobDescriptor;
use crate::permission::{Permission, PermissionResolution, ProcessUser};
use crate::process::{args, lookup_binary, CommandRunner};
use crate::scheduler::{profile_matcher, profile_matches, write_line, Handler};

pub mod crontab;

use crontab::{command_with_directory, cron_fields, CronBlock, CronLine, Crontab};

pub static CRONTAB_RULES: &[Rule] = &[
    Rule::stderr("no crontab for", ErrorKind::JobNotFound),
    Rule::stderr("not allowed", ErrorKind::AccessDenied),
    Rule::stderr("Permission denied", ErrorKind::AccessDenied),
];

const ROOT_USER: &str = "root";

pub struct CrondHandler {
    settings: CrondSettings,
    app_name: String,
    user: ProcessUser,
    runner: Arc<dyn CommandRunner>,
}

impl CrondHandler {
    pub fn new(settings: CrondSettings, app_name: &str, user: ProcessUser, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            settings,
            app_name: app_name.to_string(),
            user,
            runner,
        }
    }

    /// User column value when writing a cron file directly.
    ///
    /// System jobs run as root; `crond.user` only overrides user-scoped jobs.
    fn user_column(&self, permission: Permission) -> Option<String> {
        self.settings.file.as_ref()?;
        let permission = self.user.resolve(permission).permission();
        if permission == Permission::System {
            return Some(ROOT_USER.to_string());
        }
        Some(
            self.settings
                .user
                .clone()
                .unwrap_or_else(|| self.user.effective_username().to_string()),
        )
    }

    fn load(&self) -> Result<Crontab> {
        let content = match &self.settings.file {
            Some(file) => match fs::read_to_string(file) {
                Ok(content) => content,
                Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
                Err(e) => return Err(ScheduleError::io(file, e)),
            },
            None => {
                let output = self.runner.run(&self.settings.binary, &args(["-l"]))?;
                if output.success() {
                    output.stdout
                } else {
                    let err = classify(CRONTAB_RULES, "list", "crontab", &output);
                    // no crontab yet
                    if err.kind() != ErrorKind::JobNotFound {
                        return Err(err);
                    }
                    String::new()
                }
            }
        };
        Ok(Crontab::parse(&content, &self.app_name, self.settings.file.is_some()))
    }

    fn save(&self, table: &Crontab) -> Result<()> {
        let content = table.render();
        match &self.settings.file {
            Some(file) => save_file(file, &content),
            None => {
                let mut temp_file = tempfile::Builder::new()
                    .prefix("crontab-")
                    .suffix(".tmp")
                    .tempfile()
                    .map_err(|e| ScheduleError::io(std::env::temp_dir(), e))?;
                let temp_path = temp_file.path().to_path_buf();
                temp_file
                    .write_all(content.as_bytes())
                    .and_then(|_| temp_file.flush())
                    .map_err(|e| ScheduleError::io(&temp_path, e))?;

                let output = self
                    .runner
                    .run(&self.settings.binary, &[temp_path.to_string_lossy().to_string()])?;
                if output.success() {
                    Ok(())
                } else {
                    Err(classify(CRONTAB_RULES, "install", "crontab", &output))
                }
            }
        }
    }

    fn block_for(&self, job: &JobDescriptor, permission: Permission) -> Result<CronBlock> {
        let command = command_with_directory(job);
        let user = self.user_column(permission);
        let mut lines = Vec::new();
        for event in calendar::parse_schedules(&job.schedules)? {
            match cron_fields(&event) {
                Ok(fields) => lines.push(CronLine {
                    fields,
                    user: user.clone(),
                    command: command.clone(),
                }),
                Err(reason) => warn!(schedule = %event, %reason, "schedule skipped"),
            }
        }
        if lines.is_empty() {
            return Err(ScheduleError::Unsupported(format!(
                "no schedule of {} can be written as a crontab line",
                job.display_name()
            )));
        }
        Ok(CronBlock {
            profile_name: job.profile_name.clone(),
            command_name: job.command_name.clone(),
            lines,
        })
    }

    fn permission_of(&self, block: &CronBlock) -> Permission {
        let user = block.lines.first().and_then(|l| l.user.as_deref());
        match user {
            Some(ROOT_USER) => Permission::System,
            Some(_) => Permission::UserBackground,
            None if self.user.elevated => Permission::System,
            None => Permission::UserBackground,
        }
    }
}

fn save_file(file: &Path, content: &str) -> Result<()> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|e| ScheduleError::io(parent, e))?;
    }
    fs::write(file, content).map_err(|e| ScheduleError::io(file, e))
}

impl Handler for CrondHandler {
    fn name(&self) -> &'static str {
        "crond"
    }

    fn init(&self) -> Result<()> {
        if self.settings.file.is_some() {
            return Ok(());
        }
        lookup_binary("crond", &self.settings.binary).map(|_| ())
    }

    fn create_job(&self, job: &JobDescriptor, permission: Permission, _session: &mut CredentialSession) -> Result<()> {
        job.validate_identity()?;
        let block = self.block_for(job, permission)?;
        let mut table = self.load().step(Step::Query)?;
        table.upsert(block);
        self.save(&table).step(Step::Register)?;
        info!(job = %job.display_name(), "crontab updated");
        Ok(())
    }

    fn remove_job(&self, job: &JobDescriptor, _permission: Permission) -> Result<()> {
        let mut table = self.load().step(Step::Query)?;
        if !table.remove(&job.profile_name, &job.command_name) {
            if job.remove_only {
                warn!(job = %job.display_name(), "no crontab entry to remove");
                return Ok(());
            }
            return Err(ScheduleError::JobNotFound(job.display_name()));
        }
        self.save(&table).step(Step::Delete)?;
        info!(job = %job.display_name(), "crontab entry removed");
        Ok(())
    }

    fn display_job_status(&self, job: &JobDescriptor, out: &mut dyn Write) -> Result<()> {
        let table = self.load().step(Step::Query)?;
        let block = table
            .find(&job.profile_name, &job.command_name)
            .ok_or_else(|| ScheduleError::JobNotFound(job.display_name()))?;
        write_line(out, &block.header())?;
        for line in &block.lines {
            write_line(out, &line.render())?;
        }
        Ok(())
    }

    fn scheduled(&self, profile_filter: &str) -> Result<Vec<JobDescriptor>> {
        let matcher = profile_matcher(profile_filter)?;
        let table = self.load()?;
        Ok(table
            .blocks()
            .iter()
            .filter(|b| profile_matches(&matcher, &b.profile_name))
            .map(|b| {
                let mut job = b.to_job();
                job.permission = self.permission_of(b);
                job
            })
            .collect())
    }

    fn detect_schedule_permission(&self, declared: Permission) -> PermissionResolution {
        self.user.resolve(declared)
    }

    fn check_permission(&self, permission: Permission) -> bool {
        // a cron file outside the user table needs root
        if self.settings.file.is_some() {
            return self.user.elevated;
        }
        self.user.can_manage(permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::testing::session;
    use crate::process::testing::ScriptedRunner;
    use tempfile::TempDir;

    fn job(profile: &str) -> JobDescriptor {
        let mut job = JobDescriptor::new(profile, "backup", "/usr/bin/resticprofile");
        job.arguments = vec!["--name".to_string(), profile.to_string(), "backup".to_string()];
        job.schedules = vec!["03:00".to_string(), "15:00".to_string()];
        job.working_directory = "/home/bob".to_string();
        job
    }

    fn user() -> ProcessUser {
        ProcessUser {
            username: "root".to_string(),
            uid: Some(0),
            elevated: true,
            ..Default::default()
        }
    }

    fn file_handler(dir: &TempDir) -> CrondHandler {
        let settings = CrondSettings {
            file: Some(dir.path().join("cron.d").join("resticsched")),
            ..Default::default()
        };
        CrondHandler::new(settings, "resticsched", user(), Arc::new(ScriptedRunner::new()))
    }

    #[test]
    fn test_create_writes_one_line_per_schedule() {
        let dir = TempDir::new().unwrap();
        let handler = file_handler(&dir);
        let (mut session, _) = session("unused");
        handler.create_job(&job("home"), Permission::System, &mut session).unwrap();
        handler.create_job(&job("home"), Permission::System, &mut session).unwrap();

        let content = fs::read_to_string(dir.path().join("cron.d").join("resticsched")).unwrap();
        assert_eq!(content.matches("# job: backup@profile-home").count(), 1);
        assert!(content.contains("0 3 * * *\troot\tcd /home/bob && /usr/bin/resticprofile --name home backup\n"));
        assert!(content.contains("0 15 * * *\troot\t"));
    }

    #[test]
    fn test_system_job_under_sudo_runs_as_root() {
        let dir = TempDir::new().unwrap();
        let mut handler = file_handler(&dir);
        handler.user.sudo_user = Some("bob".to_string());
        handler.settings.user = Some("backup".to_string());
        let (mut session, _) = session("unused");

        handler.create_job(&job("home"), Permission::System, &mut session).unwrap();
        handler.create_job(&job("office"), Permission::UserBackground, &mut session).unwrap();
        handler.create_job(&job("lab"), Permission::Unspecified, &mut session).unwrap();

        let content = fs::read_to_string(dir.path().join("cron.d").join("resticsched")).unwrap();
        assert!(content.contains("0 3 * * *\troot\tcd /home/bob && /usr/bin/resticprofile --name home backup\n"));
        assert!(content.contains("0 3 * * *\tbackup\tcd /home/bob && /usr/bin/resticprofile --name office backup\n"));
        assert!(content.contains("0 3 * * *\troot\tcd /home/bob && /usr/bin/resticprofile --name lab backup\n"));

        let jobs = handler.scheduled("").unwrap();
        let permission = |profile: &str| jobs.iter().find(|j| j.profile_name == profile).unwrap().permission;
        assert_eq!(permission("home"), Permission::System);
        assert_eq!(permission("office"), Permission::UserBackground);
        assert_eq!(permission("lab"), Permission::System);
    }

    #[test]
    fn test_user_job_defaults_to_sudo_caller() {
        let dir = TempDir::new().unwrap();
        let mut handler = file_handler(&dir);
        handler.user.sudo_user = Some("bob".to_string());
        let (mut session, _) = session("unused");
        handler.create_job(&job("home"), Permission::UserLoggedOn, &mut session).unwrap();

        let content = fs::read_to_string(dir.path().join("cron.d").join("resticsched")).unwrap();
        assert!(content.contains("0 15 * * *\tbob\t"));
    }

    #[test]
    fn test_unexpressible_schedules() {
        let dir = TempDir::new().unwrap();
        let handler = file_handler(&dir);
        let mut job = job("home");
        job.schedules = vec!["2030-01-01 00:00".to_string()];
        let (mut session, _) = session("unused");
        let err = handler.create_job(&job, Permission::System, &mut session).unwrap_err();
        assert!(matches!(err, ScheduleError::Unsupported(_)));

        job.schedules = vec!["2030-01-01 00:00".to_string(), "daily".to_string()];
        handler.create_job(&job, Permission::System, &mut session).unwrap();
        let jobs = handler.scheduled("").unwrap();
        assert_eq!(jobs[0].schedules, vec!["0 0 * * *"]);
    }

    #[test]
    fn test_remove_and_not_found() {
        let dir = TempDir::new().unwrap();
        let handler = file_handler(&dir);
        let err = handler.remove_job(&job("home"), Permission::System).unwrap_err();
        assert!(err.is_not_found());

        let (mut session, _) = session("unused");
        handler.create_job(&job("home"), Permission::System, &mut session).unwrap();
        handler.create_job(&job("office"), Permission::System, &mut session).unwrap();
        handler.remove_job(&job("home"), Permission::System).unwrap();

        let jobs = handler.scheduled("").unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].profile_name, "office");

        handler
            .remove_job(&JobDescriptor::remove_only("home", "backup"), Permission::System)
            .unwrap();
    }

    #[test]
    fn test_scheduled_reads_back() {
        let dir = TempDir::new().unwrap();
        let handler = file_handler(&dir);
        let (mut session, _) = session("unused");
        handler.create_job(&job("home"), Permission::System, &mut session).unwrap();
        handler.create_job(&job("office"), Permission::System, &mut session).unwrap();

        let jobs = handler.scheduled("h*").unwrap();
        assert_eq!(jobs.len(), 1);
        let read = &jobs[0];
        assert_eq!(read.display_name(), "backup@home");
        assert_eq!(read.working_directory, "/home/bob");
        assert_eq!(read.command, "/usr/bin/resticprofile");
        assert_eq!(read.arguments, vec!["--name", "home", "backup"]);
        assert_eq!(read.schedules, vec!["0 3 * * *", "0 15 * * *"]);
        assert_eq!(read.permission, Permission::System);
    }

    #[test]
    fn test_status() {
        let dir = TempDir::new().unwrap();
        let handler = file_handler(&dir);
        assert!(handler.display_job_status(&job("home"), &mut Vec::new()).unwrap_err().is_not_found());

        let (mut session, _) = session("unused");
        handler.create_job(&job("home"), Permission::System, &mut session).unwrap();
        let mut out = Vec::new();
        handler.display_job_status(&job("home"), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("# job: backup@profile-home\n0 3 * * *"));
    }

    #[test]
    fn test_user_crontab_through_binary() {
        let runner = Arc::new(ScriptedRunner::new().on("crontab -l", 1, "", "no crontab for bob\n"));
        let handler = CrondHandler::new(CrondSettings::default(), "resticsched", user(), runner.clone());
        let (mut session, _) = session("unused");
        handler.create_job(&job("home"), Permission::UserLoggedOn, &mut session).unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], "crontab -l");
        assert!(calls[1].starts_with("crontab "));
        assert!(calls[1].ends_with(".tmp"));
    }

    #[test]
    fn test_access_denied_when_listing() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "crontab -l",
            1,
            "",
            "You (bob) are not allowed to use this program (crontab)\n",
        ));
        let handler = CrondHandler::new(CrondSettings::default(), "resticsched", user(), runner);
        let err = handler.remove_job(&job("home"), Permission::UserLoggedOn).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        assert_eq!(err.failed_step(), Some(Step::Query));
    }
}
