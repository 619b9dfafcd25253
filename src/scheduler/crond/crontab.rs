//! Crontab codec: our own section between two marker lines, one block per job.
//!
//! ```text
//! ### this content was generated by resticsched, please leave this line intact ###
//! # job: backup@profile-home
//! 0 3 * * *	cd /home/bob && /usr/bin/resticprofile --name home backup
//! 0 15 * * *	cd /home/bob && /usr/bin/resticprofile --name home backup
//! ### end of resticsched content, please leave this line intact ###
//! ```
//!
//! Everything outside the section is kept as it was.

use crate::calendar::{RecurrenceSpec, TimeUnit};
use crate::job::{join_command_line, quote_arg, split_command_line, JobDescriptor};

const JOB_HEADER: &str = "# job: ";
/// Header some `crontab -l` implementations prepend to the listing.
const GENERATED_HEADER: &str = "# DO NOT EDIT THIS FILE";

fn start_marker(app_name: &str) -> String {
    format!("### this content was generated by {}, please leave this line intact ###", app_name)
}

fn end_marker(app_name: &str) -> String {
    format!("### end of {} content, please leave this line intact ###", app_name)
}

/// One scheduled line: five time fields, optional user column and the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronLine {
    pub fields: String,
    pub user: Option<String>,
    pub command: String,
}

impl CronLine {
    pub fn parse(line: &str, user_column: bool) -> Option<Self> {
        let (fields, rest) = take_fields(line, 5)?;
        let (user, command) = if user_column {
            let (user, rest) = take_fields(rest, 1)?;
            (Some(user[0].to_string()), rest)
        } else {
            (None, rest)
        };
        if command.is_empty() {
            return None;
        }
        Some(Self {
            fields: fields.join(" "),
            user,
            command: command.to_string(),
        })
    }

    pub fn render(&self) -> String {
        match &self.user {
            Some(user) => format!("{}\t{}\t{}", self.fields, user, self.command),
            None => format!("{}\t{}", self.fields, self.command),
        }
    }
}

/// The first `count` whitespace-separated fields and the untouched remainder.
fn take_fields(line: &str, count: usize) -> Option<(Vec<&str>, &str)> {
    let mut rest = line.trim_start();
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        if rest.is_empty() {
            return None;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((fields, rest.trim_end()))
}

/// All the lines of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronBlock {
    pub profile_name: String,
    pub command_name: String,
    pub lines: Vec<CronLine>,
}

impl CronBlock {
    pub fn header(&self) -> String {
        format!("{}{}@profile-{}", JOB_HEADER, self.command_name, self.profile_name)
    }

    fn parse_header(line: &str) -> Option<(String, String)> {
        let identity = line.strip_prefix(JOB_HEADER)?.trim();
        let (command, profile) = identity.split_once("@profile-")?;
        if command.is_empty() || profile.is_empty() {
            return None;
        }
        Some((profile.to_string(), command.to_string()))
    }

    /// Descriptor view of the block. Schedules are the cron fields of each line.
    pub fn to_job(&self) -> JobDescriptor {
        let mut job = JobDescriptor::new(&self.profile_name, &self.command_name, "");
        job.schedules = self.lines.iter().map(|l| l.fields.clone()).collect();
        if let Some(line) = self.lines.first() {
            let (working_directory, command) = split_working_directory(&line.command);
            job.working_directory = working_directory;
            job.apply_command_line(&command);
        }
        job
    }
}

/// `cd <dir> && <command>` when a working directory is set.
pub fn command_with_directory(job: &JobDescriptor) -> String {
    if job.working_directory.is_empty() {
        job.command_line()
    } else {
        format!("cd {} && {}", quote_arg(&job.working_directory), job.command_line())
    }
}

fn split_working_directory(command: &str) -> (String, String) {
    let tokens = split_command_line(command);
    match tokens.as_slice() {
        [cd, dir, and, rest @ ..] if cd == "cd" && and == "&&" => (dir.clone(), join_command_line(rest)),
        _ => (String::new(), command.to_string()),
    }
}

/// Five cron fields for a recurrence, or why it cannot be written as one crontab line.
pub fn cron_fields(spec: &dyn RecurrenceSpec) -> Result<String, String> {
    if spec.as_single_instant().is_some() {
        return Err("a one-off instant cannot be expressed in a crontab".to_string());
    }
    if spec.restricts_year() {
        return Err("crontab lines cannot restrict years".to_string());
    }
    if spec.constraint(TimeUnit::Second) != Some(vec![0]) {
        return Err("crontab lines cannot fire on seconds".to_string());
    }
    // cron ORs these two fields when both are set
    if spec.constraint(TimeUnit::Weekday).is_some() && spec.constraint(TimeUnit::DayOfMonth).is_some() {
        return Err("a crontab line cannot require both a weekday and a day of the month".to_string());
    }
    let field = |unit: TimeUnit, ranges: bool| match spec.constraint(unit) {
        None => "*".to_string(),
        Some(values) if ranges => format_ranges(&values),
        Some(values) => values.iter().map(u32::to_string).collect::<Vec<_>>().join(","),
    };
    Ok(format!(
        "{} {} {} {} {}",
        field(TimeUnit::Minute, true),
        field(TimeUnit::Hour, true),
        field(TimeUnit::DayOfMonth, true),
        field(TimeUnit::Month, true),
        // weekdays stay a plain list
        field(TimeUnit::Weekday, false),
    ))
}

/// `1,2,3,4,6` gives `1-4,6`. Runs shorter than three stay listed.
fn format_ranges(values: &[u32]) -> String {
    let mut parts = Vec::new();
    let mut index = 0;
    while index < values.len() {
        let start = values[index];
        let mut end = index;
        while end + 1 < values.len() && values[end + 1] == values[end] + 1 {
            end += 1;
        }
        if end - index >= 2 {
            parts.push(format!("{}-{}", start, values[end]));
            index = end + 1;
        } else {
            parts.push(start.to_string());
            index += 1;
        }
    }
    parts.join(",")
}

/// A whole crontab, split around our section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crontab {
    app_name: String,
    user_column: bool,
    before: Vec<String>,
    blocks: Vec<CronBlock>,
    after: Vec<String>,
}

impl Crontab {
    pub fn parse(content: &str, app_name: &str, user_column: bool) -> Self {
        let start = start_marker(app_name);
        let end = end_marker(app_name);
        let mut table = Crontab {
            app_name: app_name.to_string(),
            user_column,
            before: Vec::new(),
            blocks: Vec::new(),
            after: Vec::new(),
        };

        let mut lines = content.lines().peekable();
        if lines.peek().map_or(false, |l| l.starts_with(GENERATED_HEADER)) {
            lines.nth(2);
        }

        let mut inside = false;
        let mut seen_section = false;
        for line in lines {
            if !seen_section && line.trim() == start {
                inside = true;
                seen_section = true;
                continue;
            }
            if inside && line.trim() == end {
                inside = false;
                continue;
            }
            if !inside {
                if seen_section {
                    table.after.push(line.to_string());
                } else {
                    table.before.push(line.to_string());
                }
                continue;
            }

            let trimmed = line.trim();
            if let Some((profile_name, command_name)) = CronBlock::parse_header(trimmed) {
                table.blocks.push(CronBlock {
                    profile_name,
                    command_name,
                    lines: Vec::new(),
                });
            } else if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            } else if let (Some(block), Some(parsed)) =
                (table.blocks.last_mut(), CronLine::parse(trimmed, user_column))
            {
                block.lines.push(parsed);
            }
        }
        table
    }

    pub fn blocks(&self) -> &[CronBlock] {
        &self.blocks
    }

    pub fn user_column(&self) -> bool {
        self.user_column
    }

    pub fn find(&self, profile_name: &str, command_name: &str) -> Option<&CronBlock> {
        self.blocks
            .iter()
            .find(|b| b.profile_name == profile_name && b.command_name == command_name)
    }

    /// Replace the block of the same job in place, or append it.
    pub fn upsert(&mut self, block: CronBlock) {
        match self
            .blocks
            .iter_mut()
            .find(|b| b.profile_name == block.profile_name && b.command_name == block.command_name)
        {
            Some(existing) => *existing = block,
            None => self.blocks.push(block),
        }
    }

    /// True when a block was removed.
    pub fn remove(&mut self, profile_name: &str, command_name: &str) -> bool {
        let before = self.blocks.len();
        self.blocks
            .retain(|b| !(b.profile_name == profile_name && b.command_name == command_name));
        self.blocks.len() != before
    }

    /// Full content. The section disappears once it holds no job.
    pub fn render(&self) -> String {
        let mut lines: Vec<String> = self.before.clone();
        if !self.blocks.is_empty() {
            lines.push(start_marker(&self.app_name));
            for block in &self.blocks {
                lines.push(block.header());
                lines.extend(block.lines.iter().map(CronLine::render));
            }
            lines.push(end_marker(&self.app_name));
        }
        lines.extend(self.after.iter().cloned());

        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        content
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::CalendarEvent;

    const APP: &str = "resticsched";

    fn fields(expression: &str) -> Result<String, String> {
        cron_fields(&CalendarEvent::parse(expression).unwrap())
    }

    fn block(profile: &str, command: &str, schedule: &str) -> CronBlock {
        CronBlock {
            profile_name: profile.to_string(),
            command_name: command.to_string(),
            lines: vec![CronLine {
                fields: schedule.to_string(),
                user: None,
                command: format!("/usr/bin/resticprofile --name {} {}", profile, command),
            }],
        }
    }

    #[test]
    fn test_cron_fields() {
        assert_eq!(fields("03:00").unwrap(), "0 3 * * *");
        assert_eq!(fields("30 2 * * *").unwrap(), "30 2 * * *");
        assert_eq!(fields("mon..fri 08:30").unwrap(), "30 8 * * 1,2,3,4,5");
        assert_eq!(fields("*:0/15").unwrap(), "0,15,30,45 * * * *");
        assert_eq!(fields("1..4,6:00").unwrap(), "0 1-4,6 * * *");
        assert_eq!(fields("*-*-1 03:00").unwrap(), "0 3 1 * *");
    }

    #[test]
    fn test_cron_fields_rejects() {
        assert!(fields("2024-05-01 04:30").is_err());
        assert!(fields("*:*:0/30").is_err());
        assert!(fields("0 0 0 1 1 * 2030").is_err());
        assert!(fields("mon *-*-1 03:00").is_err());
        assert!(fields("0 3 1 * Mon").is_err());
    }

    #[test]
    fn test_format_ranges() {
        assert_eq!(format_ranges(&[1, 2, 3, 4, 6]), "1-4,6");
        assert_eq!(format_ranges(&[1, 2, 5, 6, 7]), "1,2,5-7");
        assert_eq!(format_ranges(&[0]), "0");
    }

    #[test]
    fn test_parse_keeps_foreign_lines() {
        let content = format!(
            "MAILTO=bob\n0 * * * * /bin/check.sh\n{}\n# job: backup@profile-home\n0 3 * * *\t/usr/bin/rp backup\n{}\n# after\n",
            start_marker(APP),
            end_marker(APP)
        );
        let table = Crontab::parse(&content, APP, false);
        assert_eq!(table.blocks().len(), 1);
        assert_eq!(table.blocks()[0].profile_name, "home");
        assert_eq!(table.blocks()[0].lines[0].command, "/usr/bin/rp backup");
        assert_eq!(table.render(), content);
    }

    #[test]
    fn test_generated_header_is_dropped() {
        let content = "# DO NOT EDIT THIS FILE - edit the master and reinstall.\n# (/tmp/crontab.x installed)\n# (Cron version)\n0 * * * * /bin/check.sh\n";
        let table = Crontab::parse(content, APP, false);
        assert_eq!(table.render(), "0 * * * * /bin/check.sh\n");
    }

    #[test]
    fn test_upsert_replaces_block() {
        let mut table = Crontab::parse("", APP, false);
        table.upsert(block("home", "backup", "0 3 * * *"));
        table.upsert(block("office", "backup", "0 4 * * *"));
        table.upsert(block("home", "backup", "0 5 * * *"));

        assert_eq!(table.blocks().len(), 2);
        assert_eq!(table.blocks()[0].lines[0].fields, "0 5 * * *");

        let rendered = table.render();
        assert_eq!(rendered.matches("# job: backup@profile-home").count(), 1);
        assert_eq!(Crontab::parse(&rendered, APP, false), table);
    }

    #[test]
    fn test_remove_last_block_drops_section() {
        let mut table = Crontab::parse("0 * * * * /bin/check.sh\n", APP, false);
        table.upsert(block("home", "backup", "0 3 * * *"));
        assert!(table.remove("home", "backup"));
        assert!(!table.remove("home", "backup"));
        assert_eq!(table.render(), "0 * * * * /bin/check.sh\n");
    }

    #[test]
    fn test_user_column() {
        let line = CronLine::parse("0 3 * * *\troot\tcd /root && rp backup", true).unwrap();
        assert_eq!(line.user.as_deref(), Some("root"));
        assert_eq!(line.command, "cd /root && rp backup");
        assert_eq!(line.render(), "0 3 * * *\troot\tcd /root && rp backup");
        assert!(CronLine::parse("0 3 * * *", false).is_none());
    }

    #[test]
    fn test_block_to_job() {
        let mut job = JobDescriptor::new("home", "backup", "/usr/bin/rp");
        job.arguments = vec!["--name".to_string(), "home".to_string()];
        job.working_directory = "/home/bob/my files".to_string();
        let block = CronBlock {
            profile_name: "home".to_string(),
            command_name: "backup".to_string(),
            lines: vec![CronLine {
                fields: "0 3 * * *".to_string(),
                user: None,
                command: command_with_directory(&job),
            }],
        };
        let read = block.to_job();
        assert_eq!(read.display_name(), "backup@home");
        assert_eq!(read.working_directory, "/home/bob/my files");
        assert_eq!(read.command, "/usr/bin/rp");
        assert_eq!(read.arguments, job.arguments);
        assert_eq!(read.schedules, vec!["0 3 * * *"]);
    }
}
