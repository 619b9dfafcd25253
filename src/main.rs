use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use resticsched::credentials::CredentialSession;
use resticsched::process::SystemRunner;
use resticsched::{create_handler, ErrorKind, JobManager, ScheduleError, SchedulerKind, Selection, Settings};

#[derive(Parser)]
#[command(name = "resticsched", version, about = "Install backup jobs into the native scheduler")]
struct Cli {
    /// Configuration file (defaults to $RESTICSCHED_CONFIG, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the scheduler from the configuration
    #[arg(short, long, global = true, value_parser = parse_scheduler)]
    scheduler: Option<SchedulerKind>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install jobs and activate them
    Schedule {
        #[command(flatten)]
        target: Target,
        /// Do not start the job right after installing it
        #[arg(long)]
        no_start: bool,
    },
    /// Stop and remove jobs
    Unschedule {
        #[command(flatten)]
        target: Target,
    },
    /// Show the native state of jobs
    Status {
        #[command(flatten)]
        target: Target,
    },
    /// List jobs installed in the scheduler
    List {
        /// Only profiles matching this glob
        #[arg(long, default_value = "")]
        profile: String,
    },
}

#[derive(Args)]
struct Target {
    /// Every configured job
    #[arg(long, conflicts_with = "job")]
    all: bool,
    /// PROFILE or PROFILE.COMMAND
    #[arg(required_unless_present = "all")]
    job: Option<String>,
}

impl Target {
    fn selection(&self) -> Result<Selection> {
        match (&self.job, self.all) {
            (_, true) => Ok(Selection::All),
            (Some(job), false) => Ok(Selection::parse(job)),
            (None, false) => bail!("a job or --all is required"),
        }
    }
}

fn parse_scheduler(value: &str) -> std::result::Result<SchedulerKind, String> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_lowercase()))
        .map_err(|_| format!("unknown scheduler {:?} (auto, systemd, crond, launchd, taskscheduler)", value))
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(err) = run(cli) {
        eprintln!("Error: {:#}", err);
        if let Some(e) = err.downcast_ref::<ScheduleError>() {
            if e.kind() == ErrorKind::AccessDenied {
                eprintln!("hint: system jobs need to be managed from an elevated prompt (sudo or administrator)");
            }
        }
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "resticsched=debug" } else { "resticsched=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let mut settings = Settings::load(cli.config.as_deref()).context("cannot load settings")?;
    if let Some(kind) = cli.scheduler {
        settings.scheduler = kind;
    }
    debug!(scheduler = %settings.scheduler.resolve(), jobs = settings.jobs.len(), "settings loaded");

    let handler = create_handler(&settings, Arc::new(SystemRunner));
    handler.init()?;
    let manager = JobManager::new(handler, settings.jobs);
    let mut stdout = io::stdout();

    match cli.command {
        Command::Schedule { target, no_start } => {
            let mut session = CredentialSession::terminal();
            let count = manager.schedule(&target.selection()?, no_start, &mut session)?;
            println!("{} job(s) scheduled", count);
        }
        Command::Unschedule { target } => {
            let count = manager.unschedule(&target.selection()?)?;
            println!("{} job(s) removed", count);
        }
        Command::Status { target } => manager.status(&target.selection()?, &mut stdout)?,
        Command::List { profile } => {
            if manager.list(&profile, &mut stdout)? == 0 {
                println!("no job installed");
            }
        }
    }
    Ok(())
}
