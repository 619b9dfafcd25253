//! Backup job scheduling over systemd timers, crond, launchd and the Windows Task Scheduler.

pub mod calendar;
pub mod config;
pub mod credentials;
pub mod error;
pub mod job;
pub mod manager;
pub mod permission;
pub mod process;
pub mod scheduler;

pub use config::Settings;
pub use error::{ErrorKind, Result, ScheduleError};
pub use job::JobDescriptor;
pub use manager::{JobManager, Selection};
pub use permission::Permission;
pub use scheduler::{create_handler, Handler, SchedulerKind};
