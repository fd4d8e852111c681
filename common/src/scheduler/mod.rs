// Scheduler module: due-schedule detection and fetch task publishing

pub mod engine;

pub use engine::{
    ScheduleOutcome, ScheduleStatus, Scheduler, SchedulerConfig, SchedulerService, SchedulerStatus,
};
