mod scheduler;
mod types;

pub use scheduler::{new_scheduler, Epvm, RoundRobin, LIEB};
pub use types::{Scheduler, SchedulerError, SchedulerKind};
