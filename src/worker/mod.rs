pub mod api;
mod types;
mod worker;

pub use types::{Worker, WorkerError};
pub use worker::{collect_stats, run_tasks, update_tasks};
