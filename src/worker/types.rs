use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::stats::Stats;
use crate::store::{MemoryStore, PersistentStore, Store, StoreError, StoreKind};
use crate::task::{ContainerRuntime, DockerError, State, Task};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: State, to: State },
    #[error("we should not get here: no dispatch rule for queued state {queued}")]
    UnexpectedState { queued: State },
    #[error("task {0} missing from the task store")]
    TaskNotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Runtime(#[from] DockerError),
}

/// One worker agent: a FIFO intake queue, the authoritative task store for
/// this host, and a handle to the container runtime.
pub struct Worker {
    pub name: String,
    pub queue: VecDeque<Task>,
    pub db: Box<dyn Store<Task> + Send>,
    pub stats: Option<Stats>,
    pub task_count: u64,
    pub runtime: Arc<dyn ContainerRuntime>,
}

impl Worker {
    pub fn new(
        name: &str,
        store_kind: StoreKind,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Worker, WorkerError> {
        let db: Box<dyn Store<Task> + Send> = match store_kind {
            StoreKind::Memory => Box::new(MemoryStore::new()),
            StoreKind::Persistent => {
                Box::new(PersistentStore::new(format!("{name}_task.db"), "tasks")?)
            }
        };
        Ok(Worker {
            name: name.to_string(),
            queue: VecDeque::new(),
            db,
            stats: None,
            task_count: 0,
            runtime,
        })
    }
}
