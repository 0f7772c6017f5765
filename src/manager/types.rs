use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::node::Node;
use crate::scheduler::{new_scheduler, Scheduler, SchedulerKind};
use crate::store::{MemoryStore, PersistentStore, Store, StoreError, StoreKind};
use crate::task::{Task, TaskEvent};

/// Outgoing requests are bounded so a stuck peer cannot wedge a control loop
/// past its own interval.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unable to create store: {0}")]
    Store(#[from] StoreError),
    #[error("unable to build http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("no worker assigned for task {0}")]
    NoWorkerAssigned(Uuid),
    #[error("task {0} has no host port mapping")]
    NoHostPort(Uuid),
    #[error("error connecting to health check for task {task_id}: {source}")]
    HealthUnreachable {
        task_id: Uuid,
        #[source]
        source: reqwest::Error,
    },
    #[error("health check for task {task_id} returned status {status}")]
    HealthFailed { task_id: Uuid, status: u16 },
}

/// The control plane: accepts task events, places tasks onto workers, and
/// reconciles its view of the cluster with what the workers report.
pub struct Manager {
    pub pending: VecDeque<TaskEvent>,
    pub task_db: Box<dyn Store<Task> + Send>,
    pub event_db: Box<dyn Store<TaskEvent> + Send>,
    pub workers: Vec<String>,
    pub worker_task_map: HashMap<String, Vec<Uuid>>,
    pub task_worker_map: HashMap<Uuid, String>,
    pub worker_nodes: Vec<Node>,
    pub scheduler: Box<dyn Scheduler + Send>,
    pub(super) client: reqwest::Client,
}

impl Manager {
    pub fn new(
        workers: &[String],
        scheduler_kind: SchedulerKind,
        store_kind: StoreKind,
    ) -> Result<Manager, ManagerError> {
        let mut worker_task_map = HashMap::new();
        let mut worker_nodes = Vec::new();
        for worker in workers {
            worker_task_map.insert(worker.clone(), Vec::new());
            let api = format!("http://{worker}");
            worker_nodes.push(Node::new(worker, &api, "worker"));
        }

        let (task_db, event_db): (Box<dyn Store<Task> + Send>, Box<dyn Store<TaskEvent> + Send>) =
            match store_kind {
                StoreKind::Memory => (Box::new(MemoryStore::new()), Box::new(MemoryStore::new())),
                StoreKind::Persistent => (
                    Box::new(PersistentStore::new("tasks.db", "tasks")?),
                    Box::new(PersistentStore::new("events.db", "events")?),
                ),
            };

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Manager {
            pending: VecDeque::new(),
            task_db,
            event_db,
            workers: workers.to_vec(),
            worker_task_map,
            task_worker_map: HashMap::new(),
            worker_nodes,
            scheduler: new_scheduler(scheduler_kind),
            client,
        })
    }
}
