use std::collections::{HashMap, HashSet};
use std::fmt;

use bollard::secret::PortMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a task. The legal transitions live in
/// [`super::state::valid_state_transition`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    #[default]
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Pending => "Pending",
            State::Scheduled => "Scheduled",
            State::Running => "Running",
            State::Completed => "Completed",
            State::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// A task a user wants to run somewhere on the cluster. Maps to exactly one
/// container once a worker has started it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Task {
    pub id: Uuid,
    pub container_id: String,
    pub name: String,
    pub state: State,
    pub image: String,
    /// Fraction of a core.
    pub cpu: f64,
    /// Bytes.
    pub memory: i64,
    /// Bytes.
    pub disk: i64,
    pub exposed_ports: HashSet<String>,
    pub port_bindings: HashMap<String, String>,
    /// One of "", "always", "unless-stopped", "on-failure".
    pub restart_policy: String,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub health_check: String,
    pub restart_count: u32,
    /// Container port -> host bindings, as observed by the runtime.
    pub host_ports: PortMap,
}

impl Default for Task {
    fn default() -> Self {
        Task {
            id: Uuid::new_v4(),
            container_id: String::new(),
            name: String::new(),
            state: State::Pending,
            image: String::new(),
            cpu: 0.0,
            memory: 0,
            disk: 0,
            exposed_ports: HashSet::new(),
            port_bindings: HashMap::new(),
            restart_policy: String::new(),
            start_time: None,
            finish_time: None,
            health_check: String::new(),
            restart_count: 0,
            host_ports: PortMap::new(),
        }
    }
}

/// A request to move a task into a desired state. Events are what travel
/// through the manager's pending queue and over the wire to workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskEvent {
    pub id: Uuid,
    pub state: State,
    pub timestamp: Option<DateTime<Utc>>,
    pub task: Task,
}

impl Default for TaskEvent {
    fn default() -> Self {
        TaskEvent {
            id: Uuid::new_v4(),
            state: State::Pending,
            timestamp: None,
            task: Task::default(),
        }
    }
}

/// Container configuration handed to the runtime driver.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub name: String,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub exposed_ports: HashSet<String>,
    pub cmd: Vec<String>,
    pub image: String,
    pub cpu: f64,
    pub memory: i64,
    pub disk: i64,
    pub env: Vec<String>,
    pub restart_policy: String,
}

pub fn new_config(t: &Task) -> Config {
    Config {
        name: t.name.clone(),
        exposed_ports: t.exposed_ports.clone(),
        image: t.image.clone(),
        cpu: t.cpu,
        memory: t.memory,
        disk: t.disk,
        restart_policy: t.restart_policy.clone(),
        ..Default::default()
    }
}
