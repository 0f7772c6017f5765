use std::sync::Arc;
use std::time::Duration;

use bollard::secret::PortMap;
use chrono::Utc;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::node::Node;
use crate::scheduler::SchedulerError;
use crate::task::{valid_state_transition, State, Task, TaskEvent};
use crate::worker::api::ErrResponse;

use super::types::{Manager, ManagerError};

const SEND_WORK_INTERVAL: Duration = Duration::from_secs(10);
const UPDATE_INTERVAL: Duration = Duration::from_secs(15);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const NODE_STATS_INTERVAL: Duration = Duration::from_secs(15);

/// Restarts per task are capped here; past the cap the task is left alone.
const MAX_RESTARTS: u32 = 3;

impl Manager {
    /// Enqueue a task event for placement.
    pub fn add_task(&mut self, te: TaskEvent) {
        info!(event_id = %te.id, task_id = %te.task.id, "adding event to pending queue");
        self.pending.push_back(te);
    }

    pub fn get_tasks(&self) -> Vec<Task> {
        match self.task_db.list() {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "error getting list of tasks");
                Vec::new()
            }
        }
    }

    /// Run the placement pipeline over a snapshot of the node list.
    pub async fn select_worker(&mut self, t: &Task) -> Result<Node, SchedulerError> {
        let snapshot = self.worker_nodes.clone();
        let candidates = self.scheduler.select_candidate_nodes(t, &snapshot);
        if candidates.is_empty() {
            return Err(SchedulerError::NoCandidates(t.id));
        }
        let scores = self.scheduler.score(t, &candidates).await;
        self.scheduler
            .pick(&scores, &candidates)
            .ok_or(SchedulerError::NoViableNode(t.id))
    }

    /// One send-work tick: dequeue an event, persist it, and either forward a
    /// stop request to the assigned worker or place the task on a new one.
    pub async fn send_work(&mut self) {
        let Some(te) = self.pending.pop_front() else {
            debug!("no work in the queue");
            return;
        };
        if let Err(e) = self.event_db.put(&te.id.to_string(), te.clone()) {
            error!(event_id = %te.id, error = %e, "error storing task event");
            return;
        }
        info!(event_id = %te.id, task_id = %te.task.id, "pulled event off pending queue");

        if let Some(assigned) = self.task_worker_map.get(&te.task.id).cloned() {
            let persisted = match self.task_db.get(&te.task.id.to_string()) {
                Ok(Some(t)) => t,
                Ok(None) => {
                    warn!(task_id = %te.task.id, "assigned task missing from task db");
                    return;
                }
                Err(e) => {
                    error!(task_id = %te.task.id, error = %e, "unable to schedule task");
                    return;
                }
            };
            if te.state == State::Completed && valid_state_transition(persisted.state, te.state) {
                self.stop_task(&assigned, &te.task.id.to_string()).await;
                return;
            }
            warn!(
                task_id = %persisted.id,
                state = %persisted.state,
                requested = %te.state,
                "invalid request: existing task cannot transition"
            );
            return;
        }

        let mut t = te.task.clone();
        let node = match self.select_worker(&t).await {
            Ok(node) => node,
            Err(e) => {
                error!(task_id = %t.id, error = %e, "error selecting worker, dropping event");
                return;
            }
        };
        info!(worker = %node.name, task_id = %t.id, "selected worker for task");

        self.worker_task_map
            .entry(node.name.clone())
            .or_default()
            .push(t.id);
        self.task_worker_map.insert(t.id, node.name.clone());
        t.state = State::Scheduled;
        if let Err(e) = self.task_db.put(&t.id.to_string(), t.clone()) {
            error!(task_id = %t.id, error = %e, "error storing scheduled task");
            return;
        }

        let mut outbound = te.clone();
        outbound.task = t.clone();
        let url = format!("http://{}/tasks", node.name);
        let resp = match self.client.post(&url).json(&outbound).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(worker = %node.name, error = %e, "error connecting to worker, requeueing event");
                self.unassign(&node.name, &t.id);
                self.pending.push_back(te);
                return;
            }
        };

        if resp.status() != StatusCode::CREATED {
            match resp.json::<ErrResponse>().await {
                Ok(e) => error!(
                    status = e.http_status_code,
                    message = %e.message,
                    "worker rejected task"
                ),
                Err(e) => error!(error = %e, "error decoding worker error response"),
            }
            return;
        }

        match resp.json::<Task>().await {
            Ok(accepted) => {
                if let Some(placed) = self.worker_nodes.iter_mut().find(|n| n.name == node.name) {
                    placed.task_count += 1;
                }
                debug!(task_id = %accepted.id, state = %accepted.state, "received response from worker");
            }
            Err(e) => error!(error = %e, "error decoding worker response"),
        }
    }

    fn unassign(&mut self, worker: &str, task_id: &Uuid) {
        self.task_worker_map.remove(task_id);
        if let Some(tasks) = self.worker_task_map.get_mut(worker) {
            tasks.retain(|id| id != task_id);
        }
    }

    async fn stop_task(&self, worker: &str, task_id: &str) {
        let url = format!("http://{worker}/tasks/{task_id}");
        match self.client.delete(&url).send().await {
            Err(e) => error!(%worker, error = %e, "error connecting to worker to stop task"),
            Ok(resp) if resp.status() != StatusCode::NO_CONTENT => {
                error!(%worker, status = %resp.status(), "error sending stop request")
            }
            Ok(_) => info!(%task_id, "task has been scheduled to be stopped"),
        }
    }

    /// One update tick: poll every worker's task list and merge the observed
    /// state into the task db. Tasks the manager never placed are skipped;
    /// worker truth does not override manager ignorance.
    pub async fn update_tasks(&mut self) {
        for worker in self.workers.clone() {
            debug!(%worker, "checking worker for task updates");
            let url = format!("http://{worker}/tasks");
            let resp = match self.client.get(&url).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(%worker, error = %e, "error connecting to worker");
                    continue;
                }
            };
            if !resp.status().is_success() {
                warn!(%worker, status = %resp.status(), "error requesting task list");
                continue;
            }
            let tasks: Vec<Task> = match resp.json().await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(%worker, error = %e, "error unmarshalling tasks");
                    continue;
                }
            };

            for observed in tasks {
                let mut persisted = match self.task_db.get(&observed.id.to_string()) {
                    Ok(Some(t)) => t,
                    Ok(None) => {
                        warn!(task_id = %observed.id, "observed task not found in task db");
                        continue;
                    }
                    Err(e) => {
                        error!(task_id = %observed.id, error = %e, "error reading task db");
                        continue;
                    }
                };
                if persisted.state != observed.state {
                    persisted.state = observed.state;
                }
                persisted.start_time = observed.start_time;
                persisted.finish_time = observed.finish_time;
                persisted.container_id = observed.container_id;
                persisted.host_ports = observed.host_ports;
                if let Err(e) = self.task_db.put(&persisted.id.to_string(), persisted) {
                    error!(error = %e, "error persisting updated task");
                }
            }
        }
    }

    /// One health-check tick over every stored task: probe running tasks'
    /// health endpoints and restart failures, up to the restart cap.
    pub async fn do_health_checks(&mut self) {
        for t in self.get_tasks() {
            if t.state == State::Running && t.restart_count < MAX_RESTARTS {
                if let Err(e) = self.check_task_health(&t).await {
                    warn!(task_id = %t.id, error = %e, "health check failed");
                    self.restart_task(t).await;
                }
            } else if t.state == State::Failed && t.restart_count < MAX_RESTARTS {
                self.restart_task(t).await;
            }
        }
    }

    async fn check_task_health(&self, t: &Task) -> Result<(), ManagerError> {
        let worker = self
            .task_worker_map
            .get(&t.id)
            .ok_or(ManagerError::NoWorkerAssigned(t.id))?;
        let host_port = get_host_port(&t.host_ports).ok_or(ManagerError::NoHostPort(t.id))?;
        let host = worker.split(':').next().unwrap_or(worker);
        let url = format!("http://{host}:{host_port}{}", t.health_check);
        debug!(task_id = %t.id, %url, "calling health check");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| ManagerError::HealthUnreachable {
                task_id: t.id,
                source,
            })?;
        if resp.status() != StatusCode::OK {
            return Err(ManagerError::HealthFailed {
                task_id: t.id,
                status: resp.status().as_u16(),
            });
        }
        debug!(task_id = %t.id, status = %resp.status(), "health check passed");
        Ok(())
    }

    /// Reschedule the task onto its assigned worker with a bumped restart
    /// count. If the worker is unreachable the restart event goes back onto
    /// the pending queue.
    pub async fn restart_task(&mut self, mut t: Task) {
        let Some(worker) = self.task_worker_map.get(&t.id).cloned() else {
            warn!(task_id = %t.id, "no worker assigned, cannot restart");
            return;
        };
        t.state = State::Scheduled;
        t.restart_count += 1;
        if let Err(e) = self.task_db.put(&t.id.to_string(), t.clone()) {
            error!(task_id = %t.id, error = %e, "error storing restarted task");
            return;
        }

        let te = TaskEvent {
            id: Uuid::new_v4(),
            state: State::Running,
            timestamp: Some(Utc::now()),
            task: t.clone(),
        };
        let url = format!("http://{worker}/tasks");
        match self.client.post(&url).json(&te).send().await {
            Err(e) => {
                warn!(%worker, error = %e, "error connecting to worker, requeueing restart event");
                self.pending.push_back(te);
            }
            Ok(resp) if resp.status() != StatusCode::CREATED => {
                match resp.json::<ErrResponse>().await {
                    Ok(e) => error!(
                        status = e.http_status_code,
                        message = %e.message,
                        "worker rejected restart"
                    ),
                    Err(e) => error!(error = %e, "error decoding worker error response"),
                }
            }
            Ok(_) => {
                debug!(task_id = %t.id, restart_count = t.restart_count, "restart request accepted")
            }
        }
    }

    /// One node-stats tick: refresh every node record from its worker. This
    /// feeds the E-PVM denominators.
    pub async fn update_node_stats(&mut self) {
        let client = self.client.clone();
        for node in &mut self.worker_nodes {
            debug!(node = %node.name, "collecting node stats");
            if let Err(e) = node.get_stats(&client).await {
                warn!(node = %node.name, error = %e, "error updating node stats");
            }
        }
    }
}

/// First host port found in the observed port map, if any.
pub fn get_host_port(ports: &PortMap) -> Option<String> {
    ports
        .values()
        .flatten()
        .flat_map(|bindings| bindings.iter())
        .find_map(|binding| binding.host_port.clone())
}

/// Dequeue and place pending work every ten seconds.
pub async fn process_tasks(manager: Arc<Mutex<Manager>>) {
    loop {
        debug!("processing any tasks in the queue");
        manager.lock().await.send_work().await;
        sleep(SEND_WORK_INTERVAL).await;
    }
}

/// Poll workers for task state every fifteen seconds.
pub async fn update_tasks(manager: Arc<Mutex<Manager>>) {
    loop {
        debug!("checking for task updates from workers");
        manager.lock().await.update_tasks().await;
        sleep(UPDATE_INTERVAL).await;
    }
}

/// Probe task health every sixty seconds.
pub async fn do_health_checks(manager: Arc<Mutex<Manager>>) {
    loop {
        debug!("performing task health checks");
        manager.lock().await.do_health_checks().await;
        sleep(HEALTH_CHECK_INTERVAL).await;
    }
}

/// Refresh node stats every fifteen seconds.
pub async fn update_node_stats(manager: Arc<Mutex<Manager>>) {
    loop {
        manager.lock().await.update_node_stats().await;
        sleep(NODE_STATS_INTERVAL).await;
    }
}
