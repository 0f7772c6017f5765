use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::stats::Stats;
use crate::task::{new_config, valid_state_transition, State, Task};

use super::types::{Worker, WorkerError};

const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(10);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(15);
const STATS_INTERVAL: Duration = Duration::from_secs(15);

impl Worker {
    /// Enqueue a task for the run loop. No validation happens here; the
    /// dispatch rules run when the task is dequeued, so fresh submissions,
    /// resubmissions and stop requests all share one path.
    pub fn add_task(&mut self, t: Task) {
        self.queue.push_back(t);
    }

    /// Dequeue one task, persist it, and dispatch on its target state.
    pub async fn run_next_task(&mut self) -> Result<(), WorkerError> {
        let Some(queued) = self.queue.pop_front() else {
            debug!("no tasks in the queue");
            return Ok(());
        };
        debug!(task_id = %queued.id, state = %queued.state, "found task in queue");

        let key = queued.id.to_string();
        self.db.put(&key, queued.clone())?;
        let persisted = self
            .db
            .get(&key)?
            .ok_or(WorkerError::TaskNotFound(queued.id))?;

        if persisted.state == State::Completed {
            return self.stop_task(persisted).await;
        }

        if !valid_state_transition(persisted.state, queued.state) {
            warn!(
                task_id = %queued.id,
                from = %persisted.state,
                to = %queued.state,
                "invalid state transition"
            );
            return Err(WorkerError::InvalidTransition {
                from: persisted.state,
                to: queued.state,
            });
        }

        match queued.state {
            State::Scheduled => {
                if !queued.container_id.is_empty() {
                    // Resubmission of a task that already ran: replace the container.
                    if let Err(e) = self.stop_task(queued.clone()).await {
                        warn!(task_id = %queued.id, error = %e, "error stopping previous container");
                    }
                }
                self.start_task(queued).await
            }
            other => Err(WorkerError::UnexpectedState { queued: other }),
        }
    }

    pub async fn start_task(&mut self, mut t: Task) -> Result<(), WorkerError> {
        t.start_time = Some(Utc::now());
        let config = new_config(&t);
        match self.runtime.run(&config).await {
            Err(e) => {
                error!(task_id = %t.id, error = %e, "error running task");
                t.state = State::Failed;
                t.finish_time = Some(Utc::now());
                self.db.put(&t.id.to_string(), t)?;
                Err(e.into())
            }
            Ok(container_id) => {
                t.container_id = container_id;
                t.state = State::Running;
                self.db.put(&t.id.to_string(), t)?;
                Ok(())
            }
        }
    }

    /// Stop and remove the task's container. Runtime failures are logged but
    /// the task is always persisted as Completed with a finish time.
    pub async fn stop_task(&mut self, mut t: Task) -> Result<(), WorkerError> {
        if let Err(e) = self.runtime.stop(&t.container_id).await {
            warn!(task_id = %t.id, error = %e, "error stopping container");
        }
        if let Err(e) = self.runtime.remove(&t.container_id).await {
            warn!(task_id = %t.id, error = %e, "error removing container");
        }
        t.finish_time = Some(Utc::now());
        t.state = State::Completed;
        self.db.put(&t.id.to_string(), t.clone())?;
        info!(task_id = %t.id, container_id = %t.container_id, "stopped and removed container");
        Ok(())
    }

    pub fn get_tasks(&self) -> Vec<Task> {
        match self.db.list() {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "error getting list of tasks");
                Vec::new()
            }
        }
    }

    /// Reconcile stored Running tasks against what the runtime reports: a
    /// missing or exited container marks the task Failed, a live one refreshes
    /// the observed host ports.
    pub async fn update_tasks(&mut self) {
        for mut t in self.get_tasks() {
            if t.state != State::Running {
                continue;
            }
            let container = match self.runtime.inspect(&t.container_id).await {
                Ok(c) => c,
                Err(e) => {
                    error!(task_id = %t.id, error = %e, "error inspecting container");
                    continue;
                }
            };
            match container {
                None => {
                    warn!(task_id = %t.id, "no container for running task");
                    t.state = State::Failed;
                    t.finish_time = Some(Utc::now());
                }
                Some(c) if c.status == "exited" => {
                    warn!(task_id = %t.id, status = %c.status, "container in non-running state");
                    t.state = State::Failed;
                    t.finish_time = Some(Utc::now());
                }
                Some(c) => {
                    t.host_ports = c.ports;
                }
            }
            if let Err(e) = self.db.put(&t.id.to_string(), t) {
                error!(error = %e, "error persisting reconciled task");
            }
        }
    }

    pub fn collect_stats(&mut self) {
        let stats = Stats::collect();
        self.task_count = stats.task_count;
        self.stats = Some(stats);
    }
}

/// Drive the intake queue every ten seconds.
pub async fn run_tasks(worker: Arc<Mutex<Worker>>) {
    loop {
        {
            let mut w = worker.lock().await;
            if w.queue.is_empty() {
                debug!("no tasks to process currently");
            } else if let Err(e) = w.run_next_task().await {
                error!(error = %e, "error running task");
            }
        }
        debug!("sleeping for {:?}", QUEUE_POLL_INTERVAL);
        sleep(QUEUE_POLL_INTERVAL).await;
    }
}

/// Reconcile stored state with the runtime every fifteen seconds.
pub async fn update_tasks(worker: Arc<Mutex<Worker>>) {
    loop {
        debug!("checking status of tasks");
        worker.lock().await.update_tasks().await;
        debug!("task updates completed");
        sleep(RECONCILE_INTERVAL).await;
    }
}

/// Refresh host stats every fifteen seconds.
pub async fn collect_stats(worker: Arc<Mutex<Worker>>) {
    loop {
        debug!("collecting stats");
        worker.lock().await.collect_stats();
        sleep(STATS_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use bollard::secret::{PortBinding, PortMap};

    use crate::store::StoreKind;
    use crate::task::{Config, ContainerRuntime, ContainerSummary, DockerError};

    use super::*;

    #[derive(Default)]
    struct FakeRuntime {
        fail_run: bool,
        started: AtomicUsize,
        stopped: AtomicUsize,
        removed: AtomicUsize,
        inspect_result: std::sync::Mutex<Option<ContainerSummary>>,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn run(&self, _config: &Config) -> Result<String, DockerError> {
            if self.fail_run {
                return Err(DockerError::Start("runtime offline".to_string()));
            }
            let n = self.started.fetch_add(1, Ordering::SeqCst);
            Ok(format!("fake-container-{n}"))
        }

        async fn stop(&self, _container_id: &str) -> Result<(), DockerError> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn remove(&self, _container_id: &str) -> Result<(), DockerError> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn inspect(
            &self,
            _container_id: &str,
        ) -> Result<Option<ContainerSummary>, DockerError> {
            Ok(self.inspect_result.lock().unwrap().clone())
        }
    }

    fn worker_with(runtime: Arc<FakeRuntime>) -> Worker {
        Worker::new("test-worker", StoreKind::Memory, runtime).unwrap()
    }

    #[tokio::test]
    async fn scheduled_task_is_started() {
        let runtime = Arc::new(FakeRuntime::default());
        let mut w = worker_with(runtime.clone());
        let t = Task {
            state: State::Scheduled,
            image: "strm/helloworld-http".to_string(),
            ..Default::default()
        };
        let id = t.id;

        w.add_task(t);
        w.run_next_task().await.unwrap();

        let stored = w.db.get(&id.to_string()).unwrap().unwrap();
        assert_eq!(stored.state, State::Running);
        assert!(!stored.container_id.is_empty());
        assert!(stored.start_time.is_some());
        assert_eq!(runtime.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_failure_marks_the_task_failed() {
        let runtime = Arc::new(FakeRuntime {
            fail_run: true,
            ..Default::default()
        });
        let mut w = worker_with(runtime);
        let t = Task {
            state: State::Scheduled,
            ..Default::default()
        };
        let id = t.id;

        w.add_task(t);
        assert!(w.run_next_task().await.is_err());

        let stored = w.db.get(&id.to_string()).unwrap().unwrap();
        assert_eq!(stored.state, State::Failed);
        assert!(stored.container_id.is_empty());
        assert!(stored.finish_time.is_some());
    }

    #[tokio::test]
    async fn completed_target_stops_and_removes_the_container() {
        let runtime = Arc::new(FakeRuntime::default());
        let mut w = worker_with(runtime.clone());
        let t = Task {
            state: State::Completed,
            container_id: "fake-container-0".to_string(),
            ..Default::default()
        };
        let id = t.id;

        w.add_task(t);
        w.run_next_task().await.unwrap();

        let stored = w.db.get(&id.to_string()).unwrap().unwrap();
        assert_eq!(stored.state, State::Completed);
        assert!(stored.finish_time.is_some());
        assert_eq!(runtime.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resubmitted_task_with_container_is_replaced() {
        let runtime = Arc::new(FakeRuntime::default());
        let mut w = worker_with(runtime.clone());
        let t = Task {
            state: State::Scheduled,
            container_id: "fake-container-old".to_string(),
            ..Default::default()
        };
        let id = t.id;

        w.add_task(t);
        w.run_next_task().await.unwrap();

        let stored = w.db.get(&id.to_string()).unwrap().unwrap();
        assert_eq!(stored.state, State::Running);
        assert_ne!(stored.container_id, "fake-container-old");
        assert_eq!(runtime.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pending_target_state_is_rejected() {
        let runtime = Arc::new(FakeRuntime::default());
        let mut w = worker_with(runtime.clone());
        let t = Task::default();
        let id = t.id;

        w.add_task(t);
        assert!(matches!(
            w.run_next_task().await,
            Err(WorkerError::InvalidTransition { .. })
        ));
        let stored = w.db.get(&id.to_string()).unwrap().unwrap();
        assert_eq!(stored.state, State::Pending);
        assert_eq!(runtime.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_queue_is_a_noop() {
        let mut w = worker_with(Arc::new(FakeRuntime::default()));
        w.run_next_task().await.unwrap();
        assert_eq!(w.db.count().unwrap(), 0);
    }

    fn running_task(w: &mut Worker) -> Task {
        let t = Task {
            state: State::Running,
            container_id: "fake-container-0".to_string(),
            ..Default::default()
        };
        w.db.put(&t.id.to_string(), t.clone()).unwrap();
        t
    }

    #[tokio::test]
    async fn reconcile_fails_task_whose_container_is_gone() {
        let runtime = Arc::new(FakeRuntime::default());
        let mut w = worker_with(runtime);
        let t = running_task(&mut w);

        w.update_tasks().await;

        let stored = w.db.get(&t.id.to_string()).unwrap().unwrap();
        assert_eq!(stored.state, State::Failed);
        assert!(stored.finish_time.is_some());
    }

    #[tokio::test]
    async fn reconcile_fails_task_whose_container_exited() {
        let runtime = Arc::new(FakeRuntime::default());
        *runtime.inspect_result.lock().unwrap() = Some(ContainerSummary {
            status: "exited".to_string(),
            ports: PortMap::new(),
        });
        let mut w = worker_with(runtime);
        let t = running_task(&mut w);

        w.update_tasks().await;

        let stored = w.db.get(&t.id.to_string()).unwrap().unwrap();
        assert_eq!(stored.state, State::Failed);
    }

    #[tokio::test]
    async fn reconcile_copies_host_ports_from_a_live_container() {
        let mut ports = PortMap::new();
        ports.insert(
            "80/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some("49153".to_string()),
            }]),
        );
        let runtime = Arc::new(FakeRuntime::default());
        *runtime.inspect_result.lock().unwrap() = Some(ContainerSummary {
            status: "running".to_string(),
            ports: ports.clone(),
        });
        let mut w = worker_with(runtime);
        let t = running_task(&mut w);

        w.update_tasks().await;

        let stored = w.db.get(&t.id.to_string()).unwrap().unwrap();
        assert_eq!(stored.state, State::Running);
        assert_eq!(stored.host_ports, ports);
    }

    #[tokio::test]
    async fn reconcile_skips_non_running_tasks() {
        let runtime = Arc::new(FakeRuntime::default());
        let mut w = worker_with(runtime);
        let t = Task {
            state: State::Completed,
            ..Default::default()
        };
        w.db.put(&t.id.to_string(), t.clone()).unwrap();

        w.update_tasks().await;

        let stored = w.db.get(&t.id.to_string()).unwrap().unwrap();
        assert_eq!(stored.state, State::Completed);
    }
}
