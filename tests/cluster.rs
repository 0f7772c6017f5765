//! End-to-end exercises of the manager/worker pair over real HTTP, with the
//! container runtime faked out.

mod common;

use std::sync::Arc;

use archon::manager::Manager;
use archon::scheduler::SchedulerKind;
use archon::store::StoreKind;
use archon::task::{State, Task, TaskEvent};

use common::{spawn_worker, FakeRuntime};

fn submission(task: Task) -> TaskEvent {
    TaskEvent {
        state: State::Running,
        task,
        ..Default::default()
    }
}

#[tokio::test]
async fn submitted_task_is_placed_started_and_observed() {
    let runtime = Arc::new(FakeRuntime::default());
    let (worker, addr) = spawn_worker(runtime.clone()).await;
    let mut manager = Manager::new(
        &[addr.clone()],
        SchedulerKind::RoundRobin,
        StoreKind::Memory,
    )
    .unwrap();

    let te = submission(Task {
        name: "test-container-1".to_string(),
        image: "strm/helloworld-http".to_string(),
        memory: 64 * 1024 * 1024,
        disk: 100 * 1024 * 1024,
        ..Default::default()
    });
    let task_id = te.task.id;
    let event_id = te.id;

    manager.add_task(te);
    manager.send_work().await;

    // Bookkeeping after placement.
    assert!(manager
        .event_db
        .get(&event_id.to_string())
        .unwrap()
        .is_some());
    assert_eq!(manager.task_worker_map.get(&task_id), Some(&addr));
    assert!(manager.worker_task_map[&addr].contains(&task_id));
    let scheduled = manager.task_db.get(&task_id.to_string()).unwrap().unwrap();
    assert_eq!(scheduled.state, State::Scheduled);
    assert_eq!(manager.worker_nodes[0].task_count, 1);

    // The worker got the POST and starts the task on its next tick.
    {
        let mut w = worker.lock().await;
        assert_eq!(w.queue.len(), 1);
        w.run_next_task().await.unwrap();
        let running = w.db.get(&task_id.to_string()).unwrap().unwrap();
        assert_eq!(running.state, State::Running);
        assert!(!running.container_id.is_empty());
    }
    assert_eq!(
        runtime.started.load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    // The update loop merges the observed state back into the manager.
    manager.update_tasks().await;
    let merged = manager.task_db.get(&task_id.to_string()).unwrap().unwrap();
    assert_eq!(merged.state, State::Running);
    assert!(!merged.container_id.is_empty());
    assert!(merged.start_time.is_some());
}

#[tokio::test]
async fn event_for_completed_task_is_stored_but_not_forwarded() {
    let runtime = Arc::new(FakeRuntime::default());
    let (worker, addr) = spawn_worker(runtime).await;
    let mut manager = Manager::new(
        &[addr.clone()],
        SchedulerKind::RoundRobin,
        StoreKind::Memory,
    )
    .unwrap();

    let done = Task {
        state: State::Completed,
        ..Default::default()
    };
    manager
        .task_db
        .put(&done.id.to_string(), done.clone())
        .unwrap();
    manager.task_worker_map.insert(done.id, addr.clone());

    let te = TaskEvent {
        state: State::Scheduled,
        task: done.clone(),
        ..Default::default()
    };
    let event_id = te.id;
    manager.add_task(te);
    manager.send_work().await;

    assert!(manager
        .event_db
        .get(&event_id.to_string())
        .unwrap()
        .is_some());
    let stored = manager.task_db.get(&done.id.to_string()).unwrap().unwrap();
    assert_eq!(stored.state, State::Completed);
    assert!(manager.pending.is_empty());
    assert!(worker.lock().await.queue.is_empty());
}

#[tokio::test]
async fn stop_event_reaches_the_assigned_worker() {
    let runtime = Arc::new(FakeRuntime::default());
    let (worker, addr) = spawn_worker(runtime.clone()).await;
    let mut manager = Manager::new(
        &[addr.clone()],
        SchedulerKind::RoundRobin,
        StoreKind::Memory,
    )
    .unwrap();

    // A task the manager placed earlier and has since observed Running.
    let running = Task {
        state: State::Running,
        container_id: "fake-container-0".to_string(),
        ..Default::default()
    };
    manager
        .task_db
        .put(&running.id.to_string(), running.clone())
        .unwrap();
    manager.task_worker_map.insert(running.id, addr.clone());
    worker
        .lock()
        .await
        .db
        .put(&running.id.to_string(), running.clone())
        .unwrap();

    let te = TaskEvent {
        state: State::Completed,
        task: running.clone(),
        ..Default::default()
    };
    manager.add_task(te);
    manager.send_work().await;

    // The worker enqueued a Completed-targeted copy; its next tick stops it.
    {
        let mut w = worker.lock().await;
        assert_eq!(w.queue.len(), 1);
        w.run_next_task().await.unwrap();
        let stopped = w.db.get(&running.id.to_string()).unwrap().unwrap();
        assert_eq!(stopped.state, State::Completed);
        assert!(stopped.finish_time.is_some());
    }
    assert_eq!(
        runtime.stopped.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn oversized_task_is_dropped_without_contacting_workers() {
    let runtime = Arc::new(FakeRuntime::default());
    let (worker, addr) = spawn_worker(runtime).await;
    // E-PVM filters on free disk; the default node records declare zero.
    let mut manager =
        Manager::new(&[addr.clone()], SchedulerKind::Epvm, StoreKind::Memory).unwrap();

    let te = submission(Task {
        disk: 1_000_000_000_000_000,
        ..Default::default()
    });
    let task_id = te.task.id;
    manager.add_task(te);
    manager.send_work().await;

    assert!(manager.pending.is_empty());
    assert!(manager.task_worker_map.is_empty());
    assert!(manager
        .task_db
        .get(&task_id.to_string())
        .unwrap()
        .is_none());
    assert!(worker.lock().await.queue.is_empty());
}

#[tokio::test]
async fn unreachable_worker_requeues_the_event_for_the_next_tick() {
    let mut manager = Manager::new(
        &["127.0.0.1:1".to_string()],
        SchedulerKind::RoundRobin,
        StoreKind::Memory,
    )
    .unwrap();

    let te = submission(Task::default());
    let task_id = te.task.id;
    manager.add_task(te);
    manager.send_work().await;

    // The POST failed, so the assignment was rolled back and the event
    // requeued; the next tick will try placement again.
    assert_eq!(manager.pending.len(), 1);
    assert!(manager.task_worker_map.get(&task_id).is_none());
    assert!(manager.worker_task_map["127.0.0.1:1"].is_empty());
}

#[tokio::test]
async fn worker_observed_failure_is_merged_then_restarted() {
    let runtime = Arc::new(FakeRuntime::default());
    let (worker, addr) = spawn_worker(runtime.clone()).await;
    let mut manager = Manager::new(
        &[addr.clone()],
        SchedulerKind::RoundRobin,
        StoreKind::Memory,
    )
    .unwrap();

    let te = submission(Task {
        name: "flaky".to_string(),
        ..Default::default()
    });
    let task_id = te.task.id;
    manager.add_task(te);
    manager.send_work().await;
    worker.lock().await.run_next_task().await.unwrap();
    manager.update_tasks().await;

    // The container dies behind the worker's back; inspect finds nothing and
    // the worker reconciles the task to Failed.
    worker.lock().await.update_tasks().await;
    manager.update_tasks().await;
    let failed = manager.task_db.get(&task_id.to_string()).unwrap().unwrap();
    assert_eq!(failed.state, State::Failed);

    // Health check restarts it: Scheduled with a bumped restart count, and
    // the worker has a fresh start request queued.
    manager.do_health_checks().await;
    let restarted = manager.task_db.get(&task_id.to_string()).unwrap().unwrap();
    assert_eq!(restarted.state, State::Scheduled);
    assert_eq!(restarted.restart_count, 1);
    assert_eq!(worker.lock().await.queue.len(), 1);
}
