//! Command-line surface: `archon manager`, `archon worker`, and the
//! `node`/`status` listing commands that talk to a running manager.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tabled::{Table, Tabled};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::manager::{self, Manager};
use crate::node::Node;
use crate::scheduler::SchedulerKind;
use crate::store::StoreKind;
use crate::task::{DockerApi, Task};
use crate::worker::{self, Worker};

#[derive(Debug, Parser)]
#[command(name = "archon", version, about = "A small container orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the manager: accept tasks, schedule them onto workers, poll for
    /// updates, and restart what fails.
    Manager(ManagerArgs),
    /// Run a worker agent: accept tasks from the manager and drive their
    /// containers on this host.
    Worker(WorkerArgs),
    /// List the worker nodes known to the manager.
    Node(ClientArgs),
    /// List tasks and their states.
    Status(ClientArgs),
}

#[derive(Debug, Args)]
struct ManagerArgs {
    /// Hostname or IP address to listen on.
    #[arg(short = 'H', long, env = "ARCHON_MHOST", default_value = "0.0.0.0")]
    host: String,
    /// Port on which to listen.
    #[arg(short, long, env = "ARCHON_MPORT", default_value_t = 5555)]
    port: u16,
    /// Workers on which the manager will schedule tasks.
    #[arg(short, long, value_delimiter = ',', default_value = "localhost:5556")]
    workers: Vec<String>,
    /// Name of the scheduler to use.
    #[arg(short, long, value_enum, default_value = "epvm")]
    scheduler: SchedulerKind,
    /// Datastore to use for events and tasks.
    #[arg(short = 'd', long = "dbType", value_enum, default_value = "memory")]
    db_type: StoreKind,
}

#[derive(Debug, Args)]
struct WorkerArgs {
    /// Hostname or IP address to listen on.
    #[arg(short = 'H', long, env = "ARCHON_WHOST", default_value = "0.0.0.0")]
    host: String,
    /// Port on which to listen.
    #[arg(short, long, env = "ARCHON_WPORT", default_value_t = 5556)]
    port: u16,
    /// Name of this worker.
    #[arg(short, long, default_value_t = default_worker_name())]
    name: String,
    /// Datastore to use for tasks.
    #[arg(short = 'd', long = "dbType", value_enum, default_value = "memory")]
    db_type: StoreKind,
}

#[derive(Debug, Args)]
struct ClientArgs {
    /// Manager to talk to.
    #[arg(short, long, default_value = "localhost:5555")]
    manager: String,
}

fn default_worker_name() -> String {
    format!("worker-{}", Uuid::new_v4())
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Manager(args) => run_manager(args).await,
            Command::Worker(args) => run_worker(args).await,
            Command::Node(args) => run_node(args).await,
            Command::Status(args) => run_status(args).await,
        }
    }
}

async fn run_manager(args: ManagerArgs) -> anyhow::Result<()> {
    info!(scheduler = ?args.scheduler, workers = ?args.workers, "starting manager");
    let m = Manager::new(&args.workers, args.scheduler, args.db_type)
        .context("unable to create manager")?;
    let m = Arc::new(Mutex::new(m));

    tokio::spawn(manager::process_tasks(m.clone()));
    tokio::spawn(manager::update_tasks(m.clone()));
    tokio::spawn(manager::do_health_checks(m.clone()));
    tokio::spawn(manager::update_node_stats(m.clone()));

    let api = manager::api::Api {
        address: args.host,
        port: args.port,
        manager: m,
    };
    api.start().await.context("manager API failed")?;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> anyhow::Result<()> {
    info!(name = %args.name, "starting worker");
    let runtime = Arc::new(DockerApi::new().context("unable to connect to the docker daemon")?);
    let w = Worker::new(&args.name, args.db_type, runtime).context("unable to create worker")?;
    let w = Arc::new(Mutex::new(w));

    tokio::spawn(worker::run_tasks(w.clone()));
    tokio::spawn(worker::update_tasks(w.clone()));
    tokio::spawn(worker::collect_stats(w.clone()));

    let api = worker::api::Api {
        address: args.host,
        port: args.port,
        worker: w,
    };
    api.start().await.context("worker API failed")?;
    Ok(())
}

#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "MEMORY (MiB)")]
    memory: u64,
    #[tabled(rename = "DISK (GiB)")]
    disk: u64,
    #[tabled(rename = "ROLE")]
    role: String,
    #[tabled(rename = "TASKS")]
    tasks: u64,
}

async fn run_node(args: ClientArgs) -> anyhow::Result<()> {
    let url = format!("http://{}/nodes", args.manager);
    let nodes: Vec<Node> = reqwest::get(&url)
        .await
        .with_context(|| format!("error connecting to manager at {}", args.manager))?
        .json()
        .await
        .context("error decoding node list")?;

    let rows: Vec<NodeRow> = nodes
        .into_iter()
        .map(|n| NodeRow {
            name: n.name,
            memory: n.memory / 1000,
            disk: n.disk / 1_000_000_000,
            role: n.role,
            tasks: n.task_count,
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}

#[derive(Tabled)]
struct TaskRow {
    #[tabled(rename = "ID")]
    id: Uuid,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "CREATED")]
    created: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "CONTAINERNAME")]
    container_name: String,
    #[tabled(rename = "IMAGE")]
    image: String,
}

async fn run_status(args: ClientArgs) -> anyhow::Result<()> {
    let url = format!("http://{}/tasks", args.manager);
    let tasks: Vec<Task> = reqwest::get(&url)
        .await
        .with_context(|| format!("error connecting to manager at {}", args.manager))?
        .json()
        .await
        .context("error decoding task list")?;

    let rows: Vec<TaskRow> = tasks
        .into_iter()
        .map(|t| TaskRow {
            id: t.id,
            name: t.name.clone(),
            created: humanized_age(t.start_time),
            state: t.state.to_string(),
            container_name: t.name,
            image: t.image,
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}

/// "5 minutes ago"-style age of a start timestamp.
fn humanized_age(start: Option<DateTime<Utc>>) -> String {
    let Some(start) = start else {
        return "Less than a second ago".to_string();
    };
    let secs = (Utc::now() - start).num_seconds().max(0);
    let text = match secs {
        0 => return "Less than a second ago".to_string(),
        1 => "1 second".to_string(),
        s if s < 60 => format!("{s} seconds"),
        s if s < 120 => "About a minute".to_string(),
        s if s < 3_600 => format!("{} minutes", s / 60),
        s if s < 7_200 => "About an hour".to_string(),
        s if s < 172_800 => format!("{} hours", s / 3_600),
        s => format!("{} days", s / 86_400),
    };
    format!("{text} ago")
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn humanized_age_buckets() {
        assert_eq!(humanized_age(None), "Less than a second ago");
        let now = Utc::now();
        assert_eq!(
            humanized_age(Some(now - Duration::seconds(30))),
            "30 seconds ago"
        );
        assert_eq!(
            humanized_age(Some(now - Duration::seconds(90))),
            "About a minute ago"
        );
        assert_eq!(
            humanized_age(Some(now - Duration::minutes(30))),
            "30 minutes ago"
        );
        assert_eq!(
            humanized_age(Some(now - Duration::hours(5))),
            "5 hours ago"
        );
    }

    #[test]
    fn future_start_times_read_as_just_started() {
        let later = Utc::now() + Duration::minutes(5);
        assert_eq!(humanized_age(Some(later)), "Less than a second ago");
    }
}
