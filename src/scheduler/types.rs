use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::node::Node;
use crate::task::Task;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no available candidates match resource request for task {0}")]
    NoCandidates(Uuid),
    #[error("no scoreable node for task {0}")]
    NoViableNode(Uuid),
}

/// Which placement policy the manager runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SchedulerKind {
    #[value(name = "roundrobin")]
    RoundRobin,
    Epvm,
}

/// A placement policy: filter the nodes a task could run on, cost each
/// candidate (lower is better), and pick the cheapest.
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn select_candidate_nodes(&self, task: &Task, nodes: &[Node]) -> Vec<Node>;
    async fn score(&mut self, task: &Task, nodes: &[Node]) -> HashMap<String, f64>;
    fn pick(&self, scores: &HashMap<String, f64>, candidates: &[Node]) -> Option<Node>;
}
