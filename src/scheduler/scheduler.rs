use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::node::{self, Node, NodeError};
use crate::task::Task;

use super::types::{Scheduler, SchedulerKind};

/// The Lieb square-ice constant, the base of the marginal-cost curve.
pub const LIEB: f64 = 1.53960071783900203869;

/// Scoring parameter only; placement past this many tasks is allowed, just
/// increasingly expensive.
const MAX_JOBS: f64 = 4.0;

/// Interval between the two CPU samples a score takes.
const CPU_SAMPLE_GAP: Duration = Duration::from_secs(3);

pub fn new_scheduler(kind: SchedulerKind) -> Box<dyn Scheduler + Send> {
    match kind {
        SchedulerKind::RoundRobin => Box::new(RoundRobin::new()),
        SchedulerKind::Epvm => Box::new(Epvm::new()),
    }
}

/// Rotate through the node list, one placement at a time.
pub struct RoundRobin {
    pub name: String,
    pub last_worker: usize,
}

impl RoundRobin {
    pub fn new() -> RoundRobin {
        RoundRobin {
            name: "roundrobin".to_string(),
            last_worker: 0,
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        RoundRobin::new()
    }
}

#[async_trait]
impl Scheduler for RoundRobin {
    fn select_candidate_nodes(&self, _task: &Task, nodes: &[Node]) -> Vec<Node> {
        nodes.to_vec()
    }

    async fn score(&mut self, _task: &Task, nodes: &[Node]) -> HashMap<String, f64> {
        let new_worker = if self.last_worker + 1 < nodes.len() {
            self.last_worker += 1;
            self.last_worker
        } else {
            self.last_worker = 0;
            0
        };

        let mut scores = HashMap::new();
        for (idx, node) in nodes.iter().enumerate() {
            let score = if idx == new_worker { 0.1 } else { 1.0 };
            scores.insert(node.name.clone(), score);
        }
        scores
    }

    fn pick(&self, scores: &HashMap<String, f64>, candidates: &[Node]) -> Option<Node> {
        lowest_cost_node(scores, candidates)
    }
}

/// The E-PVM marginal-cost policy: cost each node by how much adding the task
/// would raise its memory fill and job count along a convex curve, so loaded
/// nodes get penalised super-linearly.
pub struct Epvm {
    pub name: String,
    client: reqwest::Client,
}

impl Epvm {
    pub fn new() -> Epvm {
        Epvm {
            name: "epvm".to_string(),
            client: reqwest::Client::new(),
        }
    }
}

impl Default for Epvm {
    fn default() -> Self {
        Epvm::new()
    }
}

#[async_trait]
impl Scheduler for Epvm {
    /// A node is feasible when the task's disk request fits in what is left
    /// after existing allocations.
    fn select_candidate_nodes(&self, task: &Task, nodes: &[Node]) -> Vec<Node> {
        nodes
            .iter()
            .filter(|n| task.disk <= n.disk.saturating_sub(n.disk_allocated) as i64)
            .cloned()
            .collect()
    }

    async fn score(&mut self, task: &Task, nodes: &[Node]) -> HashMap<String, f64> {
        let mut scores = HashMap::new();
        for node in nodes {
            let cpu_usage = match calculate_cpu_usage(&self.client, node).await {
                Ok(usage) => usage,
                Err(e) => {
                    warn!(node = %node.name, error = %e, "error sampling cpu usage, skipping node");
                    continue;
                }
            };
            scores.insert(node.name.clone(), score_node(task, node, cpu_usage));
        }
        scores
    }

    fn pick(&self, scores: &HashMap<String, f64>, candidates: &[Node]) -> Option<Node> {
        lowest_cost_node(scores, candidates)
    }
}

/// Marginal cost of placing `task` on `node`, given a fresh CPU usage sample.
fn score_node(task: &Task, node: &Node, cpu_usage: f64) -> f64 {
    let cpu_load = cpu_usage / 2f64.powf(0.8);

    let memory_allocated = node.stats.mem_used_kb() as f64 + node.memory_allocated as f64;
    let memory_percent = memory_allocated / node.memory as f64;
    let new_memory_percent = (memory_allocated + (task.memory / 1000) as f64) / node.memory as f64;

    let tc = node.task_count as f64;
    let mem_cost = LIEB.powf(new_memory_percent) + LIEB.powf((tc + 1.0) / MAX_JOBS)
        - LIEB.powf(memory_percent)
        - LIEB.powf(tc / MAX_JOBS);
    // The cpu_load terms cancel as written; kept in the same shape as mem_cost.
    let cpu_cost = LIEB.powf(cpu_load) + LIEB.powf((tc + 1.0) / MAX_JOBS)
        - LIEB.powf(cpu_load)
        - LIEB.powf(tc / MAX_JOBS);

    mem_cost + cpu_cost
}

/// Fraction of CPU time the node spent non-idle across two samples taken
/// [`CPU_SAMPLE_GAP`] apart.
async fn calculate_cpu_usage(client: &reqwest::Client, node: &Node) -> Result<f64, NodeError> {
    let first = node::fetch_stats(client, &node.api).await?;
    tokio::time::sleep(CPU_SAMPLE_GAP).await;
    let second = node::fetch_stats(client, &node.api).await?;

    let idle_before = first.cpu_idle();
    let idle_after = second.cpu_idle();
    let total_before = idle_before + first.cpu_busy();
    let total_after = idle_after + second.cpu_busy();

    let total = total_after.saturating_sub(total_before);
    let idle = idle_after.saturating_sub(idle_before);

    if total == 0 {
        return Ok(0.0);
    }
    Ok(total.saturating_sub(idle) as f64 / total as f64)
}

/// Arg-min over the candidates, seeded from the first scored candidate. Nodes
/// that were skipped during scoring carry no score and are never picked.
fn lowest_cost_node(scores: &HashMap<String, f64>, candidates: &[Node]) -> Option<Node> {
    let mut best: Option<(&Node, f64)> = None;
    for node in candidates {
        let Some(&score) = scores.get(&node.name) else {
            continue;
        };
        match best {
            Some((_, lowest)) if score >= lowest => {}
            _ => best = Some((node, score)),
        }
    }
    best.map(|(node, _)| node.clone())
}
