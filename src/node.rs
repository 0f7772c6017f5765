//! The manager's record of one worker machine: identity, declared capacity,
//! what has been allocated onto it, and the stats it last reported.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stats::Stats;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("error connecting to {api}: {source}")]
    Unreachable {
        api: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{api}/stats returned status {status}")]
    BadStatus { api: String, status: u16 },
    #[error("error decoding stats from {api}: {source}")]
    Decode {
        api: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("worker at {api} has not collected stats yet")]
    StatsUnavailable { api: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    /// host:port of the worker; the join key across the manager's maps.
    pub name: String,
    /// Base URL of the worker's API.
    pub api: String,
    pub cores: u64,
    /// KiB.
    pub memory: u64,
    /// KiB, summed over tasks placed here.
    pub memory_allocated: u64,
    /// Bytes.
    pub disk: u64,
    /// Bytes, summed over tasks placed here.
    pub disk_allocated: u64,
    pub role: String,
    pub task_count: u64,
    pub stats: Stats,
}

impl Node {
    pub fn new(name: &str, api: &str, role: &str) -> Node {
        Node {
            name: name.to_string(),
            api: api.to_string(),
            role: role.to_string(),
            ..Default::default()
        }
    }

    /// Poll the worker's stats endpoint and refresh this record's capacity
    /// and last-observed stats.
    pub async fn get_stats(&mut self, client: &reqwest::Client) -> Result<Stats, NodeError> {
        let stats = fetch_stats(client, &self.api).await?;
        self.memory = stats.mem_total_kb();
        self.disk = stats.disk_total();
        self.stats = stats.clone();
        Ok(stats)
    }
}

/// GET `{api}/stats`. A worker that has not finished its first stats sample
/// serves `null`, which is reported as [`NodeError::StatsUnavailable`].
pub async fn fetch_stats(client: &reqwest::Client, api: &str) -> Result<Stats, NodeError> {
    let url = format!("{api}/stats");
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|source| NodeError::Unreachable {
            api: api.to_string(),
            source,
        })?;
    if !resp.status().is_success() {
        return Err(NodeError::BadStatus {
            api: api.to_string(),
            status: resp.status().as_u16(),
        });
    }
    let stats: Option<Stats> = resp.json().await.map_err(|source| NodeError::Decode {
        api: api.to_string(),
        source,
    })?;
    stats.ok_or_else(|| NodeError::StatsUnavailable {
        api: api.to_string(),
    })
}
