use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Role recorded in `cluster_nodes.role`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    Follower,
    GatewayLeader,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follower => "follower",
            Self::GatewayLeader => "gateway-leader",
        }
    }
}

impl Default for NodeRole {
    fn default() -> Self {
        Self::Follower
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim() {
            "follower" => Ok(Self::Follower),
            "gateway-leader" => Ok(Self::GatewayLeader),
            other => Err(format!("unknown node role '{other}'")),
        }
    }
}

/// Row of the `cluster_nodes` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub node_id: String,
    pub last_heartbeat_at: DateTime<Utc>,
    pub role: NodeRole,
}

/// All membership rows together with the database time they were read at.
#[derive(Debug, Clone)]
pub struct ClusterView {
    pub observed_at: DateTime<Utc>,
    pub nodes: Vec<ClusterNode>,
}

/// A membership row with its liveness judged at the observation time.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node: ClusterNode,
    pub alive: bool,
    pub heartbeat_age_ms: i64,
}
