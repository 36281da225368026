//! Domain types persisted in the shared store.
//!
//! All records are JSON-serialized into store values. Only the elected
//! updater writes the [`UpdateRequest`]; each worker writes its own
//! [`NodeStatus`] and [`NodeRegistration`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of a boot server taking part in rollouts.
pub type NodeId = String;

// ── Update request ────────────────────────────────────────────────

/// The single in-flight fleet-wide rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateRequest {
    /// Target package version.
    pub version: String,
    /// Nodes in rollout order. Never reordered after creation.
    pub nodes: Vec<NodeId>,
    /// Unix timestamp (seconds) when the request was created.
    pub started_at: u64,
    #[serde(default)]
    pub state: RequestState,
}

/// Whether a rollout is still progressing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestState {
    #[default]
    Running,
    /// Terminal until an operator clears the request.
    Failed {
        node: Option<NodeId>,
        reason: String,
    },
}

impl UpdateRequest {
    pub fn new(version: &str, nodes: Vec<NodeId>, started_at: u64) -> Self {
        Self {
            version: version.to_string(),
            nodes,
            started_at,
            state: RequestState::Running,
        }
    }

    /// Position of `node` in the rollout order.
    pub fn position(&self, node: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n == node)
    }

    pub fn contains(&self, node: &str) -> bool {
        self.position(node).is_some()
    }

    /// Nodes that must succeed before `node` may start.
    pub fn predecessors(&self, node: &str) -> &[NodeId] {
        match self.position(node) {
            Some(idx) => &self.nodes[..idx],
            None => &[],
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, RequestState::Failed { .. })
    }

    /// Copy of this request moved into the failed state.
    pub fn failed(&self, node: Option<&str>, reason: &str) -> Self {
        Self {
            state: RequestState::Failed {
                node: node.map(str::to_string),
                reason: reason.to_string(),
            },
            ..self.clone()
        }
    }
}

// ── Node status ───────────────────────────────────────────────────

/// Progress of one node for one target version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeStatus {
    pub node: NodeId,
    /// Version this status refers to. A status for another version is stale.
    pub version: String,
    pub step: NodeStep,
    /// Unix timestamp of the last change.
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Step of a node inside a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStep {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl NodeStep {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStep::Succeeded | NodeStep::Failed)
    }
}

impl fmt::Display for NodeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStep::Pending => "pending",
            NodeStep::Running => "running",
            NodeStep::Succeeded => "succeeded",
            NodeStep::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl NodeStatus {
    pub fn new(node: &str, version: &str, step: NodeStep, updated_at: u64) -> Self {
        Self {
            node: node.to_string(),
            version: version.to_string(),
            step,
            updated_at,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

// ── Leadership and membership ─────────────────────────────────────

/// Identity of the current updater leader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderRecord {
    pub holder: String,
    pub lease: i64,
    pub acquired_at: u64,
}

/// Written by each worker at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRegistration {
    pub node: NodeId,
    pub registered_at: u64,
}

// ── Release channel ───────────────────────────────────────────────

/// Which published version counts as "latest".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseChannel {
    /// Latest published release, pre-releases included.
    Staging,
    /// Latest full release only.
    #[default]
    Production,
}

impl ReleaseChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseChannel::Staging => "staging",
            ReleaseChannel::Production => "production",
        }
    }
}

impl fmt::Display for ReleaseChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReleaseChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staging" => Ok(ReleaseChannel::Staging),
            "production" => Ok(ReleaseChannel::Production),
            other => Err(format!("unknown release channel: {other}")),
        }
    }
}

/// True if `next` is an older semver version than `current`.
///
/// Versions that do not parse as semver are never considered downgrades.
pub fn is_downgrade(current: &str, next: &str) -> bool {
    let parse = |s: &str| semver::Version::parse(s.trim_start_matches('v')).ok();
    match (parse(current), parse(next)) {
        (Some(cur), Some(nxt)) => nxt < cur,
        _ => false,
    }
}
