//! Rollout controller: derives rollout progress from durable state.
//!
//! Everything here is a pure function of the stored request and node
//! statuses, so a freshly elected updater reaches the same decision as
//! the one it replaced.

use std::collections::HashMap;
use std::fmt;

use fleetup_core::{NodeId, NodeStatus, NodeStep, UpdateRequest};
use serde::Serialize;

use crate::error::OrderViolation;

/// Lifecycle phase of the fleet-wide rollout.
///
/// A successful rollout retires its request, so success is only ever
/// observed as the transition back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No request in the store.
    Idle,
    /// Request stored; no node has reported for it yet.
    Proposed,
    InProgress,
    /// Halted until an operator clears the request.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Proposed => "proposed",
            Phase::InProgress => "in_progress",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

pub fn phase(request: Option<&UpdateRequest>, statuses: &HashMap<NodeId, NodeStatus>) -> Phase {
    match request {
        None => Phase::Idle,
        Some(request) if request.is_failed() => Phase::Failed,
        Some(request) => {
            let reported = statuses
                .values()
                .any(|s| s.version == request.version && request.contains(&s.node));
            if reported {
                Phase::InProgress
            } else {
                Phase::Proposed
            }
        }
    }
}

/// Where a running rollout stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// `node` (at `index` in rollout order) is the current node. `step` is
    /// its reported step, `None` before it has reported anything.
    Waiting {
        index: usize,
        node: NodeId,
        step: Option<NodeStep>,
    },
    /// Every listed node succeeded.
    Completed,
    /// The current node reported failure.
    NodeFailed { node: NodeId, message: String },
}

/// Evaluate a running request against node statuses.
///
/// Only statuses for the request's version count. Fails if any node after
/// the first non-succeeded node has left `pending`.
pub fn evaluate(
    request: &UpdateRequest,
    statuses: &HashMap<NodeId, NodeStatus>,
) -> Result<Progress, OrderViolation> {
    let step_of = |node: &str| {
        statuses
            .get(node)
            .filter(|s| s.version == request.version)
            .map(|s| s.step)
    };

    let Some(index) = request
        .nodes
        .iter()
        .position(|node| step_of(node) != Some(NodeStep::Succeeded))
    else {
        return Ok(Progress::Completed);
    };
    let current = &request.nodes[index];

    for later in &request.nodes[index + 1..] {
        match step_of(later) {
            None | Some(NodeStep::Pending) => {}
            Some(step) => {
                return Err(OrderViolation {
                    node: later.clone(),
                    step,
                    blocking: current.clone(),
                });
            }
        }
    }

    let step = step_of(current);
    if step == Some(NodeStep::Failed) {
        let message = statuses
            .get(current)
            .and_then(|s| s.message.clone())
            .unwrap_or_else(|| "no message".to_string());
        return Ok(Progress::NodeFailed {
            node: current.clone(),
            message,
        });
    }
    Ok(Progress::Waiting {
        index,
        node: current.clone(),
        step,
    })
}
