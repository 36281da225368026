//! Operator commands: `status` and `clear`.

use std::fmt::Write as _;

use anyhow::Context;
use fleetup_core::{Config, KeySpace, RequestState};
use fleetup_store::{Snapshot, Storage};
use fleetup_updater::{evaluate, phase, Progress};
use serde_json::json;

async fn storage(config: &Config) -> anyhow::Result<Storage> {
    let store = fleetup_store::connect(&config.store)
        .await
        .context("connecting to the shared store")?;
    Ok(Storage::new(store, KeySpace::new(&config.store.prefix)))
}

pub async fn status(config: &Config, as_json: bool) -> anyhow::Result<()> {
    let snapshot = storage(config).await?.snapshot().await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&to_json(&snapshot))?);
    } else {
        print!("{}", render(&snapshot));
    }
    Ok(())
}

pub async fn clear(config: &Config) -> anyhow::Result<()> {
    if storage(config).await?.clear_request().await? {
        println!("update request cleared");
    } else {
        println!("no update request to clear");
    }
    Ok(())
}

fn to_json(snapshot: &Snapshot) -> serde_json::Value {
    let request = snapshot.request.as_ref().map(|(r, _)| r);
    let statuses = match request {
        Some(r) => snapshot.statuses_for(&r.version),
        None => Default::default(),
    };
    let mut nodes: Vec<_> = snapshot.statuses.values().map(|(s, _)| s).collect();
    nodes.sort_by(|a, b| a.node.cmp(&b.node));
    let malformed: serde_json::Map<String, serde_json::Value> = snapshot
        .malformed
        .iter()
        .map(|(node, (error, _))| (node.clone(), json!(error)))
        .collect();
    json!({
        "phase": phase(request, &statuses),
        "current": snapshot.current,
        "leader": snapshot.leader,
        "request": request,
        "statuses": nodes,
        "malformed": malformed,
        "registered": snapshot.nodes,
        "revision": snapshot.revision,
    })
}

fn render(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    let request = snapshot.request.as_ref().map(|(r, _)| r);
    let statuses = match request {
        Some(r) => snapshot.statuses_for(&r.version),
        None => Default::default(),
    };

    let _ = writeln!(out, "phase:    {}", phase(request, &statuses));
    let _ = writeln!(
        out,
        "current:  {}",
        snapshot.current.as_deref().unwrap_or("unknown")
    );
    match &snapshot.leader {
        Some(leader) => {
            let _ = writeln!(out, "leader:   {} (lease {:x})", leader.holder, leader.lease);
        }
        None => {
            let _ = writeln!(out, "leader:   none");
        }
    }

    let Some(request) = request else {
        let _ = writeln!(out, "request:  none");
        return out;
    };
    let _ = writeln!(out, "request:  {} (started {})", request.version, request.started_at);
    if let RequestState::Failed { node, reason } = &request.state {
        let _ = writeln!(
            out,
            "failed:   {} ({})",
            reason,
            node.as_deref().unwrap_or("no node")
        );
    }
    let current = match evaluate(request, &statuses) {
        Ok(Progress::Waiting { node, .. }) => Some(node),
        _ => None,
    };
    for node in &request.nodes {
        let step = match statuses.get(node) {
            Some(s) => s.step.to_string(),
            None if snapshot.malformed.contains_key(node) => "unreadable".to_string(),
            None => "pending".to_string(),
        };
        let marker = if current.as_deref() == Some(node.as_str()) { "*" } else { " " };
        let message = statuses
            .get(node)
            .and_then(|s| s.message.as_deref())
            .map(|m| format!("  {m}"))
            .unwrap_or_default();
        let _ = writeln!(out, "  {marker} {node:<20} {step}{message}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetup_core::{NodeStatus, NodeStep, UpdateRequest};

    fn snapshot() -> Snapshot {
        let request = UpdateRequest::new("2.0.0", vec!["n1".into(), "n2".into(), "n3".into()], 10);
        let mut snap = Snapshot {
            request: Some((request, 5)),
            current: Some("1.0.0".into()),
            nodes: vec!["n1".into(), "n2".into(), "n3".into()],
            revision: 9,
            ..Snapshot::default()
        };
        snap.statuses.insert(
            "n1".into(),
            (NodeStatus::new("n1", "2.0.0", NodeStep::Succeeded, 11), 6),
        );
        snap.statuses.insert(
            "n2".into(),
            (NodeStatus::new("n2", "2.0.0", NodeStep::Running, 12), 7),
        );
        snap
    }

    #[test]
    fn render_marks_current_node() {
        let text = render(&snapshot());
        assert!(text.contains("phase:    in_progress"));
        assert!(text.contains("current:  1.0.0"));
        assert!(text.contains("* n2"));
        assert!(text
            .lines()
            .any(|l| l.trim_start().starts_with("n3") && l.ends_with("pending")));
    }

    #[test]
    fn unreadable_status_is_shown() {
        let mut snap = snapshot();
        snap.malformed.insert("n3".into(), ("bad json".into(), 8));
        let text = render(&snap);
        assert!(text
            .lines()
            .any(|l| l.trim_start().starts_with("n3") && l.ends_with("unreadable")));
        assert_eq!(to_json(&snap)["malformed"]["n3"], "bad json");
    }

    #[test]
    fn render_idle() {
        let text = render(&Snapshot::default());
        assert!(text.contains("phase:    idle"));
        assert!(text.contains("request:  none"));
    }

    #[test]
    fn json_has_request_and_statuses() {
        let value = to_json(&snapshot());
        assert_eq!(value["phase"], "in_progress");
        assert_eq!(value["request"]["version"], "2.0.0");
        assert_eq!(value["statuses"][0]["node"], "n1");
        assert_eq!(value["statuses"][1]["step"], "running");
    }
}
