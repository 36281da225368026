//! End-to-end rollout scenarios.
//!
//! Updaters and node agents run in-process against one embedded store,
//! with fake hosts standing in for dpkg/systemd and a recording sink
//! instead of the webhook.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetup_core::{
    BoxFuture, KeySpace, NodeStep, ReleaseChannel, RequestState, RetryPolicy, UpdateRequest,
};
use fleetup_notify::NotificationSink;
use fleetup_release::{Release, ReleaseResult, ReleaseSource, ReleaseWatcher};
use fleetup_store::{EmbeddedStore, SharedStore, Snapshot, Storage};
use fleetup_updater::{Updater, UpdaterOptions};
use fleetup_worker::{AgentOptions, NodeAgent, StepError, UpdateProcedure};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(10);

// ── Fakes ─────────────────────────────────────────────────────────

struct Registry(Vec<Release>);

impl Registry {
    fn with(version: &str) -> Arc<Self> {
        Arc::new(Self(vec![Release {
            tag_name: format!("v{version}"),
            draft: false,
            prerelease: false,
            published_at: Some("2024-05-01T00:00:00Z".into()),
            assets: Vec::new(),
        }]))
    }
}

impl ReleaseSource for Registry {
    fn list_releases(&self) -> BoxFuture<'_, ReleaseResult<Vec<Release>>> {
        let releases = self.0.clone();
        Box::pin(async move { Ok(releases) })
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<(&'static str, String)>>);

impl Recorder {
    fn of(&self, kind: &str) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl NotificationSink for Recorder {
    fn notify_info<'a>(&'a self, _: &'a UpdateRequest, message: &'a str) -> BoxFuture<'a, ()> {
        self.0.lock().unwrap().push(("info", message.to_string()));
        Box::pin(async {})
    }

    fn notify_succeeded<'a>(&'a self, request: &'a UpdateRequest) -> BoxFuture<'a, ()> {
        self.0.lock().unwrap().push(("succeeded", request.version.clone()));
        Box::pin(async {})
    }

    fn notify_failure<'a>(&'a self, _: &'a UpdateRequest, message: &'a str) -> BoxFuture<'a, ()> {
        self.0.lock().unwrap().push(("failure", message.to_string()));
        Box::pin(async {})
    }
}

/// Shared journal of what every fake host did.
#[derive(Default)]
struct Journal {
    installs: Mutex<Vec<String>>,
    /// Nodes that started while a predecessor had not succeeded.
    violations: Mutex<Vec<String>>,
}

struct FakeHost {
    node: String,
    storage: Storage,
    journal: Arc<Journal>,
    installed: Mutex<Option<String>>,
    install_error: Option<String>,
}

impl FakeHost {
    async fn check_turn(&self) {
        let Ok(snapshot) = self.storage.snapshot().await else {
            return;
        };
        let Some((request, _)) = &snapshot.request else {
            return;
        };
        let early = request.predecessors(&self.node).iter().any(|p| {
            snapshot
                .status(p)
                .is_none_or(|s| s.version != request.version || s.step != NodeStep::Succeeded)
        });
        if early {
            self.journal.violations.lock().unwrap().push(self.node.clone());
        }
    }
}

impl UpdateProcedure for FakeHost {
    fn installed_version(&self) -> BoxFuture<'_, Result<Option<String>, StepError>> {
        let installed = self.installed.lock().unwrap().clone();
        Box::pin(async move { Ok(installed) })
    }

    fn fetch<'a>(&'a self, version: &'a str) -> BoxFuture<'a, Result<PathBuf, StepError>> {
        Box::pin(async move { Ok(PathBuf::from(version)) })
    }

    fn stop_services(&self) -> BoxFuture<'_, Result<(), StepError>> {
        Box::pin(async move {
            self.check_turn().await;
            Ok(())
        })
    }

    fn install<'a>(&'a self, package: &'a Path) -> BoxFuture<'a, Result<(), StepError>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(message) = &self.install_error {
                return Err(StepError::Fatal(message.clone()));
            }
            self.journal.installs.lock().unwrap().push(self.node.clone());
            *self.installed.lock().unwrap() = Some(package.display().to_string());
            Ok(())
        })
    }

    fn start_services(&self) -> BoxFuture<'_, Result<(), StepError>> {
        Box::pin(async { Ok(()) })
    }

    fn probe(&self) -> BoxFuture<'_, Result<(), StepError>> {
        Box::pin(async { Ok(()) })
    }
}

// ── Fleet harness ─────────────────────────────────────────────────

struct Fleet {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    storage: Storage,
    registry: Arc<Registry>,
    recorder: Arc<Recorder>,
    journal: Arc<Journal>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Fleet {
    fn new(version: &str) -> Self {
        let store: Arc<dyn SharedStore> = Arc::new(EmbeddedStore::open_in_memory().unwrap());
        let keys = KeySpace::new("/fleet/");
        let (shutdown, _) = watch::channel(false);
        Self {
            storage: Storage::new(store.clone(), keys.clone()),
            store,
            keys,
            registry: Registry::with(version),
            recorder: Arc::new(Recorder::default()),
            journal: Arc::new(Journal::default()),
            shutdown,
            tasks: Vec::new(),
        }
    }

    fn updater(&self, id: &str, nodes: &[&str]) -> Updater {
        let watcher = Arc::new(ReleaseWatcher::new(
            self.registry.clone(),
            ReleaseChannel::Production,
            "v",
            Duration::ZERO,
        ));
        let options = UpdaterOptions {
            id: id.to_string(),
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            lease_ttl: Duration::from_secs(1),
            check_interval: Duration::from_millis(50),
            node_timeout: Duration::from_secs(30),
            transient_deadline: Duration::from_secs(5),
            retry: RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(50), u32::MAX),
        };
        Updater::new(
            self.store.clone(),
            self.keys.clone(),
            watcher,
            self.recorder.clone(),
            options,
        )
    }

    fn spawn_updater(&mut self, id: &str, nodes: &[&str]) {
        let updater = self.updater(id, nodes);
        let rx = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(async move {
            updater.run(rx).await.unwrap();
        }));
    }

    fn spawn_agent(&mut self, node: &str, installed: &str, install_error: Option<&str>) {
        let host = FakeHost {
            node: node.to_string(),
            storage: self.storage.clone(),
            journal: self.journal.clone(),
            installed: Mutex::new(Some(installed.to_string())),
            install_error: install_error.map(str::to_string),
        };
        let options = AgentOptions {
            node: node.to_string(),
            check_interval: Duration::from_millis(50),
            retry: RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 3),
        };
        let agent = NodeAgent::new(self.store.clone(), self.keys.clone(), Arc::new(host), options);
        let rx = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(async move {
            agent.run(rx).await.unwrap();
        }));
    }

    async fn wait_for(&self, what: &str, done: impl Fn(&Snapshot) -> bool) -> Snapshot {
        let deadline = Instant::now() + WAIT;
        loop {
            let snapshot = self.storage.snapshot().await.unwrap();
            if done(&snapshot) {
                return snapshot;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_notified(&self, kind: &str) {
        let deadline = Instant::now() + WAIT;
        while self.recorder.of(kind).is_empty() {
            assert!(Instant::now() < deadline, "no {kind} notification");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn stop(self) {
        self.shutdown.send_replace(true);
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

fn is_failed(snapshot: &Snapshot) -> bool {
    snapshot
        .request
        .as_ref()
        .is_some_and(|(r, _)| r.is_failed())
}

// ── Scenarios ─────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_nodes_succeed_in_order() {
    let mut fleet = Fleet::new("2.0.0");
    for node in ["n1", "n2", "n3"] {
        fleet.spawn_agent(node, "1.0.0", None);
    }
    fleet.spawn_updater("u1", &["n1", "n2", "n3"]);

    let snapshot = fleet
        .wait_for("rollout to retire", |s| s.current.as_deref() == Some("2.0.0"))
        .await;
    assert!(snapshot.request.is_none());
    assert!(snapshot.statuses.is_empty());
    fleet.wait_notified("succeeded").await;

    // Let a few more ticks pass: nothing is proposed or announced again.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fleet.recorder.of("info").len(), 1);
    assert_eq!(fleet.recorder.of("succeeded"), vec!["2.0.0".to_string()]);
    assert!(fleet.recorder.of("failure").is_empty());
    assert_eq!(*fleet.journal.installs.lock().unwrap(), vec!["n1", "n2", "n3"]);
    assert!(fleet.journal.violations.lock().unwrap().is_empty());
    fleet.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failure_halts_the_rollout() {
    let mut fleet = Fleet::new("2.0.0");
    fleet.spawn_agent("n1", "1.0.0", None);
    fleet.spawn_agent("n2", "1.0.0", Some("disk full"));
    fleet.spawn_agent("n3", "1.0.0", None);
    fleet.spawn_updater("u1", &["n1", "n2", "n3"]);

    let snapshot = fleet.wait_for("request to fail", is_failed).await;
    let (request, _) = snapshot.request.as_ref().unwrap();
    match &request.state {
        RequestState::Failed { node, reason } => {
            assert_eq!(node.as_deref(), Some("n2"));
            assert!(reason.contains("disk full"), "{reason}");
        }
        other => panic!("unexpected state {other:?}"),
    }
    fleet.wait_notified("failure").await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let snapshot = fleet.storage.snapshot().await.unwrap();
    assert!(is_failed(&snapshot), "request must stay failed until cleared");
    assert_eq!(snapshot.status("n1").unwrap().step, NodeStep::Succeeded);
    assert_eq!(snapshot.status("n2").unwrap().step, NodeStep::Failed);
    assert!(snapshot.status("n3").is_none(), "n3 must stay pending");
    assert_eq!(snapshot.current, None);

    let failures = fleet.recorder.of("failure");
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("disk full"));
    assert!(fleet.recorder.of("succeeded").is_empty());
    assert_eq!(*fleet.journal.installs.lock().unwrap(), vec!["n1"]);
    fleet.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cleared_failure_is_proposed_again() {
    let mut fleet = Fleet::new("2.0.0");
    fleet.spawn_agent("n1", "1.0.0", Some("dpkg exited with 1"));
    fleet.spawn_updater("u1", &["n1"]);

    fleet.wait_for("request to fail", is_failed).await;
    fleet.wait_notified("failure").await;
    assert!(fleet.storage.clear_request().await.unwrap());

    // The release is still newer than the fleet, so it is proposed again.
    let deadline = Instant::now() + WAIT;
    while fleet.recorder.of("info").len() < 2 {
        assert!(Instant::now() < deadline, "no second proposal");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    fleet.wait_for("a request", |s| s.request.is_some()).await;
    fleet.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_updaters_propose_once() {
    let mut fleet = Fleet::new("2.0.0");
    for id in ["u1", "u2", "u3"] {
        fleet.spawn_updater(id, &["n1", "n2"]);
    }
    let snapshot = fleet
        .wait_for("a request", |s| s.request.is_some())
        .await;
    let leader = snapshot.leader.expect("leader record");
    assert!(["u1", "u2", "u3"].contains(&leader.holder.as_str()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fleet.recorder.of("info").len(), 1);

    for node in ["n1", "n2"] {
        fleet.spawn_agent(node, "1.0.0", None);
    }
    fleet
        .wait_for("rollout to retire", |s| s.current.as_deref() == Some("2.0.0"))
        .await;
    fleet.wait_notified("succeeded").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fleet.recorder.of("succeeded").len(), 1);
    fleet.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn standby_takes_over_mid_rollout() {
    let mut fleet = Fleet::new("2.0.0");
    let (first_tx, first_rx) = watch::channel(false);
    let first = fleet.updater("u1", &["n1", "n2"]);
    let first_task = tokio::spawn(async move { first.run(first_rx).await.unwrap() });

    fleet.wait_for("a request", |s| s.request.is_some()).await;
    fleet.spawn_updater("u2", &["n1", "n2"]);

    // n1 finishes under u1, then u1 goes away.
    fleet.spawn_agent("n1", "1.0.0", None);
    fleet
        .wait_for("n1 to succeed", |s| {
            s.status("n1").is_some_and(|st| st.step == NodeStep::Succeeded)
        })
        .await;
    first_tx.send(true).unwrap();
    first_task.await.unwrap();

    fleet
        .wait_for("u2 to lead", |s| {
            s.leader.as_ref().is_some_and(|l| l.holder == "u2")
        })
        .await;
    fleet.spawn_agent("n2", "1.0.0", None);
    fleet
        .wait_for("rollout to retire", |s| s.current.as_deref() == Some("2.0.0"))
        .await;
    fleet.wait_notified("succeeded").await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fleet.recorder.of("info").len(), 1);
    assert_eq!(fleet.recorder.of("succeeded").len(), 1);
    assert_eq!(*fleet.journal.installs.lock().unwrap(), vec!["n1", "n2"]);
    fleet.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn node_already_on_target_reports_success() {
    let mut fleet = Fleet::new("2.0.0");
    fleet.spawn_agent("n1", "2.0.0", None);
    fleet.spawn_agent("n2", "1.0.0", None);
    fleet.spawn_updater("u1", &["n1", "n2"]);

    fleet
        .wait_for("rollout to retire", |s| s.current.as_deref() == Some("2.0.0"))
        .await;
    assert_eq!(*fleet.journal.installs.lock().unwrap(), vec!["n2"]);
    fleet.stop().await;
}
