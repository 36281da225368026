//! Debian package update procedure.
//!
//! Packages come from the release registry through [`PackageFetcher`],
//! services are driven with `systemctl`, the package is installed with
//! `dpkg -i`, and the installed version is read with `dpkg-query`.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use fleetup_core::config::WorkerConfig;
use fleetup_core::BoxFuture;
use fleetup_release::PackageFetcher;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{StepError, StepResult};
use crate::health::{wait_healthy, ProbeResult};
use crate::procedure::UpdateProcedure;

const PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Programs invoked by [`DebProcedure`], each as a program plus leading
/// arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commands {
    pub systemctl: Vec<String>,
    pub dpkg: Vec<String>,
    pub dpkg_query: Vec<String>,
}

impl Default for Commands {
    fn default() -> Self {
        Self {
            systemctl: vec!["systemctl".into()],
            dpkg: vec!["dpkg".into()],
            dpkg_query: vec!["dpkg-query".into()],
        }
    }
}

pub struct DebProcedure {
    fetcher: PackageFetcher,
    package: String,
    services: Vec<String>,
    health_url: Option<String>,
    probe_timeout: Duration,
    commands: Commands,
}

impl DebProcedure {
    pub fn new(fetcher: PackageFetcher, package: &str, config: &WorkerConfig) -> Self {
        Self {
            fetcher,
            package: package.to_string(),
            services: config.services.clone(),
            health_url: config.health_url.clone(),
            probe_timeout: config.probe_timeout,
            commands: Commands::default(),
        }
    }

    pub fn with_commands(mut self, commands: Commands) -> Self {
        self.commands = commands;
        self
    }

    async fn query_version(&self) -> StepResult<Option<String>> {
        let format = "-f=${Version}";
        let output = run(&self.commands.dpkg_query, &["-W", format, &self.package]).await?;
        // dpkg-query exits 1 for unknown packages.
        if output.status.code() == Some(1) {
            return Ok(None);
        }
        let stdout = checked("dpkg-query", output, StepError::Transient)?;
        Ok(Some(stdout).filter(|v| !v.is_empty()))
    }

    async fn systemctl(&self, action: &str) -> StepResult<()> {
        if self.services.is_empty() {
            return Ok(());
        }
        let mut args = vec![action];
        args.extend(self.services.iter().map(String::as_str));
        let output = run(&self.commands.systemctl, &args).await?;
        checked("systemctl", output, StepError::Transient)?;
        info!(action, services = ?self.services, "services changed");
        Ok(())
    }

    async fn dpkg_install(&self, package: &Path) -> StepResult<()> {
        let path = package.to_string_lossy();
        let output = run(&self.commands.dpkg, &["-i", &path]).await?;
        checked("dpkg -i", output, StepError::Fatal)?;
        info!(package = %package.display(), "package installed");
        Ok(())
    }

    async fn health(&self) -> StepResult<()> {
        let Some(url) = &self.health_url else {
            debug!("no health url configured, skipping probe");
            return Ok(());
        };
        match wait_healthy(url, self.probe_timeout, PROBE_INTERVAL).await {
            ProbeResult::Healthy => Ok(()),
            ProbeResult::Unhealthy(status) => Err(StepError::Transient(format!(
                "health check {url} returned HTTP {status}"
            ))),
            ProbeResult::Failed(reason) => Err(StepError::Transient(format!(
                "health check {url} failed: {reason}"
            ))),
        }
    }
}

impl UpdateProcedure for DebProcedure {
    fn installed_version(&self) -> BoxFuture<'_, StepResult<Option<String>>> {
        Box::pin(self.query_version())
    }

    fn fetch<'a>(&'a self, version: &'a str) -> BoxFuture<'a, StepResult<PathBuf>> {
        Box::pin(async move {
            let downloaded = self.fetcher.fetch(version).await?;
            Ok(downloaded.path)
        })
    }

    fn stop_services(&self) -> BoxFuture<'_, StepResult<()>> {
        Box::pin(self.systemctl("stop"))
    }

    fn install<'a>(&'a self, package: &'a Path) -> BoxFuture<'a, StepResult<()>> {
        Box::pin(self.dpkg_install(package))
    }

    fn start_services(&self) -> BoxFuture<'_, StepResult<()>> {
        Box::pin(self.systemctl("start"))
    }

    fn probe(&self) -> BoxFuture<'_, StepResult<()>> {
        Box::pin(self.health())
    }
}

/// Run `argv` followed by `args`. Failing to spawn is fatal.
async fn run(argv: &[String], args: &[&str]) -> StepResult<Output> {
    let Some((program, leading)) = argv.split_first() else {
        return Err(StepError::Fatal("empty command line".into()));
    };
    debug!(program, ?args, "running command");
    Command::new(program)
        .args(leading)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| StepError::Fatal(format!("failed to run {program}: {e}")))
}

/// Stdout of a successful command; otherwise `error` with exit code and stderr.
fn checked(what: &str, output: Output, error: fn(String) -> StepError) -> StepResult<String> {
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(error(format!(
        "{what} exited with {}: {}",
        output.status,
        stderr.trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetup_core::config::ReleaseConfig;
    use fleetup_release::{Release, ReleaseResult, ReleaseSource};
    use std::sync::Arc;

    struct NoReleases;

    impl ReleaseSource for NoReleases {
        fn list_releases(&self) -> BoxFuture<'_, ReleaseResult<Vec<Release>>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    fn sh(script: &str) -> Vec<String> {
        // Extra arguments land in $0.. and are ignored by the script.
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn procedure(commands: Commands, services: &[&str]) -> DebProcedure {
        let dir = std::env::temp_dir();
        let http = fleetup_release::http_client(None, Duration::from_secs(5)).unwrap();
        let config = ReleaseConfig {
            package: "boot".into(),
            ..ReleaseConfig::default()
        };
        let fetcher =
            PackageFetcher::new(Arc::new(NoReleases), http, config, &dir, Duration::from_secs(5));
        let worker = WorkerConfig {
            services: services.iter().map(|s| s.to_string()).collect(),
            ..WorkerConfig::default()
        };
        DebProcedure::new(fetcher, "boot", &worker).with_commands(commands)
    }

    #[tokio::test]
    async fn reads_installed_version() {
        let commands = Commands {
            dpkg_query: sh("echo 2.0.0"),
            ..Commands::default()
        };
        let version = procedure(commands, &[]).installed_version().await.unwrap();
        assert_eq!(version.as_deref(), Some("2.0.0"));
    }

    #[tokio::test]
    async fn unknown_package_is_not_installed() {
        let commands = Commands {
            dpkg_query: sh("echo 'no packages found' >&2; exit 1"),
            ..Commands::default()
        };
        assert_eq!(procedure(commands, &[]).installed_version().await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_install_is_fatal_with_stderr() {
        let commands = Commands {
            dpkg: sh("echo 'dpkg: error: disk full' >&2; exit 2"),
            ..Commands::default()
        };
        let err = procedure(commands, &[])
            .install(Path::new("/tmp/boot.deb"))
            .await
            .unwrap_err();
        match err {
            StepError::Fatal(message) => assert!(message.contains("disk full"), "{message}"),
            other => panic!("expected fatal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn systemctl_failure_is_transient() {
        let commands = Commands {
            systemctl: sh("exit 1"),
            ..Commands::default()
        };
        let err = procedure(commands, &["etcd"]).stop_services().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn no_services_means_nothing_to_run() {
        let commands = Commands {
            systemctl: vec!["/nonexistent/systemctl".into()],
            ..Commands::default()
        };
        let procedure = procedure(commands, &[]);
        procedure.stop_services().await.unwrap();
        procedure.start_services().await.unwrap();
    }

    #[tokio::test]
    async fn missing_program_is_fatal() {
        let commands = Commands {
            systemctl: vec!["/nonexistent/systemctl".into()],
            ..Commands::default()
        };
        let err = procedure(commands, &["etcd"]).start_services().await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn probe_without_url_passes() {
        procedure(Commands::default(), &[]).probe().await.unwrap();
    }

    #[tokio::test]
    async fn fetch_of_unpublished_version_is_fatal() {
        let err = procedure(Commands::default(), &[]).fetch("9.9.9").await.unwrap_err();
        assert!(!err.is_transient());
    }
}
