//! The local update procedure a node agent drives.

use std::path::{Path, PathBuf};

use fleetup_core::BoxFuture;

use crate::error::StepResult;

/// Steps of a node update, in the order the agent runs them.
///
/// Every step must be safe to repeat: a crashed agent restarts the
/// procedure from the beginning.
pub trait UpdateProcedure: Send + Sync {
    /// Version currently installed on this host, `None` if not installed.
    fn installed_version(&self) -> BoxFuture<'_, StepResult<Option<String>>>;

    /// Download and verify the package for `version`. Returns its path.
    fn fetch<'a>(&'a self, version: &'a str) -> BoxFuture<'a, StepResult<PathBuf>>;

    fn stop_services(&self) -> BoxFuture<'_, StepResult<()>>;

    fn install<'a>(&'a self, package: &'a Path) -> BoxFuture<'a, StepResult<()>>;

    fn start_services(&self) -> BoxFuture<'_, StepResult<()>>;

    /// Check the restarted services answer.
    fn probe(&self) -> BoxFuture<'_, StepResult<()>>;
}
