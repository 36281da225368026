//! fleetup-worker: the per-node side of fleetup rollouts.
//!
//! A [`NodeAgent`] runs on every boot server. When the node's turn comes
//! it drives an [`UpdateProcedure`] (in production the [`DebProcedure`]:
//! download, stop services, `dpkg -i`, start services, health probe) and
//! reports the result as the node's status.

pub mod agent;
pub mod deb;
pub mod error;
pub mod health;
pub mod procedure;

pub use agent::{AgentOptions, NodeAgent, Outcome};
pub use deb::{Commands, DebProcedure};
pub use error::{AgentError, AgentResult, StepError, StepResult};
pub use health::{http_probe, wait_healthy, ProbeResult};
pub use procedure::UpdateProcedure;
