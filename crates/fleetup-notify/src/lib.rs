//! fleetup-notify: tell operators about rollout transitions.
//!
//! The updater reports three transitions: a rollout was proposed, it
//! succeeded, or it failed. Delivery is best effort; a failed webhook is
//! logged and never affects the rollout.

pub mod notification;
pub mod sink;

pub use notification::{Category, Field, Notification};
pub use sink::{
    from_config, NoopNotifier, NotificationSink, NotifyError, NotifyResult, WebhookNotifier,
};
