//! Seams to external collaborators that the control plane only calls into.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KernelError;
use crate::identity::ManagerId;

/// A message for the notification subsystem.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub manager_id: ManagerId,
    pub kind: String,
    pub subject: String,
    pub body: Value,
}

impl Notification {
    pub fn new(
        manager_id: impl Into<ManagerId>,
        kind: impl Into<String>,
        subject: impl Into<String>,
        body: Value,
    ) -> Self {
        Self {
            manager_id: manager_id.into(),
            kind: kind.into(),
            subject: subject.into(),
            body,
        }
    }
}

/// Notification delivery. Callers dispatch fire-and-forget: a failure is
/// logged by the caller's spawned task and never fails the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), KernelError>;
}

/// Drops every notification.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), KernelError> {
        tracing::debug!(
            manager_id = %notification.manager_id,
            kind = %notification.kind,
            "notification_dropped"
        );
        Ok(())
    }
}
