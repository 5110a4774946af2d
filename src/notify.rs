/// Fire-and-forget notifications.
///
/// Delivery is external. A failed notification is logged and dropped; it
/// never fails the transition that triggered it.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum NotificationKind {
    DonorAssigned,
    WorkflowStatusChanged,
    AppointmentProposed,
    AppointmentApproved,
    AppointmentRejected,
    AppointmentCancelled,
    AppointmentExpired,
    DemandFulfilled,
}

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

pub trait Notifier: Send + Sync {
    fn notify(&self, user_id: Uuid, kind: NotificationKind, message: &str) -> Result<(), NotifyError>;
}

/// Send a notification, logging and suppressing any delivery failure.
pub fn dispatch(notifier: &dyn Notifier, user_id: Uuid, kind: NotificationKind, message: &str) {
    if let Err(e) = notifier.notify(user_id, kind, message) {
        warn!(%user_id, %kind, error = %e, "notification dropped");
    }
}

/// Notifier that only writes a log line.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, user_id: Uuid, kind: NotificationKind, message: &str) -> Result<(), NotifyError> {
        info!(%user_id, %kind, text = message, "notification");
        Ok(())
    }
}

/// A delivered notification, as captured by `RecordingNotifier`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub message: String,
}

/// Notifier that keeps everything it was asked to send.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose every delivery fails.
    pub fn failing() -> Self {
        RecordingNotifier {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.sent().iter().filter(|n| n.kind == kind).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, user_id: Uuid, kind: NotificationKind, message: &str) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError(format!("{kind} to {user_id} bounced")));
        }
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| NotifyError("recording buffer poisoned".to_string()))?;
        sent.push(SentNotification {
            user_id,
            kind,
            message: message.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn failed_delivery_is_logged_not_propagated() {
        let notifier = RecordingNotifier::failing();
        dispatch(&notifier, Uuid::new_v4(), NotificationKind::AppointmentApproved, "approved");
        assert!(logs_contain("notification dropped"));
        assert!(notifier.sent().is_empty());
    }

    #[test]
    fn recording_notifier_keeps_messages() {
        let notifier = RecordingNotifier::new();
        let user = Uuid::new_v4();
        dispatch(&notifier, user, NotificationKind::DonorAssigned, "you are assigned");
        assert_eq!(notifier.count(NotificationKind::DonorAssigned), 1);
        assert_eq!(notifier.sent()[0].user_id, user);
    }
}
