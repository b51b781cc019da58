use std::fmt;

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        formatter.write_str(label)
    }
}

/// User-visible notice for failures that have no turn to attach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub severity: Severity,
    pub text: String,
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, severity: Severity, text: &str);
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify(&self, severity: Severity, text: &str) {
        match severity {
            Severity::Info => tracing::info!(notification = %text),
            Severity::Warning => tracing::warn!(notification = %text),
            Severity::Error => tracing::error!(notification = %text),
        }
    }
}

/// Forwards notifications to a receiver owned by the presentation layer.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    notifications: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (notifications, receiver) = mpsc::unbounded_channel();
        (Self { notifications }, receiver)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, severity: Severity, text: &str) {
        let notification = Notification {
            severity,
            text: text.to_string(),
        };
        if self.notifications.send(notification).is_err() {
            tracing::debug!(%severity, "notification receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_notifier_delivers_in_order() {
        let (notifier, mut receiver) = ChannelNotifier::new();

        notifier.notify(Severity::Warning, "slow network");
        notifier.notify(Severity::Error, "history unavailable");

        assert_eq!(
            receiver.try_recv().unwrap(),
            Notification {
                severity: Severity::Warning,
                text: "slow network".to_string(),
            }
        );
        assert_eq!(receiver.try_recv().unwrap().severity, Severity::Error);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn tracing_notifier_handles_every_severity() {
        for severity in [Severity::Info, Severity::Warning, Severity::Error] {
            TracingNotifier.notify(severity, "history unavailable");
        }
        assert_eq!(Severity::Warning.to_string(), "warning");
    }

    #[test]
    fn closed_receiver_is_ignored() {
        let (notifier, receiver) = ChannelNotifier::new();
        drop(receiver);

        notifier.notify(Severity::Info, "nobody listens");
    }
}
