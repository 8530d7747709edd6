//! Composition and dispatch of the alert email.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::{Alert, MonitorError, Policy};

pub const SUBJECT_PREFIX: &str = "Database security alert - ";
pub const BODY_HEADER: &str = "Database anomalies found:";

/// Outbound mail transport.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OutboundMessage {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoAlerts,
    Disabled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NotifyOutcome {
    Sent,
    Skipped { reason: SkipReason },
}

pub struct Notifier<'a> {
    sender: &'a dyn MailSender,
    site_name: &'a str,
}

impl<'a> Notifier<'a> {
    #[must_use]
    pub fn new(sender: &'a dyn MailSender, site_name: &'a str) -> Self {
        Self { sender, site_name }
    }

    /// Send one message when there is something to report and the policy allows it.
    /// A single delivery attempt is made.
    ///
    /// # Errors
    /// Returns [`MonitorError::Notification`] when there is no recipient or the
    /// transport rejects the message.
    pub async fn notify_if_needed(
        &self,
        alerts: &[Alert],
        policy: &Policy,
        recipient: &str,
    ) -> Result<NotifyOutcome, MonitorError> {
        if alerts.is_empty() {
            return Ok(NotifyOutcome::Skipped { reason: SkipReason::NoAlerts });
        }
        if !policy.email_notify_enabled {
            return Ok(NotifyOutcome::Skipped { reason: SkipReason::Disabled });
        }
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(MonitorError::Notification("no recipient configured".to_string()));
        }

        let message = compose_message(self.site_name, alerts);
        self.sender
            .send(recipient, &message.subject, &message.body)
            .await
            .map_err(|err| MonitorError::Notification(format!("{err:#}")))?;

        tracing::info!(recipient, alerts = alerts.len(), "alert email sent");
        Ok(NotifyOutcome::Sent)
    }
}

/// Build the plain-text subject and body, one alert per line.
#[must_use]
pub fn compose_message(site_name: &str, alerts: &[Alert]) -> OutboundMessage {
    let subject = format!("{SUBJECT_PREFIX}{}", plain_line(site_name));
    let mut body = format!("{BODY_HEADER}\n\n");
    let lines = alerts.iter().map(|alert| plain_line(&alert.message)).collect::<Vec<_>>();
    body.push_str(&lines.join("\n"));
    OutboundMessage { subject, body }
}

/// Strip markup and fold the text onto a single line.
#[must_use]
pub fn plain_line(text: &str) -> String {
    let stripped = match markup_tags() {
        Some(re) => re.replace_all(text, " ").into_owned(),
        None => text.to_string(),
    };
    let decoded = decode_entities(&stripped);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn markup_tags() -> Option<&'static Regex> {
    static TAGS: OnceLock<Option<Regex>> = OnceLock::new();
    TAGS.get_or_init(|| Regex::new(r"<[^>]*>").ok()).as_ref()
}

fn decode_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::anyhow;

    use super::*;
    use crate::AlertKind;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, String, String)>>,
        fail: bool,
    }

    impl RecordingSender {
        fn sent(&self) -> Vec<(String, String, String)> {
            self.sent.lock().map(|guard| guard.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl MailSender for RecordingSender {
        async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
            if let Ok(mut guard) = self.sent.lock() {
                guard.push((to.to_string(), subject.to_string(), body.to_string()));
            }
            if self.fail {
                return Err(anyhow!("smtp relay refused connection"));
            }
            Ok(())
        }
    }

    fn alert(kind: AlertKind, message: &str) -> Alert {
        Alert { kind, message: message.to_string() }
    }

    fn policy(enabled: bool) -> Policy {
        Policy { email_notify_enabled: enabled, allowed_databases: vec![] }
    }

    #[tokio::test]
    async fn empty_alerts_never_reach_the_sender() -> Result<(), MonitorError> {
        let sender = RecordingSender::default();
        let notifier = Notifier::new(&sender, "Site");
        for enabled in [true, false] {
            let outcome = notifier.notify_if_needed(&[], &policy(enabled), "a@b.c").await?;
            assert_eq!(outcome, NotifyOutcome::Skipped { reason: SkipReason::NoAlerts });
        }
        assert!(sender.sent().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn disabled_policy_never_reaches_the_sender() -> Result<(), MonitorError> {
        let sender = RecordingSender::default();
        let alerts = [alert(AlertKind::UnsafeAuthMode, "bad")];
        let outcome =
            Notifier::new(&sender, "Site").notify_if_needed(&alerts, &policy(false), "a@b.c").await?;
        assert_eq!(outcome, NotifyOutcome::Skipped { reason: SkipReason::Disabled });
        assert!(sender.sent().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn exactly_one_message_is_sent_per_invocation() -> Result<(), MonitorError> {
        let sender = RecordingSender::default();
        let alerts = [
            alert(AlertKind::UnsafeAuthMode, "first"),
            alert(AlertKind::UnexpectedDatabase, "second"),
        ];
        let outcome = Notifier::new(&sender, "Ops")
            .notify_if_needed(&alerts, &policy(true), " admin@example.com ")
            .await?;
        assert_eq!(outcome, NotifyOutcome::Sent);

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "admin@example.com");
        assert_eq!(sent[0].1, "Database security alert - Ops");
        assert_eq!(sent[0].2, "Database anomalies found:\n\nfirst\nsecond");
        Ok(())
    }

    #[tokio::test]
    async fn transport_failure_is_a_notification_error() {
        let sender = RecordingSender { fail: true, ..RecordingSender::default() };
        let alerts = [alert(AlertKind::UnsafeAuthMode, "bad")];
        let err = Notifier::new(&sender, "Site")
            .notify_if_needed(&alerts, &policy(true), "a@b.c")
            .await
            .err();
        assert!(matches!(err, Some(MonitorError::Notification(message)) if message.contains("refused")));
        assert_eq!(sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn missing_recipient_is_a_notification_error() {
        let sender = RecordingSender::default();
        let alerts = [alert(AlertKind::UnsafeAuthMode, "bad")];
        let err =
            Notifier::new(&sender, "Site").notify_if_needed(&alerts, &policy(true), "  ").await.err();
        assert!(matches!(err, Some(MonitorError::Notification(_))));
        assert!(sender.sent().is_empty());
    }

    #[test]
    fn markup_is_stripped_but_symbols_survive() {
        let message = compose_message(
            "<b>Shop</b>",
            &[alert(AlertKind::UnexpectedDatabase, "🔍 <strong>found</strong>:<br>a &amp; b")],
        );
        assert_eq!(message.subject, "Database security alert - Shop");
        assert_eq!(message.body, "Database anomalies found:\n\n🔍 found : a & b");
    }

    #[test]
    fn multi_line_alert_stays_on_one_line() {
        assert_eq!(plain_line("one\ntwo\r\n  three"), "one two three");
    }
}
