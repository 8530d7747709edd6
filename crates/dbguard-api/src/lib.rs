use std::sync::Arc;

use anyhow::Result;
use dbguard_core::{
    evaluate, CheckResult, DatabaseHandle, Inspector, MailSender, MonitorError, Notifier,
    NotifyOutcome, Policy, PolicyForm, Settings, SettingsStore, SkipReason,
};
use dbguard_store_sqlite::SqliteSettingsStore;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::Instrument;
use ulid::Ulid;

pub mod config;
pub mod logging;
pub mod mail;
pub mod mysql;
pub mod schedule;

pub use config::{DbGuardConfig, MailConfig, MailTransportKind, ScheduleConfig};
pub use schedule::PeriodicScheduler;

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const ANOMALY_BANNER: &str =
    "Database anomalies detected! Open the dbguard status view for details.";

/// How the notification step of a scheduled run ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NotificationReport {
    Sent,
    Skipped { reason: SkipReason },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledRun {
    pub run_id: Ulid,
    pub result: CheckResult,
    pub notification: NotificationReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReport {
    pub banner: Option<String>,
    pub last_result: Option<CheckResult>,
}

/// Where alert mail goes and how the site is named in it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationTarget {
    pub recipient: String,
    pub site_name: String,
}

/// Trigger layer composing inspection, evaluation, persistence and notification.
///
/// Built once at process start and cloned into whichever surface drives it.
#[derive(Clone)]
pub struct DbGuardApi {
    database: Arc<dyn DatabaseHandle>,
    settings: Arc<dyn SettingsStore>,
    mailer: Arc<dyn MailSender>,
    target: NotificationTarget,
}

impl DbGuardApi {
    #[must_use]
    pub fn new(
        database: Arc<dyn DatabaseHandle>,
        settings: Arc<dyn SettingsStore>,
        mailer: Arc<dyn MailSender>,
        target: NotificationTarget,
    ) -> Self {
        Self { database, settings, mailer, target }
    }

    /// Wire the MySQL handle, SQLite settings file and mail transport named by `config`.
    /// The database pool connects lazily.
    ///
    /// # Errors
    /// Returns an error when the database URL or mail settings are invalid.
    pub fn from_config(config: &DbGuardConfig) -> Result<Self> {
        config.validate()?;
        let database = mysql::MySqlHandle::connect_lazy(&config.database_url)?;
        let settings = SqliteSettingsStore::new(config.settings_db.clone());
        let mailer = mail::mail_sender(&config.mail)?;
        Ok(Self::new(
            Arc::new(database),
            Arc::new(settings),
            mailer,
            NotificationTarget {
                recipient: config.recipient.clone(),
                site_name: config.site_name.clone(),
            },
        ))
    }

    /// Store the initial policy unless one already exists. Returns the policy in effect.
    ///
    /// # Errors
    /// Returns an error when the store fails or the current database cannot be queried.
    pub async fn activate(&self) -> Result<Policy, MonitorError> {
        let settings = Settings::new(self.settings.as_ref());
        if let Some(policy) = settings.load_policy()? {
            return Ok(policy);
        }

        let current = Inspector::new(self.database.as_ref()).current_database().await?;
        let policy = Policy::initial(current.as_deref());
        settings.save_policy(&policy)?;
        tracing::info!(
            allowed = policy.allowed_databases.len(),
            "initialized default monitoring policy"
        );
        Ok(policy)
    }

    /// Stored policy, or `None` before activation.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub fn policy(&self) -> Result<Option<Policy>, MonitorError> {
        Settings::new(self.settings.as_ref()).load_policy()
    }

    /// Replace the policy with the normalized form contents.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub fn update_policy(&self, form: PolicyForm) -> Result<Policy, MonitorError> {
        let policy = form.into_policy();
        Settings::new(self.settings.as_ref()).save_policy(&policy)?;
        tracing::info!(
            allowed = policy.allowed_databases.len(),
            email_notify_enabled = policy.email_notify_enabled,
            "monitoring policy updated"
        );
        Ok(policy)
    }

    /// Banner text plus the result of the last scheduled run.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub fn status(&self) -> Result<StatusReport, MonitorError> {
        let last_result = Settings::new(self.settings.as_ref()).load_result()?;
        let banner = last_result
            .as_ref()
            .filter(|result| result.has_anomalies())
            .map(|_| ANOMALY_BANNER.to_string());
        Ok(StatusReport { banner, last_result })
    }

    /// Periodic path: inspect, evaluate, persist, then notify.
    ///
    /// Inspection failures abort before anything is written. A notification
    /// failure is reported in the returned run and never undoes the save.
    ///
    /// # Errors
    /// Returns an error when inspection fails or the result cannot be persisted.
    pub async fn run_scheduled(&self) -> Result<ScheduledRun, MonitorError> {
        let run_id = Ulid::new();
        let span = tracing::info_span!("scheduled_check", %run_id);
        self.scheduled(run_id).instrument(span).await
    }

    async fn scheduled(&self, run_id: Ulid) -> Result<ScheduledRun, MonitorError> {
        let policy = self.activate().await?;
        let result = self.check(&policy).await?;

        let settings = Settings::new(self.settings.as_ref());
        let saved = settings.save_result(&result);
        if let Err(err) = &saved {
            tracing::error!(error = %err, "failed to persist check result");
        }

        let notifier = Notifier::new(self.mailer.as_ref(), &self.target.site_name);
        let notification =
            match notifier.notify_if_needed(&result.alerts, &policy, &self.target.recipient).await {
                Ok(NotifyOutcome::Sent) => NotificationReport::Sent,
                Ok(NotifyOutcome::Skipped { reason }) => NotificationReport::Skipped { reason },
                Err(err) => {
                    tracing::warn!(error = %err, "alert notification failed");
                    NotificationReport::Failed { error: err.to_string() }
                }
            };

        saved?;
        tracing::info!(alerts = result.alerts.len(), "scheduled check finished");
        Ok(ScheduledRun { run_id, result, notification })
    }

    /// Ad-hoc path for status views: evaluates live state without writing the
    /// check result or sending mail. On a store that was never activated, the
    /// default policy is still written by [`Self::activate`].
    ///
    /// # Errors
    /// Returns an error when the policy cannot be loaded or inspection fails.
    pub async fn run_on_demand(&self) -> Result<CheckResult, MonitorError> {
        let policy = self.activate().await?;
        let result = self.check(&policy).await?;
        tracing::debug!(alerts = result.alerts.len(), "on-demand check finished");
        Ok(result)
    }

    async fn check(&self, policy: &Policy) -> Result<CheckResult, MonitorError> {
        let facts = Inspector::new(self.database.as_ref()).inspect().await?;
        let alerts = evaluate(&facts, policy);
        Ok(CheckResult::new(OffsetDateTime::now_utc(), alerts))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use dbguard_core::{AlertKind, InMemorySettingsStore, Row};

    use super::*;

    struct FakeServer {
        state: Mutex<Result<(bool, Vec<String>), MonitorError>>,
        current_database: Option<String>,
    }

    impl FakeServer {
        fn new(skip: bool, databases: &[&str]) -> Self {
            Self {
                state: Mutex::new(Ok((skip, databases.iter().map(ToString::to_string).collect()))),
                current_database: Some("app".to_string()),
            }
        }

        fn set(&self, state: Result<(bool, Vec<String>), MonitorError>) {
            if let Ok(mut guard) = self.state.lock() {
                *guard = state;
            }
        }

        fn snapshot(&self) -> Result<(bool, Vec<String>), MonitorError> {
            self.state
                .lock()
                .map_err(|_| MonitorError::Connection("poisoned".to_string()))?
                .clone()
        }
    }

    #[async_trait]
    impl DatabaseHandle for FakeServer {
        async fn query_row(&self, sql: &str) -> Result<Option<Row>, MonitorError> {
            if sql == dbguard_core::inspect::CURRENT_DATABASE_SQL {
                return Ok(Some(Row::new(vec![("name".to_string(), self.current_database.clone())])));
            }
            let (skip, _) = self.snapshot()?;
            let value = if skip { "ON" } else { "OFF" };
            Ok(Some(Row::new(vec![("Value".to_string(), Some(value.to_string()))])))
        }

        async fn query_column(&self, _sql: &str) -> Result<Vec<String>, MonitorError> {
            Ok(self.snapshot()?.1)
        }
    }

    #[derive(Default)]
    struct CountingMailer {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl MailSender for CountingMailer {
        async fn send(&self, _to: &str, _subject: &str, _body: &str) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("mailbox unavailable"));
            }
            Ok(())
        }
    }

    struct Harness {
        api: DbGuardApi,
        server: Arc<FakeServer>,
        store: Arc<InMemorySettingsStore>,
        mailer: Arc<CountingMailer>,
    }

    fn harness(server: FakeServer, mailer: CountingMailer) -> Harness {
        let server = Arc::new(server);
        let store = Arc::new(InMemorySettingsStore::new());
        let mailer = Arc::new(mailer);
        let api = DbGuardApi::new(
            server.clone(),
            store.clone(),
            mailer.clone(),
            NotificationTarget {
                recipient: "admin@example.com".to_string(),
                site_name: "Example".to_string(),
            },
        );
        Harness { api, server, store, mailer }
    }

    fn stored_result(store: &InMemorySettingsStore) -> Result<Option<CheckResult>, MonitorError> {
        Settings::new(store).load_result()
    }

    #[tokio::test]
    async fn activate_synthesizes_default_policy_once() -> Result<(), MonitorError> {
        let h = harness(FakeServer::new(false, &[]), CountingMailer::default());
        let first = h.api.activate().await?;
        assert_eq!(
            first.allowed_databases,
            vec!["app", "information_schema", "performance_schema", "mysql", "sys"]
        );
        assert!(first.email_notify_enabled);

        h.api.update_policy(PolicyForm {
            allowed_databases: "only_this".to_string(),
            email_notify_enabled: false,
        })?;
        let second = h.api.activate().await?;
        assert_eq!(second.allowed_databases, vec!["only_this"]);
        Ok(())
    }

    #[tokio::test]
    async fn scheduled_run_persists_and_notifies() -> Result<(), MonitorError> {
        let h = harness(FakeServer::new(true, &["app", "mysql", "rogue"]), CountingMailer::default());
        let run = h.api.run_scheduled().await?;

        let kinds = run.result.alerts.iter().map(|alert| alert.kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![AlertKind::UnsafeAuthMode, AlertKind::UnexpectedDatabase]);
        assert_eq!(run.notification, NotificationReport::Sent);
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stored_result(&h.store)?, Some(run.result));
        Ok(())
    }

    #[tokio::test]
    async fn clean_scheduled_run_skips_notification() -> Result<(), MonitorError> {
        let h = harness(FakeServer::new(false, &["app", "sys"]), CountingMailer::default());
        let run = h.api.run_scheduled().await?;
        assert!(run.result.alerts.is_empty());
        assert_eq!(run.notification, NotificationReport::Skipped { reason: SkipReason::NoAlerts });
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.api.status()?.banner, None);
        Ok(())
    }

    #[tokio::test]
    async fn disabled_notifications_still_persist() -> Result<(), MonitorError> {
        let h = harness(FakeServer::new(false, &["rogue"]), CountingMailer::default());
        h.api.update_policy(PolicyForm {
            allowed_databases: "mysql".to_string(),
            email_notify_enabled: false,
        })?;
        let run = h.api.run_scheduled().await?;
        assert_eq!(run.notification, NotificationReport::Skipped { reason: SkipReason::Disabled });
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 0);
        assert!(stored_result(&h.store)?.is_some_and(|result| result.has_anomalies()));
        Ok(())
    }

    #[tokio::test]
    async fn mail_failure_does_not_block_persistence() -> Result<(), MonitorError> {
        let h = harness(
            FakeServer::new(false, &["rogue"]),
            CountingMailer { fail: true, ..CountingMailer::default() },
        );
        let run = h.api.run_scheduled().await?;
        assert!(matches!(run.notification, NotificationReport::Failed { .. }));
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stored_result(&h.store)?, Some(run.result));
        Ok(())
    }

    #[tokio::test]
    async fn connection_error_leaves_previous_result_untouched() -> Result<(), MonitorError> {
        let h = harness(FakeServer::new(false, &["rogue"]), CountingMailer::default());
        let first = h.api.run_scheduled().await?;

        h.server.set(Err(MonitorError::Connection("server has gone away".to_string())));
        let err = h.api.run_scheduled().await.err();
        assert!(matches!(err, Some(MonitorError::Connection(_))));
        assert_eq!(stored_result(&h.store)?, Some(first.result));
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn on_demand_run_neither_persists_nor_notifies() -> Result<(), MonitorError> {
        let h = harness(FakeServer::new(false, &["app"]), CountingMailer::default());
        let scheduled = h.api.run_scheduled().await?;
        assert!(scheduled.result.alerts.is_empty());

        h.server.set(Ok((true, vec!["app".to_string(), "rogue".to_string()])));
        let on_demand = h.api.run_on_demand().await?;
        assert_eq!(on_demand.alerts.len(), 2);
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 0);

        let status = h.api.status()?;
        assert_eq!(status.last_result, Some(scheduled.result));
        assert_eq!(status.banner, None);
        Ok(())
    }

    #[tokio::test]
    async fn on_demand_run_on_fresh_store_writes_only_the_default_policy(
    ) -> Result<(), MonitorError> {
        let h = harness(FakeServer::new(false, &["app"]), CountingMailer::default());
        assert_eq!(h.api.policy()?, None);

        let result = h.api.run_on_demand().await?;
        assert!(result.alerts.is_empty());
        assert!(h.api.policy()?.is_some_and(|policy| policy.allows("app")));
        assert_eq!(stored_result(&h.store)?, None);
        Ok(())
    }

    #[tokio::test]
    async fn banner_reflects_last_scheduled_anomalies() -> Result<(), MonitorError> {
        let h = harness(FakeServer::new(true, &[]), CountingMailer::default());
        assert_eq!(h.api.status()?, StatusReport { banner: None, last_result: None });
        h.api.run_scheduled().await?;
        assert_eq!(h.api.status()?.banner.as_deref(), Some(ANOMALY_BANNER));
        Ok(())
    }

    #[tokio::test]
    async fn empty_allow_list_flags_every_database() -> Result<(), MonitorError> {
        let h = harness(FakeServer::new(false, &["b", "a"]), CountingMailer::default());
        h.api.update_policy(PolicyForm {
            allowed_databases: String::new(),
            email_notify_enabled: true,
        })?;
        let result = h.api.run_on_demand().await?;
        assert_eq!(result.alerts.len(), 1);
        assert!(result.alerts[0].message.ends_with("b, a"));
        Ok(())
    }
}
