use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod inspect;
pub mod notify;
pub mod policy;
pub mod rules;
pub mod settings;

pub use inspect::{DatabaseHandle, Inspector, Row};
pub use notify::{MailSender, Notifier, NotifyOutcome, OutboundMessage, SkipReason};
pub use policy::{normalize_database_names, parse_allow_list, PolicyForm, SYSTEM_SCHEMAS};
pub use rules::evaluate;
pub use settings::{InMemorySettingsStore, Settings, SettingsStore};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MonitorError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("unexpected result: {0}")]
    UnexpectedResult(String),
    #[error("notification error: {0}")]
    Notification(String),
    #[error("settings store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    UnsafeAuthMode,
    UnexpectedDatabase,
}

/// One detected anomaly. The message is display text and is not meant to be parsed.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
}

impl Display for Alert {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Raw observations pulled from the target server during one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Facts {
    pub skip_grant_tables_on: bool,
    /// Server-reported names in discovery order.
    pub database_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Policy {
    pub email_notify_enabled: bool,
    pub allowed_databases: Vec<String>,
}

impl Policy {
    /// Policy synthesized on first activation: the monitored database plus the
    /// fixed system schemas, with notifications on.
    #[must_use]
    pub fn initial(current_database: Option<&str>) -> Self {
        let names = current_database
            .into_iter()
            .chain(SYSTEM_SCHEMAS.iter().copied())
            .map(str::to_string);
        Self {
            email_notify_enabled: true,
            allowed_databases: normalize_database_names(names),
        }
    }

    #[must_use]
    pub fn allows(&self, database: &str) -> bool {
        self.allowed_databases.iter().any(|allowed| allowed == database)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CheckResult {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub alerts: Vec<Alert>,
}

impl CheckResult {
    #[must_use]
    pub fn new(checked_at: OffsetDateTime, alerts: Vec<Alert>) -> Self {
        Self { checked_at, alerts }
    }

    #[must_use]
    pub fn has_anomalies(&self) -> bool {
        !self.alerts.is_empty()
    }
}
