//! YAML configuration for the CLI and service binaries.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const WEEKLY_CADENCE_SECS: u64 = 7 * 24 * 60 * 60;
pub const MAX_CADENCE_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DbGuardConfig {
    pub database_url: String,
    pub settings_db: PathBuf,
    pub recipient: String,
    pub site_name: String,
    pub schedule: ScheduleConfig,
    pub mail: MailConfig,
}

impl Default for DbGuardConfig {
    fn default() -> Self {
        Self {
            database_url: "mysql://root@127.0.0.1:3306".to_string(),
            settings_db: PathBuf::from("./dbguard.sqlite3"),
            recipient: String::new(),
            site_name: "dbguard".to_string(),
            schedule: ScheduleConfig::default(),
            mail: MailConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleConfig {
    pub cadence_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self { cadence_secs: WEEKLY_CADENCE_SECS }
    }
}

impl ScheduleConfig {
    #[must_use]
    pub fn cadence(&self) -> Duration {
        Duration::from_secs(self.cadence_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MailTransportKind {
    Sendmail,
    Webhook,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MailConfig {
    pub transport: MailTransportKind,
    pub sendmail_path: PathBuf,
    pub from: String,
    pub webhook_url: Option<String>,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            transport: MailTransportKind::Sendmail,
            sendmail_path: PathBuf::from("/usr/sbin/sendmail"),
            from: "dbguard@localhost".to_string(),
            webhook_url: None,
        }
    }
}

impl DbGuardConfig {
    /// Parse a YAML config file. Missing fields take their defaults.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, is not valid YAML, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_yaml(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the file cannot be loaded.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// # Errors
    /// Returns an error when the document is not valid YAML or fails validation.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(anyhow!("database_url must not be empty"));
        }
        if self.schedule.cadence_secs == 0 {
            return Err(anyhow!("schedule.cadence_secs must be greater than zero"));
        }
        if self.schedule.cadence_secs > MAX_CADENCE_SECS {
            return Err(anyhow!("schedule.cadence_secs must be at most {MAX_CADENCE_SECS}"));
        }
        if self.mail.transport == MailTransportKind::Webhook
            && self.mail.webhook_url.as_deref().map_or(true, |url| url.trim().is_empty())
        {
            return Err(anyhow!("mail.webhook_url is required for the webhook transport"));
        }
        Ok(())
    }
}
