//! Typed access to the persisted policy and last check result.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{CheckResult, MonitorError, Policy};

pub const POLICY_KEY: &str = "dbguard.policy";
pub const LAST_RESULT_KEY: &str = "dbguard.last_result";

/// External key-value store. `set` replaces the whole value atomically.
pub trait SettingsStore: Send + Sync {
    /// # Errors
    /// Returns an error when the backing store cannot be read.
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// # Errors
    /// Returns an error when the backing store cannot be written.
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemorySettingsStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl InMemorySettingsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for InMemorySettingsStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let values =
            self.values.lock().map_err(|_| anyhow::anyhow!("settings map lock poisoned"))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut values =
            self.values.lock().map_err(|_| anyhow::anyhow!("settings map lock poisoned"))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Policy and result persistence over any [`SettingsStore`]. Nothing is cached;
/// each call goes to the store.
pub struct Settings<'a> {
    store: &'a dyn SettingsStore,
}

impl<'a> Settings<'a> {
    #[must_use]
    pub fn new(store: &'a dyn SettingsStore) -> Self {
        Self { store }
    }

    /// Stored policy, normalized on the way out. `None` before first activation.
    ///
    /// # Errors
    /// Returns [`MonitorError::Store`] when the store fails or holds a malformed record.
    pub fn load_policy(&self) -> Result<Option<Policy>, MonitorError> {
        Ok(self.read::<Policy>(POLICY_KEY)?.map(Policy::normalized))
    }

    /// # Errors
    /// Returns [`MonitorError::Store`] when the record cannot be written.
    pub fn save_policy(&self, policy: &Policy) -> Result<(), MonitorError> {
        self.write(POLICY_KEY, policy)
    }

    /// Overwrite the last result in full.
    ///
    /// # Errors
    /// Returns [`MonitorError::Store`] when the record cannot be written.
    pub fn save_result(&self, result: &CheckResult) -> Result<(), MonitorError> {
        self.write(LAST_RESULT_KEY, result)
    }

    /// # Errors
    /// Returns [`MonitorError::Store`] when the store fails or holds a malformed record.
    pub fn load_result(&self) -> Result<Option<CheckResult>, MonitorError> {
        self.read(LAST_RESULT_KEY)
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, MonitorError> {
        let Some(raw) = self.store.get(key).map_err(|err| store_error(key, &err))? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| MonitorError::Store(format!("malformed record `{key}`: {err}")))
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), MonitorError> {
        let raw = serde_json::to_string(value)
            .map_err(|err| MonitorError::Store(format!("failed to encode `{key}`: {err}")))?;
        self.store.set(key, &raw).map_err(|err| store_error(key, &err))
    }
}

fn store_error(key: &str, err: &anyhow::Error) -> MonitorError {
    MonitorError::Store(format!("`{key}`: {err:#}"))
}
