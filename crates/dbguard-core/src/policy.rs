//! Allow-list normalization and the editable policy form.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::Policy;

/// Schemas every MySQL server reports regardless of application data.
pub const SYSTEM_SCHEMAS: [&str; 4] = ["information_schema", "performance_schema", "mysql", "sys"];

/// Trim each name, drop empty entries and keep the first occurrence of duplicates.
#[must_use]
pub fn normalize_database_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for name in names {
        let trimmed = name.as_ref().trim();
        if trimmed.is_empty() || !seen.insert(trimmed.to_string()) {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

/// Parse free text where names are separated by newlines or commas.
#[must_use]
pub fn parse_allow_list(text: &str) -> Vec<String> {
    normalize_database_names(text.split(['\n', ',']))
}

/// Policy as submitted from an admin surface.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PolicyForm {
    pub allowed_databases: String,
    pub email_notify_enabled: bool,
}

impl PolicyForm {
    #[must_use]
    pub fn into_policy(self) -> Policy {
        Policy {
            email_notify_enabled: self.email_notify_enabled,
            allowed_databases: parse_allow_list(&self.allowed_databases),
        }
    }

    /// Render a policy back into the one-name-per-line text form.
    #[must_use]
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            allowed_databases: policy.allowed_databases.join("\n"),
            email_notify_enabled: policy.email_notify_enabled,
        }
    }
}

impl Policy {
    /// Re-apply normalization to a record that may have been written by hand.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            email_notify_enabled: self.email_notify_enabled,
            allowed_databases: normalize_database_names(self.allowed_databases),
        }
    }
}
