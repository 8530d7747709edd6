//! Rule evaluation over one set of [`Facts`].
//!
//! Evaluation is pure: it reads no clock and performs no I/O, so the same facts
//! and policy always yield the same alerts in the same order.

use std::collections::BTreeSet;

use crate::{Alert, AlertKind, Facts, Policy};

pub const UNSAFE_AUTH_MODE_MESSAGE: &str =
    "🚨 Danger: the database server is running with --skip-grant-tables!";
pub const UNEXPECTED_DATABASE_PREFIX: &str = "🔍 Unexpected databases detected: ";

/// Evaluate facts against policy. An empty result means no anomaly.
///
/// An empty allow-list reports every database as unexpected.
#[must_use]
pub fn evaluate(facts: &Facts, policy: &Policy) -> Vec<Alert> {
    let mut alerts = Vec::with_capacity(2);

    if facts.skip_grant_tables_on {
        alerts.push(Alert {
            kind: AlertKind::UnsafeAuthMode,
            message: UNSAFE_AUTH_MODE_MESSAGE.to_string(),
        });
    }

    let unexpected = unexpected_databases(facts, policy);
    if !unexpected.is_empty() {
        alerts.push(Alert {
            kind: AlertKind::UnexpectedDatabase,
            message: format!("{UNEXPECTED_DATABASE_PREFIX}{}", unexpected.join(", ")),
        });
    }

    alerts
}

/// Names reported by the server that the policy does not allow, in discovery order.
#[must_use]
pub fn unexpected_databases<'a>(facts: &'a Facts, policy: &Policy) -> Vec<&'a str> {
    let mut listed = BTreeSet::new();
    facts
        .database_names
        .iter()
        .map(String::as_str)
        .filter(|name| !policy.allows(name) && listed.insert(*name))
        .collect()
}
