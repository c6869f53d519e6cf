use std::time::Duration;

mod error;
pub mod messages;

pub use error::*;

/// Name of the kubernetes resource manager.
pub(crate) const MANAGER_NAME: &str = "node-maintenance-operator";

/// Default holder identity written into node leases. Every replica uses
/// the same identity so that a restarted controller keeps its leases.
pub const DEFAULT_HOLDER_IDENTITY: &str = "node-maintenance";

/// Default namespace for node leases when the service account namespace
/// can't be determined.
pub const DEFAULT_LEASE_NAMESPACE: &str = "node-maintenance";

/// Default validity of a node lease.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(3600);

/// Default time budget for a single drain attempt.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default requeue interval after a drain attempt fails.
pub const DEFAULT_DRAIN_ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Number of times renewing a lease we already hold may fail before the
/// maintenance is aborted.
pub(crate) const MAX_OWNED_LEASE_ERRORS: usize = 3;

/// Returns true if `list` contains `value`.
pub fn contains_string(list: &[String], value: &str) -> bool {
    list.iter().any(|item| item == value)
}

/// Returns `list` without any occurrence of `value`.
pub fn remove_string(list: &[String], value: &str) -> Vec<String> {
    list.iter().filter(|item| *item != value).cloned().collect()
}
