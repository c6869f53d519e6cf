use std::time::Duration;
use tracing::debug;

use crate::quorum::QuorumPolicy;
use crate::util::{
    DEFAULT_DRAIN_ERROR_REQUEUE, DEFAULT_DRAIN_TIMEOUT, DEFAULT_HOLDER_IDENTITY,
    DEFAULT_LEASE_DURATION, DEFAULT_LEASE_NAMESPACE,
};

/// File holding the namespace of the pod's service account.
const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Shortest requeue of a finished maintenance.
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_secs(1);

/// Runtime settings of the NodeMaintenance controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Validity written into every node lease.
    pub lease_duration: Duration,

    /// Time budget of a single drain attempt.
    pub drain_timeout: Duration,

    /// Requeue interval after a failed drain.
    pub drain_error_requeue: Duration,

    /// Namespace the node leases live in.
    pub lease_namespace: String,

    /// Holder identity written into node leases.
    pub holder_identity: String,

    pub quorum_policy: QuorumPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            lease_duration: DEFAULT_LEASE_DURATION,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            drain_error_requeue: DEFAULT_DRAIN_ERROR_REQUEUE,
            lease_namespace: DEFAULT_LEASE_NAMESPACE.to_owned(),
            holder_identity: DEFAULT_HOLDER_IDENTITY.to_owned(),
            quorum_policy: QuorumPolicy::default(),
        }
    }
}

impl Config {
    /// How long a finished maintenance waits before its lease is looked at
    /// again. The lease is renewed once it gets within two drain timeouts
    /// of expiring, so the next pass must land inside that window: after
    /// it opens, and with half a drain timeout to spare before expiry for
    /// the pass itself.
    pub fn renewal_interval(&self) -> Duration {
        self.lease_duration
            .saturating_sub(self.drain_timeout * 3 / 2)
            .max(MIN_RENEWAL_INTERVAL)
    }
}

/// Returns the namespace the process runs in, or the default lease
/// namespace when running outside a cluster.
pub fn own_namespace() -> String {
    match std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE) {
        Ok(namespace) if !namespace.trim().is_empty() => namespace.trim().to_owned(),
        _ => {
            debug!(
                "service account namespace unavailable, using {}",
                DEFAULT_LEASE_NAMESPACE
            );
            DEFAULT_LEASE_NAMESPACE.to_owned()
        }
    }
}
