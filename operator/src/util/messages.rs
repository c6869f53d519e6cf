/// Log line emitted whenever a failed reconcile is retried on the fixed
/// drain-error schedule instead of the exponential backoff.
pub const FIXED_DURATION_REQUEUE: &str = "Reconciling with fixed duration";

/// Log line emitted whenever a failed reconcile falls back to the
/// exponential error backoff.
pub const EXPONENTIAL_REQUEUE: &str = "Reconciling with exponential duration";

/// Reason recorded when maintenance is aborted because the node's lease
/// was lost or could not be renewed.
pub const LEASE_LOST: &str = "lost ownership of the node lease, maintenance aborted";
