use crate::drain::DrainError;

/// All errors possible to occur during reconciliation
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },

    /// Error in user input or NodeMaintenance resource definition, typically missing fields.
    #[error("Invalid NodeMaintenance: {0}")]
    UserInputError(String),

    /// The node named by the request does not exist.
    #[error("node {0} not found")]
    NodeNotFound(String),

    /// The node's lease belongs to someone else and has not expired yet.
    #[error("can't update valid lease on node {node} held by different owner {holder}")]
    LeaseHeldByOther { node: String, holder: String },

    /// Writing a lease that this controller already held was rejected.
    #[error("failed to extend lease on node {node} owned by us: {source}")]
    OwnedLeaseUpdateFailed {
        node: String,
        #[source]
        source: kube::Error,
    },

    /// Draining the control-plane node would break the etcd quorum.
    #[error("can not put master node {0} into maintenance at this moment, it would violate the master quorum")]
    QuorumViolation(String),

    /// Pods could not be removed from the node.
    #[error("not all pods evicted: {source}")]
    Drain {
        #[from]
        source: DrainError,
    },
}

impl Error {
    /// Returns true if the error means a lease we already held slipped
    /// out of our hands.
    pub fn ownership_failed(&self) -> bool {
        matches!(self, Error::OwnedLeaseUpdateFailed { .. })
    }
}
