//! Per-node leases recording which controller owns the maintenance of a node.
//!
//! Every node in maintenance has a `coordination.k8s.io/v1` Lease named
//! after it. The holder renews the lease well before it expires so that a
//! long drain never outlives it, and another holder may only take the
//! lease over once it has expired. Writes are conditional on the lease's
//! `resourceVersion`; a writer that loses the race reads the lease again
//! and makes its decision anew.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::{
    api::{
        coordination::v1::{Lease, LeaseSpec},
        core::v1::Node,
    },
    apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, OwnerReference},
};
use kube::{Resource, ResourceExt};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

use crate::cluster::{is_already_exists, is_conflict, is_not_found, ClusterClient};
use crate::util::Error;

mod registry;

pub use registry::OwnershipRegistry;

/// Number of times a lease write is retried after a conflict.
const MAX_LEASE_ATTEMPTS: usize = 5;

/// What to do with a lease that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseDecision {
    /// We hold the lease and it is good for long enough.
    Keep,

    /// We hold the lease but it must be renewed. `restamp` also resets the
    /// acquire time and counts a transition.
    Renew { restamp: bool },

    /// The lease belongs to someone else but has expired.
    TakeOver,
}

/// Time at which the lease runs out unless renewed.
pub fn due_time(lease: &Lease) -> Option<DateTime<Utc>> {
    let spec = lease.spec.as_ref()?;
    let renew = spec.renew_time.as_ref()?;
    let seconds = spec.lease_duration_seconds?;
    Some(renew.0 + ChronoDuration::seconds(i64::from(seconds)))
}

/// A lease is valid while it was renewed no later than `now` and is not
/// yet due.
pub fn is_valid(lease: &Lease, now: DateTime<Utc>) -> bool {
    let renew = match lease.spec.as_ref().and_then(|s| s.renew_time.as_ref()) {
        Some(renew) => renew.0,
        None => return false,
    };
    match due_time(lease) {
        Some(due) => renew <= now && due >= now,
        None => false,
    }
}

fn holder_of(lease: &Lease) -> Option<&str> {
    lease.spec.as_ref()?.holder_identity.as_deref()
}

/// Creates, renews and releases node leases on behalf of one holder identity.
pub struct LeaseManager {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    holder_identity: String,
    duration: Duration,
    drain_timeout: Duration,
}

impl LeaseManager {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        holder_identity: impl Into<String>,
        duration: Duration,
        drain_timeout: Duration,
    ) -> Self {
        LeaseManager {
            client,
            namespace: namespace.into(),
            holder_identity: holder_identity.into(),
            duration,
            drain_timeout,
        }
    }

    fn duration_seconds(&self) -> i32 {
        i32::try_from(self.duration.as_secs()).unwrap_or(i32::MAX)
    }

    /// Decides how to treat an existing lease at `now`.
    ///
    /// Fails with [`Error::LeaseHeldByOther`] if someone else holds a lease
    /// that is still valid.
    pub fn decide(&self, lease: &Lease, now: DateTime<Utc>) -> Result<LeaseDecision, Error> {
        match holder_of(lease) {
            Some(holder) if holder == self.holder_identity => Ok(self.decide_owned(lease, now)),
            holder if is_valid(lease, now) => Err(Error::LeaseHeldByOther {
                node: lease.name_any(),
                holder: holder.unwrap_or_default().to_owned(),
            }),
            _ => Ok(LeaseDecision::TakeOver),
        }
    }

    fn decide_owned(&self, lease: &Lease, now: DateTime<Utc>) -> LeaseDecision {
        let due = match due_time(lease) {
            Some(due) => due,
            None => return LeaseDecision::Renew { restamp: true },
        };
        if due < now {
            let acquired = lease
                .spec
                .as_ref()
                .and_then(|s| s.acquire_time.as_ref())
                .is_some();
            return LeaseDecision::Renew { restamp: !acquired };
        }
        let margin = ChronoDuration::milliseconds(self.drain_timeout.as_millis() as i64 * 2);
        if due < now + margin {
            return LeaseDecision::Renew { restamp: false };
        }
        LeaseDecision::Keep
    }

    fn owner_reference(node: &Node) -> OwnerReference {
        OwnerReference {
            api_version: Node::api_version(&()).into_owned(),
            kind: Node::kind(&()).into_owned(),
            name: node.name_any(),
            uid: node.uid().unwrap_or_default(),
            ..Default::default()
        }
    }

    /// Returns `lease` as it should be written for `decision`, or `None`
    /// if nothing needs to be written. Duration and holder are always
    /// restated from configuration.
    pub fn apply(
        &self,
        lease: &Lease,
        decision: LeaseDecision,
        node: &Node,
        now: DateTime<Utc>,
    ) -> Option<Lease> {
        let restamp = match decision {
            LeaseDecision::Keep => return None,
            LeaseDecision::Renew { restamp } => restamp,
            LeaseDecision::TakeOver => true,
        };
        let mut updated = lease.clone();
        updated.metadata.owner_references = Some(vec![Self::owner_reference(node)]);
        let spec = updated.spec.get_or_insert_with(LeaseSpec::default);
        spec.holder_identity = Some(self.holder_identity.clone());
        spec.lease_duration_seconds = Some(self.duration_seconds());
        spec.renew_time = Some(MicroTime(now));
        if restamp {
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }
        Some(updated)
    }

    fn new_lease(&self, node: &Node, now: DateTime<Utc>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(node.name_any()),
                namespace: Some(self.namespace.clone()),
                owner_references: Some(vec![Self::owner_reference(node)]),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.holder_identity.clone()),
                lease_duration_seconds: Some(self.duration_seconds()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
            }),
        }
    }

    /// Makes sure we hold a lease on `node` that stays valid for the next
    /// drain, creating, renewing or taking it over as needed.
    ///
    /// Fails with [`Error::LeaseHeldByOther`] if another holder has a valid
    /// lease, and with [`Error::OwnedLeaseUpdateFailed`] if a lease we
    /// already held could not be renewed.
    pub async fn acquire_or_renew(&self, node: &Node, now: DateTime<Utc>) -> Result<Lease, Error> {
        let name = node.name_any();
        let mut attempt = 1;
        loop {
            let current = match self.client.get_lease(&self.namespace, &name).await {
                Ok(lease) => lease,
                Err(e) if is_not_found(&e) => {
                    match self.client.create_lease(&self.new_lease(node, now)).await {
                        Ok(lease) => {
                            info!(
                                node = %name,
                                holder = %self.holder_identity,
                                "created node lease"
                            );
                            return Ok(lease);
                        }
                        Err(e) if is_already_exists(&e) && attempt < MAX_LEASE_ATTEMPTS => {
                            debug!(node = %name, "lease created concurrently, reading it back");
                            attempt += 1;
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            };

            let decision = self.decide(&current, now)?;
            let updated = match self.apply(&current, decision, node, now) {
                Some(updated) => updated,
                None => return Ok(current),
            };
            match self.client.replace_lease(&updated).await {
                Ok(lease) => {
                    info!(node = %name, ?decision, "updated node lease");
                    return Ok(lease);
                }
                Err(e) if is_conflict(&e) && attempt < MAX_LEASE_ATTEMPTS => {
                    debug!(node = %name, attempt, "lease changed concurrently, retrying");
                    attempt += 1;
                }
                Err(source) if decision != LeaseDecision::TakeOver => {
                    return Err(Error::OwnedLeaseUpdateFailed { node: name, source })
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Clears the temporal fields of the node's lease, keeping the object
    /// itself so the next maintenance reuses it. A missing lease is fine.
    pub async fn invalidate(&self, node_name: &str) -> Result<(), Error> {
        let mut attempt = 1;
        loop {
            let mut lease = match self.client.get_lease(&self.namespace, node_name).await {
                Ok(lease) => lease,
                Err(e) if is_not_found(&e) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            if let Some(spec) = lease.spec.as_mut() {
                if spec.acquire_time.is_none()
                    && spec.renew_time.is_none()
                    && spec.lease_duration_seconds.is_none()
                    && spec.lease_transitions.is_none()
                {
                    return Ok(());
                }
                spec.acquire_time = None;
                spec.renew_time = None;
                spec.lease_duration_seconds = None;
                spec.lease_transitions = None;
            } else {
                return Ok(());
            }
            match self.client.replace_lease(&lease).await {
                Ok(_) => {
                    info!(node = %node_name, "invalidated node lease");
                    return Ok(());
                }
                Err(e) if is_not_found(&e) => return Ok(()),
                Err(e) if is_conflict(&e) && attempt < MAX_LEASE_ATTEMPTS => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }
}
