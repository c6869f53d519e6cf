use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// What this process knows about its ownership of one node.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct OwnershipState {
    /// We have held the node's lease since maintenance started.
    pub owned: bool,
}

/// Ownership tracking for a single node. Reconcile passes for the node
/// take the state lock for the duration of their lease work.
#[derive(Debug)]
pub struct NodeOwnership {
    pub node_name: String,
    pub state: tokio::sync::Mutex<OwnershipState>,
}

/// Process-local table of the nodes this controller is maintaining.
///
/// The map lock is only held to look up, insert or remove an entry, never
/// while talking to the cluster.
#[derive(Debug, Default)]
pub struct OwnershipRegistry {
    nodes: Mutex<HashMap<String, Arc<NodeOwnership>>>,
}

impl OwnershipRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the node's entry, creating it on first use.
    pub fn entry(&self, node_name: &str) -> Arc<NodeOwnership> {
        let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        nodes
            .entry(node_name.to_owned())
            .or_insert_with(|| {
                Arc::new(NodeOwnership {
                    node_name: node_name.to_owned(),
                    state: Default::default(),
                })
            })
            .clone()
    }

    #[cfg(test)]
    pub fn get(&self, node_name: &str) -> Option<Arc<NodeOwnership>> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_name)
            .cloned()
    }

    /// Forgets the node. Passes still holding its entry keep working on
    /// the detached copy.
    pub fn release(&self, node_name: &str) -> Option<Arc<NodeOwnership>> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_name)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
