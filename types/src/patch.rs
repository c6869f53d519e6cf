use crate::maintenance::*;

/// Resources whose status can be edited in place before being written
/// back through the status subresource.
pub trait Object<S: Default> {
    /// Returns the status object, creating an empty one if missing.
    fn mut_status(&mut self) -> &mut S;
}

impl Object<NodeMaintenanceStatus> for NodeMaintenance {
    fn mut_status(&mut self) -> &mut NodeMaintenanceStatus {
        self.status.get_or_insert_with(Default::default)
    }
}
