mod actions;
mod finalizer;
mod reconcile;

#[cfg(feature = "metrics")]
mod metrics;

pub use reconcile::run;

#[cfg(test)]
pub(crate) use reconcile::{on_error, reconcile, ContextData};
