mod maintenance;
mod patch;

pub use maintenance::*;
pub use patch::*;
