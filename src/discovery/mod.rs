//! Plan discovery from the deployment repository layout

pub mod plan;
pub mod tracker;

pub use plan::{Plan, Step, Track};
pub use tracker::DirectoryTracker;
