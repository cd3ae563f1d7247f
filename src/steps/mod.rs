//! Step backends: the runner contract, the registry, and the terraform CLI
//! implementation

pub mod registry;
pub mod runner;
pub mod terraform;

pub use runner::{ExecContext, Runner, StepOutput, StepStatus, StepTestOutput, VariableMap};
