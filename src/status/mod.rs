//! Status recording collaborator

pub mod sink;

pub use sink::{ExecutionRecord, InMemoryStatusSink, RecordedResult, StatusSink};
