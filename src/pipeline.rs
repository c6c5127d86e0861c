//! Batching, flushing and retry of row inserts.

pub mod batch;
pub mod executor;
pub mod provision;
pub mod queue;
pub mod reader;
pub mod retry;
