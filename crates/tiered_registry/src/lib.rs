//! TIERED Registry
//!
//! Read contract for function metadata and code, plus an in-memory store
//! that keeps every deployed version as an immutable snapshot.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod store;

pub use store::{FunctionStore, MemoryStore, StoreStats};
