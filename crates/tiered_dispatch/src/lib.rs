//! TIERED Dispatch
//!
//! Routes an invocation to the tier its metadata declares: loaded code,
//! a generative call, an agentic loop, a human task, or a cascade of other
//! functions with per-step fallback. Every tier runs under its own budget
//! and every outcome is reported as a [`DispatchResult`].

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cascade;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod result;
pub mod validate;

pub use config::DispatchConfig;
pub use dispatcher::Dispatcher;
pub use executor::{AgenticExecution, Executors, HumanTask, TaskStatus, TierExecutor, TierResponse};
pub use result::{DispatchBody, DispatchMeta, DispatchResult};
pub use validate::{ensure_valid, validate_input};
