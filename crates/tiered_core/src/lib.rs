//! TIERED Core Types
//!
//! This crate contains pure types and logic with no I/O.
//! Function metadata, versions and schemas round-trip through the
//! camelCase JSON the platform stores and serves.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod metadata;
pub mod schema;
pub mod version;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use metadata::{
    AgenticSpec, CascadeSpec, CascadeStep, CodeSpec, ErrorHandling, FunctionMetadata,
    GenerativeSpec, HumanSpec, TierKind, TierSpec,
};
pub use schema::{JsonSchema, SchemaType};
pub use version::{Version, VersionError};
