//! Source block implementations
//!
//! Source blocks are the entry points of a design: every workload request is
//! handed to them first.

pub mod schema;

pub use schema::SchemaBlock;
