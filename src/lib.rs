//! scout-nql
//!
//! Validates NQL query plans against a semantic model, resolves filter
//! values through a versioned canonical synonym store, and compiles the
//! result into one parameterized, read-only SQL statement.

pub mod canonical;
pub mod config;
pub mod error;
pub mod nql;
pub mod observability;
pub mod semantic;
pub mod time_range;

pub use canonical::{CanonicalStore, CanonicalWatcher, FilterResolver, FuzzyMatcher, MappingRepository};
pub use config::NqlConfig;
pub use error::{ErrorKind, NqlError, Result};
pub use nql::{compile, CompileOptions, CompiledQuery, PlanCompiler, PlanValidator, QueryPlan, ValidatedPlan};
pub use semantic::{SemanticModel, SemanticRegistry};
pub use time_range::{RelativeRange, TimeRange};
