//! NQL: the query plan model, its validator and the SQL compiler.

pub mod compiler;
pub mod lineage;
pub mod model;
pub mod sql;
pub mod validator;

pub use compiler::{compile, CompileOptions, CompiledQuery, PlanCompiler};
pub use lineage::{CanonicalizedValue, Lineage};
pub use model::*;
pub use sql::{BindValue, Predicate, Query, Select};
pub use validator::{validate, GroupKey, PlanShape, PlanValidator, ValidatedPlan, ValidationResult};
