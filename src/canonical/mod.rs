//! Canonical value resolution: durable synonym mappings, the in-memory
//! store built from them, fuzzy suggestions and the background watcher.

pub mod fuzzy;
pub mod repository;
pub mod resolver;
pub mod store;
pub mod vocabulary;
pub mod watcher;

pub use fuzzy::{FuzzyMatch, FuzzyMatcher};
pub use repository::{CanonicalMapping, MappingRepository, UpsertOutcome};
pub use resolver::{FilterResolver, ResolvedFilters, ResolvedPlanFilter, ResolvedValue};
pub use store::{
    CanonicalCandidate, CanonicalStore, Clock, MappingEntry, MappingState, Resolution, ResolvedFilter,
    Snapshot, StoreOptions, SystemClock,
};
pub use vocabulary::{SqliteVocabulary, StaticVocabulary, VocabularySource};
pub use watcher::CanonicalWatcher;
