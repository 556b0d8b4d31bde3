//! Canonical Store
//!
//! In-memory view of the durable mapping table, published as an immutable
//! [`Snapshot`] behind an `Arc`. Readers clone the `Arc` and work on that
//! snapshot without further locking. `promote` and `reload` build a new
//! snapshot off to the side and swap the pointer; they are serialized with
//! each other by a dedicated mutex that readers never touch.

use crate::canonical::fuzzy::FuzzyMatcher;
use crate::canonical::repository::{CanonicalMapping, MappingRepository, UpsertOutcome};
use crate::canonical::vocabulary::VocabularySource;
use crate::config::NqlConfig;
use crate::error::{NqlError, Result, Suggestion};
use crate::observability;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Wildcard that marks a value as a LIKE pattern.
pub const WILDCARD: char = '%';

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub canonical: String,
    pub score: f64,
    pub version: i64,
}

/// Lookup state of one `(dimension, synonym)` key.
#[derive(Debug, Clone, PartialEq)]
pub enum MappingState {
    NotFound,
    Found(MappingEntry),
}

/// How a filter value was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// A promoted mapping rewrote the value.
    Canonical,
    /// The value matched a raw dimension value case-insensitively.
    Vocabulary,
    /// The value is a LIKE pattern and was left untouched.
    LikeBypass,
    /// Nothing matched; see `suggestions`.
    Unresolved,
}

/// Canonicalization result for one filter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFilter {
    pub dimension: String,
    pub original: String,
    /// Value to bind: the canonical form when resolved, else the original.
    pub value: String,
    pub canonicalization_applied: bool,
    pub like_bypass: bool,
    pub resolution: Resolution,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<Suggestion>,
}

impl ResolvedFilter {
    pub fn like_bypass(dimension: &str, raw: &str) -> Self {
        Self {
            dimension: dimension.to_string(),
            original: raw.to_string(),
            value: raw.to_string(),
            canonicalization_applied: false,
            like_bypass: true,
            resolution: Resolution::LikeBypass,
            suggestions: Vec::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution != Resolution::Unresolved
    }
}

/// Candidate returned by [`CanonicalStore::search`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalCandidate {
    pub candidate: String,
    pub score: f64,
    pub canonical: Option<String>,
}

/// Immutable mapping table at one global version.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    version: i64,
    entries: HashMap<(String, String), MappingEntry>,
    /// Promoted spellings per dimension, for candidate pools.
    synonyms: HashMap<String, Vec<String>>,
}

impl Snapshot {
    pub fn from_mappings(version: i64, mappings: Vec<CanonicalMapping>) -> Self {
        let mut snapshot = Snapshot { version, ..Default::default() };
        for mapping in mappings {
            snapshot.insert(mapping);
        }
        snapshot
    }

    fn insert(&mut self, mapping: CanonicalMapping) {
        let normalized = normalize(&mapping.synonym);
        let spellings = self.synonyms.entry(mapping.dimension.clone()).or_default();
        spellings.retain(|s| normalize(s) != normalized);
        spellings.push(mapping.synonym);
        let key = (mapping.dimension, normalized);
        self.entries.insert(
            key,
            MappingEntry { canonical: mapping.canonical, score: mapping.score, version: mapping.version },
        );
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self, dimension: &str, synonym: &str) -> MappingState {
        match self.entries.get(&(dimension.to_string(), normalize(synonym))) {
            Some(entry) => MappingState::Found(entry.clone()),
            None => MappingState::NotFound,
        }
    }

    /// Promoted synonyms and canonical values for `dimension`.
    pub fn known_values(&self, dimension: &str) -> Vec<String> {
        let mut values: Vec<String> = self.synonyms.get(dimension).cloned().unwrap_or_default();
        let mut canonicals: Vec<String> = self
            .entries
            .iter()
            .filter(|((dim, _), _)| dim == dimension)
            .map(|(_, entry)| entry.canonical.clone())
            .collect();
        canonicals.sort();
        values.extend(canonicals);
        values
    }
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Tunables for the store, usually taken from [`NqlConfig`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub fuzzy_threshold: f64,
    pub max_suggestions: usize,
    pub max_vocabulary: usize,
    pub io_timeout: Duration,
    pub max_staleness: Option<Duration>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from_config(&NqlConfig::default())
    }
}

impl StoreOptions {
    pub fn from_config(config: &NqlConfig) -> Self {
        Self {
            fuzzy_threshold: config.fuzzy_threshold,
            max_suggestions: config.max_suggestions,
            max_vocabulary: config.max_vocabulary,
            io_timeout: config.store_timeout,
            max_staleness: config.max_staleness,
        }
    }
}

struct Inner {
    repo: MappingRepository,
    snapshot: RwLock<Arc<Snapshot>>,
    /// Serializes promote/reload. Never taken by readers.
    writer: Mutex<()>,
    vocabulary: Arc<dyn VocabularySource>,
    matcher: FuzzyMatcher,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
    /// Millisecond timestamp of the last confirmation that the snapshot is current.
    confirmed_at_ms: AtomicI64,
}

#[derive(Clone)]
pub struct CanonicalStore {
    inner: Arc<Inner>,
}

impl CanonicalStore {
    pub fn open(
        repo: MappingRepository,
        vocabulary: Arc<dyn VocabularySource>,
        options: StoreOptions,
    ) -> Result<Self> {
        Self::open_with_clock(repo, vocabulary, options, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        repo: MappingRepository,
        vocabulary: Arc<dyn VocabularySource>,
        options: StoreOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let (version, mappings) = repo.load_all()?;
        let snapshot = Snapshot::from_mappings(version, mappings);
        info!(version, mappings = snapshot.len(), "Canonical store loaded");
        let now_ms = clock.now().timestamp_millis();
        Ok(Self {
            inner: Arc::new(Inner {
                repo,
                snapshot: RwLock::new(Arc::new(snapshot)),
                writer: Mutex::new(()),
                vocabulary,
                matcher: FuzzyMatcher::new(options.fuzzy_threshold, 10),
                clock,
                options,
                confirmed_at_ms: AtomicI64::new(now_ms),
            }),
        })
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    /// Current published snapshot.
    pub fn snapshot(&self) -> Result<Arc<Snapshot>> {
        self.inner
            .snapshot
            .read()
            .map(|guard| Arc::clone(&*guard))
            .map_err(|_| NqlError::unavailable("canonical snapshot lock poisoned"))
    }

    /// Version of the published snapshot.
    pub fn version(&self) -> Result<i64> {
        Ok(self.snapshot()?.version())
    }

    /// Version as persisted in durable storage.
    pub fn durable_version(&self) -> Result<i64> {
        self.inner.repo.current_version()
    }

    fn publish(&self, next: Snapshot) -> Result<()> {
        let mut guard = self
            .inner
            .snapshot
            .write()
            .map_err(|_| NqlError::unavailable("canonical snapshot lock poisoned"))?;
        *guard = Arc::new(next);
        Ok(())
    }

    /// Record that the snapshot was just confirmed against durable storage.
    pub fn mark_fresh(&self) {
        let now = self.inner.clock.now().timestamp_millis();
        self.inner.confirmed_at_ms.store(now, Ordering::Release);
    }

    fn ensure_fresh(&self) -> Result<()> {
        let Some(tolerance) = self.inner.options.max_staleness else {
            return Ok(());
        };
        let confirmed = self.inner.confirmed_at_ms.load(Ordering::Acquire);
        let age_ms = self.inner.clock.now().timestamp_millis().saturating_sub(confirmed);
        if age_ms > i64::try_from(tolerance.as_millis()).unwrap_or(i64::MAX) {
            return Err(NqlError::unavailable(format!(
                "canonical snapshot not confirmed for {} ms (tolerance {} ms)",
                age_ms,
                tolerance.as_millis()
            )));
        }
        Ok(())
    }

    /// Resolve one filter value.
    ///
    /// Blocks on durable storage and the vocabulary source without a time
    /// bound. Request paths go through [`lookup_with_timeout`](Self::lookup_with_timeout).
    pub fn lookup(&self, dimension: &str, raw_value: &str) -> Result<ResolvedFilter> {
        self.ensure_fresh()?;
        if raw_value.contains(WILDCARD) {
            return Ok(ResolvedFilter::like_bypass(dimension, raw_value));
        }

        let snapshot = self.snapshot()?;
        if let MappingState::Found(entry) = snapshot.state(dimension, raw_value) {
            return Ok(ResolvedFilter {
                dimension: dimension.to_string(),
                original: raw_value.to_string(),
                value: entry.canonical,
                canonicalization_applied: true,
                like_bypass: false,
                resolution: Resolution::Canonical,
                suggestions: Vec::new(),
            });
        }

        if let Some(spelling) = self.inner.vocabulary.find_value(dimension, raw_value)? {
            return Ok(ResolvedFilter {
                dimension: dimension.to_string(),
                original: raw_value.to_string(),
                value: spelling,
                canonicalization_applied: false,
                like_bypass: false,
                resolution: Resolution::Vocabulary,
                suggestions: Vec::new(),
            });
        }

        let vocabulary = self
            .inner
            .vocabulary
            .distinct_values(dimension, self.inner.options.max_vocabulary)?;
        let pool = merge_candidates(vocabulary, snapshot.known_values(dimension));
        let suggestions: Vec<Suggestion> = self
            .inner
            .matcher
            .rank(raw_value, &pool)
            .into_iter()
            .take(self.inner.options.max_suggestions)
            .map(|m| Suggestion { candidate: m.candidate, score: m.score })
            .collect();
        observability::record_resolution_miss(dimension, raw_value, suggestions.len());
        Ok(ResolvedFilter {
            dimension: dimension.to_string(),
            original: raw_value.to_string(),
            value: raw_value.to_string(),
            canonicalization_applied: false,
            like_bypass: false,
            resolution: Resolution::Unresolved,
            suggestions,
        })
    }

    /// Ranked candidates for an administrative search. Unbounded like [`lookup`](Self::lookup).
    pub fn search(&self, dimension: &str, token: &str) -> Result<Vec<CanonicalCandidate>> {
        if token.trim().is_empty() {
            return Ok(Vec::new());
        }
        let snapshot = self.snapshot()?;
        let vocabulary = self
            .inner
            .vocabulary
            .distinct_values(dimension, self.inner.options.max_vocabulary)?;
        let pool = merge_candidates(vocabulary, snapshot.known_values(dimension));
        Ok(self
            .inner
            .matcher
            .rank(token, &pool)
            .into_iter()
            .map(|m| {
                let canonical = match snapshot.state(dimension, &m.candidate) {
                    MappingState::Found(entry) => Some(entry.canonical),
                    MappingState::NotFound => None,
                };
                CanonicalCandidate { candidate: m.candidate, score: m.score.clamp(0.0, 1.0), canonical }
            })
            .collect())
    }

    /// Upsert a mapping, bump the global version and publish a new snapshot.
    ///
    /// When durable storage moved past the published snapshot before this
    /// write, the whole table is reloaded instead of patching the snapshot.
    pub fn promote(
        &self,
        dimension: &str,
        synonym: &str,
        canonical: &str,
        score: Option<f64>,
        promoted_by: Option<&str>,
    ) -> Result<UpsertOutcome> {
        for (name, value) in [("dimension", dimension), ("synonym", synonym), ("canonical", canonical)] {
            if value.trim().is_empty() {
                return Err(NqlError::InvalidPromotion(format!("{} must not be empty", name)));
            }
        }
        let score = score.unwrap_or(1.0);
        if !(0.0..=1.0).contains(&score) {
            return Err(NqlError::InvalidPromotion(format!("score {} outside [0, 1]", score)));
        }
        let promoted_by = promoted_by.filter(|p| !p.trim().is_empty()).unwrap_or("admin");

        let _writer = self
            .inner
            .writer
            .lock()
            .map_err(|_| NqlError::unavailable("canonical writer lock poisoned"))?;
        let promoted_at = self.inner.clock.now();
        let outcome = self
            .inner
            .repo
            .upsert(dimension, synonym, canonical, score, promoted_by, promoted_at)?;

        let current = self.snapshot()?;
        if outcome.version() == current.version() + 1 {
            let mut next = (*current).clone();
            next.insert(CanonicalMapping {
                dimension: dimension.to_string(),
                synonym: synonym.trim().to_string(),
                canonical: canonical.to_string(),
                score,
                promoted_by: promoted_by.to_string(),
                promoted_at,
                version: outcome.version(),
            });
            next.version = outcome.version();
            self.publish(next)?;
        } else {
            let (version, mappings) = self.inner.repo.load_all()?;
            debug!(
                published = current.version(),
                durable = version,
                "Durable mappings moved ahead, reloading after promotion"
            );
            if version >= current.version() {
                self.publish(Snapshot::from_mappings(version, mappings))?;
                self.mark_fresh();
            }
        }

        observability::record_promotion(dimension, synonym, &outcome);
        Ok(outcome)
    }

    /// Re-read every mapping from durable storage and publish it.
    ///
    /// The published version never goes backwards: a load older than the
    /// current snapshot is discarded.
    pub fn reload(&self) -> Result<i64> {
        let _writer = self
            .inner
            .writer
            .lock()
            .map_err(|_| NqlError::unavailable("canonical writer lock poisoned"))?;
        let (version, mappings) = self.inner.repo.load_all()?;
        let current = self.snapshot()?.version();
        if version < current {
            debug!(version, current, "Discarding stale canonical reload");
            return Ok(current);
        }
        let snapshot = Snapshot::from_mappings(version, mappings);
        let count = snapshot.len();
        self.publish(snapshot)?;
        self.mark_fresh();
        info!(version, mappings = count, "Canonical store reloaded");
        Ok(version)
    }

    async fn bounded<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(CanonicalStore) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        let timeout = self.inner.options.io_timeout;
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || f(store))).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(NqlError::unavailable(format!(
                "{} task failed: {}",
                operation, join_error
            ))),
            Err(_) => Err(NqlError::unavailable(format!(
                "{} timed out after {} ms",
                operation,
                timeout.as_millis()
            ))),
        }
    }

    /// [`lookup`](Self::lookup) bounded by the store timeout.
    pub async fn lookup_with_timeout(&self, dimension: &str, raw_value: &str) -> Result<ResolvedFilter> {
        let (dimension, raw_value) = (dimension.to_string(), raw_value.to_string());
        self.bounded("lookup", move |store| store.lookup(&dimension, &raw_value)).await
    }

    pub async fn search_with_timeout(&self, dimension: &str, token: &str) -> Result<Vec<CanonicalCandidate>> {
        let (dimension, token) = (dimension.to_string(), token.to_string());
        self.bounded("search", move |store| store.search(&dimension, &token)).await
    }

    pub async fn reload_with_timeout(&self) -> Result<i64> {
        self.bounded("reload", |store| store.reload()).await
    }

    pub async fn durable_version_with_timeout(&self) -> Result<i64> {
        self.bounded("version poll", |store| store.durable_version()).await
    }
}

/// Raw values first, then promoted spellings, without case-insensitive duplicates.
fn merge_candidates(vocabulary: Vec<String>, known: Vec<String>) -> Vec<String> {
    let mut merged: Vec<String> = vocabulary.into_iter().chain(known).collect();
    dedup_case_insensitive(&mut merged);
    merged
}

fn dedup_case_insensitive(values: &mut Vec<String>) {
    let mut seen = HashSet::new();
    values.retain(|v| seen.insert(normalize(v)));
}
