//! Trigram fuzzy matching
//!
//! Strings are trimmed, lowercased and padded with two spaces on each side
//! before being cut into character trigrams. Similarity is the cosine
//! between the two trigram frequency vectors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ranked candidate produced by [`FuzzyMatcher::rank`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzyMatch {
    pub candidate: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct FuzzyMatcher {
    /// Minimum score (0.0-1.0) a candidate needs to be returned
    pub similarity_threshold: f64,
    /// Maximum number of matches returned
    pub limit: usize,
}

impl Default for FuzzyMatcher {
    fn default() -> Self {
        Self { similarity_threshold: 0.75, limit: 10 }
    }
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

fn trigrams(text: &str) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    let normalized = normalize(text);
    if normalized.is_empty() {
        return counts;
    }
    let padded: Vec<char> = format!("  {}  ", normalized).chars().collect();
    for window in padded.windows(3) {
        *counts.entry(window.iter().collect::<String>()).or_insert(0) += 1;
    }
    counts
}

/// Cosine similarity of trigram vectors, in `[0.0, 1.0]`.
pub fn score(query: &str, candidate: &str) -> f64 {
    if normalize(query) == normalize(candidate) && !normalize(query).is_empty() {
        return 1.0;
    }
    let a = trigrams(query);
    let b = trigrams(candidate);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let dot: f64 = a
        .iter()
        .map(|(gram, weight)| (*weight * b.get(gram).copied().unwrap_or(0)) as f64)
        .sum();
    let norm = |v: &HashMap<String, usize>| v.values().map(|w| (w * w) as f64).sum::<f64>().sqrt();
    let denominator = norm(&a) * norm(&b);
    if denominator == 0.0 {
        return 0.0;
    }
    (dot / denominator).clamp(0.0, 1.0)
}

/// First character of every alphanumeric run: "North Hollywood" -> "NH".
fn acronym(text: &str) -> String {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter_map(|part| part.chars().next())
        .collect()
}

impl FuzzyMatcher {
    pub fn new(threshold: f64, limit: usize) -> Self {
        Self { similarity_threshold: threshold, limit }
    }

    /// Score with prefix, substring and acronym boosts on top of the cosine.
    pub fn boosted_score(&self, query: &str, candidate: &str) -> f64 {
        let query_norm = normalize(query);
        if query_norm.is_empty() {
            return 0.0;
        }
        let candidate_norm = normalize(candidate);
        let mut best = score(query, candidate);

        if candidate_norm.starts_with(&query_norm) {
            best = best.max(0.9);
        } else if query_norm.chars().count() >= 3 && candidate_norm.contains(&query_norm) {
            let fraction = (query_norm.len() as f64 / candidate_norm.len().max(1) as f64).min(1.0);
            best = best.max(0.75 + 0.2 * fraction);
        }

        let initials = acronym(candidate).to_lowercase();
        if !initials.is_empty() && initials.starts_with(&query_norm) {
            let fraction = (query_norm.len() as f64 / initials.len() as f64).min(1.0);
            best = best.max(0.85 + 0.15 * fraction);
        }
        best.clamp(0.0, 1.0)
    }

    /// Candidates scoring at least the threshold, best first.
    ///
    /// Ties are ordered by candidate text so results are deterministic.
    pub fn rank<I, S>(&self, query: &str, candidates: I) -> Vec<FuzzyMatch>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut scored: Vec<FuzzyMatch> = candidates
            .into_iter()
            .filter_map(|candidate| {
                let candidate = candidate.as_ref();
                let score = self.boosted_score(query, candidate);
                (score >= self.similarity_threshold)
                    .then(|| FuzzyMatch { candidate: candidate.to_string(), score })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.candidate.cmp(&b.candidate))
        });
        scored.truncate(self.limit);
        scored
    }
}
