//! Text similarity primitives for fuzzy exercise-name matching
//!
//! Pure functions only. Edit distance and Jaro come from `strsim`; the scoring
//! rules used for spoken names (prefix bonus gate, substring scores) live here.

use strsim::{jaro, levenshtein};

/// Default minimum score a candidate must exceed to count as a match
pub const DEFAULT_THRESHOLD: f64 = 0.6;

/// Highest score a substring hit can reach, keeping exact matches on top
const SUBSTRING_SCORE_CAP: f64 = 0.95;

/// Floor for substring hits before the length-ratio bonus is added
const SUBSTRING_BASE_SCORE: f64 = 0.8;

/// Jaro score at which the Winkler prefix bonus starts applying
const PREFIX_BONUS_GATE: f64 = 0.7;

/// Weight per shared leading character (at most four count)
const PREFIX_SCALE: f64 = 0.1;

/// Levenshtein distance, counted in characters and case-sensitive
pub fn edit_distance(a: &str, b: &str) -> usize {
    levenshtein(a, b)
}

/// Normalized edit similarity: `1 - distance / max(len)`, 1.0 for two empty strings
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - edit_distance(a, b) as f64 / max_len as f64
}

/// Jaro-Winkler similarity
///
/// The prefix bonus is only applied once the plain Jaro score reaches 0.7.
pub fn jaro_winkler(a: &str, b: &str) -> f64 {
    let base = jaro(a, b);
    if base < PREFIX_BONUS_GATE {
        return base;
    }

    let prefix = a
        .chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .take(4)
        .count();

    (base + prefix as f64 * PREFIX_SCALE * (1.0 - base)).min(1.0)
}

/// Score a lowercased query against a lowercased candidate
///
/// Exact match scores 1.0, a substring relationship in either direction scores
/// by length ratio (capped below exact), anything else falls back to [`similarity`].
pub fn score_candidate(query: &str, candidate: &str) -> f64 {
    if query == candidate {
        return 1.0;
    }
    if query.is_empty() || candidate.is_empty() {
        return 0.0;
    }

    if candidate.contains(query) || query.contains(candidate) {
        let q_len = query.chars().count() as f64;
        let c_len = candidate.chars().count() as f64;
        let ratio = q_len.min(c_len) / q_len.max(c_len);
        return (SUBSTRING_BASE_SCORE + (1.0 - SUBSTRING_BASE_SCORE) * ratio)
            .min(SUBSTRING_SCORE_CAP);
    }

    similarity(query, candidate)
}

/// Best candidate found by [`find_best_match`]
#[derive(Debug, Clone, PartialEq)]
pub struct BestMatch {
    /// Candidate as it was passed in (original casing)
    pub matched: String,
    /// Index into the candidate slice
    pub index: usize,
    pub score: f64,
}

/// Case-insensitive best match of `query` among `candidates`
///
/// A case-insensitive exact match returns immediately with score 1.0. Otherwise
/// a candidate only replaces the running best if its score exceeds both the best
/// so far and `threshold`. Returns `None` when nothing clears the threshold.
pub fn find_best_match<S: AsRef<str>>(
    query: &str,
    candidates: &[S],
    threshold: f64,
) -> Option<BestMatch> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return None;
    }

    let mut best: Option<BestMatch> = None;

    for (index, candidate) in candidates.iter().enumerate() {
        let candidate = candidate.as_ref();
        let lower = candidate.to_lowercase();

        if lower == query {
            return Some(BestMatch {
                matched: candidate.to_string(),
                index,
                score: 1.0,
            });
        }

        let score = score_candidate(&query, &lower);
        let best_score = best.as_ref().map_or(0.0, |b| b.score);
        if score > best_score && score > threshold {
            best = Some(BestMatch {
                matched: candidate.to_string(),
                index,
                score,
            });
        }
    }

    best
}
