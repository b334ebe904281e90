//! Resolves spoken exercise names against the user's active library

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::VoiceConfig;
use crate::similarity::{edit_distance, score_candidate};
use crate::types::Exercise;

/// A scored library entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub exercise: Exercise,
    pub score: f64,
}

/// Outcome of matching a spoken name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchResult {
    Matched { exercise: Exercise, score: f64 },
    /// Ordered by descending score; never empty
    Ambiguous { candidates: Vec<MatchCandidate> },
    Unmatched,
}

impl MatchResult {
    pub fn is_matched(&self) -> bool {
        matches!(self, Self::Matched { .. })
    }
}

/// Lowercase, strip punctuation, collapse whitespace
pub fn normalize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .to_lowercase();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fuzzy matcher with the ambiguity policy applied on top of raw scores
#[derive(Debug, Clone)]
pub struct EntityMatcher {
    threshold: f64,
    matched_min_score: f64,
    tie_band: f64,
    max_candidates: usize,
}

impl Default for EntityMatcher {
    fn default() -> Self {
        Self::from_config(&VoiceConfig::default())
    }
}

impl EntityMatcher {
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self {
            threshold: config.match_threshold,
            matched_min_score: config.matched_min_score,
            tie_band: config.tie_band,
            max_candidates: config.max_ambiguous_candidates,
        }
    }

    /// Match `spoken_name` against the active exercises in `library`
    ///
    /// Archived and suggested exercises are never considered. An exact match on the
    /// normalized name wins outright. Otherwise every candidate above the threshold
    /// within `tie_band` of the best makes the result ambiguous; a lone candidate
    /// must reach `matched_min_score` to be matched, and below that it is offered
    /// back as a single-candidate ambiguity so the user can confirm it.
    pub fn match_exercise(&self, spoken_name: &str, library: &[Exercise]) -> MatchResult {
        let query = normalize_name(spoken_name);
        if query.is_empty() {
            return MatchResult::Unmatched;
        }

        let mut scored: Vec<(f64, usize, String, &Exercise)> = Vec::new();
        for exercise in library.iter().filter(|e| e.is_active()) {
            let name = normalize_name(&exercise.name);
            if name == query {
                debug!("Exact exercise match for '{}': {}", spoken_name, exercise.name);
                return MatchResult::Matched {
                    exercise: exercise.clone(),
                    score: 1.0,
                };
            }

            let score = score_candidate(&query, &name);
            if score > self.threshold {
                scored.push((score, edit_distance(&query, &name), name, exercise));
            }
        }

        if scored.is_empty() {
            debug!("No exercise cleared threshold for '{}'", spoken_name);
            return MatchResult::Unmatched;
        }

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        let best_score = scored[0].0;
        let contenders: Vec<MatchCandidate> = scored
            .iter()
            .filter(|(score, ..)| best_score - score <= self.tie_band)
            .take(self.max_candidates)
            .map(|(score, _, _, exercise)| MatchCandidate {
                exercise: (*exercise).clone(),
                score: *score,
            })
            .collect();

        if contenders.len() == 1 && best_score >= self.matched_min_score {
            let exercise = scored[0].3.clone();
            debug!(
                "Matched '{}' to {} (score {:.2})",
                spoken_name, exercise.name, best_score
            );
            return MatchResult::Matched {
                exercise,
                score: best_score,
            };
        }

        debug!(
            "Ambiguous match for '{}': {} candidates",
            spoken_name,
            contenders.len()
        );
        MatchResult::Ambiguous {
            candidates: contenders,
        }
    }
}
