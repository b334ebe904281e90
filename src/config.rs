//! Tunable thresholds and timeouts for the voice pipeline

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::storage::{SETTING_VOICE_CONFIG, Storage};

/// Runtime configuration for the voice core
///
/// Every field has a default, so a partial JSON document only overrides what it names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Minimum STT confidence to go straight to a spoken confirmation
    pub confidence_threshold: f32,
    /// Score a candidate name must exceed to be considered at all
    pub match_threshold: f64,
    /// Score a lone candidate needs to count as matched
    pub matched_min_score: f64,
    /// Candidates within this distance of the best are ambiguous
    pub tie_band: f64,
    pub max_ambiguous_candidates: usize,
    /// How many candidates a disambiguation question reads out
    pub max_spoken_candidates: usize,
    pub confirmation_timeout_ms: u64,
    /// Persist instead of abort when the confirmation timer expires
    pub accept_on_timeout: bool,
    /// Read the full set back after the user picks a candidate
    pub confirm_after_disambiguation: bool,
    /// Treat an unrecognized reply to a confirmation as "yes"
    pub implicit_accept: bool,
    /// Unclear replies tolerated before a pending prompt is abandoned
    pub max_reprompts: u32,
    /// Completed sessions older than this are evicted
    pub session_timeout_secs: u64,
    pub default_rest_seconds: u32,
    /// Confidence assumed when a provider reports none
    pub default_stt_confidence: f32,
    /// Reject sets whose exercise needs equipment the user doesn't have
    pub require_available_equipment: bool,
    pub locale: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            match_threshold: 0.6,
            matched_min_score: 0.8,
            tie_band: 0.2,
            max_ambiguous_candidates: 5,
            max_spoken_candidates: 3,
            confirmation_timeout_ms: 8_000,
            accept_on_timeout: false,
            confirm_after_disambiguation: true,
            implicit_accept: false,
            max_reprompts: 2,
            session_timeout_secs: 30 * 60,
            default_rest_seconds: 90,
            default_stt_confidence: 0.9,
            require_available_equipment: true,
            locale: "en-US".to_string(),
        }
    }
}

impl VoiceConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Check that every tunable is in range
    pub fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&(self.confidence_threshold as f64)) {
            return Err(Error::Config(format!(
                "confidence_threshold must be within 0..1, got {}",
                self.confidence_threshold
            )));
        }
        if !unit.contains(&self.match_threshold) || !unit.contains(&self.matched_min_score) {
            return Err(Error::Config(
                "match thresholds must be within 0..1".to_string(),
            ));
        }
        if self.matched_min_score < self.match_threshold {
            return Err(Error::Config(
                "matched_min_score must not be below match_threshold".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.tie_band) {
            return Err(Error::Config("tie_band must be within 0..1".to_string()));
        }
        if self.max_ambiguous_candidates == 0 || self.max_spoken_candidates == 0 {
            return Err(Error::Config(
                "candidate limits must be at least 1".to_string(),
            ));
        }
        if self.confirmation_timeout_ms == 0 {
            return Err(Error::Config(
                "confirmation_timeout_ms must be positive".to_string(),
            ));
        }
        if !unit.contains(&(self.default_stt_confidence as f64)) {
            return Err(Error::Config(
                "default_stt_confidence must be within 0..1".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        info!("Loaded voice config from {}", path.display());
        Ok(config)
    }

    /// Load from the settings table, falling back to defaults when unset
    pub fn from_storage(storage: &Storage) -> Result<Self> {
        match storage.get_setting(SETTING_VOICE_CONFIG)? {
            Some(json) => Self::from_json_str(&json),
            None => {
                debug!("No stored voice config, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Persist to the settings table
    pub fn save_to_storage(&self, storage: &Storage) -> Result<()> {
        self.validate()?;
        storage.set_setting(SETTING_VOICE_CONFIG, &serde_json::to_string(self)?)
    }
}
