//! Speech-to-text and text-to-speech provider traits and types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::AudioData;

/// Request for transcription
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    /// Raw audio data (16-bit PCM)
    pub audio: AudioData,
    /// Sample rate of the audio
    pub sample_rate: u32,
    /// Optional language hint (ISO 639-1 code, e.g., "en")
    pub language: Option<String>,
    /// Optional prompt to bias recognition, e.g. exercise names
    pub prompt: Option<String>,
}

impl TranscriptionRequest {
    pub fn new(audio: AudioData, sample_rate: u32) -> Self {
        Self {
            audio,
            sample_rate,
            language: None,
            prompt: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

/// Result of a transcription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    /// Confidence score (0.0 - 1.0) if the provider reports one
    pub confidence: Option<f32>,
    pub language: Option<String>,
    /// Duration of audio in milliseconds
    pub duration_ms: u64,
}

/// Request for speech synthesis
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub text: String,
    /// Provider-specific voice name
    pub voice: Option<String>,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: None,
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }
}

/// Synthesized audio (16-bit mono PCM)
#[derive(Debug, Clone)]
pub struct SynthesizedSpeech {
    pub audio: AudioData,
    pub sample_rate: u32,
}

/// A provider that turns audio into text
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Get the provider name
    fn name(&self) -> &'static str;

    async fn transcribe(&self, request: TranscriptionRequest) -> Result<Transcript>;

    /// Check if the provider is configured and ready
    fn is_configured(&self) -> bool;
}

/// A provider that turns text into audio
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    fn name(&self) -> &'static str;

    async fn synthesize(&self, request: SynthesisRequest) -> Result<SynthesizedSpeech>;

    fn is_configured(&self) -> bool;
}
