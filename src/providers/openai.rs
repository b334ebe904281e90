//! OpenAI provider for Whisper transcription and speech synthesis

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::storage::{SETTING_OPENAI_API_KEY, Storage};

use super::{
    SpeechToText, SynthesisRequest, SynthesizedSpeech, TextToSpeech, Transcript,
    TranscriptionRequest,
};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// The speech endpoint returns raw 24kHz 16-bit mono PCM
const TTS_SAMPLE_RATE: u32 = 24_000;

/// OpenAI audio provider, usable for both speech-to-text and text-to-speech
pub struct OpenAISpeechProvider {
    client: Client,
    api_key: Option<String>,
    stt_model: String,
    tts_model: String,
    voice: String,
}

impl OpenAISpeechProvider {
    /// Create a new provider (API key loaded from environment if not provided)
    pub fn new(api_key: Option<String>) -> Self {
        let key = api_key.or_else(|| std::env::var("OPENAI_API_KEY").ok());

        Self {
            client: Client::new(),
            api_key: key,
            stt_model: "whisper-1".to_string(),
            tts_model: "tts-1".to_string(),
            voice: "alloy".to_string(),
        }
    }

    /// Use the API key saved in the settings table, or the environment
    pub fn from_storage(storage: &Storage) -> Result<Self> {
        Ok(Self::new(storage.get_setting(SETTING_OPENAI_API_KEY)?))
    }

    pub fn with_stt_model(mut self, model: impl Into<String>) -> Self {
        self.stt_model = model.into();
        self
    }

    pub fn with_tts_model(mut self, model: impl Into<String>) -> Self {
        self.tts_model = model.into();
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| Error::ProviderNotConfigured("OpenAI API key not set".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct WhisperResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    avg_logprob: Option<f64>,
}

#[derive(Debug, Serialize)]
struct SpeechBody<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

/// Mean per-segment token probability, as a 0..1 confidence
fn confidence_from_segments(segments: &[WhisperSegment]) -> Option<f32> {
    let logprobs: Vec<f64> = segments.iter().filter_map(|s| s.avg_logprob).collect();
    if logprobs.is_empty() {
        return None;
    }
    let mean = logprobs.iter().sum::<f64>() / logprobs.len() as f64;
    Some(mean.exp().clamp(0.0, 1.0) as f32)
}

#[async_trait]
impl SpeechToText for OpenAISpeechProvider {
    fn name(&self) -> &'static str {
        "OpenAI Whisper"
    }

    async fn transcribe(&self, request: TranscriptionRequest) -> Result<Transcript> {
        let api_key = self.api_key()?;

        // convert PCM to WAV format for the API
        let wav_data = pcm_to_wav(&request.audio, request.sample_rate, 1);

        let file_part = reqwest::multipart::Part::bytes(wav_data)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| Error::Provider(format!("Failed to create form part: {e}")))?;

        // verbose_json carries per-segment log probabilities
        let mut form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("model", self.stt_model.clone())
            .text("response_format", "verbose_json");

        if let Some(lang) = &request.language {
            form = form.text("language", lang.clone());
        }

        if let Some(prompt) = &request.prompt {
            form = form.text("prompt", prompt.clone());
        }

        debug!("Sending transcription request to OpenAI Whisper");

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", OPENAI_API_BASE))
            .header("Authorization", format!("Bearer {}", api_key))
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("Whisper API error: {} - {}", status, error_text);
            return Err(Error::Provider(format!(
                "Whisper API error: {} - {}",
                status, error_text
            )));
        }

        let whisper: WhisperResponse = response.json().await?;

        let duration_ms = whisper
            .duration
            .map(|d| (d * 1000.0) as u64)
            .unwrap_or_else(|| {
                // PCM 16-bit mono at sample_rate
                let samples = request.audio.len() / 2;
                (samples as u64 * 1000) / u64::from(request.sample_rate.max(1))
            });

        Ok(Transcript {
            text: whisper.text.trim().to_string(),
            confidence: confidence_from_segments(&whisper.segments),
            language: whisper.language,
            duration_ms,
        })
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl TextToSpeech for OpenAISpeechProvider {
    fn name(&self) -> &'static str {
        "OpenAI Speech"
    }

    async fn synthesize(&self, request: SynthesisRequest) -> Result<SynthesizedSpeech> {
        let api_key = self.api_key()?;
        let body = SpeechBody {
            model: &self.tts_model,
            input: &request.text,
            voice: request.voice.as_deref().unwrap_or(&self.voice),
            response_format: "pcm",
        };

        debug!("Sending speech request to OpenAI ({} chars)", request.text.len());

        let response = self
            .client
            .post(format!("{}/audio/speech", OPENAI_API_BASE))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("Speech API error: {} - {}", status, error_text);
            return Err(Error::Provider(format!(
                "Speech API error: {} - {}",
                status, error_text
            )));
        }

        let audio = response.bytes().await?.to_vec();
        Ok(SynthesizedSpeech {
            audio,
            sample_rate: TTS_SAMPLE_RATE,
        })
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Wrap raw 16-bit PCM in a WAV header
fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let bits_per_sample: u16 = 16;
    let byte_rate = sample_rate * u32::from(channels) * u32::from(bits_per_sample) / 8;
    let block_align = channels * bits_per_sample / 8;
    let data_size = pcm.len() as u32;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_size).to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());

    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_size.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_to_wav_header() {
        let pcm = vec![0u8; 3200];
        let wav = pcm_to_wav(&pcm, 16000, 1);
        assert_eq!(wav.len(), 44 + 3200);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 16000);
        assert_eq!(u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]), 3200);
    }

    #[test]
    fn test_confidence_from_segments() {
        assert_eq!(confidence_from_segments(&[]), None);
        let segments = vec![
            WhisperSegment {
                avg_logprob: Some(0.0),
            },
            WhisperSegment { avg_logprob: None },
        ];
        assert_eq!(confidence_from_segments(&segments), Some(1.0));

        let segments = vec![WhisperSegment {
            avg_logprob: Some(-0.5),
        }];
        let confidence = confidence_from_segments(&segments).unwrap();
        assert!((confidence - 0.6065).abs() < 0.001);
    }

    #[test]
    fn test_unconfigured_without_key() {
        let provider = OpenAISpeechProvider {
            client: Client::new(),
            api_key: None,
            stt_model: "whisper-1".to_string(),
            tts_model: "tts-1".to_string(),
            voice: "alloy".to_string(),
        };
        assert!(!SpeechToText::is_configured(&provider));
        assert!(matches!(provider.api_key(), Err(Error::ProviderNotConfigured(_))));
    }
}
