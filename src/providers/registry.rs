//! Capability-typed provider registry with a single fallback

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Error, Result};

use super::{
    SpeechToText, SynthesisRequest, SynthesizedSpeech, TextToSpeech, Transcript,
    TranscriptionRequest,
};

/// Number of providers tried per request: the primary and one fallback
const MAX_ATTEMPTS: usize = 2;

/// Holds speech providers by capability, in registration order
///
/// The first configured provider of a capability is the primary; the next one is
/// its fallback.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    stt: Vec<Arc<dyn SpeechToText>>,
    tts: Vec<Arc<dyn TextToSpeech>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_stt(&mut self, provider: Arc<dyn SpeechToText>) -> &mut Self {
        info!("Registered speech-to-text provider {}", provider.name());
        self.stt.push(provider);
        self
    }

    pub fn register_tts(&mut self, provider: Arc<dyn TextToSpeech>) -> &mut Self {
        info!("Registered text-to-speech provider {}", provider.name());
        self.tts.push(provider);
        self
    }

    /// Register a provider for both capabilities
    pub fn register_duplex<P>(&mut self, provider: Arc<P>) -> &mut Self
    where
        P: SpeechToText + TextToSpeech + 'static,
    {
        self.register_stt(provider.clone());
        self.register_tts(provider)
    }

    pub fn has_stt(&self) -> bool {
        self.stt.iter().any(|p| p.is_configured())
    }

    pub fn has_tts(&self) -> bool {
        self.tts.iter().any(|p| p.is_configured())
    }

    /// Transcribe with the primary provider, falling back once
    pub async fn transcribe(&self, request: TranscriptionRequest) -> Result<Transcript> {
        let providers: Vec<_> = self
            .stt
            .iter()
            .filter(|p| p.is_configured())
            .take(MAX_ATTEMPTS)
            .cloned()
            .collect();
        if providers.is_empty() {
            return Err(Error::ProviderNotConfigured(
                "no speech-to-text provider".to_string(),
            ));
        }

        let mut last_error = String::new();
        for (attempt, provider) in providers.iter().enumerate() {
            match provider.transcribe(request.clone()).await {
                Ok(transcript) => {
                    if attempt > 0 {
                        info!("Fallback provider {} transcribed audio", provider.name());
                    }
                    return Ok(transcript);
                }
                Err(e) => {
                    warn!("Transcription with {} failed: {}", provider.name(), e);
                    last_error = e.to_string();
                }
            }
        }
        Err(Error::Provider(format!("transcription failed: {last_error}")))
    }

    /// Synthesize with the primary provider, falling back once
    pub async fn synthesize(&self, request: SynthesisRequest) -> Result<SynthesizedSpeech> {
        let providers: Vec<_> = self
            .tts
            .iter()
            .filter(|p| p.is_configured())
            .take(MAX_ATTEMPTS)
            .cloned()
            .collect();
        if providers.is_empty() {
            return Err(Error::ProviderNotConfigured(
                "no text-to-speech provider".to_string(),
            ));
        }

        let mut last_error = String::new();
        for (attempt, provider) in providers.iter().enumerate() {
            match provider.synthesize(request.clone()).await {
                Ok(speech) => {
                    if attempt > 0 {
                        info!("Fallback provider {} synthesized speech", provider.name());
                    }
                    return Ok(speech);
                }
                Err(e) => {
                    warn!("Synthesis with {} failed: {}", provider.name(), e);
                    last_error = e.to_string();
                }
            }
        }
        Err(Error::Provider(format!("synthesis failed: {last_error}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedStt {
        name: &'static str,
        fail: bool,
        configured: bool,
        calls: AtomicUsize,
    }

    impl ScriptedStt {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                configured: true,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SpeechToText for ScriptedStt {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn transcribe(&self, _request: TranscriptionRequest) -> Result<Transcript> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Provider(format!("{} down", self.name)));
            }
            Ok(Transcript {
                text: self.name.to_string(),
                confidence: Some(0.9),
                language: None,
                duration_ms: 0,
            })
        }

        fn is_configured(&self) -> bool {
            self.configured
        }
    }

    fn request() -> TranscriptionRequest {
        TranscriptionRequest::new(vec![0; 320], 16000)
    }

    #[tokio::test]
    async fn test_primary_used_when_healthy() {
        let primary = ScriptedStt::new("primary", false);
        let fallback = ScriptedStt::new("fallback", false);
        let mut registry = ProviderRegistry::new();
        registry.register_stt(primary.clone()).register_stt(fallback.clone());

        let transcript = registry.transcribe(request()).await.unwrap();
        assert_eq!(transcript.text, "primary");
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_falls_back_exactly_once() {
        let primary = ScriptedStt::new("primary", true);
        let fallback = ScriptedStt::new("fallback", true);
        let third = ScriptedStt::new("third", false);
        let mut registry = ProviderRegistry::new();
        registry
            .register_stt(primary.clone())
            .register_stt(fallback.clone())
            .register_stt(third.clone());

        let err = registry.transcribe(request()).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fallback_success() {
        let mut registry = ProviderRegistry::new();
        registry
            .register_stt(ScriptedStt::new("primary", true))
            .register_stt(ScriptedStt::new("fallback", false));
        assert_eq!(registry.transcribe(request()).await.unwrap().text, "fallback");
    }

    #[tokio::test]
    async fn test_missing_capability() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.transcribe(request()).await,
            Err(Error::ProviderNotConfigured(_))
        ));
        assert!(matches!(
            registry.synthesize(SynthesisRequest::new("hi")).await,
            Err(Error::ProviderNotConfigured(_))
        ));
        assert!(!registry.has_tts());
    }

    #[tokio::test]
    async fn test_unconfigured_providers_skipped() {
        let idle = Arc::new(ScriptedStt {
            name: "idle",
            fail: false,
            configured: false,
            calls: AtomicUsize::new(0),
        });
        let mut registry = ProviderRegistry::new();
        registry
            .register_stt(idle.clone())
            .register_stt(ScriptedStt::new("ready", false));
        assert_eq!(registry.transcribe(request()).await.unwrap().text, "ready");
        assert_eq!(idle.calls.load(Ordering::SeqCst), 0);
    }
}
