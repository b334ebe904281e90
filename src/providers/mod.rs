//! Provider abstraction layer for speech services
//!
//! Providers declare their capabilities by the traits they implement; the
//! registry only routes a request to providers of the matching capability.
mod openai;
mod registry;
mod speech;

pub use openai::OpenAISpeechProvider;
pub use registry::ProviderRegistry;
pub use speech::{
    SpeechToText, SynthesisRequest, SynthesizedSpeech, TextToSpeech, Transcript,
    TranscriptionRequest,
};
