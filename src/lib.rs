//! LiftVoice - voice command core for workout logging
//!
//! Turns spoken utterances into confirmed, persisted workout-log mutations: fuzzy
//! exercise matching, a confirmation state machine for anything ambiguous, and an
//! offline sync queue that keeps the backend eventually consistent.

pub mod config;
pub mod confirmation;
pub mod connectivity;
pub mod error;
pub mod gateway;
pub mod intent;
pub mod matcher;
pub mod numbers;
pub mod pipeline;
pub mod prompts;
pub mod providers;
pub mod session;
pub mod similarity;
pub mod storage;
pub mod sync;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

/// Re-export the main components for convenience
pub use config::VoiceConfig;
pub use confirmation::{ConfirmationMachine, Effect, MachineContext, MachineState, Mutation, PersistOutcome};
pub use connectivity::{ConnectivityProbe, ManualConnectivity};
pub use gateway::{LibraryProvider, PersistenceGateway, RestGateway};
pub use intent::{IntentKind, IntentParser, ParsedIntent, Slots};
pub use matcher::{EntityMatcher, MatchCandidate, MatchResult};
pub use pipeline::{LoopInput, VoiceHandle, VoiceLoop, VoicePipeline, VoiceResponse};
pub use providers::{OpenAISpeechProvider, ProviderRegistry, SpeechToText, TextToSpeech};
pub use session::{SessionManager, SessionNotification, SessionObserver, SubscriptionId};
pub use storage::Storage;
pub use sync::{DeadLetter, SyncOp, SyncQueue, SyncQueueItem};
