//! Voice pipeline: utterance in, spoken response and persisted mutations out
//!
//! [`VoicePipeline`] wires the confirmation machine to the session manager, the
//! persistence gateway and the speech providers, and carries out the machine's
//! effects. [`VoiceLoop`] drives one pipeline from a single task so utterances,
//! timer expiries and connectivity changes are handled strictly one at a time.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::VoiceConfig;
use crate::confirmation::{ConfirmationMachine, Effect, MachineContext, MachineState, Mutation, PersistOutcome};
use crate::error::{Error, Result};
use crate::gateway::{LibraryProvider, PersistenceGateway};
use crate::prompts;
use crate::providers::{ProviderRegistry, SynthesisRequest, SynthesizedSpeech, TranscriptionRequest};
use crate::session::SessionManager;
use crate::types::{
    AudioData, CommittedSet, Exercise, SessionMetadata, SessionType, SetId, VoiceEvent,
    VoiceEventType, VoiceSession,
};

/// How often the loop evicts expired sessions
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// What the host should present after one input was handled
#[derive(Debug, Clone, Default)]
pub struct VoiceResponse {
    /// Recognized text, when the input was audio
    pub transcript: Option<String>,
    /// Prompts to speak, in order
    pub spoken: Vec<String>,
    /// Synthesized audio for `spoken`, when a TTS provider is registered
    pub audio: Vec<SynthesizedSpeech>,
    /// Outcome of the persist this input triggered, if any
    pub outcome: Option<PersistOutcome>,
    pub state: Option<MachineState>,
    /// Terminal failure, e.g. every speech provider failed
    pub error: Option<String>,
}

impl VoiceResponse {
    fn failed(error: &Error) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

/// Inputs accepted by a running [`VoiceLoop`]
#[derive(Debug)]
pub enum LoopInput {
    Utterance { text: String, confidence: f32 },
    Audio { audio: AudioData, sample_rate: u32 },
    Connectivity(bool),
    ConfirmationTimeout(u64),
    RestElapsed,
    /// Tear the session down and stop the loop
    Cancel,
}

/// The voice pipeline for one user
pub struct VoicePipeline {
    config: VoiceConfig,
    user_id: String,
    sessions: SessionManager,
    machine: ConfirmationMachine,
    registry: ProviderRegistry,
    library: Arc<dyn LibraryProvider>,
    gateway: Arc<dyn PersistenceGateway>,
    exercises: Vec<Exercise>,
    equipment: HashSet<String>,
    library_loaded: bool,
    /// Sets persisted or queued in the current workout, oldest first
    committed: Vec<CommittedSet>,
    synthesize_prompts: bool,
    timers: Option<mpsc::WeakUnboundedSender<LoopInput>>,
    confirmation_timer: Option<JoinHandle<()>>,
    rest_timer: Option<JoinHandle<()>>,
}

impl VoicePipeline {
    pub fn new(
        user_id: impl Into<String>,
        config: VoiceConfig,
        sessions: SessionManager,
        library: Arc<dyn LibraryProvider>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        Self {
            machine: ConfirmationMachine::new(config.clone()),
            config,
            user_id: user_id.into(),
            sessions,
            registry: ProviderRegistry::new(),
            library,
            gateway,
            exercises: Vec::new(),
            equipment: HashSet::new(),
            library_loaded: false,
            committed: Vec::new(),
            synthesize_prompts: false,
            timers: None,
            confirmation_timer: None,
            rest_timer: None,
        }
    }

    /// Use `registry` for audio input, and for spoken output if it has a TTS provider
    pub fn with_providers(mut self, registry: ProviderRegistry) -> Self {
        self.synthesize_prompts = registry.has_tts();
        self.registry = registry;
        self
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn state(&self) -> MachineState {
        self.machine.state()
    }

    pub fn committed_sets(&self) -> &[CommittedSet] {
        &self.committed
    }

    pub fn exercises(&self) -> &[Exercise] {
        &self.exercises
    }

    /// Reload active exercises and available equipment
    pub async fn refresh_library(&mut self) -> Result<()> {
        let (exercises, equipment) = futures::try_join!(
            self.library.active_exercises(&self.user_id),
            self.library.available_equipment(&self.user_id),
        )?;
        self.exercises = exercises.into_iter().filter(Exercise::is_active).collect();
        self.equipment = equipment;
        self.library_loaded = true;
        info!(
            "Loaded {} exercises and {} equipment items",
            self.exercises.len(),
            self.equipment.len()
        );
        Ok(())
    }

    /// Start a workout session directly, outside of a spoken command
    pub fn start_workout(&mut self) -> VoiceSession {
        let workout_id = Uuid::new_v4().to_string();
        let metadata = SessionMetadata::for_user(&self.user_id)
            .with_workout(workout_id)
            .with_locale(&self.config.locale);
        self.committed.clear();
        self.sessions.start_session(SessionType::Workout, metadata)
    }

    /// Handle one recognized utterance to completion
    pub async fn handle_utterance(&mut self, text: &str, stt_confidence: f32) -> VoiceResponse {
        if !self.library_loaded {
            if let Err(e) = self.refresh_library().await {
                warn!("Exercise library unavailable: {}", e);
            }
        }
        self.ensure_session();

        let workout_id = self.workout_id();
        let ctx = MachineContext {
            library: &self.exercises,
            equipment: &self.equipment,
            workout_id: workout_id.as_deref(),
            committed: &self.committed,
        };
        let effects = self.machine.handle_utterance(text, stt_confidence, &ctx);
        self.run(effects).await
    }

    /// Transcribe audio through the provider registry, then handle the text
    ///
    /// Fails only when every configured speech-to-text provider failed.
    pub async fn handle_audio(&mut self, audio: AudioData, sample_rate: u32) -> Result<VoiceResponse> {
        let mut request = TranscriptionRequest::new(audio, sample_rate);
        if let Some(language) = self.config.locale.split('-').next().filter(|l| !l.is_empty()) {
            request = request.with_language(language.to_lowercase());
        }
        if !self.exercises.is_empty() {
            let names: Vec<&str> = self.exercises.iter().map(|e| e.name.as_str()).collect();
            request = request.with_prompt(names.join(", "));
        }

        let transcript = self.registry.transcribe(request).await.inspect_err(|e| {
            error!("Transcription failed: {}", e);
        })?;
        let confidence = transcript
            .confidence
            .unwrap_or(self.config.default_stt_confidence);

        let mut response = self.handle_utterance(&transcript.text, confidence).await;
        response.transcript = Some(transcript.text);
        Ok(response)
    }

    /// The confirmation timer armed for `pending_id` expired
    pub async fn handle_confirmation_timeout(&mut self, pending_id: u64) -> VoiceResponse {
        self.confirmation_timer = None;
        let effects = self.machine.handle_timeout(pending_id);
        self.run(effects).await
    }

    pub async fn handle_rest_elapsed(&mut self) -> VoiceResponse {
        self.rest_timer = None;
        self.run(vec![Effect::Speak(prompts::rest_over())]).await
    }

    pub fn handle_connectivity_change(&self, is_online: bool) {
        self.sessions.handle_connectivity_change(is_online);
    }

    /// Abandon anything pending, stop timers and end the session
    ///
    /// Queued sync items are pushed out as far as connectivity allows.
    pub async fn cancel(&mut self) -> Option<VoiceSession> {
        let effects = self.machine.cancel();
        self.run(effects).await;
        if let Some(timer) = self.rest_timer.take() {
            timer.abort();
        }
        self.committed.clear();
        self.sessions.shutdown().await
    }

    fn ensure_session(&self) {
        if self.sessions.current_session_id().is_none() {
            debug!("No active session, starting a free session");
            let metadata = SessionMetadata::for_user(&self.user_id).with_locale(&self.config.locale);
            self.sessions.start_session(SessionType::Free, metadata);
        }
    }

    fn workout_id(&self) -> Option<String> {
        match self.sessions.current_context()? {
            (SessionType::Workout, workout_id) => workout_id,
            _ => None,
        }
    }

    /// Carry out effects in order, including the ones a persist outcome produces
    async fn run(&mut self, effects: Vec<Effect>) -> VoiceResponse {
        let mut response = VoiceResponse::default();
        let mut queue: VecDeque<Effect> = effects.into();

        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Speak(text) => self.speak(text, &mut response).await,
                Effect::RecordEvent(event) => self.record(event),
                Effect::Persist(mutation) => {
                    let outcome = self.persist(&mutation).await;
                    response.outcome = Some(outcome.clone());
                    for follow_up in self.machine.persist_completed(outcome).into_iter().rev() {
                        queue.push_front(follow_up);
                    }
                }
                Effect::ArmTimer {
                    pending_id,
                    duration,
                } => {
                    self.cancel_confirmation_timer();
                    self.confirmation_timer =
                        self.schedule(duration, LoopInput::ConfirmationTimeout(pending_id));
                }
                Effect::CancelTimer => self.cancel_confirmation_timer(),
                Effect::StartWorkout => {
                    self.start_workout();
                }
                Effect::StartRestTimer { seconds } => {
                    if let Some(timer) = self.rest_timer.take() {
                        timer.abort();
                    }
                    self.rest_timer =
                        self.schedule(Duration::from_secs(u64::from(seconds)), LoopInput::RestElapsed);
                }
            }
        }

        response.state = Some(self.machine.state());
        response
    }

    async fn speak(&mut self, text: String, response: &mut VoiceResponse) {
        self.record(VoiceEvent::new(VoiceEventType::Tts, json!({ "text": text })));
        if self.synthesize_prompts {
            match self.registry.synthesize(SynthesisRequest::new(&text)).await {
                Ok(speech) => response.audio.push(speech),
                Err(e) => warn!("Prompt synthesis failed: {}", e),
            }
        }
        response.spoken.push(text);
    }

    fn record(&self, event: VoiceEvent) {
        if let Err(e) = self.sessions.add_event_to_session(event) {
            warn!("Event not recorded: {}", e);
        }
    }

    /// Commit a confirmed mutation, queueing it when the backend is out of reach
    async fn persist(&mut self, mutation: &Mutation) -> PersistOutcome {
        // earlier mutations still queued must reach the backend first
        let queued_ahead = self
            .sessions
            .sync_queue()
            .iter()
            .any(|item| item.op.is_ordered());
        if !self.sessions.is_online() || queued_ahead {
            return self.queue_mutation(mutation);
        }

        let result = match mutation {
            Mutation::LogSet { workout_id, draft } => {
                self.gateway.commit_set(workout_id, draft).await.map(Some)
            }
            Mutation::EditLast { workout_id, draft } => {
                self.gateway.amend_set(workout_id, draft).await.map(|_| None)
            }
            Mutation::UndoLast { workout_id, .. } => {
                self.gateway.revert_last_set(workout_id).await.map(|reverted| {
                    if !reverted {
                        debug!("Backend had no set to revert in workout {}", workout_id);
                    }
                    None
                })
            }
        };

        match result {
            Ok(set_id) => {
                self.apply(mutation, set_id);
                PersistOutcome::Committed
            }
            Err(e) if e.is_retryable() => {
                warn!("Commit failed, queueing for sync: {}", e);
                self.queue_mutation(mutation)
            }
            Err(e) => {
                warn!("Backend rejected {:?}: {}", mutation, e);
                PersistOutcome::Rejected(e.to_string())
            }
        }
    }

    fn queue_mutation(&mut self, mutation: &Mutation) -> PersistOutcome {
        match self.sessions.enqueue_mutation(mutation.to_sync_op()) {
            Ok(()) => {
                self.apply(mutation, None);
                if self.sessions.is_online() {
                    self.sessions.sync_now();
                }
                PersistOutcome::Queued
            }
            Err(e) => PersistOutcome::Rejected(e.to_string()),
        }
    }

    /// Mirror a persisted mutation in the local list of committed sets
    fn apply(&mut self, mutation: &Mutation, set_id: Option<SetId>) {
        match mutation {
            Mutation::LogSet { workout_id, draft } => self.committed.push(CommittedSet {
                workout_id: workout_id.clone(),
                set_id,
                draft: draft.clone(),
            }),
            Mutation::EditLast { draft, .. } => {
                if let Some(set) = self
                    .committed
                    .iter_mut()
                    .rev()
                    .find(|set| set.draft.client_id == draft.client_id)
                {
                    set.draft = draft.clone();
                }
            }
            Mutation::UndoLast { draft, .. } => {
                if let Some(pos) = self
                    .committed
                    .iter()
                    .rposition(|set| set.draft.client_id == draft.client_id)
                {
                    self.committed.remove(pos);
                }
            }
        }
    }

    fn cancel_confirmation_timer(&mut self) {
        if let Some(timer) = self.confirmation_timer.take() {
            timer.abort();
        }
    }

    /// Deliver `input` to the running loop after `delay`
    fn schedule(&self, delay: Duration, input: LoopInput) -> Option<JoinHandle<()>> {
        let Some(timers) = self.timers.clone() else {
            debug!("No loop attached, {:?} will not fire", input);
            return None;
        };
        Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sender) = timers.upgrade() {
                let _ = sender.send(input);
            }
        }))
    }
}

/// Handle onto a running [`VoiceLoop`]
pub struct VoiceHandle {
    inputs: mpsc::UnboundedSender<LoopInput>,
    responses: mpsc::UnboundedReceiver<VoiceResponse>,
    task: JoinHandle<Option<VoiceSession>>,
}

impl VoiceHandle {
    /// Queue an input; false if the loop has stopped
    pub fn send(&self, input: LoopInput) -> bool {
        self.inputs.send(input).is_ok()
    }

    pub fn utterance(&self, text: impl Into<String>, confidence: f32) -> bool {
        self.send(LoopInput::Utterance {
            text: text.into(),
            confidence,
        })
    }

    /// Next response, or None once the loop has stopped
    pub async fn next_response(&mut self) -> Option<VoiceResponse> {
        self.responses.recv().await
    }

    /// Cancel the session and wait for the loop to finish
    pub async fn cancel(self) -> Option<VoiceSession> {
        let _ = self.inputs.send(LoopInput::Cancel);
        drop(self.inputs);
        match self.task.await {
            Ok(session) => session,
            Err(e) => {
                error!("Voice loop task failed: {}", e);
                None
            }
        }
    }
}

/// Single-task event loop around a [`VoicePipeline`]
pub struct VoiceLoop {
    pipeline: VoicePipeline,
    inputs: mpsc::UnboundedReceiver<LoopInput>,
    responses: mpsc::UnboundedSender<VoiceResponse>,
}

impl VoiceLoop {
    /// Spawn the loop onto the current Tokio runtime
    ///
    /// The loop stops on [`LoopInput::Cancel`] or when every handle is dropped, and
    /// tears the session down either way.
    pub fn spawn(mut pipeline: VoicePipeline) -> VoiceHandle {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        pipeline.timers = Some(input_tx.downgrade());

        let voice_loop = Self {
            pipeline,
            inputs: input_rx,
            responses: response_tx,
        };
        let task = tokio::spawn(voice_loop.run());

        VoiceHandle {
            inputs: input_tx,
            responses: response_rx,
            task,
        }
    }

    async fn run(mut self) -> Option<VoiceSession> {
        info!("Voice loop started");
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);

        loop {
            tokio::select! {
                input = self.inputs.recv() => {
                    let Some(input) = input else { break };
                    let response = match input {
                        LoopInput::Utterance { text, confidence } => {
                            Some(self.pipeline.handle_utterance(&text, confidence).await)
                        }
                        LoopInput::Audio { audio, sample_rate } => Some(
                            self.pipeline
                                .handle_audio(audio, sample_rate)
                                .await
                                .unwrap_or_else(|e| VoiceResponse::failed(&e)),
                        ),
                        LoopInput::Connectivity(online) => {
                            self.pipeline.handle_connectivity_change(online);
                            None
                        }
                        LoopInput::ConfirmationTimeout(id) => {
                            Some(self.pipeline.handle_confirmation_timeout(id).await)
                        }
                        LoopInput::RestElapsed => Some(self.pipeline.handle_rest_elapsed().await),
                        LoopInput::Cancel => break,
                    };
                    if let Some(response) = response {
                        let _ = self.responses.send(response);
                    }
                }
                _ = housekeeping.tick() => {
                    let sessions = self.pipeline.sessions();
                    sessions.clear_expired_sessions();
                    // retries whatever a failed drain left behind
                    if sessions.is_online() {
                        sessions.sync_now();
                    }
                }
            }
        }

        info!("Voice loop stopping");
        self.pipeline.cancel().await
    }
}
