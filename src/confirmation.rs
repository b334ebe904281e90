//! Confirmation state machine
//!
//! Decides, per utterance, whether a workout mutation may be persisted. The machine
//! performs no IO: every call returns a list of [`Effect`]s (speak, persist, arm a
//! timer, record an event) that the pipeline carries out in order, and the outcome
//! of a persist is fed back through [`ConfirmationMachine::persist_completed`].
//!
//! While a confirmation or disambiguation is pending, every utterance is read as the
//! answer to it. Nothing is parsed as a new command until the machine is idle again.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::VoiceConfig;
use crate::intent::{IntentKind, IntentParser, ParsedIntent, Slots, Token, tokenize};
use crate::matcher::{EntityMatcher, MatchCandidate, MatchResult};
use crate::numbers;
use crate::prompts;
use crate::sync::SyncOp;
use crate::types::{CommittedSet, Exercise, SetDraft, VoiceEvent, VoiceEventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Idle,
    Parsing,
    Matching,
    AwaitingConfirmation,
    Disambiguating,
    Persisting,
    Rejected,
}

/// A change to the workout log that needs the user's go-ahead
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    LogSet { workout_id: String, draft: SetDraft },
    /// `draft` keeps the client id of the set it replaces
    EditLast { workout_id: String, draft: SetDraft },
    /// `draft` is the set being removed
    UndoLast { workout_id: String, draft: SetDraft },
}

impl Mutation {
    pub fn workout_id(&self) -> &str {
        match self {
            Self::LogSet { workout_id, .. }
            | Self::EditLast { workout_id, .. }
            | Self::UndoLast { workout_id, .. } => workout_id,
        }
    }

    pub fn draft(&self) -> &SetDraft {
        match self {
            Self::LogSet { draft, .. } | Self::EditLast { draft, .. } | Self::UndoLast { draft, .. } => {
                draft
            }
        }
    }

    /// The gateway call to queue if the interactive commit cannot be made
    pub fn to_sync_op(&self) -> SyncOp {
        let workout_id = self.workout_id().to_string();
        match self {
            Self::LogSet { draft, .. } => SyncOp::CommitSet {
                workout_id,
                draft: draft.clone(),
            },
            Self::EditLast { draft, .. } => SyncOp::AmendSet {
                workout_id,
                draft: draft.clone(),
            },
            Self::UndoLast { .. } => SyncOp::RevertLastSet { workout_id },
        }
    }
}

/// How a `Persist` effect turned out
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOutcome {
    Committed,
    /// The backend was unreachable; the mutation waits in the sync queue
    Queued,
    /// The backend refused the mutation
    Rejected(String),
}

/// Side effects requested by the machine, in the order they must happen
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Speak(String),
    Persist(Mutation),
    ArmTimer { pending_id: u64, duration: Duration },
    CancelTimer,
    RecordEvent(VoiceEvent),
    StartWorkout,
    StartRestTimer { seconds: u32 },
}

/// Snapshot of the surrounding state a decision is made against
#[derive(Debug, Clone, Copy)]
pub struct MachineContext<'a> {
    pub library: &'a [Exercise],
    pub equipment: &'a HashSet<String>,
    /// Set while the active session is a workout
    pub workout_id: Option<&'a str>,
    /// Sets committed in this workout, oldest first
    pub committed: &'a [CommittedSet],
}

impl MachineContext<'_> {
    fn find_exercise(&self, id: &str) -> Option<&Exercise> {
        self.library.iter().find(|e| e.id == id)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RequestKind {
    New { reps: u32 },
    Edit { base: SetDraft },
}

/// A log or edit request waiting for its exercise to be resolved
#[derive(Debug, Clone, PartialEq)]
pub struct SetRequest {
    kind: RequestKind,
    slots: Slots,
    workout_id: String,
}

impl SetRequest {
    fn draft_for(&self, exercise: &Exercise, committed: &[CommittedSet]) -> SetDraft {
        match &self.kind {
            RequestKind::New { reps } => {
                let mut draft = SetDraft::new(exercise, *reps);
                draft.set_index = self
                    .slots
                    .set_index
                    .or_else(|| Some(next_set_index(&exercise.id, committed, None)));
                draft.weight_kg = self.slots.weight_kg;
                draft.rpe = self.slots.rpe;
                draft
            }
            RequestKind::Edit { base } => edit_draft(base, Some(exercise), &self.slots, committed),
        }
    }

    fn mutation(&self, draft: SetDraft) -> Mutation {
        let workout_id = self.workout_id.clone();
        match self.kind {
            RequestKind::New { .. } => Mutation::LogSet { workout_id, draft },
            RequestKind::Edit { .. } => Mutation::EditLast { workout_id, draft },
        }
    }
}

/// What the pending prompt is waiting for
#[derive(Debug, Clone, PartialEq)]
pub enum PendingAction {
    /// A yes/no on a fully resolved mutation
    Confirm(Mutation),
    /// A pick among exercise candidates
    Choose {
        candidates: Vec<MatchCandidate>,
        request: SetRequest,
    },
}

/// The one prompt awaiting an answer; never persisted
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    /// Changes on every re-arm so stale timers can be recognized
    pub id: u64,
    pub action: PendingAction,
    pub match_result: Option<MatchResult>,
    pub deadline: Instant,
    pub reprompts: u32,
}

const AFFIRM_WORDS: &[&str] = &[
    "yes", "yeah", "yep", "yup", "sure", "correct", "confirm", "confirmed", "ok", "okay",
    "right", "affirmative", "absolutely", "definitely", "save", "exactly",
];

const DENY_WORDS: &[&str] = &[
    "no", "nope", "nah", "cancel", "stop", "wrong", "incorrect", "negative", "dont", "abort",
    "never", "nevermind",
];

/// Words ignored when a reply names a candidate ("the standing one")
const REPLY_NOISE: &[&str] = &[
    "the", "a", "an", "one", "that", "this", "it", "i", "mean", "meant", "please", "yes",
    "yeah", "um", "uh",
];

fn has_word(tokens: &[Token], words: &[&str]) -> bool {
    tokens.iter().any(|t| words.contains(&t.norm.as_str()))
}

/// "the second one", "number two", "3"
///
/// A bare cardinal only counts when the reply is nothing but that number, so
/// "the standing one" is not read as a pick of the first candidate.
fn reply_ordinal(tokens: &[Token]) -> Option<usize> {
    let norms: Vec<String> = tokens.iter().map(|t| t.norm.clone()).collect();
    let spans = numbers::scan(&norms);

    if let Some(n) = spans
        .iter()
        .filter(|span| span.ordinal)
        .find_map(|span| span.as_count())
    {
        return Some(n as usize);
    }

    let first = spans.first()?;
    let only_number = norms.iter().enumerate().all(|(i, word)| {
        (first.start..first.end).contains(&i)
            || matches!(word.as_str(), "number" | "option" | "the" | "please")
    });
    if only_number {
        first.as_count().map(|n| n as usize)
    } else {
        None
    }
}

/// Next set number for `exercise_id`, not counting the set `skip`
fn next_set_index(exercise_id: &str, committed: &[CommittedSet], skip: Option<Uuid>) -> u32 {
    let done = committed
        .iter()
        .filter(|c| c.draft.exercise_id == exercise_id && Some(c.draft.client_id) != skip)
        .count();
    done as u32 + 1
}

/// Apply spoken changes to a committed set
fn edit_draft(
    base: &SetDraft,
    exercise: Option<&Exercise>,
    slots: &Slots,
    committed: &[CommittedSet],
) -> SetDraft {
    let mut draft = base.clone();
    if let Some(exercise) = exercise {
        if exercise.id != base.exercise_id {
            draft.exercise_id = exercise.id.clone();
            draft.exercise_name = exercise.name.clone();
            draft.set_index = Some(next_set_index(&exercise.id, committed, Some(base.client_id)));
        }
    }
    if let Some(reps) = slots.reps {
        draft.reps = reps;
    }
    if let Some(weight) = slots.weight_kg {
        draft.weight_kg = Some(weight);
    }
    if let Some(rpe) = slots.rpe {
        draft.rpe = Some(rpe);
    }
    if let Some(index) = slots.set_index {
        draft.set_index = Some(index);
    }
    draft
}

/// Check a draft against the physical limits and the user's equipment
pub fn validate_draft(
    draft: &SetDraft,
    exercise: Option<&Exercise>,
    equipment: &HashSet<String>,
    require_equipment: bool,
) -> std::result::Result<(), String> {
    if !(1..=100).contains(&draft.reps) {
        return Err(format!("{} reps is out of range", draft.reps));
    }
    if let Some(weight) = draft.weight_kg {
        if !(0.0..=1000.0).contains(&weight) {
            return Err(format!("{} kilos is out of range", prompts::format_number(weight)));
        }
    }
    if let Some(rpe) = draft.rpe {
        if !(1.0..=10.0).contains(&rpe) {
            return Err("RPE must be between 1 and 10".to_string());
        }
    }
    if require_equipment {
        if let Some(exercise) = exercise {
            let missing: Vec<&str> = exercise
                .equipment_required
                .iter()
                .filter(|item| !equipment.contains(*item))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(format!(
                    "{} needs {}, which isn't in your equipment",
                    exercise.name,
                    missing.join(" and ")
                ));
            }
        }
    }
    Ok(())
}

/// Per-session confirmation flow
pub struct ConfirmationMachine {
    config: VoiceConfig,
    parser: IntentParser,
    matcher: EntityMatcher,
    state: MachineState,
    pending: Option<PendingConfirmation>,
    persisting: Option<Mutation>,
    next_pending_id: u64,
}

impl ConfirmationMachine {
    pub fn new(config: VoiceConfig) -> Self {
        Self {
            matcher: EntityMatcher::from_config(&config),
            parser: IntentParser::new(),
            config,
            state: MachineState::Idle,
            pending: None,
            persisting: None,
            next_pending_id: 1,
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn pending(&self) -> Option<&PendingConfirmation> {
        self.pending.as_ref()
    }

    fn transition(&mut self, next: MachineState) {
        if self.state != next {
            debug!("Confirmation state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Handle one utterance to completion
    pub fn handle_utterance(
        &mut self,
        text: &str,
        stt_confidence: f32,
        ctx: &MachineContext<'_>,
    ) -> Vec<Effect> {
        let mut effects = vec![Effect::RecordEvent(
            VoiceEvent::new(VoiceEventType::Transcription, json!({ "text": text }))
                .with_confidence(stt_confidence),
        )];

        if self.pending.is_some() {
            self.handle_reply(text, ctx, &mut effects);
            return effects;
        }
        if let Some(mutation) = &self.persisting {
            warn!("Utterance arrived while {:?} is still persisting", mutation);
        }

        self.transition(MachineState::Parsing);
        let vocabulary: Vec<&str> = ctx
            .library
            .iter()
            .filter(|e| e.is_active())
            .map(|e| e.name.as_str())
            .collect();
        let intent = self.parser.parse(text, stt_confidence, &vocabulary);
        effects.push(Effect::RecordEvent(
            VoiceEvent::new(
                VoiceEventType::IntentRecognized,
                json!({ "kind": intent.kind, "slots": intent.slots }),
            )
            .with_confidence(stt_confidence),
        ));

        match intent.kind {
            IntentKind::Unknown => {
                effects.push(Effect::Speak(prompts::not_understood()));
                self.transition(MachineState::Idle);
            }
            IntentKind::StartWorkout => {
                if ctx.workout_id.is_some() {
                    effects.push(Effect::Speak(prompts::already_in_workout()));
                } else {
                    effects.push(Effect::StartWorkout);
                    effects.push(Effect::Speak(prompts::workout_started()));
                }
                self.transition(MachineState::Idle);
            }
            IntentKind::RestTimer => {
                let seconds = intent.slots.seconds.unwrap_or(self.config.default_rest_seconds);
                effects.push(Effect::StartRestTimer { seconds });
                effects.push(Effect::Speak(prompts::rest_started(seconds)));
                self.transition(MachineState::Idle);
            }
            IntentKind::UndoLast => self.begin_undo(ctx, &mut effects),
            IntentKind::LogSet => self.begin_log(intent, ctx, &mut effects),
            IntentKind::EditLast => self.begin_edit(intent, ctx, &mut effects),
        }

        effects
    }

    fn begin_undo(&mut self, ctx: &MachineContext<'_>, effects: &mut Vec<Effect>) {
        let Some(last) = ctx.committed.last() else {
            debug!("Undo with nothing committed");
            effects.push(Effect::Speak(prompts::nothing_to_undo()));
            self.transition(MachineState::Idle);
            return;
        };

        let mutation = Mutation::UndoLast {
            workout_id: last.workout_id.clone(),
            draft: last.draft.clone(),
        };
        effects.push(Effect::Speak(prompts::confirm_undo(&last.draft)));
        self.transition(MachineState::AwaitingConfirmation);
        self.arm(PendingAction::Confirm(mutation), None, 0, effects);
    }

    fn begin_log(&mut self, intent: ParsedIntent, ctx: &MachineContext<'_>, effects: &mut Vec<Effect>) {
        let Some(workout_id) = ctx.workout_id else {
            effects.push(Effect::Speak(prompts::need_workout()));
            self.transition(MachineState::Idle);
            return;
        };
        let Some(name) = intent.slots.exercise_name.clone() else {
            effects.push(Effect::Speak(prompts::missing_exercise()));
            self.transition(MachineState::Idle);
            return;
        };
        let Some(reps) = intent.slots.reps else {
            effects.push(Effect::Speak(prompts::missing_reps(&name)));
            self.transition(MachineState::Idle);
            return;
        };

        let request = SetRequest {
            kind: RequestKind::New { reps },
            slots: intent.slots,
            workout_id: workout_id.to_string(),
        };
        self.match_and_gate(&name, request, intent.stt_confidence, ctx, effects);
    }

    fn begin_edit(&mut self, intent: ParsedIntent, ctx: &MachineContext<'_>, effects: &mut Vec<Effect>) {
        let Some(last) = ctx.committed.last() else {
            effects.push(Effect::Speak(prompts::nothing_to_edit()));
            self.transition(MachineState::Idle);
            return;
        };
        if !intent.slots.has_edit_fields() {
            effects.push(Effect::Speak(prompts::missing_edit_fields()));
            self.transition(MachineState::Idle);
            return;
        }

        let request = SetRequest {
            kind: RequestKind::Edit {
                base: last.draft.clone(),
            },
            slots: intent.slots.clone(),
            workout_id: last.workout_id.clone(),
        };

        match &intent.slots.exercise_name {
            Some(name) => self.match_and_gate(name, request, intent.stt_confidence, ctx, effects),
            None => {
                let draft = edit_draft(&last.draft, None, &intent.slots, ctx.committed);
                let exercise = ctx.find_exercise(&draft.exercise_id);
                self.propose(request.mutation(draft), exercise, None, ctx, effects);
            }
        }
    }

    /// Resolve the exercise name and decide between confirming and asking
    fn match_and_gate(
        &mut self,
        name: &str,
        request: SetRequest,
        stt_confidence: f32,
        ctx: &MachineContext<'_>,
        effects: &mut Vec<Effect>,
    ) {
        self.transition(MachineState::Matching);
        let result = self.matcher.match_exercise(name, ctx.library);

        match &result {
            MatchResult::Matched { exercise, .. }
                if stt_confidence >= self.config.confidence_threshold =>
            {
                let draft = request.draft_for(exercise, ctx.committed);
                self.propose(request.mutation(draft), Some(exercise), Some(result.clone()), ctx, effects);
            }
            MatchResult::Matched { exercise, score } => {
                debug!(
                    "Matched {} but STT confidence {:.2} is low",
                    exercise.name, stt_confidence
                );
                let candidates = vec![MatchCandidate {
                    exercise: exercise.clone(),
                    score: *score,
                }];
                self.ask_choice(candidates, request, result.clone(), effects);
            }
            MatchResult::Ambiguous { candidates } => {
                self.ask_choice(candidates.clone(), request, result.clone(), effects);
            }
            MatchResult::Unmatched => {
                self.transition(MachineState::Rejected);
                effects.push(Effect::Speak(prompts::unknown_exercise(name)));
                effects.push(Effect::RecordEvent(VoiceEvent::new(
                    VoiceEventType::Correction,
                    json!({ "reason": "unmatched_exercise", "spoken_name": name }),
                )));
                self.transition(MachineState::Idle);
            }
        }
    }

    /// Validate a resolved mutation and read it back for a yes/no
    fn propose(
        &mut self,
        mutation: Mutation,
        exercise: Option<&Exercise>,
        match_result: Option<MatchResult>,
        ctx: &MachineContext<'_>,
        effects: &mut Vec<Effect>,
    ) {
        if let Err(reason) = self.validate(&mutation, exercise, ctx) {
            self.reject(&mutation, &reason, effects);
            return;
        }

        let prompt = match &mutation {
            Mutation::LogSet { draft, .. } => prompts::confirm_set(draft),
            Mutation::EditLast { draft, .. } => prompts::confirm_edit(draft),
            Mutation::UndoLast { draft, .. } => prompts::confirm_undo(draft),
        };
        effects.push(Effect::Speak(prompt));
        self.transition(MachineState::AwaitingConfirmation);
        self.arm(PendingAction::Confirm(mutation), match_result, 0, effects);
    }

    fn validate(
        &self,
        mutation: &Mutation,
        exercise: Option<&Exercise>,
        ctx: &MachineContext<'_>,
    ) -> std::result::Result<(), String> {
        validate_draft(
            mutation.draft(),
            exercise,
            ctx.equipment,
            self.config.require_available_equipment,
        )
    }

    fn reject(&mut self, mutation: &Mutation, reason: &str, effects: &mut Vec<Effect>) {
        self.transition(MachineState::Rejected);
        effects.push(Effect::Speak(prompts::rejected(reason)));
        effects.push(Effect::RecordEvent(VoiceEvent::new(
            VoiceEventType::Correction,
            json!({ "reason": "invalid_set", "detail": reason, "mutation": mutation }),
        )));
        self.transition(MachineState::Idle);
    }

    fn ask_choice(
        &mut self,
        candidates: Vec<MatchCandidate>,
        request: SetRequest,
        match_result: MatchResult,
        effects: &mut Vec<Effect>,
    ) {
        effects.push(Effect::Speak(prompts::disambiguate(
            &candidates,
            self.config.max_spoken_candidates,
        )));
        self.transition(MachineState::Disambiguating);
        self.arm(
            PendingAction::Choose {
                candidates,
                request,
            },
            Some(match_result),
            0,
            effects,
        );
    }

    fn arm(
        &mut self,
        action: PendingAction,
        match_result: Option<MatchResult>,
        reprompts: u32,
        effects: &mut Vec<Effect>,
    ) {
        let id = self.next_pending_id;
        self.next_pending_id += 1;
        let duration = self.config.confirmation_timeout();

        effects.push(Effect::ArmTimer {
            pending_id: id,
            duration,
        });
        self.pending = Some(PendingConfirmation {
            id,
            action,
            match_result,
            deadline: Instant::now() + duration,
            reprompts,
        });
    }

    fn handle_reply(&mut self, text: &str, ctx: &MachineContext<'_>, effects: &mut Vec<Effect>) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        effects.push(Effect::CancelTimer);

        let tokens = tokenize(text);
        if has_word(&tokens, DENY_WORDS) {
            self.abort(&pending, "rejected_by_user", effects);
            effects.push(Effect::Speak(prompts::cancelled()));
            return;
        }

        match pending.action {
            PendingAction::Confirm(mutation) => {
                if has_word(&tokens, AFFIRM_WORDS) || self.config.implicit_accept {
                    self.begin_persist(mutation, effects);
                } else {
                    pending.action = PendingAction::Confirm(mutation);
                    self.reprompt(pending, prompts::reprompt_yes_no(), effects);
                }
            }
            PendingAction::Choose {
                candidates,
                request,
            } => match self.pick_candidate(&tokens, &candidates) {
                Some(exercise) => {
                    debug!("User picked {}", exercise.name);
                    let draft = request.draft_for(&exercise, ctx.committed);
                    let mutation = request.mutation(draft);
                    if self.config.confirm_after_disambiguation {
                        self.propose(mutation, Some(&exercise), pending.match_result, ctx, effects);
                    } else if let Err(reason) = self.validate(&mutation, Some(&exercise), ctx) {
                        self.reject(&mutation, &reason, effects);
                    } else {
                        self.begin_persist(mutation, effects);
                    }
                }
                None => {
                    let prompt =
                        prompts::reprompt_choice(&candidates, self.config.max_spoken_candidates);
                    pending.action = PendingAction::Choose {
                        candidates,
                        request,
                    };
                    self.reprompt(pending, prompt, effects);
                }
            },
        }
    }

    /// Read a reply as a candidate pick: by ordinal, by "yes" to a lone
    /// candidate, or by name
    fn pick_candidate(&self, tokens: &[Token], candidates: &[MatchCandidate]) -> Option<Exercise> {
        let spoken = candidates.len().min(self.config.max_spoken_candidates);
        if let Some(n) = reply_ordinal(tokens) {
            if (1..=spoken).contains(&n) {
                return Some(candidates[n - 1].exercise.clone());
            }
        }

        if candidates.len() == 1 && has_word(tokens, AFFIRM_WORDS) {
            return Some(candidates[0].exercise.clone());
        }

        let name: Vec<&str> = tokens
            .iter()
            .map(|t| t.norm.as_str())
            .filter(|word| !REPLY_NOISE.contains(word))
            .collect();
        if name.is_empty() {
            return None;
        }

        let exercises: Vec<Exercise> = candidates.iter().map(|c| c.exercise.clone()).collect();
        match self.matcher.match_exercise(&name.join(" "), &exercises) {
            MatchResult::Matched { exercise, .. } => Some(exercise),
            _ => None,
        }
    }

    fn reprompt(&mut self, mut pending: PendingConfirmation, prompt: String, effects: &mut Vec<Effect>) {
        pending.reprompts += 1;
        if pending.reprompts > self.config.max_reprompts {
            self.abort(&pending, "no_clear_answer", effects);
            effects.push(Effect::Speak(prompts::cancelled()));
            return;
        }

        effects.push(Effect::Speak(prompt));
        let reprompts = pending.reprompts;
        self.arm(pending.action, pending.match_result, reprompts, effects);
    }

    fn abort(&mut self, pending: &PendingConfirmation, reason: &str, effects: &mut Vec<Effect>) {
        let attempted = match &pending.action {
            PendingAction::Confirm(mutation) => json!({ "mutation": mutation }),
            PendingAction::Choose { candidates, .. } => {
                let names: Vec<&str> = candidates.iter().map(|c| c.exercise.name.as_str()).collect();
                json!({ "candidates": names })
            }
        };
        debug!("Aborting pending confirmation {}: {}", pending.id, reason);
        effects.push(Effect::RecordEvent(VoiceEvent::new(
            VoiceEventType::Correction,
            json!({ "reason": reason, "attempted": attempted }),
        )));
        self.transition(MachineState::Idle);
    }

    fn begin_persist(&mut self, mutation: Mutation, effects: &mut Vec<Effect>) {
        self.transition(MachineState::Persisting);
        self.persisting = Some(mutation.clone());
        effects.push(Effect::Persist(mutation));
    }

    /// The response timer for `pending_id` fired
    ///
    /// Timers of prompts that were already answered or re-armed are ignored.
    pub fn handle_timeout(&mut self, pending_id: u64) -> Vec<Effect> {
        if self.pending.as_ref().map(|p| p.id) != Some(pending_id) {
            debug!("Ignoring stale confirmation timer {}", pending_id);
            return Vec::new();
        }
        let Some(pending) = self.pending.take() else {
            return Vec::new();
        };

        let mut effects = Vec::new();
        match pending.action {
            PendingAction::Confirm(mutation) if self.config.accept_on_timeout => {
                debug!("Confirmation timed out, accepting");
                self.begin_persist(mutation, &mut effects);
            }
            action => {
                let pending = PendingConfirmation { action, ..pending };
                self.abort(&pending, "timeout", &mut effects);
                effects.push(Effect::Speak(prompts::timed_out()));
            }
        }
        effects
    }

    /// Report how the last `Persist` effect went
    pub fn persist_completed(&mut self, outcome: PersistOutcome) -> Vec<Effect> {
        let Some(mutation) = self.persisting.take() else {
            warn!("Persist outcome {:?} with nothing persisting", outcome);
            return Vec::new();
        };

        let mut effects = Vec::new();
        match outcome {
            PersistOutcome::Committed | PersistOutcome::Queued => {
                let queued = outcome == PersistOutcome::Queued;
                effects.push(Effect::RecordEvent(VoiceEvent::new(
                    VoiceEventType::Confirmation,
                    json!({ "mutation": mutation, "queued": queued }),
                )));
                let spoken = if queued {
                    prompts::saved_offline()
                } else {
                    match &mutation {
                        Mutation::LogSet { draft, .. } => prompts::logged(draft),
                        Mutation::EditLast { draft, .. } => prompts::edited(draft),
                        Mutation::UndoLast { draft, .. } => prompts::undone(draft),
                    }
                };
                effects.push(Effect::Speak(spoken));
            }
            PersistOutcome::Rejected(reason) => {
                effects.push(Effect::Speak(prompts::rejected(&reason)));
                effects.push(Effect::RecordEvent(VoiceEvent::new(
                    VoiceEventType::Correction,
                    json!({ "reason": "rejected_by_backend", "detail": reason, "mutation": mutation }),
                )));
            }
        }
        self.transition(MachineState::Idle);
        effects
    }

    /// Drop whatever is pending, e.g. when the session is torn down
    pub fn cancel(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(pending) = self.pending.take() {
            effects.push(Effect::CancelTimer);
            self.abort(&pending, "cancelled", &mut effects);
        }
        self.persisting = None;
        self.transition(MachineState::Idle);
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUAT_UTTERANCE: &str = "Back squat, set three, five reps at one-hundred kilos, RPE eight";

    fn library() -> Vec<Exercise> {
        vec![
            Exercise::new("e1", "Back Squat").with_equipment(&["barbell"]),
            Exercise::new("e2", "Bench Press").with_equipment(&["barbell", "bench"]),
            Exercise::new("e3", "Seated Dumbbell Press"),
            Exercise::new("e4", "Standing Press"),
            Exercise::new("e5", "Deadlift"),
        ]
    }

    fn equipment() -> HashSet<String> {
        ["barbell", "bench"].iter().map(|s| s.to_string()).collect()
    }

    struct Fixture {
        library: Vec<Exercise>,
        equipment: HashSet<String>,
        committed: Vec<CommittedSet>,
        workout_id: Option<String>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                library: library(),
                equipment: equipment(),
                committed: Vec::new(),
                workout_id: Some("w1".to_string()),
            }
        }

        fn ctx(&self) -> MachineContext<'_> {
            MachineContext {
                library: &self.library,
                equipment: &self.equipment,
                workout_id: self.workout_id.as_deref(),
                committed: &self.committed,
            }
        }
    }

    fn spoken(effects: &[Effect]) -> Vec<&str> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Speak(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn persisted(effects: &[Effect]) -> Option<&Mutation> {
        effects.iter().find_map(|e| match e {
            Effect::Persist(m) => Some(m),
            _ => None,
        })
    }

    fn armed(effects: &[Effect]) -> Option<u64> {
        effects.iter().find_map(|e| match e {
            Effect::ArmTimer { pending_id, .. } => Some(*pending_id),
            _ => None,
        })
    }

    fn recorded(effects: &[Effect], kind: VoiceEventType) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::RecordEvent(ev) if ev.event_type == kind))
            .count()
    }

    #[test]
    fn test_confident_log_set_confirms_then_persists() {
        let fixture = Fixture::new();
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());

        let effects = machine.handle_utterance(SQUAT_UTTERANCE, 0.95, &fixture.ctx());
        assert_eq!(machine.state(), MachineState::AwaitingConfirmation);
        assert_eq!(
            spoken(&effects),
            vec!["Log Back Squat, set 3, 5 reps at 100 kilos, RPE 8?"]
        );
        assert!(armed(&effects).is_some());
        assert!(persisted(&effects).is_none());
        assert_eq!(recorded(&effects, VoiceEventType::IntentRecognized), 1);

        let effects = machine.handle_utterance("yes", 0.95, &fixture.ctx());
        assert_eq!(machine.state(), MachineState::Persisting);
        assert!(effects.contains(&Effect::CancelTimer));
        match persisted(&effects) {
            Some(Mutation::LogSet { workout_id, draft }) => {
                assert_eq!(workout_id, "w1");
                assert_eq!(draft.exercise_id, "e1");
                assert_eq!(draft.set_index, Some(3));
                assert_eq!(draft.reps, 5);
                assert_eq!(draft.weight_kg, Some(100.0));
                assert_eq!(draft.rpe, Some(8.0));
            }
            other => panic!("expected log set, got {other:?}"),
        }

        let effects = machine.persist_completed(PersistOutcome::Committed);
        assert_eq!(machine.state(), MachineState::Idle);
        assert_eq!(recorded(&effects, VoiceEventType::Confirmation), 1);
        assert!(machine.pending().is_none());
    }

    #[test]
    fn test_low_confidence_asks_first() {
        let fixture = Fixture::new();
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());

        let effects = machine.handle_utterance("deadlift five reps", 0.4, &fixture.ctx());
        assert_eq!(machine.state(), MachineState::Disambiguating);
        assert_eq!(spoken(&effects), vec!["Did you mean Deadlift?"]);

        let effects = machine.handle_utterance("yes", 0.9, &fixture.ctx());
        assert_eq!(machine.state(), MachineState::AwaitingConfirmation);
        assert!(persisted(&effects).is_none());

        let effects = machine.handle_utterance("yes", 0.9, &fixture.ctx());
        assert!(persisted(&effects).is_some());
    }

    #[test]
    fn test_ambiguous_pick_by_name() {
        let fixture = Fixture::new();
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());

        let effects = machine.handle_utterance("log press five reps", 0.95, &fixture.ctx());
        assert_eq!(machine.state(), MachineState::Disambiguating);
        assert!(spoken(&effects)[0].starts_with("Did you mean"));

        let effects = machine.handle_utterance("the standing one", 0.95, &fixture.ctx());
        assert_eq!(machine.state(), MachineState::AwaitingConfirmation);
        assert_eq!(spoken(&effects), vec!["Log Standing Press, set 1, 5 reps?"]);
    }

    #[test]
    fn test_ambiguous_pick_by_ordinal() {
        let fixture = Fixture::new();
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());
        machine.handle_utterance("log press five reps", 0.95, &fixture.ctx());

        let candidates = match &machine.pending().unwrap().action {
            PendingAction::Choose { candidates, .. } => candidates.clone(),
            other => panic!("expected choice, got {other:?}"),
        };
        let effects = machine.handle_utterance("the second one", 0.95, &fixture.ctx());
        let expected = format!("Log {}, set 1, 5 reps?", candidates[1].exercise.name);
        assert_eq!(spoken(&effects), vec![expected.as_str()]);
    }

    #[test]
    fn test_skip_readback_after_disambiguation() {
        let fixture = Fixture::new();
        let config = VoiceConfig {
            confirm_after_disambiguation: false,
            ..Default::default()
        };
        let mut machine = ConfirmationMachine::new(config);
        machine.handle_utterance("log press five reps", 0.95, &fixture.ctx());
        let effects = machine.handle_utterance("standing", 0.95, &fixture.ctx());
        assert_eq!(machine.state(), MachineState::Persisting);
        assert_eq!(persisted(&effects).unwrap().draft().exercise_id, "e4");
    }

    #[test]
    fn test_no_aborts_without_persisting() {
        let fixture = Fixture::new();
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());
        machine.handle_utterance(SQUAT_UTTERANCE, 0.95, &fixture.ctx());

        let effects = machine.handle_utterance("no", 0.95, &fixture.ctx());
        assert_eq!(machine.state(), MachineState::Idle);
        assert!(persisted(&effects).is_none());
        assert_eq!(recorded(&effects, VoiceEventType::Correction), 1);
        assert!(machine.pending().is_none());
    }

    #[test]
    fn test_reply_is_never_parsed_as_command() {
        let mut fixture = Fixture::new();
        let draft = SetDraft::new(&fixture.library[4], 3);
        fixture.committed.push(CommittedSet {
            workout_id: "w1".to_string(),
            set_id: Some("s1".to_string()),
            draft,
        });
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());
        machine.handle_utterance(SQUAT_UTTERANCE, 0.95, &fixture.ctx());

        let effects = machine.handle_utterance("undo", 0.95, &fixture.ctx());
        assert_eq!(machine.state(), MachineState::AwaitingConfirmation);
        assert_eq!(recorded(&effects, VoiceEventType::IntentRecognized), 0);
        assert!(persisted(&effects).is_none());
        assert_eq!(spoken(&effects), vec![prompts::reprompt_yes_no()]);
        assert!(matches!(
            machine.pending().unwrap().action,
            PendingAction::Confirm(Mutation::LogSet { .. })
        ));
    }

    #[test]
    fn test_too_many_unclear_replies_abort() {
        let fixture = Fixture::new();
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());
        machine.handle_utterance(SQUAT_UTTERANCE, 0.95, &fixture.ctx());

        machine.handle_utterance("hmm", 0.95, &fixture.ctx());
        machine.handle_utterance("what", 0.95, &fixture.ctx());
        assert_eq!(machine.state(), MachineState::AwaitingConfirmation);
        let effects = machine.handle_utterance("huh", 0.95, &fixture.ctx());
        assert_eq!(machine.state(), MachineState::Idle);
        assert_eq!(recorded(&effects, VoiceEventType::Correction), 1);
    }

    #[test]
    fn test_implicit_accept() {
        let fixture = Fixture::new();
        let config = VoiceConfig {
            implicit_accept: true,
            ..Default::default()
        };
        let mut machine = ConfirmationMachine::new(config);
        machine.handle_utterance(SQUAT_UTTERANCE, 0.95, &fixture.ctx());
        let effects = machine.handle_utterance("next", 0.95, &fixture.ctx());
        assert!(persisted(&effects).is_some());
    }

    #[test]
    fn test_timeout_aborts_and_ignores_stale_timers() {
        let fixture = Fixture::new();
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());
        let effects = machine.handle_utterance(SQUAT_UTTERANCE, 0.95, &fixture.ctx());
        let id = armed(&effects).unwrap();

        assert!(machine.handle_timeout(id + 100).is_empty());
        assert_eq!(machine.state(), MachineState::AwaitingConfirmation);

        let effects = machine.handle_timeout(id);
        assert_eq!(machine.state(), MachineState::Idle);
        assert!(persisted(&effects).is_none());
        assert_eq!(recorded(&effects, VoiceEventType::Correction), 1);
        assert_eq!(spoken(&effects), vec![prompts::timed_out()]);

        // a second firing of the same timer is stale
        assert!(machine.handle_timeout(id).is_empty());
    }

    #[test]
    fn test_reprompt_rearms_with_new_id() {
        let fixture = Fixture::new();
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());
        let first = armed(&machine.handle_utterance(SQUAT_UTTERANCE, 0.95, &fixture.ctx())).unwrap();
        let second = armed(&machine.handle_utterance("hmm", 0.95, &fixture.ctx())).unwrap();
        assert_ne!(first, second);
        assert!(machine.handle_timeout(first).is_empty());
    }

    #[test]
    fn test_accept_on_timeout() {
        let fixture = Fixture::new();
        let config = VoiceConfig {
            accept_on_timeout: true,
            ..Default::default()
        };
        let mut machine = ConfirmationMachine::new(config);
        let id = armed(&machine.handle_utterance(SQUAT_UTTERANCE, 0.95, &fixture.ctx())).unwrap();
        let effects = machine.handle_timeout(id);
        assert!(persisted(&effects).is_some());
        assert_eq!(machine.state(), MachineState::Persisting);
    }

    #[test]
    fn test_undo_without_history_is_noop() {
        let fixture = Fixture::new();
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());
        let effects = machine.handle_utterance("undo", 0.95, &fixture.ctx());
        assert_eq!(machine.state(), MachineState::Idle);
        assert_eq!(spoken(&effects), vec![prompts::nothing_to_undo()]);
        assert!(persisted(&effects).is_none());
        assert!(armed(&effects).is_none());
    }

    #[test]
    fn test_undo_confirms_last_set() {
        let mut fixture = Fixture::new();
        let draft = SetDraft::new(&fixture.library[4], 3);
        fixture.committed.push(CommittedSet {
            workout_id: "w1".to_string(),
            set_id: None,
            draft: draft.clone(),
        });
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());
        machine.handle_utterance("scratch that", 0.95, &fixture.ctx());
        let effects = machine.handle_utterance("yes", 0.95, &fixture.ctx());
        assert_eq!(
            persisted(&effects),
            Some(&Mutation::UndoLast {
                workout_id: "w1".to_string(),
                draft
            })
        );
    }

    #[test]
    fn test_edit_last_keeps_client_id() {
        let mut fixture = Fixture::new();
        let mut draft = SetDraft::new(&fixture.library[0], 5);
        draft.weight_kg = Some(100.0);
        fixture.committed.push(CommittedSet {
            workout_id: "w1".to_string(),
            set_id: Some("s1".to_string()),
            draft: draft.clone(),
        });
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());

        let effects = machine.handle_utterance("change the last set to six reps", 0.95, &fixture.ctx());
        assert_eq!(spoken(&effects), vec!["Change the last set to Back Squat, 6 reps at 100 kilos?"]);
        let effects = machine.handle_utterance("yes", 0.95, &fixture.ctx());
        match persisted(&effects) {
            Some(Mutation::EditLast { draft: edited, .. }) => {
                assert_eq!(edited.client_id, draft.client_id);
                assert_eq!(edited.reps, 6);
                assert_eq!(edited.weight_kg, Some(100.0));
            }
            other => panic!("expected edit, got {other:?}"),
        }
    }

    #[test]
    fn test_unmatched_exercise_rejected() {
        let fixture = Fixture::new();
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());
        let effects = machine.handle_utterance("log zumba twelve reps", 0.95, &fixture.ctx());
        assert_eq!(machine.state(), MachineState::Idle);
        assert_eq!(spoken(&effects), vec![prompts::unknown_exercise("zumba")]);
        assert_eq!(recorded(&effects, VoiceEventType::Correction), 1);
        assert!(machine.pending().is_none());
    }

    #[test]
    fn test_missing_reps_asks_for_clarification() {
        let fixture = Fixture::new();
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());
        let effects = machine.handle_utterance("log deadlift", 0.95, &fixture.ctx());
        assert_eq!(spoken(&effects), vec![prompts::missing_reps("deadlift")]);
        assert_eq!(machine.state(), MachineState::Idle);
    }

    #[test]
    fn test_log_outside_workout_prompts_to_start() {
        let mut fixture = Fixture::new();
        fixture.workout_id = None;
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());
        let effects = machine.handle_utterance(SQUAT_UTTERANCE, 0.95, &fixture.ctx());
        assert_eq!(spoken(&effects), vec![prompts::need_workout()]);

        let effects = machine.handle_utterance("start a workout", 0.95, &fixture.ctx());
        assert!(effects.contains(&Effect::StartWorkout));
    }

    #[test]
    fn test_missing_equipment_rejected() {
        let mut fixture = Fixture::new();
        fixture.equipment.remove("bench");
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());
        let effects = machine.handle_utterance("bench press eight reps", 0.95, &fixture.ctx());
        assert_eq!(machine.state(), MachineState::Idle);
        assert!(spoken(&effects)[0].contains("bench"));
        assert!(persisted(&effects).is_none());
    }

    #[test]
    fn test_set_index_auto_numbers() {
        let mut fixture = Fixture::new();
        fixture.committed.push(CommittedSet {
            workout_id: "w1".to_string(),
            set_id: None,
            draft: SetDraft::new(&fixture.library[4], 5),
        });
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());
        machine.handle_utterance("deadlift five reps", 0.95, &fixture.ctx());
        let effects = machine.handle_utterance("yes", 0.95, &fixture.ctx());
        assert_eq!(persisted(&effects).unwrap().draft().set_index, Some(2));
    }

    #[test]
    fn test_backend_rejection_records_correction() {
        let fixture = Fixture::new();
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());
        machine.handle_utterance(SQUAT_UTTERANCE, 0.95, &fixture.ctx());
        machine.handle_utterance("yes", 0.95, &fixture.ctx());

        let effects = machine.persist_completed(PersistOutcome::Rejected("inactive exercise".into()));
        assert_eq!(machine.state(), MachineState::Idle);
        assert_eq!(recorded(&effects, VoiceEventType::Correction), 1);
        assert_eq!(recorded(&effects, VoiceEventType::Confirmation), 0);
    }

    #[test]
    fn test_rest_timer_uses_default() {
        let fixture = Fixture::new();
        let mut machine = ConfirmationMachine::new(VoiceConfig::default());
        let effects = machine.handle_utterance("rest", 0.95, &fixture.ctx());
        assert!(effects.contains(&Effect::StartRestTimer { seconds: 90 }));
    }

    #[test]
    fn test_validate_draft_limits() {
        let exercise = Exercise::new("e1", "Back Squat");
        let none = HashSet::new();
        let mut draft = SetDraft::new(&exercise, 0);
        assert!(validate_draft(&draft, Some(&exercise), &none, true).is_err());
        draft.reps = 5;
        assert!(validate_draft(&draft, Some(&exercise), &none, true).is_ok());
        draft.weight_kg = Some(1200.0);
        assert!(validate_draft(&draft, Some(&exercise), &none, true).is_err());
        draft.weight_kg = Some(100.0);
        draft.rpe = Some(11.0);
        assert!(validate_draft(&draft, Some(&exercise), &none, true).is_err());
    }
}
