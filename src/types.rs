//! Core types used throughout the voice core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for voice sessions (client side)
pub type SessionId = Uuid;

/// Unique identifier for voice events
pub type EventId = Uuid;

/// Identifier the backend assigns to a mirrored session
pub type RemoteSessionId = String;

/// Identifier the backend assigns to a committed set
pub type SetId = String;

/// Audio data as raw bytes (16-bit PCM)
pub type AudioData = Vec<u8>;

/// Kind of voice session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// Logging sets inside a workout
    Workout,
    /// General voice interaction with no workout attached
    #[default]
    Free,
}

/// Lifecycle status of a voice session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
}

/// Free-form context attached to a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub user_id: String,
    /// Client-generated workout id, present on workout sessions
    #[serde(default)]
    pub workout_id: Option<String>,
    /// Locale tag of the speaker, e.g. "en-US"
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SessionMetadata {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_workout(mut self, workout_id: impl Into<String>) -> Self {
        self.workout_id = Some(workout_id.into());
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }
}

/// A voice session and its ordered event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceSession {
    pub id: SessionId,
    /// Server-assigned id once the session has been registered
    pub remote_id: Option<RemoteSessionId>,
    pub session_type: SessionType,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub metadata: SessionMetadata,
    pub events: Vec<VoiceEvent>,
}

impl VoiceSession {
    pub fn new(session_type: SessionType, metadata: SessionMetadata) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_id: None,
            session_type,
            start_time: Utc::now(),
            end_time: None,
            status: SessionStatus::Active,
            metadata,
            events: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Mark completed; returns false if it already was
    pub fn complete(&mut self) -> bool {
        if self.status == SessionStatus::Completed {
            return false;
        }
        self.status = SessionStatus::Completed;
        self.end_time = Some(Utc::now());
        true
    }
}

/// Types of events recorded in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceEventType {
    Transcription,
    IntentRecognized,
    Confirmation,
    Correction,
    Tts,
    System,
}

/// An append-only entry in a session's event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceEvent {
    pub id: EventId,
    pub event_type: VoiceEventType,
    pub payload: serde_json::Value,
    pub confidence: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

impl VoiceEvent {
    pub fn new(event_type: VoiceEventType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            payload,
            confidence: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }
}

/// Library status of an exercise
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExerciseStatus {
    #[default]
    Active,
    Archived,
    Suggested,
}

/// An exercise from the user's library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exercise {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub equipment_required: Vec<String>,
    #[serde(default)]
    pub status: ExerciseStatus,
}

impl Exercise {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            equipment_required: Vec::new(),
            status: ExerciseStatus::Active,
        }
    }

    pub fn with_equipment(mut self, equipment: &[&str]) -> Self {
        self.equipment_required = equipment.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn with_status(mut self, status: ExerciseStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == ExerciseStatus::Active
    }
}

/// A set about to be written to the workout log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetDraft {
    /// Client-side idempotency key; amendments target this id
    pub client_id: Uuid,
    pub exercise_id: String,
    pub exercise_name: String,
    pub set_index: Option<u32>,
    pub reps: u32,
    pub weight_kg: Option<f32>,
    pub rpe: Option<f32>,
}

impl SetDraft {
    pub fn new(exercise: &Exercise, reps: u32) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            exercise_id: exercise.id.clone(),
            exercise_name: exercise.name.clone(),
            set_index: None,
            reps,
            weight_kg: None,
            rpe: None,
        }
    }
}

/// A set that was persisted (or queued for persistence) during this session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedSet {
    pub workout_id: String,
    /// Backend id, unknown while the commit is still queued
    pub set_id: Option<SetId>,
    pub draft: SetDraft,
}
