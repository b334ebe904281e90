//! Collaborator interfaces for the exercise library and durable persistence
//!
//! The voice core never talks to the backend directly; it goes through
//! [`LibraryProvider`] for read-only library data and [`PersistenceGateway`] for
//! everything it writes. [`RestGateway`] implements both against a PostgREST-style
//! HTTP backend.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::storage::{SETTING_BACKEND_API_KEY, SETTING_BACKEND_URL, Storage};
use crate::types::{
    Exercise, RemoteSessionId, SessionMetadata, SessionType, SetDraft, SetId, VoiceEvent,
};

/// Read access to the user's exercise library
#[async_trait]
pub trait LibraryProvider: Send + Sync {
    /// Exercises with `status = active` only
    async fn active_exercises(&self, user_id: &str) -> Result<Vec<Exercise>>;

    /// Ids of equipment marked available
    async fn available_equipment(&self, user_id: &str) -> Result<HashSet<String>>;
}

/// Durable store for sessions, events and workout sets
///
/// Every call may fail with [`Error::Transient`]/[`Error::Network`] (retryable) or
/// [`Error::Validation`] (the backend refused the write).
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn create_session(
        &self,
        session_type: SessionType,
        metadata: &SessionMetadata,
    ) -> Result<RemoteSessionId>;

    async fn append_event(&self, session_id: &str, event: &VoiceEvent) -> Result<()>;

    async fn commit_set(&self, workout_id: &str, draft: &SetDraft) -> Result<SetId>;

    /// Overwrite the set previously committed under `draft.client_id`
    async fn amend_set(&self, workout_id: &str, draft: &SetDraft) -> Result<()>;

    /// Revert the most recent set of the workout; false if there was none
    async fn revert_last_set(&self, workout_id: &str) -> Result<bool>;
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Gateway for a PostgREST-compatible backend (e.g. Supabase)
pub struct RestGateway {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: String,
}

#[derive(Debug, Deserialize)]
struct EquipmentRow {
    equipment_id: String,
}

impl RestGateway {
    /// Create a gateway (API key loaded from `LIFTVOICE_API_KEY` if not provided)
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let key = api_key.or_else(|| std::env::var("LIFTVOICE_API_KEY").ok());
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: key,
            access_token: None,
        })
    }

    /// Build from the backend settings stored in SQLite
    pub fn from_storage(storage: &Storage) -> Result<Self> {
        let base_url = storage
            .get_setting(SETTING_BACKEND_URL)?
            .ok_or_else(|| Error::Config("backend url not set".to_string()))?;
        Self::new(base_url, storage.get_setting(SETTING_BACKEND_API_KEY)?)
    }

    /// Authenticate requests as a signed-in user instead of with the bare API key
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn url(&self, path: &str, filters: &[(&str, String)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/rest/v1/{}", self.base_url, path))
            .map_err(|e| Error::Config(format!("invalid backend url: {e}")))?;
        if !filters.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in filters {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(key) = &self.api_key {
            builder = builder.header("apikey", key);
        }
        // a signed-in user's token wins over the project key
        if let Some(bearer) = self.access_token.as_ref().or(self.api_key.as_ref()) {
            builder = builder.header("Authorization", format!("Bearer {}", bearer));
        }
        builder
    }

    async fn first_id(response: Response, what: &str) -> Result<String> {
        let rows: Vec<IdRow> = read_json(response, what).await?;
        rows.into_iter()
            .next()
            .map(|row| row.id)
            .ok_or_else(|| Error::Validation(format!("{what}: backend returned no row")))
    }
}

/// Map a non-success HTTP status onto the retryable/validation split
fn classify_status(status: StatusCode, body: &str, what: &str) -> Error {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Error::Transient(format!("{what}: {status}"))
    } else {
        Error::Validation(format!("{what}: {status} - {body}"))
    }
}

/// Decode a success body; one that does not parse is a validation failure
fn parse_body<T: DeserializeOwned>(body: &str, what: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| {
        error!("Backend {} returned an unreadable body: {}", what, e);
        Error::Validation(format!("{what}: unreadable response: {e}"))
    })
}

async fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    let body = response.text().await?;
    parse_body(&body, what)
}

async fn check(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    error!("Backend {} failed: {} - {}", what, status, body);
    Err(classify_status(status, &body, what))
}

#[async_trait]
impl LibraryProvider for RestGateway {
    async fn active_exercises(&self, user_id: &str) -> Result<Vec<Exercise>> {
        let url = self.url(
            "exercises",
            &[
                ("select", "id,name,equipment_required,status".to_string()),
                ("user_id", format!("eq.{user_id}")),
                ("status", "eq.active".to_string()),
            ],
        )?;
        let response = check(self.request(Method::GET, url).send().await?, "exercises").await?;
        let exercises: Vec<Exercise> = read_json(response, "exercises").await?;
        debug!("Fetched {} active exercises", exercises.len());

        // the matcher trusts this list, so never let a stale status through
        Ok(exercises.into_iter().filter(Exercise::is_active).collect())
    }

    async fn available_equipment(&self, user_id: &str) -> Result<HashSet<String>> {
        let url = self.url(
            "user_equipment",
            &[
                ("select", "equipment_id".to_string()),
                ("user_id", format!("eq.{user_id}")),
                ("available", "eq.true".to_string()),
            ],
        )?;
        let response = check(self.request(Method::GET, url).send().await?, "equipment").await?;
        let rows: Vec<EquipmentRow> = read_json(response, "equipment").await?;
        Ok(rows.into_iter().map(|row| row.equipment_id).collect())
    }
}

#[async_trait]
impl PersistenceGateway for RestGateway {
    async fn create_session(
        &self,
        session_type: SessionType,
        metadata: &SessionMetadata,
    ) -> Result<RemoteSessionId> {
        let url = self.url("voice_sessions", &[])?;
        let body = json!({
            "session_type": session_type,
            "user_id": metadata.user_id,
            "workout_id": metadata.workout_id,
            "locale": metadata.locale,
            "metadata": metadata.extra,
        });
        let response = self
            .request(Method::POST, url)
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await?;
        let id = Self::first_id(check(response, "create session").await?, "create session").await?;
        debug!("Registered voice session {}", id);
        Ok(id)
    }

    async fn append_event(&self, session_id: &str, event: &VoiceEvent) -> Result<()> {
        let url = self.url("voice_events", &[("on_conflict", "id".to_string())])?;
        let body = json!({
            "id": event.id,
            "session_id": session_id,
            "event_type": event.event_type,
            "payload": event.payload,
            "confidence": event.confidence,
            "created_at": event.timestamp,
        });
        let response = self
            .request(Method::POST, url)
            .header("Prefer", "resolution=ignore-duplicates,return=minimal")
            .json(&body)
            .send()
            .await?;
        check(response, "append event").await?;
        Ok(())
    }

    async fn commit_set(&self, workout_id: &str, draft: &SetDraft) -> Result<SetId> {
        // upsert on client_id so a replayed commit cannot create a second row
        let url = self.url("workout_sets", &[("on_conflict", "client_id".to_string())])?;
        let body = json!({
            "client_id": draft.client_id,
            "workout_id": workout_id,
            "exercise_id": draft.exercise_id,
            "set_index": draft.set_index,
            "reps": draft.reps,
            "weight_kg": draft.weight_kg,
            "rpe": draft.rpe,
        });
        let response = self
            .request(Method::POST, url)
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&body)
            .send()
            .await?;
        Self::first_id(check(response, "commit set").await?, "commit set").await
    }

    async fn amend_set(&self, workout_id: &str, draft: &SetDraft) -> Result<()> {
        let url = self.url(
            "workout_sets",
            &[
                ("client_id", format!("eq.{}", draft.client_id)),
                ("workout_id", format!("eq.{workout_id}")),
            ],
        )?;
        let body = json!({
            "exercise_id": draft.exercise_id,
            "set_index": draft.set_index,
            "reps": draft.reps,
            "weight_kg": draft.weight_kg,
            "rpe": draft.rpe,
        });
        let response = self
            .request(Method::PATCH, url)
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await?;
        let rows: Vec<IdRow> = read_json(check(response, "amend set").await?, "amend set").await?;
        if rows.is_empty() {
            return Err(Error::Validation(format!(
                "amend set: no set with client id {}",
                draft.client_id
            )));
        }
        Ok(())
    }

    async fn revert_last_set(&self, workout_id: &str) -> Result<bool> {
        let url = self.url("rpc/revert_last_set", &[])?;
        let response = self
            .request(Method::POST, url)
            .json(&json!({ "workout_id": workout_id }))
            .send()
            .await?;
        let what = "revert last set";
        let reverted: bool = read_json(check(response, what).await?, what).await?;
        Ok(reverted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "", "x").is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "", "x").is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "", "x").is_retryable());
        assert!(matches!(
            classify_status(StatusCode::CONFLICT, "inactive exercise", "commit set"),
            Error::Validation(msg) if msg.contains("inactive exercise")
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "", "x"),
            Error::Validation(_)
        ));
    }

    #[test]
    fn test_unreadable_body_is_not_retried() {
        let result: Result<Vec<IdRow>> = parse_body(r#"[{"uuid": "s1"}]"#, "commit set");
        let err = result.unwrap_err();
        assert!(matches!(&err, Error::Validation(msg) if msg.contains("commit set")));
        assert!(!err.is_retryable());

        let rows: Vec<IdRow> = parse_body(r#"[{"id": "s1"}]"#, "commit set").unwrap();
        assert_eq!(rows[0].id, "s1");
        let reverted: bool = parse_body("true", "revert last set").unwrap();
        assert!(reverted);
    }

    #[test]
    fn test_url_filters_are_encoded() {
        let gateway = RestGateway::new("https://db.example.com/", Some("k".to_string())).unwrap();
        let url = gateway
            .url("exercises", &[("user_id", "eq.a b&c".to_string())])
            .unwrap();
        assert_eq!(url.path(), "/rest/v1/exercises");
        assert_eq!(url.query(), Some("user_id=eq.a+b%26c"));
    }

    fn auth_headers(gateway: &RestGateway) -> (Option<String>, Option<String>) {
        let url = gateway.url("exercises", &[]).unwrap();
        let request = gateway.request(Method::GET, url).build().unwrap();
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .map(|value| value.to_str().unwrap().to_string())
        };
        (header("apikey"), header("Authorization"))
    }

    #[test]
    fn test_request_authentication() {
        let keyed = RestGateway::new("https://db.example.com", Some("k".to_string())).unwrap();
        assert_eq!(
            auth_headers(&keyed),
            (Some("k".to_string()), Some("Bearer k".to_string()))
        );

        let signed_in = keyed.with_access_token("t");
        assert_eq!(
            auth_headers(&signed_in),
            (Some("k".to_string()), Some("Bearer t".to_string()))
        );

        // cleared by hand so a LIFTVOICE_API_KEY in the environment cannot leak in
        let mut anonymous = RestGateway::new("https://db.example.com", None).unwrap();
        anonymous.api_key = None;
        assert_eq!(auth_headers(&anonymous), (None, None));

        let token_only = anonymous.with_access_token("t");
        assert_eq!(auth_headers(&token_only), (None, Some("Bearer t".to_string())));
    }

    #[test]
    fn test_from_storage_requires_url() {
        let storage = Storage::in_memory().unwrap();
        assert!(matches!(
            RestGateway::from_storage(&storage),
            Err(Error::Config(_))
        ));
        storage
            .set_setting(SETTING_BACKEND_URL, "https://db.example.com")
            .unwrap();
        assert!(RestGateway::from_storage(&storage).is_ok());
    }
}
