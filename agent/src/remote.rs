//! Remote store client for the TimeFlow backend.
//!
//! The agent treats its backend as an external, fallible collaborator that
//! exposes three operations: insert a row, patch a row by id, and upload an
//! object. [`RemoteStore`] captures that contract so the sync path can be
//! exercised against either the real service or an in-process fake.
//!
//! # Architecture
//!
//! - [`SupabaseStore`] speaks PostgREST (`/rest/v1/{table}`) and the storage
//!   API (`/storage/v1/object/{bucket}/{path}`). Inserts use
//!   `resolution=merge-duplicates` and uploads use `x-upsert`, so replaying a
//!   queued write after an ambiguous failure does not create a second row.
//! - [`MemoryStore`] keeps rows in memory and can be switched offline. It backs
//!   `timeflow-agent run --offline` and the test suite.
//!
//! # Example
//!
//! ```rust,ignore
//! use timeflow_agent::remote::{RemoteStore, SupabaseStore};
//!
//! let store = SupabaseStore::new("https://your-project.supabase.co", "anon-key")?;
//! let id = store.insert("time_logs", &serde_json::json!({ "user_id": "u1" })).await?;
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

/// Timeout applied to every remote request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors returned by a [`RemoteStore`].
///
/// Every variant is treated the same by the sync path (the record is queued),
/// but the distinction is kept for logging.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The remote store could not be reached.
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    /// The remote store answered with a non-success status.
    #[error("rejected by remote store: {status} - {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The response could not be interpreted.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Client configuration error.
    #[error("client configuration error: {0}")]
    Configuration(String),
}

/// Operations the agent needs from its backend.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Inserts `record` into `table` and returns the id of the stored row.
    async fn insert(&self, table: &str, record: &Value) -> Result<String, RemoteError>;

    /// Applies `fields` to the row of `table` whose id is `id`.
    async fn update(&self, table: &str, id: &str, fields: &Value) -> Result<(), RemoteError>;

    /// Stores `bytes` at `object_path` inside `bucket` and returns its public URL.
    async fn upload(
        &self,
        bucket: &str,
        object_path: &str,
        bytes: Vec<u8>,
    ) -> Result<String, RemoteError>;
}

/// [`RemoteStore`] backed by a Supabase project.
#[derive(Debug, Clone)]
pub struct SupabaseStore {
    http_client: Client,
    base_url: String,
    api_key: String,
}

impl SupabaseStore {
    /// Creates a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The project URL (e.g., `https://xxx.supabase.co`)
    /// * `api_key` - Key sent as both `apikey` and bearer token
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Configuration`] if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, RemoteError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(5)
            .build()
            .map_err(|e| RemoteError::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url,
            api_key: api_key.into(),
        })
    }

    /// Returns the configured base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = self.authorized(request).send().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout(REQUEST_TIMEOUT)
            } else if e.is_connect() {
                RemoteError::Unavailable(format!("connection failed: {e}"))
            } else {
                RemoteError::Unavailable(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, "Remote store rejected request");
        Err(RemoteError::Rejected {
            status: status.as_u16(),
            message: if body.is_empty() {
                status.canonical_reason().unwrap_or("unknown").to_string()
            } else {
                body
            },
        })
    }
}

#[async_trait]
impl RemoteStore for SupabaseStore {
    async fn insert(&self, table: &str, record: &Value) -> Result<String, RemoteError> {
        let url = format!("{}/rest/v1/{table}", self.base_url);
        debug!(url = %url, "Inserting row");

        let request = self
            .http_client
            .post(&url)
            .header("Prefer", "return=representation,resolution=merge-duplicates")
            .json(record);
        let response = self.send(request).await?;

        let rows: Value = response.json().await.map_err(|e| {
            RemoteError::InvalidResponse(format!("failed to parse insert response: {e}"))
        })?;

        // PostgREST returns the stored rows as an array.
        let returned = rows.get(0).and_then(|row| row.get("id"));
        match returned.or_else(|| record.get("id")) {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Err(RemoteError::InvalidResponse(
                "insert response did not include an id".to_string(),
            )),
        }
    }

    async fn update(&self, table: &str, id: &str, fields: &Value) -> Result<(), RemoteError> {
        let url = format!("{}/rest/v1/{table}", self.base_url);
        debug!(url = %url, id, "Updating row");

        let request = self
            .http_client
            .patch(&url)
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=minimal")
            .json(fields);
        self.send(request).await?;
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        object_path: &str,
        bytes: Vec<u8>,
    ) -> Result<String, RemoteError> {
        let url = format!("{}/storage/v1/object/{bucket}/{object_path}", self.base_url);
        debug!(url = %url, size = bytes.len(), "Uploading object");

        let request = self
            .http_client
            .post(&url)
            .header("x-upsert", "true")
            .header("Content-Type", "image/png")
            .body(bytes);
        self.send(request).await?;

        Ok(format!(
            "{}/storage/v1/object/public/{bucket}/{object_path}",
            self.base_url
        ))
    }
}

#[derive(Debug)]
struct MemoryState {
    available: bool,
    tables: HashMap<String, Vec<Value>>,
    objects: HashMap<String, Vec<u8>>,
    attempts: usize,
}

/// In-process [`RemoteStore`] that can be toggled offline.
///
/// Inserts upsert by `id`, so replayed records replace their earlier copy.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store that accepts writes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                available: true,
                tables: HashMap::new(),
                objects: HashMap::new(),
                attempts: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every subsequent call succeed (`true`) or fail (`false`).
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Rows currently stored in `table`.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// Object paths currently stored in `bucket`.
    #[must_use]
    pub fn objects(&self, bucket: &str) -> Vec<String> {
        let prefix = format!("{bucket}/");
        let mut paths: Vec<String> = self
            .lock()
            .objects
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect();
        paths.sort();
        paths
    }

    /// Number of calls made against the store, successful or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    fn begin(&self) -> Result<MutexGuard<'_, MemoryState>, RemoteError> {
        let mut state = self.lock();
        state.attempts += 1;
        if state.available {
            Ok(state)
        } else {
            Err(RemoteError::Unavailable("remote store is offline".to_string()))
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn insert(&self, table: &str, record: &Value) -> Result<String, RemoteError> {
        let mut state = self.begin()?;

        let mut row = record.clone();
        let id = match row.get("id") {
            Some(Value::String(id)) => id.clone(),
            _ => {
                let id = Uuid::new_v4().to_string();
                if let Value::Object(map) = &mut row {
                    map.insert("id".to_string(), Value::String(id.clone()));
                }
                id
            }
        };

        let rows = state.tables.entry(table.to_string()).or_default();
        match rows.iter_mut().find(|r| r.get("id").and_then(Value::as_str) == Some(id.as_str())) {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
        Ok(id)
    }

    async fn update(&self, table: &str, id: &str, fields: &Value) -> Result<(), RemoteError> {
        let mut state = self.begin()?;

        // Matching zero rows is not an error, as with PostgREST.
        let target = state.tables.get_mut(table).and_then(|rows| {
            rows.iter_mut()
                .find(|r| r.get("id").and_then(Value::as_str) == Some(id))
        });
        if let (Some(Value::Object(row)), Value::Object(patch)) = (target, fields) {
            for (key, value) in patch {
                row.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        object_path: &str,
        bytes: Vec<u8>,
    ) -> Result<String, RemoteError> {
        let mut state = self.begin()?;
        state.objects.insert(format!("{bucket}/{object_path}"), bytes);
        Ok(format!("memory://{bucket}/{object_path}"))
    }
}
