//! Read/write access to the project-management data store.
//!
//! Every call is parameterized by the caller's `client_id`. Implementations
//! are expected to honor it, but callers must not rely on that: the
//! retrieval layer filters rows again before anything reaches a response.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::{resolve_secret, DataApiConfig};
use crate::error::{ParleyError, Result};
use crate::model::{
    ActionCommand, ActionType, EntityFilters, EntityRecord, EntityRef, EntityType, TimeRange,
};

/// Result of a successful write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub entity: EntityRef,
    pub message: String,
}

pub trait DataApi: Send + Sync {
    fn search(
        &self,
        client_id: &str,
        filters: &EntityFilters,
        time_range: Option<TimeRange>,
    ) -> impl std::future::Future<Output = Result<Vec<EntityRecord>>> + Send;

    fn get(
        &self,
        client_id: &str,
        entity: &EntityRef,
    ) -> impl std::future::Future<Output = Result<Option<EntityRecord>>> + Send;

    /// Single attempt. Callers never retry writes.
    fn write(
        &self,
        client_id: &str,
        command: &ActionCommand,
    ) -> impl std::future::Future<Output = Result<WriteOutcome>> + Send;

    fn health(&self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Enum wrapper for data API backends (the trait uses RPITIT, so no `dyn`).
pub enum DataApiBackend {
    Http(HttpDataApi),
    Memory(InMemoryDataApi),
}

impl DataApiBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Memory(_) => "memory",
        }
    }

    pub fn as_memory(&self) -> Option<&InMemoryDataApi> {
        match self {
            Self::Memory(m) => Some(m),
            Self::Http(_) => None,
        }
    }
}

impl DataApi for DataApiBackend {
    async fn search(
        &self,
        client_id: &str,
        filters: &EntityFilters,
        time_range: Option<TimeRange>,
    ) -> Result<Vec<EntityRecord>> {
        match self {
            Self::Http(d) => d.search(client_id, filters, time_range).await,
            Self::Memory(d) => d.search(client_id, filters, time_range).await,
        }
    }

    async fn get(&self, client_id: &str, entity: &EntityRef) -> Result<Option<EntityRecord>> {
        match self {
            Self::Http(d) => d.get(client_id, entity).await,
            Self::Memory(d) => d.get(client_id, entity).await,
        }
    }

    async fn write(&self, client_id: &str, command: &ActionCommand) -> Result<WriteOutcome> {
        match self {
            Self::Http(d) => d.write(client_id, command).await,
            Self::Memory(d) => d.write(client_id, command).await,
        }
    }

    async fn health(&self) -> Result<()> {
        match self {
            Self::Http(d) => d.health().await,
            Self::Memory(d) => d.health().await,
        }
    }
}

/// Build the configured data API backend.
pub fn create_data_api(config: &DataApiConfig) -> Result<DataApiBackend> {
    match config.backend.as_str() {
        "http" => Ok(DataApiBackend::Http(HttpDataApi::from_config(config)?)),
        "memory" => {
            tracing::info!("data api: serving built-in demo dataset");
            Ok(DataApiBackend::Memory(InMemoryDataApi::demo()))
        }
        other => Err(ParleyError::Config(format!(
            "unknown data api backend: {other}"
        ))),
    }
}

// -- HTTP --

/// JSON client for the host's data API.
pub struct HttpDataApi {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    filters: &'a EntityFilters,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_range: Option<TimeRange>,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<EntityRecord>,
}

impl HttpDataApi {
    pub fn from_config(config: &DataApiConfig) -> Result<Self> {
        // A missing key is allowed: some deployments sit behind a private network.
        let api_key = resolve_secret(
            config.api_key.as_deref(),
            config.env_var.as_deref(),
            "PARLEY_DATA_API_KEY",
            "data api key",
        )
        .ok();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            http,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.http.request(method, format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn search_once(
        &self,
        client_id: &str,
        filters: &EntityFilters,
        time_range: Option<TimeRange>,
    ) -> Result<Vec<EntityRecord>> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/clients/{client_id}/entities/search"),
            )
            .json(&SearchRequest {
                filters,
                time_range,
            })
            .send()
            .await
            .map_err(downstream)?;
        let resp = check_status(resp, "search").await?;
        let body: SearchResponse = resp.json().await?;
        Ok(body.items)
    }

    async fn get_once(&self, client_id: &str, entity: &EntityRef) -> Result<Option<EntityRecord>> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/clients/{client_id}/entities/{}", entity.id),
            )
            .send()
            .await
            .map_err(downstream)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(resp, "get").await?;
        Ok(Some(resp.json().await?))
    }
}

impl DataApi for HttpDataApi {
    async fn search(
        &self,
        client_id: &str,
        filters: &EntityFilters,
        time_range: Option<TimeRange>,
    ) -> Result<Vec<EntityRecord>> {
        crate::retry::retry_read("data api search", 2, 200, || {
            self.search_once(client_id, filters, time_range)
        })
        .await
    }

    async fn get(&self, client_id: &str, entity: &EntityRef) -> Result<Option<EntityRecord>> {
        crate::retry::retry_read("data api get", 2, 200, || self.get_once(client_id, entity)).await
    }

    async fn write(&self, client_id: &str, command: &ActionCommand) -> Result<WriteOutcome> {
        let resp = self
            .request(reqwest::Method::POST, &format!("/clients/{client_id}/actions"))
            .header("Idempotency-Key", command.proposal_id.to_string())
            .json(command)
            .send()
            .await
            .map_err(|e| ParleyError::ActionFailed(format!("data api unreachable: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ParleyError::ActionFailed(format!(
                "data api error {}: {text}",
                status.as_u16()
            )));
        }
        resp.json()
            .await
            .map_err(|e| ParleyError::ActionFailed(format!("unreadable write response: {e}")))
    }

    async fn health(&self) -> Result<()> {
        let resp = self
            .request(reqwest::Method::GET, "/health")
            .send()
            .await
            .map_err(downstream)?;
        check_status(resp, "health").await.map(|_| ())
    }
}

fn downstream(e: reqwest::Error) -> ParleyError {
    if e.is_timeout() {
        ParleyError::Timeout(format!("data api: {e}"))
    } else {
        ParleyError::DownstreamUnavailable(format!("data api: {e}"))
    }
}

async fn check_status(resp: reqwest::Response, op: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let msg = format!("data api {op} returned {}: {text}", status.as_u16());
    if status == reqwest::StatusCode::FORBIDDEN {
        Err(ParleyError::AccessDenied(msg))
    } else {
        Err(ParleyError::DownstreamUnavailable(msg))
    }
}

// -- In-memory --

/// Seedable fixture store. Used for the `memory` backend and in tests.
#[derive(Default)]
pub struct InMemoryDataApi {
    records: RwLock<Vec<EntityRecord>>,
    writes: RwLock<Vec<ActionCommand>>,
    fail_writes: AtomicBool,
    unavailable: AtomicBool,
    // Returns every tenant's rows from `search`, like a buggy backend would.
    leak_across_clients: AtomicBool,
    search_calls: AtomicUsize,
    latency_ms: AtomicU64,
}

impl InMemoryDataApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<EntityRecord>) -> Self {
        let api = Self::new();
        if let Ok(mut guard) = api.records.write() {
            *guard = records;
        }
        api
    }

    /// Small two-tenant dataset for local development.
    pub fn demo() -> Self {
        let now = Utc::now();
        Self::with_records(vec![
            EntityRecord::new(EntityType::Program, "PRG-1", "acme", "Platform modernization")
                .with_owner("carol"),
            EntityRecord::new(EntityType::Project, "PRJ-3", "acme", "Payments revamp")
                .with_status("in_progress")
                .with_owner("carol"),
            EntityRecord::new(EntityType::Milestone, "MS-2", "acme", "Payments beta")
                .with_status("open"),
            EntityRecord::new(EntityType::Task, "TSK-42", "acme", "Integrate card tokenization")
                .with_status("blocked")
                .with_assignee("alice")
                .with_owner("alice")
                .with_blocked_by(vec!["BUG-7".into()])
                .with_updated_at(now - chrono::Duration::hours(2)),
            EntityRecord::new(EntityType::Task, "TSK-43", "acme", "Write payment webhooks")
                .with_status("in_progress")
                .with_assignee("bob")
                .with_owner("bob"),
            EntityRecord::new(EntityType::Bug, "BUG-7", "acme", "Tokenizer rejects Amex cards")
                .with_status("open")
                .with_assignee("bob")
                .with_updated_at(now - chrono::Duration::days(1)),
            EntityRecord::new(EntityType::Document, "DOC-5", "acme", "Payments runbook")
                .with_description("How to rotate tokenization keys"),
            EntityRecord::new(EntityType::Task, "TSK-900", "globex", "Globex onboarding")
                .with_status("open")
                .with_assignee("zed"),
        ])
    }

    pub fn insert(&self, record: EntityRecord) {
        if let Ok(mut guard) = self.records.write() {
            guard.retain(|r| r.id != record.id || r.client_id != record.client_id);
            guard.push(record);
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_leak_across_clients(&self, leak: bool) {
        self.leak_across_clients.store(leak, Ordering::SeqCst);
    }

    /// Delay every read by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `search` calls served so far.
    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    /// Every write applied so far, oldest first.
    pub fn writes(&self) -> Vec<ActionCommand> {
        self.writes.read().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn record(&self, client_id: &str, id: &str) -> Option<EntityRecord> {
        self.records
            .read()
            .ok()?
            .iter()
            .find(|r| r.client_id == client_id && r.id == id)
            .cloned()
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ParleyError::DownstreamUnavailable(
                "data api: connection refused".into(),
            ));
        }
        Ok(())
    }
}

fn lock_err<E: std::fmt::Display>(e: E) -> ParleyError {
    ParleyError::Storage(format!("data api fixture lock poisoned: {e}"))
}

/// Whether `record` satisfies `filters`/`time_range` (tenant not checked).
pub fn matches_filters(
    record: &EntityRecord,
    filters: &EntityFilters,
    time_range: Option<TimeRange>,
) -> bool {
    if !filters.ids.is_empty() {
        return filters
            .ids
            .iter()
            .any(|r| r.id.eq_ignore_ascii_case(&record.id));
    }
    if let Some(t) = filters.entity_type {
        if record.entity_type != t {
            return false;
        }
    }
    if let Some(status) = &filters.status {
        if record.status.as_deref() != Some(status.as_str()) {
            return false;
        }
    }
    if let Some(assignee) = &filters.assignee {
        if record.assignee.as_deref() != Some(assignee.as_str()) {
            return false;
        }
    }
    if let Some(range) = time_range {
        if !range.contains(record.updated_at) {
            return false;
        }
    }
    if filters.entity_type.is_none()
        && filters.status.is_none()
        && filters.assignee.is_none()
        && !filters.keywords.is_empty()
    {
        let haystack = record.search_text().to_lowercase();
        return filters.keywords.iter().any(|k| haystack.contains(k.as_str()));
    }
    true
}

impl DataApi for InMemoryDataApi {
    async fn search(
        &self,
        client_id: &str,
        filters: &EntityFilters,
        time_range: Option<TimeRange>,
    ) -> Result<Vec<EntityRecord>> {
        self.check_available()?;
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let leak = self.leak_across_clients.load(Ordering::SeqCst);
        let records = self.records.read().map_err(lock_err)?;
        Ok(records
            .iter()
            .filter(|r| leak || r.client_id == client_id)
            .filter(|r| matches_filters(r, filters, time_range))
            .cloned()
            .collect())
    }

    async fn get(&self, client_id: &str, entity: &EntityRef) -> Result<Option<EntityRecord>> {
        self.check_available()?;
        self.simulate_latency().await;
        Ok(self.record(client_id, &entity.id))
    }

    async fn write(&self, client_id: &str, command: &ActionCommand) -> Result<WriteOutcome> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ParleyError::ActionFailed(
                "data api error 503: service unavailable".into(),
            ));
        }

        let mut records = self.records.write().map_err(lock_err)?;
        let Some(record) = records
            .iter_mut()
            .find(|r| r.client_id == client_id && r.id == command.target.id)
        else {
            return Err(ParleyError::ActionFailed(format!(
                "data api error 404: {} not found",
                command.target.id
            )));
        };

        let message = match command.action {
            ActionType::UpdateStatus => {
                let status = param(&command.parameters, "status")?;
                record.status = Some(status.to_string());
                record.updated_at = Utc::now();
                format!("{} status set to {status}", record.id)
            }
            ActionType::CreateComment => format!("Comment added to {}", record.id),
            ActionType::SetReminder => format!(
                "Reminder set for {} at {}",
                record.id,
                param(&command.parameters, "remind_at")?
            ),
            ActionType::LinkCommit => format!(
                "Linked PR #{} to {}",
                param(&command.parameters, "pr_id")?,
                record.id
            ),
            ActionType::View | ActionType::DeepLink => {
                return Err(ParleyError::ActionFailed(format!(
                    "{} is not a write operation",
                    command.action
                )))
            }
        };
        let entity = record.entity_ref();
        drop(records);

        self.writes.write().map_err(lock_err)?.push(command.clone());
        Ok(WriteOutcome { entity, message })
    }

    async fn health(&self) -> Result<()> {
        self.check_available()
    }
}

fn param<'a>(parameters: &'a BTreeMap<String, String>, name: &str) -> Result<&'a str> {
    parameters
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| ParleyError::ActionFailed(format!("missing parameter '{name}'")))
}
