//! The chat pipeline: admission, session, scope, intent, retrieval or
//! action, reply, audit.
//!
//! Every public entry point produces exactly one audit record, including
//! requests rejected before any work was done.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::AccessScope;
use crate::audit::{AuditAction, AuditEvent, AuditLogger};
use crate::collab::{
    create_data_api, create_extractor, create_vector_index, DataApi, DataApiBackend, Extractor,
    RoleAuthorizer, VectorBackend, VectorIndex,
};
use crate::config::ParleyConfig;
use crate::error::{ParleyError, Result};
use crate::executor::ActionExecutor;
use crate::intent::IntentResolver;
use crate::model::{validate_query, ActionState, ChatTurn, EntityRef, Intent, Principal};
use crate::rate_limit::{Admission, RateLimiter};
use crate::response::{ChatResponse, ResponseBuilder, ResponseStatus};
use crate::retrieval::RetrievalOrchestrator;
use crate::scrub::Masker;
use crate::session_store::{SessionLease, SessionStore};

/// Body of `POST /api/v1/chat`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub context: ChatContext,
}

/// Optional client context. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatContext {
    /// Continue the previous query from this result offset.
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub session_id: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// A request that ended in an error. `response` is the body to send.
#[derive(Debug)]
pub struct ChatFailure {
    pub error: ParleyError,
    pub response: ChatResponse,
}

pub type ChatResult = std::result::Result<ChatResponse, ChatFailure>;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub data_api: &'static str,
    pub vector_index: &'static str,
    pub nlu: &'static str,
    pub session_store: &'static str,
    pub active_sessions: usize,
}

impl HealthReport {
    /// Ready when the data API answers; everything else is optional.
    pub fn is_ready(&self) -> bool {
        self.data_api == "ok"
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sessions: usize,
    pub rate_buckets: usize,
    pub proposals: usize,
}

/// What a request got as far as, for the audit record and metrics.
struct Trace {
    action: AuditAction,
    intent: &'static str,
    session_id: Option<String>,
    client_id: Option<String>,
    status: &'static str,
    entities: Vec<EntityRef>,
    /// Reply to send instead of the generic error body.
    error_body: Option<ChatResponse>,
}

impl Trace {
    fn new(action: AuditAction, intent: &'static str) -> Self {
        Self {
            action,
            intent,
            session_id: None,
            client_id: None,
            status: "success",
            entities: Vec::new(),
            error_body: None,
        }
    }
}

pub struct ChatService {
    limiter: RateLimiter,
    sessions: SessionStore,
    resolver: IntentResolver,
    retrieval: RetrievalOrchestrator,
    executor: ActionExecutor,
    responses: ResponseBuilder,
    audit: AuditLogger,
    data_api: Arc<DataApiBackend>,
    vector: Arc<VectorBackend>,
    request_timeout: Duration,
    max_query_chars: usize,
}

impl ChatService {
    /// Wire every component from configuration.
    pub fn from_config(config: &ParleyConfig) -> Result<Self> {
        let data_api = create_data_api(&config.data_api)?;
        let vector = create_vector_index(&config.vector)?;
        let extractor = create_extractor(&config.llm)?;
        Self::with_collaborators(config, data_api, vector, extractor)
    }

    /// Wire the pipeline around caller-supplied collaborators.
    pub fn with_collaborators(
        config: &ParleyConfig,
        data_api: DataApiBackend,
        vector: VectorBackend,
        extractor: Extractor,
    ) -> Result<Self> {
        let data_api = Arc::new(data_api);
        let vector = Arc::new(vector);
        let masker = Masker::new(config.scrub.clone());

        Ok(Self {
            limiter: RateLimiter::from_config(&config.rate_limit),
            sessions: SessionStore::from_config(&config.session),
            resolver: IntentResolver::new(extractor, config.input.max_query_chars),
            retrieval: RetrievalOrchestrator::new(
                Arc::clone(&data_api),
                Arc::clone(&vector),
                &config.retrieval,
            ),
            executor: ActionExecutor::new(
                Arc::clone(&data_api),
                Arc::new(RoleAuthorizer),
                config.session_ttl(),
            ),
            responses: ResponseBuilder::from_config(&config.llm),
            audit: AuditLogger::from_config(&config.audit, masker)?,
            data_api,
            vector,
            request_timeout: config.request_timeout(),
            max_query_chars: config.input.max_query_chars,
        })
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn data_api(&self) -> &DataApiBackend {
        &self.data_api
    }

    pub fn vector(&self) -> &VectorBackend {
        &self.vector
    }

    /// Handle one chat message.
    pub async fn chat(&self, principal: &Principal, request: ChatRequest) -> ChatResult {
        let started = Instant::now();
        let request_id = Uuid::now_v7();
        let mut trace = Trace::new(AuditAction::Query, "none");

        let outcome = self
            .within_deadline(self.run_chat(principal, &request, &mut trace))
            .await;
        self.conclude(request_id, principal, &request.query, trace, outcome, started)
    }

    async fn run_chat(
        &self,
        principal: &Principal,
        request: &ChatRequest,
        trace: &mut Trace,
    ) -> Result<ChatResponse> {
        trace.client_id = principal.sole_client().map(str::to_string);
        self.admit(principal)?;
        let scope = AccessScope::derive(principal)?;
        validate_query(&request.query, self.max_query_chars)?;

        let mut lease = self
            .sessions
            .get_or_create(request.session_id.as_deref(), &scope.user_id, &scope.client_id)
            .await;
        self.sessions.touch(&mut lease);
        trace.session_id = Some(lease.session_id.clone());

        let intent = self.resolver.resolve(&request.query, &lease).await?;
        trace.intent = intent.type_name();
        let subjects = intent.subject_entities();

        let response = match intent {
            Intent::Query(mut query) => {
                if let Some(offset) = request.context.offset {
                    query.offset = offset;
                }
                let set = self.retrieval.retrieve(&query, &scope).await?;
                if set.denied {
                    trace.status = "access_denied";
                }
                trace.entities = set.entities_accessed();
                self.responses.query(&query, &set).await
            }
            Intent::ActionRequest(action) => {
                trace.action = AuditAction::Action;
                let proposal = self
                    .executor
                    .propose(&action, &lease.session_id, &scope)
                    .await?;
                trace.entities = proposal.target.iter().cloned().collect();
                let response = self.responses.proposal(&proposal);
                match proposal.rejection.as_ref().and_then(|r| r.as_error()) {
                    Some(ParleyError::Unsupported(_)) => trace.status = "unsupported",
                    Some(err) => {
                        trace.error_body = Some(response.with_session(lease.session_id.clone()));
                        return Err(err);
                    }
                    None => trace.status = "pending_confirmation",
                }
                response
            }
            Intent::Clarification {
                question,
                candidates,
            } => {
                trace.status = "clarification";
                self.responses.clarification(&question, &candidates)
            }
            Intent::Unsupported { reason } => {
                trace.status = "unsupported";
                self.responses.unsupported(&reason)
            }
        };

        self.record_exchange(&mut lease, &request.query, &response.message, subjects)
            .await;
        Ok(response.with_session(lease.session_id.clone()))
    }

    /// Confirm a pending proposal with its echoed parameters, then execute it.
    pub async fn confirm(
        &self,
        principal: &Principal,
        proposal_id: Uuid,
        request: ConfirmRequest,
    ) -> ChatResult {
        let started = Instant::now();
        let request_id = Uuid::now_v7();
        let mut trace = Trace::new(AuditAction::Action, "confirm");
        let text = format!("confirm proposal {proposal_id}");

        let outcome = self
            .within_deadline(self.run_confirm(principal, proposal_id, &request, &mut trace))
            .await;
        self.conclude(request_id, principal, &text, trace, outcome, started)
    }

    async fn run_confirm(
        &self,
        principal: &Principal,
        proposal_id: Uuid,
        request: &ConfirmRequest,
        trace: &mut Trace,
    ) -> Result<ChatResponse> {
        trace.client_id = principal.sole_client().map(str::to_string);
        self.admit(principal)?;
        let scope = AccessScope::derive(principal)?;
        trace.session_id = Some(request.session_id.clone());

        let mut lease = self.owned_session(&request.session_id, &scope).await?;
        self.sessions.touch(&mut lease);

        let proposal =
            self.executor
                .confirm(proposal_id, &lease.session_id, &scope.user_id, &request.parameters)?;
        trace.entities = proposal.target.iter().cloned().collect();
        let result = self.executor.execute(proposal).await?;
        let response = self.responses.action_result(&result);

        let targets: Vec<EntityRef> = result.proposal.target.iter().cloned().collect();
        self.sessions
            .append_turn(
                &mut lease,
                ChatTurn::assistant(result.message.clone()).with_entities(targets),
            )
            .await;

        let response = response.with_session(lease.session_id.clone());
        if result.proposal.state == ActionState::Failed {
            let reason = result.proposal.reason.clone().unwrap_or_default();
            trace.error_body = Some(response);
            return Err(ParleyError::ActionFailed(reason));
        }
        Ok(response)
    }

    /// Withdraw a pending proposal.
    pub async fn cancel(&self, principal: &Principal, proposal_id: Uuid, session_id: &str) -> ChatResult {
        let started = Instant::now();
        let request_id = Uuid::now_v7();
        let mut trace = Trace::new(AuditAction::Action, "cancel");
        let text = format!("cancel proposal {proposal_id}");

        let outcome = self
            .within_deadline(self.run_cancel(principal, proposal_id, session_id, &mut trace))
            .await;
        self.conclude(request_id, principal, &text, trace, outcome, started)
    }

    async fn run_cancel(
        &self,
        principal: &Principal,
        proposal_id: Uuid,
        session_id: &str,
        trace: &mut Trace,
    ) -> Result<ChatResponse> {
        trace.client_id = principal.sole_client().map(str::to_string);
        self.admit(principal)?;
        let scope = AccessScope::derive(principal)?;
        trace.session_id = Some(session_id.to_string());
        let lease = self.owned_session(session_id, &scope).await?;

        let proposal = self
            .executor
            .cancel(proposal_id, &lease.session_id, &scope.user_id)?;
        trace.status = "cancelled";
        trace.entities = proposal.target.iter().cloned().collect();

        let mut response = self.responses.proposal(&proposal);
        response.status = ResponseStatus::Success;
        response.message = format!("Cancelled {}.", proposal.describe());
        Ok(response.with_session(lease.session_id.clone()))
    }

    /// Recent turns of the caller's own session, oldest first.
    pub async fn history(
        &self,
        principal: &Principal,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChatTurn>> {
        let scope = AccessScope::derive(principal)?;
        let max = self.sessions.max_history();
        let limit = limit.unwrap_or(max).clamp(1, max);
        self.sessions
            .history(session_id, &scope.user_id, &scope.client_id, limit)
            .await
    }

    /// End the caller's session. Idempotent; foreign sessions are left alone.
    pub async fn clear_session(&self, principal: &Principal, session_id: &str) -> Result<bool> {
        let scope = AccessScope::derive(principal)?;
        let cleared = self
            .sessions
            .clear_owned(session_id, &scope.user_id, &scope.client_id)
            .await;
        if cleared {
            tracing::info!(session_id, user_id = %scope.user_id, "session cleared");
        }
        Ok(cleared)
    }

    pub async fn health(&self) -> HealthReport {
        let data_api = match self.data_api.health().await {
            Ok(()) => "ok",
            Err(e) => {
                tracing::warn!(error = %e, "health: data api unreachable");
                "unavailable"
            }
        };
        let vector_index = if !self.vector.is_enabled() {
            "disabled"
        } else {
            match self.vector.health().await {
                Ok(()) => "ok",
                Err(e) => {
                    tracing::warn!(error = %e, "health: vector index unreachable");
                    "unavailable"
                }
            }
        };
        let session_store = self.sessions.mirror_status();
        let status = if data_api != "ok" {
            "unavailable"
        } else if vector_index == "unavailable" || session_store == "degraded" {
            "degraded"
        } else {
            "ok"
        };
        HealthReport {
            status,
            data_api,
            vector_index,
            nlu: self.resolver.extractor_name(),
            session_store,
            active_sessions: self.sessions.active_count(),
        }
    }

    /// Reclaim expired sessions, idle rate-limit buckets and stale proposals.
    pub async fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            sessions: self.sessions.sweep_expired().await,
            rate_buckets: self.limiter.prune_idle(),
            proposals: self.executor.prune_expired(),
        };
        if report != SweepReport::default() {
            tracing::debug!(
                sessions = report.sessions,
                rate_buckets = report.rate_buckets,
                proposals = report.proposals,
                "sweep finished"
            );
        }
        report
    }

    fn admit(&self, principal: &Principal) -> Result<()> {
        match self.limiter.admit(&principal.user_id) {
            Admission::Allowed => Ok(()),
            Admission::Denied { retry_after_secs } => {
                Err(ParleyError::RateLimited { retry_after_secs })
            }
        }
    }

    async fn owned_session(&self, session_id: &str, scope: &AccessScope) -> Result<SessionLease> {
        self.sessions
            .resume(session_id, &scope.user_id, &scope.client_id)
            .await
            .ok_or_else(|| ParleyError::NotFound("session not found or expired".into()))
    }

    async fn within_deadline<F>(&self, work: F) -> Result<ChatResponse>
    where
        F: std::future::Future<Output = Result<ChatResponse>>,
    {
        match tokio::time::timeout(self.request_timeout, work).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ParleyError::Timeout(format!(
                "request exceeded {}s",
                self.request_timeout.as_secs()
            ))),
        }
    }

    /// Append the user turn and the reply, both tagged with the intent's
    /// subject entities so later pronouns resolve against them.
    async fn record_exchange(
        &self,
        lease: &mut SessionLease,
        query: &str,
        reply: &str,
        subjects: Vec<EntityRef>,
    ) {
        let max = self.sessions.max_history();
        lease.push_turn(
            ChatTurn::user(query).with_entities(subjects.iter().cloned()),
            max,
        );
        self.sessions
            .append_turn(lease, ChatTurn::assistant(reply).with_entities(subjects))
            .await;
    }

    /// Audit, count and shape the outcome of one request.
    fn conclude(
        &self,
        request_id: Uuid,
        principal: &Principal,
        text: &str,
        trace: Trace,
        outcome: Result<ChatResponse>,
        started: Instant,
    ) -> ChatResult {
        let status = match &outcome {
            Ok(_) => trace.status,
            Err(e) => e.result_status(),
        };

        let mut event = AuditEvent::new(request_id, principal.user_id.clone(), trace.action, text)
            .with_status(status)
            .with_entities(trace.entities);
        if let Some(session_id) = &trace.session_id {
            event = event.with_session(session_id.clone());
        }
        if let Some(client_id) = &trace.client_id {
            event = event.with_client(client_id.clone());
        }
        self.audit.record(event);

        let elapsed = started.elapsed();
        metrics::counter!(crate::metrics::CHAT_QUERIES_TOTAL, "intent" => trace.intent).increment(1);
        metrics::histogram!(crate::metrics::CHAT_REQUEST_DURATION_SECONDS, "intent" => trace.intent)
            .record(elapsed.as_secs_f64());

        match outcome {
            Ok(response) => {
                tracing::info!(
                    %request_id,
                    session_id = trace.session_id.as_deref().unwrap_or(""),
                    user_id = %principal.user_id,
                    intent = trace.intent,
                    status,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "chat request"
                );
                Ok(response.finish(request_id, trace.intent, started))
            }
            Err(error) => {
                metrics::counter!(
                    crate::metrics::CHAT_ERRORS_TOTAL,
                    "intent" => trace.intent,
                    "error_type" => error.kind()
                )
                .increment(1);
                match error.result_status() {
                    "internal_error" => tracing::error!(
                        %request_id,
                        user_id = %principal.user_id,
                        error = %error,
                        "chat request failed"
                    ),
                    _ => tracing::info!(
                        %request_id,
                        user_id = %principal.user_id,
                        intent = trace.intent,
                        status,
                        "chat request rejected"
                    ),
                }
                let mut response = trace
                    .error_body
                    .unwrap_or_else(|| ChatResponse::error(&error));
                response.status = ResponseStatus::Error;
                if let Some(session_id) = trace.session_id {
                    response = response.with_session(session_id);
                }
                let response = response.finish(request_id, trace.intent, started);
                Err(ChatFailure { error, response })
            }
        }
    }
}
