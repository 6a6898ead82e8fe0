//! Structured chat replies.
//!
//! Everything here formats data that retrieval or the executor already
//! scoped. Nothing in this module talks to the data API.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collab::{DocHit, LlmService};
use crate::config::LlmConfig;
use crate::error::ParleyError;
use crate::model::{
    ActionProposal, ActionResult, ActionState, EntityRecord, EntityRef, QueryIntent,
};
use crate::retrieval::{ResultItem, ResultSet};

/// Sentence used for both "nothing matched" and "not visible to you".
pub const NO_RESULTS: &str = "I couldn't find any matching results.";

const TABLE_THRESHOLD: usize = 3;

const REPLY_SYSTEM_PROMPT: &str = "You answer questions about project-management data. \
Use only the JSON records you are given. Never invent items, people, or dates. \
Reply in at most three sentences of plain text.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Clarification,
    ConfirmationRequired,
    Unsupported,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub request_id: Uuid,
    pub intent_type: String,
    #[serde(default)]
    pub entities_accessed: Vec<EntityRef>,
    pub response_time_ms: u64,
}

/// A suggested follow-up the UI can render as a button.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedAction {
    /// `deep_link`, `confirm`, `cancel` or `next_page`.
    pub kind: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl SuggestedAction {
    fn deep_link(entity: &EntityRef) -> Self {
        Self {
            kind: "deep_link".into(),
            label: format!("Open {}", entity.id),
            payload: serde_json::json!({ "type": entity.entity_type, "id": entity.id }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub entity: EntityRef,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<SuggestedAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub status: ResponseStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cards: Option<Vec<Card>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<Table>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<SuggestedAction>>,
    pub metadata: ResponseMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal: Option<ActionProposal>,
}

impl ChatResponse {
    pub fn new(status: ResponseStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: None,
            cards: None,
            table: None,
            actions: None,
            metadata: ResponseMetadata::default(),
            session_id: None,
            proposal: None,
        }
    }

    /// A well-formed error body for any [`ParleyError`].
    pub fn error(err: &ParleyError) -> Self {
        let mut response = Self::new(ResponseStatus::Error, user_message(err));
        let mut data = serde_json::json!({ "error_type": err.kind() });
        if let ParleyError::RateLimited { retry_after_secs } = err {
            data["retry_after_secs"] = serde_json::json!(retry_after_secs);
        }
        response.data = Some(data);
        response
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Stamp request id, intent and elapsed time.
    pub fn finish(mut self, request_id: Uuid, intent_type: &str, started: Instant) -> Self {
        self.metadata.request_id = request_id;
        self.metadata.intent_type = intent_type.to_string();
        self.metadata.response_time_ms = started.elapsed().as_millis() as u64;
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }
}

/// Plain-language text for an error. Never includes internal detail for
/// faults the user cannot act on.
pub fn user_message(err: &ParleyError) -> String {
    match err {
        ParleyError::Validation(msg) => format!("I can't process that message: {msg}."),
        ParleyError::AccessDenied(_) => "You don't have permission to do that.".into(),
        ParleyError::RateLimited { retry_after_secs } => format!(
            "You're sending messages too quickly. Try again in {retry_after_secs} seconds."
        ),
        ParleyError::Timeout(_) => {
            "That took too long to answer. Please try again in a moment.".into()
        }
        ParleyError::Unsupported(reason) => reason.clone(),
        ParleyError::DownstreamUnavailable(_) => {
            "Project data is temporarily unavailable. Please try again shortly.".into()
        }
        ParleyError::ActionFailed(msg) => format!("The action could not be completed: {msg}."),
        ParleyError::NotFound(what) => format!("I couldn't find {what}."),
        ParleyError::Storage(_)
        | ParleyError::Llm(_)
        | ParleyError::Http(_)
        | ParleyError::Serialization(_)
        | ParleyError::Config(_) => "Something went wrong on our side.".into(),
    }
}

pub struct ResponseBuilder {
    llm: Option<LlmService>,
}

impl ResponseBuilder {
    pub fn new(llm: Option<LlmService>) -> Self {
        Self { llm }
    }

    /// Template-only builder.
    pub fn templated() -> Self {
        Self::new(None)
    }

    /// Uses the LLM for query replies only when it is enabled and reply
    /// generation is switched on.
    pub fn from_config(config: &LlmConfig) -> Self {
        if !(config.enabled && config.generate_replies) {
            return Self::templated();
        }
        match LlmService::from_config(config) {
            Ok(llm) => Self::new(Some(llm)),
            Err(e) => {
                tracing::warn!("reply generation disabled: {e}");
                Self::templated()
            }
        }
    }

    pub async fn query(&self, query: &QueryIntent, set: &ResultSet) -> ChatResponse {
        if set.is_empty() {
            // Same body whether nothing matched or the type is hidden.
            let mut response = ChatResponse::new(ResponseStatus::Success, NO_RESULTS);
            response.data = Some(serde_json::json!({ "total": 0 }));
            return response;
        }

        let message = match &self.llm {
            Some(llm) => self
                .phrase_with_llm(llm, query, set)
                .await
                .unwrap_or_else(|| summarize(set)),
            None => summarize(set),
        };

        let mut response = ChatResponse::new(ResponseStatus::Success, message);
        response.data = Some(serde_json::json!({
            "total": set.total,
            "offset": set.offset,
            "truncated": set.truncated,
            "next_offset": set.next_offset,
            "degraded": set.degraded,
        }));
        response.cards = Some(set.items.iter().map(card_for).collect());
        if set.records().count() > TABLE_THRESHOLD {
            response.table = Some(table_for(set.records()));
        }
        if let Some(next) = set.next_offset {
            response.actions = Some(vec![SuggestedAction {
                kind: "next_page".into(),
                label: "Show more results".into(),
                payload: serde_json::json!({ "offset": next }),
            }]);
        }
        response.metadata.entities_accessed = set.entities_accessed();
        response
    }

    async fn phrase_with_llm(
        &self,
        llm: &LlmService,
        query: &QueryIntent,
        set: &ResultSet,
    ) -> Option<String> {
        let rows = serde_json::to_string(&set.items).ok()?;
        let prompt = format!("Question: {}\n\nRecords:\n{rows}", query.text);
        match llm.generate(&prompt, Some(REPLY_SYSTEM_PROMPT)).await {
            Ok(text) if !text.trim().is_empty() => {
                let mut text = text.trim().to_string();
                if set.truncated {
                    text.push(' ');
                    text.push_str(&truncation_note(set));
                }
                Some(text)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("reply generation failed, using template: {e}");
                None
            }
        }
    }

    pub fn clarification(&self, question: &str, candidates: &[EntityRef]) -> ChatResponse {
        let mut response = ChatResponse::new(ResponseStatus::Clarification, question);
        if !candidates.is_empty() {
            response.actions = Some(
                candidates
                    .iter()
                    .map(|c| SuggestedAction {
                        kind: "clarify".into(),
                        label: format!("{} ({})", c.id, c.entity_type),
                        payload: serde_json::json!({ "type": c.entity_type, "id": c.id }),
                    })
                    .collect(),
            );
        }
        response
    }

    pub fn unsupported(&self, reason: &str) -> ChatResponse {
        ChatResponse::new(ResponseStatus::Unsupported, reason)
    }

    /// Reply for a fresh proposal: echo its parameters and offer
    /// confirm/cancel, or explain the rejection.
    pub fn proposal(&self, proposal: &ActionProposal) -> ChatResponse {
        let mut response = match proposal.state {
            ActionState::Proposed => {
                let mut r = ChatResponse::new(
                    ResponseStatus::ConfirmationRequired,
                    format!("Please confirm: {}.", proposal.describe()),
                );
                r.actions = Some(vec![
                    SuggestedAction {
                        kind: "confirm".into(),
                        label: "Confirm".into(),
                        payload: serde_json::json!({
                            "proposal_id": proposal.proposal_id,
                            "parameters": proposal.parameters,
                        }),
                    },
                    SuggestedAction {
                        kind: "cancel".into(),
                        label: "Cancel".into(),
                        payload: serde_json::json!({ "proposal_id": proposal.proposal_id }),
                    },
                ]);
                r
            }
            _ => {
                let reason = proposal.reason.as_deref().unwrap_or("not allowed");
                let status = match proposal.rejection.as_ref().and_then(|r| r.as_error()) {
                    Some(ParleyError::Unsupported(_)) => ResponseStatus::Unsupported,
                    _ => ResponseStatus::Error,
                };
                ChatResponse::new(
                    status,
                    format!("I can't {}: {reason}.", proposal.describe()),
                )
            }
        };
        response.metadata.entities_accessed = proposal.target.iter().cloned().collect();
        response.proposal = Some(proposal.clone());
        response
    }

    pub fn action_result(&self, result: &ActionResult) -> ChatResponse {
        let executed = result.proposal.state == ActionState::Executed;
        let mut response = ChatResponse::new(
            if executed {
                ResponseStatus::Success
            } else {
                ResponseStatus::Error
            },
            result.message.clone(),
        );
        if let Some(target) = &result.proposal.target {
            response.cards = Some(vec![Card {
                entity: target.clone(),
                title: target.id.clone(),
                subtitle: Some(result.proposal.state.to_string()),
                actions: vec![SuggestedAction::deep_link(target)],
            }]);
            response.metadata.entities_accessed = vec![target.clone()];
        }
        if let Some(suggestion) = &result.retry_suggestion {
            response.data = Some(serde_json::json!({
                "error_type": "action_failed",
                "retry_suggestion": suggestion,
            }));
        }
        response.proposal = Some(result.proposal.clone());
        response
    }
}

/// Deterministic reply text for a non-empty result set.
pub fn summarize(set: &ResultSet) -> String {
    let mut text = match set.items.as_slice() {
        [ResultItem::Entity(record)] => describe_record(record),
        [ResultItem::Document(doc)] => format!("The closest document is \"{}\".", doc.title),
        items => {
            let shown = items.len();
            let docs = set.documents().count();
            let mut s = format!("I found {} matching result{}", set.total, plural(set.total));
            if docs > 0 && docs < shown {
                s.push_str(&format!(", including {docs} document{}", plural(docs)));
            }
            s.push('.');
            s
        }
    };
    if set.truncated {
        text.push(' ');
        text.push_str(&truncation_note(set));
    }
    if !set.degraded.is_empty() {
        text.push_str(" Document search is unavailable right now, so some documentation may be missing.");
    }
    text
}

fn truncation_note(set: &ResultSet) -> String {
    let from = set.offset + 1;
    let to = set.offset + set.items.len();
    format!(
        "Showing {from}-{to} of {}. Ask for more results to see the next page.",
        set.total
    )
}

fn describe_record(record: &EntityRecord) -> String {
    let mut s = format!("{} \"{}\"", record.id, record.title);
    match &record.status {
        Some(status) => s.push_str(&format!(" is {}", status.replace('_', " "))),
        None => s.push_str(&format!(" is a {}", record.entity_type)),
    }
    if let Some(assignee) = &record.assignee {
        s.push_str(&format!(", assigned to {assignee}"));
    }
    if let Some(owner) = record.owner.as_ref().filter(|o| record.assignee.as_ref() != Some(*o)) {
        s.push_str(&format!(", owned by {owner}"));
    }
    s.push('.');
    if !record.blocked_by.is_empty() {
        s.push_str(&format!(" It is blocked by {}.", record.blocked_by.join(", ")));
    }
    s
}

fn card_for(item: &ResultItem) -> Card {
    match item {
        ResultItem::Entity(r) => {
            let entity = r.entity_ref();
            let subtitle = match (&r.status, &r.assignee) {
                (Some(s), Some(a)) => Some(format!("{s} · {a}")),
                (Some(s), None) => Some(s.clone()),
                (None, Some(a)) => Some(a.clone()),
                (None, None) => None,
            };
            Card {
                actions: vec![SuggestedAction::deep_link(&entity)],
                entity,
                title: r.title.clone(),
                subtitle,
            }
        }
        ResultItem::Document(d) => doc_card(d),
    }
}

fn doc_card(doc: &DocHit) -> Card {
    let entity = EntityRef::parse(&doc.doc_id)
        .unwrap_or_else(|| EntityRef::new(crate::model::EntityType::Document, doc.doc_id.clone()));
    Card {
        actions: vec![SuggestedAction::deep_link(&entity)],
        entity,
        title: doc.title.clone(),
        subtitle: (!doc.snippet.is_empty()).then(|| doc.snippet.clone()),
    }
}

fn table_for<'a>(records: impl Iterator<Item = &'a EntityRecord>) -> Table {
    Table {
        columns: ["id", "type", "title", "status", "assignee"]
            .iter()
            .map(|c| c.to_string())
            .collect(),
        rows: records
            .map(|r| {
                vec![
                    r.id.clone(),
                    r.entity_type.to_string(),
                    r.title.clone(),
                    r.status.clone().unwrap_or_default(),
                    r.assignee.clone().unwrap_or_default(),
                ]
            })
            .collect(),
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityType, Rejection};
    use std::collections::BTreeMap;

    fn task(id: &str, title: &str) -> EntityRecord {
        EntityRecord::new(EntityType::Task, id, "acme", title)
    }

    fn set_of(records: Vec<EntityRecord>) -> ResultSet {
        ResultSet {
            total: records.len(),
            items: records.into_iter().map(ResultItem::Entity).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_single_record_names_owner_and_blocker() {
        let record = task("TSK-42", "Integrate card tokenization")
            .with_status("blocked")
            .with_assignee("alice")
            .with_blocked_by(vec!["BUG-7".into()]);
        let response = ResponseBuilder::templated()
            .query(&QueryIntent::default(), &set_of(vec![record]))
            .await;
        assert_eq!(response.status, ResponseStatus::Success);
        assert!(response.message.contains("assigned to alice"));
        assert!(response.message.contains("blocked by BUG-7"));
        assert_eq!(
            response.metadata.entities_accessed,
            vec![EntityRef::new(EntityType::Task, "TSK-42")]
        );
        let cards = response.cards.unwrap();
        assert_eq!(cards[0].actions[0].kind, "deep_link");
        assert!(response.table.is_none());
    }

    #[tokio::test]
    async fn test_denied_and_empty_are_indistinguishable() {
        let builder = ResponseBuilder::templated();
        let denied = ResultSet {
            denied: true,
            ..Default::default()
        };
        let a = builder.query(&QueryIntent::default(), &denied).await;
        let b = builder
            .query(&QueryIntent::default(), &ResultSet::default())
            .await;
        assert_eq!(
            serde_json::to_value(&a).unwrap(),
            serde_json::to_value(&b).unwrap()
        );
        assert_eq!(a.message, NO_RESULTS);
    }

    #[tokio::test]
    async fn test_truncated_offers_next_page() {
        let records: Vec<_> = (0..20).map(|n| task(&format!("TSK-{n}"), "t")).collect();
        let mut set = set_of(records);
        set.total = 31;
        set.truncated = true;
        set.next_offset = Some(20);

        let response = ResponseBuilder::templated()
            .query(&QueryIntent::default(), &set)
            .await;
        assert!(response.message.contains("Showing 1-20 of 31"));
        assert_eq!(response.table.as_ref().unwrap().rows.len(), 20);
        let actions = response.actions.unwrap();
        assert_eq!(actions[0].kind, "next_page");
        assert_eq!(actions[0].payload["offset"], 20);
    }

    #[test]
    fn test_proposal_echoes_parameters() {
        let mut params = BTreeMap::new();
        params.insert("status".to_string(), "done".to_string());
        let proposal = ActionProposal::new(
            "s1",
            "alice",
            "acme",
            "update_status",
            Some(EntityRef::new(EntityType::Task, "TSK-42")),
            params,
        );
        let response = ResponseBuilder::templated().proposal(&proposal);
        assert_eq!(response.status, ResponseStatus::ConfirmationRequired);
        let actions = response.actions.unwrap();
        assert_eq!(actions[0].payload["parameters"]["status"], "done");
        assert_eq!(actions[1].kind, "cancel");
    }

    #[test]
    fn test_rejected_proposal_is_error() {
        let mut proposal = ActionProposal::new(
            "s1",
            "alice",
            "acme",
            "update_status",
            Some(EntityRef::new(EntityType::Task, "TSK-43")),
            BTreeMap::new(),
        );
        proposal.reject(Rejection::InsufficientPermission).unwrap();
        let response = ResponseBuilder::templated().proposal(&proposal);
        assert!(response.is_error());
        assert!(response.message.contains("insufficient permission"));
    }

    #[test]
    fn test_error_body_carries_retry_after() {
        let response = ChatResponse::error(&ParleyError::RateLimited {
            retry_after_secs: 7,
        });
        assert_eq!(response.status, ResponseStatus::Error);
        let data = response.data.unwrap();
        assert_eq!(data["error_type"], "rate_limited");
        assert_eq!(data["retry_after_secs"], 7);
    }

    #[test]
    fn test_internal_errors_hide_detail() {
        let response = ChatResponse::error(&ParleyError::Storage("disk /var/x full".into()));
        assert!(!response.message.contains("/var/x"));
    }

    #[test]
    fn test_error_serializes_status_error() {
        let json = serde_json::to_value(ChatResponse::error(&ParleyError::Timeout("llm".into())))
            .unwrap();
        assert_eq!(json["status"], "error");
        assert!(json["message"].as_str().is_some_and(|m| !m.is_empty()));
        assert!(json.get("cards").is_none());
    }
}
