use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{EntityRef, EntityType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at <= self.to
    }
}

/// Structured filters handed to the data API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<EntityRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

impl EntityFilters {
    /// Every entity type this filter touches.
    pub fn entity_types(&self) -> Vec<EntityType> {
        let mut types: Vec<EntityType> = self.ids.iter().map(|r| r.entity_type).collect();
        if let Some(t) = self.entity_type {
            types.push(t);
        }
        types.sort();
        types.dedup();
        types
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryIntent {
    pub text: String,
    pub entity_filters: EntityFilters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    /// The query asks about long-form documentation.
    #[serde(default)]
    pub references_docs: bool,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: String,
    pub target_ref: Option<EntityRef>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Structured interpretation of one user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Intent {
    Query(QueryIntent),
    ActionRequest(ActionRequest),
    Clarification {
        question: String,
        #[serde(default)]
        candidates: Vec<EntityRef>,
    },
    Unsupported {
        reason: String,
    },
}

impl Intent {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Query(_) => "query",
            Self::ActionRequest(_) => "action",
            Self::Clarification { .. } => "clarification",
            Self::Unsupported { .. } => "unsupported",
        }
    }

    /// Entities the intent is about; recorded on the turn for follow-ups.
    pub fn subject_entities(&self) -> Vec<EntityRef> {
        match self {
            Self::Query(q) => q.entity_filters.ids.clone(),
            Self::ActionRequest(a) => a.target_ref.iter().cloned().collect(),
            Self::Clarification { .. } | Self::Unsupported { .. } => Vec::new(),
        }
    }
}
