use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::EntityRef;
use crate::error::{ParleyError, Result};

/// Whitelisted assistant capabilities. Everything outside this enum is
/// rejected before any permission lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    View,
    DeepLink,
    SetReminder,
    UpdateStatus,
    CreateComment,
    LinkCommit,
}

impl ActionType {
    pub const ALL: [ActionType; 6] = [
        Self::View,
        Self::DeepLink,
        Self::SetReminder,
        Self::UpdateStatus,
        Self::CreateComment,
        Self::LinkCommit,
    ];

    /// Mutating actions go through the propose/confirm/execute workflow.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::View | Self::DeepLink)
    }

    /// Parameters that must be present before a proposal can be confirmed.
    pub fn required_parameters(&self) -> &'static [&'static str] {
        match self {
            Self::View | Self::DeepLink => &[],
            Self::SetReminder => &["remind_at"],
            Self::UpdateStatus => &["status"],
            Self::CreateComment => &["body"],
            Self::LinkCommit => &["pr_id"],
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::View => write!(f, "view"),
            Self::DeepLink => write!(f, "deep_link"),
            Self::SetReminder => write!(f, "set_reminder"),
            Self::UpdateStatus => write!(f, "update_status"),
            Self::CreateComment => write!(f, "create_comment"),
            Self::LinkCommit => write!(f, "link_commit"),
        }
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "view" | "navigate" => Ok(Self::View),
            "deep_link" => Ok(Self::DeepLink),
            "set_reminder" => Ok(Self::SetReminder),
            "update_status" => Ok(Self::UpdateStatus),
            "create_comment" => Ok(Self::CreateComment),
            "link_commit" | "link_commit_by_pr_id" => Ok(Self::LinkCommit),
            _ => Err(format!("unsupported action: {s}")),
        }
    }
}

/// Action names that are refused unconditionally, regardless of role.
pub const DESTRUCTIVE_ACTIONS: &[&str] = &[
    "delete_project",
    "delete_task",
    "delete_bug",
    "delete_program",
    "delete_milestone",
    "delete_document",
    "delete_comment",
    "change_user_role",
    "remove_team_member",
    "remove_user",
    "archive_project",
];

/// Classification of a raw action name coming out of intent extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionClass {
    Allowed(ActionType),
    Destructive(String),
    Unknown(String),
}

pub fn classify_action(name: &str) -> ActionClass {
    let normalized = name.trim().to_lowercase().replace(['-', ' '], "_");
    if DESTRUCTIVE_ACTIONS.contains(&normalized.as_str())
        || normalized.starts_with("delete_")
        || normalized.starts_with("remove_")
    {
        return ActionClass::Destructive(normalized);
    }
    match normalized.parse::<ActionType>() {
        Ok(action) => ActionClass::Allowed(action),
        Err(_) => ActionClass::Unknown(normalized),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Proposed,
    Confirmed,
    Executed,
    Rejected,
    Failed,
}

impl ActionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Executed | Self::Rejected | Self::Failed)
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proposed => write!(f, "proposed"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Executed => write!(f, "executed"),
            Self::Rejected => write!(f, "rejected"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Why a proposal ended in [`ActionState::Rejected`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    Destructive,
    NotWhitelisted,
    InsufficientPermission,
    MissingTarget,
    TargetNotFound,
    MissingParameter(String),
    Cancelled,
}

impl Rejection {
    /// The error a rejected proposal surfaces as, if any. Cancellation is a
    /// normal outcome.
    pub fn as_error(&self) -> Option<ParleyError> {
        let reason = self.to_string();
        match self {
            Self::Destructive | Self::NotWhitelisted => Some(ParleyError::Unsupported(reason)),
            Self::InsufficientPermission => Some(ParleyError::AccessDenied(reason)),
            Self::MissingTarget | Self::MissingParameter(_) => {
                Some(ParleyError::Validation(reason))
            }
            Self::TargetNotFound => Some(ParleyError::NotFound(reason)),
            Self::Cancelled => None,
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Destructive => write!(f, "destructive actions are never performed from chat"),
            Self::NotWhitelisted => write!(f, "action is not available from chat"),
            Self::InsufficientPermission => write!(f, "insufficient permission"),
            Self::MissingTarget => write!(f, "no target entity was given"),
            Self::TargetNotFound => write!(f, "target entity not found"),
            Self::MissingParameter(name) => write!(f, "missing parameter '{name}'"),
            Self::Cancelled => write!(f, "cancelled by user"),
        }
    }
}

/// A candidate mutating action and its position in the confirm workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionProposal {
    pub proposal_id: Uuid,
    pub session_id: String,
    pub user_id: String,
    pub client_id: String,
    /// Normalized action name as requested.
    pub action: String,
    /// Set only for whitelisted actions.
    pub action_type: Option<ActionType>,
    pub target: Option<EntityRef>,
    pub parameters: BTreeMap<String, String>,
    pub state: ActionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActionProposal {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        client_id: impl Into<String>,
        action: impl Into<String>,
        target: Option<EntityRef>,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        let action = action.into();
        let action_type = match classify_action(&action) {
            ActionClass::Allowed(t) => Some(t),
            _ => None,
        };
        let now = Utc::now();
        Self {
            proposal_id: Uuid::new_v4(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            client_id: client_id.into(),
            action,
            action_type,
            target,
            parameters,
            state: ActionState::Proposed,
            rejection: None,
            reason: None,
            outcome: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Proposed/Confirmed → Rejected.
    pub fn reject(&mut self, rejection: Rejection) -> Result<()> {
        self.transition(
            &[ActionState::Proposed, ActionState::Confirmed],
            ActionState::Rejected,
        )?;
        self.reason = Some(rejection.to_string());
        self.rejection = Some(rejection);
        Ok(())
    }

    /// Proposed → Confirmed. The caller must echo the exact parameters
    /// that were proposed.
    pub fn confirm(&mut self, echoed: &BTreeMap<String, String>) -> Result<()> {
        if self.state != ActionState::Proposed {
            return Err(ParleyError::Validation(format!(
                "proposal {} is {}, not awaiting confirmation",
                self.proposal_id, self.state
            )));
        }
        if echoed != &self.parameters {
            return Err(ParleyError::Validation(
                "confirmation parameters do not match the proposed action".into(),
            ));
        }
        self.transition(&[ActionState::Proposed], ActionState::Confirmed)
    }

    /// Confirmed → Executed.
    pub fn mark_executed(&mut self, outcome: impl Into<String>) -> Result<()> {
        self.transition(&[ActionState::Confirmed], ActionState::Executed)?;
        self.outcome = Some(outcome.into());
        Ok(())
    }

    /// Confirmed → Failed.
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(&[ActionState::Confirmed], ActionState::Failed)?;
        self.reason = Some(reason.into());
        Ok(())
    }

    fn transition(&mut self, from: &[ActionState], to: ActionState) -> Result<()> {
        if !from.contains(&self.state) {
            return Err(ParleyError::Validation(format!(
                "invalid action transition {} -> {}",
                self.state, to
            )));
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Human-readable summary echoed back for confirmation.
    pub fn describe(&self) -> String {
        let target = self
            .target
            .as_ref()
            .map(|t| t.id.clone())
            .unwrap_or_else(|| "(no target)".to_string());
        let params = self
            .parameters
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        if params.is_empty() {
            format!("{} on {target}", self.action)
        } else {
            format!("{} on {target} ({params})", self.action)
        }
    }
}

/// Write command sent to the data API once a proposal is confirmed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionCommand {
    pub action: ActionType,
    pub target: EntityRef,
    pub parameters: BTreeMap<String, String>,
    pub requested_by: String,
    /// Idempotency key for the downstream write.
    pub proposal_id: Uuid,
}

/// Outcome reported back to the caller after `execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub proposal: ActionProposal,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_suggestion: Option<String>,
}
