use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Project-management entity kinds the assistant can talk about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Program,
    Project,
    Milestone,
    Task,
    Bug,
    Document,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        Self::Program,
        Self::Project,
        Self::Milestone,
        Self::Task,
        Self::Bug,
        Self::Document,
    ];

    /// Human-facing id prefix, e.g. `TSK` in `TSK-42`.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Program => "PRG",
            Self::Project => "PRJ",
            Self::Milestone => "MS",
            Self::Task => "TSK",
            Self::Bug => "BUG",
            Self::Document => "DOC",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        let upper = prefix.to_ascii_uppercase();
        Self::ALL.into_iter().find(|t| t.prefix() == upper)
    }

    pub fn all() -> BTreeSet<EntityType> {
        Self::ALL.into_iter().collect()
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Program => write!(f, "program"),
            Self::Project => write!(f, "project"),
            Self::Milestone => write!(f, "milestone"),
            Self::Task => write!(f, "task"),
            Self::Bug => write!(f, "bug"),
            Self::Document => write!(f, "document"),
        }
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().trim_end_matches('s') {
            "program" => Ok(Self::Program),
            "project" => Ok(Self::Project),
            "milestone" => Ok(Self::Milestone),
            "task" | "ticket" => Ok(Self::Task),
            "bug" | "issue" => Ok(Self::Bug),
            "document" | "doc" => Ok(Self::Document),
            _ => Err(format!("unknown entity type: {s}")),
        }
    }
}

/// Reference to a single entity, e.g. `{type: task, id: "TSK-42"}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }

    /// Parse a display id such as `TSK-42` or `bug-7`.
    pub fn parse(display_id: &str) -> Option<Self> {
        let (prefix, number) = display_id.split_once('-')?;
        if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let entity_type = EntityType::from_prefix(prefix)?;
        Some(Self::new(
            entity_type,
            format!("{}-{}", entity_type.prefix(), number),
        ))
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// A row returned by the data API. `client_id` is the tenant that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub client_id: String,
    pub title: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn new(
        entity_type: EntityType,
        id: impl Into<String>,
        client_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type,
            client_id: client_id.into(),
            title: title.into(),
            status: None,
            assignee: None,
            owner: None,
            description: String::new(),
            blocked_by: Vec::new(),
            due_date: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_blocked_by(mut self, blocked_by: Vec<String>) -> Self {
        self.blocked_by = blocked_by;
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type, self.id.clone())
    }

    /// Text matched against query keywords.
    pub fn search_text(&self) -> String {
        format!(
            "{} {} {} {}",
            self.id,
            self.title,
            self.description,
            self.status.as_deref().unwrap_or_default()
        )
    }
}

/// Host roles. Elevated roles never widen the client boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Developer,
    Tester,
    Viewer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admin => write!(f, "admin"),
            Self::Manager => write!(f, "manager"),
            Self::Developer => write!(f, "developer"),
            Self::Tester => write!(f, "tester"),
            Self::Viewer => write!(f, "viewer"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "manager" | "project_manager" => Ok(Self::Manager),
            "developer" => Ok(Self::Developer),
            "tester" | "qa" => Ok(Self::Tester),
            "viewer" | "client" => Ok(Self::Viewer),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

/// Verified caller identity, injected by the auth layer.
///
/// `client_ids` comes straight from the token; a usable principal has
/// exactly one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub client_ids: Vec<String>,
    pub role: Role,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, client_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            client_ids: vec![client_id.into()],
            role,
        }
    }

    /// The single bound client, if the token names exactly one.
    pub fn sole_client(&self) -> Option<&str> {
        match self.client_ids.as_slice() {
            [only] if !only.trim().is_empty() => Some(only.as_str()),
            _ => None,
        }
    }
}
