use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::{EntityRef, EntityType};

/// Default number of turns kept per session.
pub const MAX_HISTORY_TURNS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One message in a conversation. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub turn_id: Uuid,
    pub role: TurnRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Entities this turn was about, keyed by role name (`"task"`, `"bug"`).
    #[serde(default)]
    pub entities: BTreeMap<String, EntityRef>,
}

impl ChatTurn {
    pub fn new(role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            turn_id: Uuid::now_v7(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
            entities: BTreeMap::new(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(TurnRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, text)
    }

    pub fn with_entities<I>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = EntityRef>,
    {
        for entity in entities {
            self.entities
                .entry(entity.entity_type.to_string())
                .or_insert(entity);
        }
        self
    }

    pub fn entity_of_type(&self, entity_type: EntityType) -> Option<&EntityRef> {
        self.entities.get(&entity_type.to_string())
    }
}

/// A bounded, time-limited conversation owned by one user/client pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub session_id: String,
    pub user_id: String,
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub history: VecDeque<ChatTurn>,
}

impl ChatSession {
    pub fn new(user_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: new_session_id(),
            user_id: user_id.into(),
            client_id: client_id.into(),
            created_at: now,
            last_activity_at: now,
            history: VecDeque::new(),
        }
    }

    /// Expired once `now - last_activity_at >= ttl`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.last_activity_at >= ttl
    }

    pub fn belongs_to(&self, user_id: &str, client_id: &str) -> bool {
        self.user_id == user_id && self.client_id == client_id
    }

    /// Append a turn, dropping the oldest once `max_turns` is exceeded.
    pub fn push_turn(&mut self, turn: ChatTurn, max_turns: usize) {
        let max_turns = max_turns.max(1);
        self.last_activity_at = turn.timestamp.max(self.last_activity_at);
        self.history.push_back(turn);
        while self.history.len() > max_turns {
            self.history.pop_front();
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
    }

    /// The most recent `limit` turns, oldest first.
    pub fn recent_turns(&self, limit: usize) -> Vec<ChatTurn> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).cloned().collect()
    }
}

/// Opaque, unguessable session identifier (122 random bits).
pub fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}
