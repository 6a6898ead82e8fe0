//! Turns a raw message plus session context into an [`Intent`].
//!
//! Language understanding is delegated to an [`Extractor`]; this module owns
//! input bounds, reference resolution against session history, and the
//! action whitelist.

use crate::collab::{Anaphora, Extraction, ExtractionKind, Extractor, IntentExtractor};
use crate::error::Result;
use crate::model::{
    classify_action, validate_query, ActionClass, ActionRequest, ActionType, ChatSession,
    EntityFilters, EntityRef, Intent, QueryIntent, MAX_HISTORY_TURNS,
};

/// Outcome of looking up "it" / "that bug" in history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Resolved(EntityRef),
    Ambiguous(Vec<EntityRef>),
    Missing,
}

pub struct IntentResolver {
    extractor: Extractor,
    max_query_chars: usize,
}

impl IntentResolver {
    pub fn new(extractor: Extractor, max_query_chars: usize) -> Self {
        Self {
            extractor,
            max_query_chars,
        }
    }

    pub fn extractor_name(&self) -> &'static str {
        self.extractor.name()
    }

    /// Bound-check `text`, extract, resolve references, apply the whitelist.
    /// Never calls the extractor for out-of-bounds input.
    pub async fn resolve(&self, text: &str, session: &ChatSession) -> Result<Intent> {
        validate_query(text, self.max_query_chars)?;

        let history = session.recent_turns(MAX_HISTORY_TURNS);
        let extraction = self.extractor.extract(text, &history).await?;
        let intent = interpret(text, extraction, session);

        tracing::debug!(
            session_id = %session.session_id,
            intent = intent.type_name(),
            extractor = self.extractor.name(),
            "intent resolved"
        );
        Ok(intent)
    }
}

fn interpret(text: &str, ex: Extraction, session: &ChatSession) -> Intent {
    // Whitelist first: "delete it" is refused without asking what "it" is.
    let requested = match (&ex.kind, &ex.action) {
        (ExtractionKind::Action, Some(action)) => match classify_action(action) {
            ActionClass::Destructive(name) => {
                return Intent::Unsupported {
                    reason: format!(
                        "I can't perform '{name}'. Deleting items, changing roles and removing \
                         team members must be done in the application itself."
                    ),
                }
            }
            ActionClass::Unknown(name) => {
                return Intent::Unsupported {
                    reason: format!(
                        "'{name}' isn't something I can do from chat. I can update a status, \
                         add a comment, set a reminder, or link a pull request."
                    ),
                }
            }
            ActionClass::Allowed(t) => Some(t),
        },
        _ => None,
    };

    let mut ids = ex.entity_refs.clone();
    if ids.is_empty() {
        if let Some(anaphora) = ex.anaphora {
            match resolve_reference(anaphora, session) {
                Reference::Resolved(r) => ids.push(r),
                Reference::Ambiguous(candidates) => {
                    let names = candidates
                        .iter()
                        .map(|c| format!("{} ({})", c.id, c.entity_type))
                        .collect::<Vec<_>>()
                        .join(" or ");
                    return Intent::Clarification {
                        question: format!("Which one do you mean: {names}?"),
                        candidates,
                    };
                }
                Reference::Missing => {
                    let what = anaphora
                        .entity_type
                        .map(|t| format!("which {t}"))
                        .unwrap_or_else(|| "what".to_string());
                    return Intent::Clarification {
                        question: format!(
                            "I'm not sure {what} you're referring to. Could you give me its ID?"
                        ),
                        candidates: Vec::new(),
                    };
                }
            }
        }
    }

    match requested {
        Some(action_type) if action_type.is_mutating() => interpret_action(action_type, ids, ex),
        _ => Intent::Query(build_query(text, ids, ex, session)),
    }
}

fn interpret_action(action_type: ActionType, ids: Vec<EntityRef>, ex: Extraction) -> Intent {
    let target_ref = match ids.as_slice() {
        [] => {
            return Intent::Clarification {
                question: format!("Which item should I {}?", humanize(action_type)),
                candidates: Vec::new(),
            }
        }
        [only] => only.clone(),
        many => {
            return Intent::Clarification {
                question: format!(
                    "Which item should I {}: {}?",
                    humanize(action_type),
                    many.iter()
                        .map(|r| r.id.as_str())
                        .collect::<Vec<_>>()
                        .join(" or ")
                ),
                candidates: many.to_vec(),
            }
        }
    };

    Intent::ActionRequest(ActionRequest {
        action: action_type.to_string(),
        target_ref: Some(target_ref),
        parameters: ex.parameters,
    })
}

fn build_query(text: &str, ids: Vec<EntityRef>, ex: Extraction, session: &ChatSession) -> QueryIntent {
    let assignee = ex.assignee.map(|a| {
        if a.eq_ignore_ascii_case("me") {
            session.user_id.clone()
        } else {
            a
        }
    });
    QueryIntent {
        text: text.to_string(),
        entity_filters: EntityFilters {
            entity_type: if ids.is_empty() { ex.entity_type } else { None },
            ids,
            keywords: ex.keywords,
            status: ex.status,
            assignee,
        },
        time_range: ex.time_range,
        references_docs: ex.references_docs,
        offset: 0,
    }
}

/// Find what "it" / "that bug" points at: the most recent turn carrying a
/// matching entity. An untyped reference whose most recent turn holds
/// several entities of different types is ambiguous.
pub fn resolve_reference(anaphora: Anaphora, session: &ChatSession) -> Reference {
    let mut turns = session.history.iter().rev().filter(|t| !t.entities.is_empty());

    match anaphora.entity_type {
        Some(wanted) => turns
            .find_map(|t| t.entity_of_type(wanted).cloned())
            .map(Reference::Resolved)
            .unwrap_or(Reference::Missing),
        None => match turns.next() {
            None => Reference::Missing,
            Some(turn) => {
                let mut candidates: Vec<EntityRef> = turn.entities.values().cloned().collect();
                if candidates.len() == 1 {
                    Reference::Resolved(candidates.remove(0))
                } else {
                    Reference::Ambiguous(candidates)
                }
            }
        },
    }
}

fn humanize(action: ActionType) -> &'static str {
    match action {
        ActionType::UpdateStatus => "update",
        ActionType::CreateComment => "comment on",
        ActionType::SetReminder => "set a reminder for",
        ActionType::LinkCommit => "link the pull request to",
        ActionType::View | ActionType::DeepLink => "open",
    }
}
