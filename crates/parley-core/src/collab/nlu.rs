//! Language understanding: raw text in, loosely structured [`Extraction`] out.
//!
//! Extractors only read the text and the recent turns. Reference resolution,
//! whitelisting and scoping happen afterwards in the intent resolver.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::llm::LlmService;
use crate::error::Result;
use crate::model::{ChatTurn, EntityRef, EntityType, TimeRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionKind {
    #[default]
    Query,
    Action,
}

/// A reference to something said earlier ("it", "that bug").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anaphora {
    /// Set when the reference names a type ("that bug").
    pub entity_type: Option<EntityType>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub kind: ExtractionKind,
    pub entity_refs: Vec<EntityRef>,
    pub entity_type: Option<EntityType>,
    /// Raw action name as understood, before whitelisting.
    pub action: Option<String>,
    pub parameters: BTreeMap<String, String>,
    pub time_range: Option<TimeRange>,
    pub references_docs: bool,
    pub anaphora: Option<Anaphora>,
    pub keywords: Vec<String>,
    pub status: Option<String>,
    /// `"me"` is resolved to the session user later.
    pub assignee: Option<String>,
}

pub trait IntentExtractor: Send + Sync {
    fn extract(
        &self,
        text: &str,
        history: &[ChatTurn],
    ) -> impl std::future::Future<Output = Result<Extraction>> + Send;
}

pub enum Extractor {
    Rules(RuleExtractor),
    Llm(LlmExtractor),
}

impl IntentExtractor for Extractor {
    async fn extract(&self, text: &str, history: &[ChatTurn]) -> Result<Extraction> {
        match self {
            Self::Rules(e) => e.extract(text, history).await,
            Self::Llm(e) => e.extract(text, history).await,
        }
    }
}

impl Extractor {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rules(_) => "rules",
            Self::Llm(_) => "llm",
        }
    }
}

// -- Rule-based --

static ENTITY_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(PRG|PRJ|MS|TSK|BUG|DOC)-(\d+)\b").unwrap());

static TYPED_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:that|this|the same)\s+(program|project|milestone|task|ticket|bug|issue|document|doc)\b",
    )
    .unwrap()
});

static PRONOUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(it|its|it's|this one|that one)\b").unwrap());

static ENTITY_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(programs?|projects?|milestones?|tasks?|tickets?|bugs?|issues?|documents?|docs?)\b",
    )
    .unwrap()
});

static DOCS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(docs?|documentation|documents?|wiki|guide|runbook|readme|how to)\b")
        .unwrap()
});

static STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(open|closed|done|blocked|in[ _]progress)\b").unwrap());

static ASSIGNEE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bassigned to (\w+)|\b(my|mine)\b").unwrap());

static LAST_DAYS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:last|past) (\d{1,3}) days?\b").unwrap());

/// Optional politeness before an imperative verb at the start of a message.
const LEAD: &str = r"^\s*(?:(?:please|can you|could you|go ahead and)\s+)*";

const ENTITY_OBJECT: &str = r"programs?|projects?|milestones?|tasks?|tickets?|bugs?|issues?|documents?|docs?|(?:PRG|PRJ|MS|TSK|BUG|DOC)-\d+";

// An imperative "delete X", or the verb acting directly on an entity,
// e.g. "can I drop TSK-9". "did the error rate drop" is a question.
static DESTRUCTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i){LEAD}(?P<verb>delete|remove|archive|drop)\b(?:\s+(?:the|this|that|a))?\s+(?P<object>[\w-]+)|\b(?P<verb2>delete|remove|archive|drop)\s+(?:(?:the|this|that|a)\s+)?(?P<object2>{ENTITY_OBJECT}|members?|users?|teammates?)\b"
    ))
    .unwrap()
});

static ROLE_CHANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:change|set|update)\s+(?:(?:\w+'s|the|their|his|her|my|a)\s+)?(?:user\s+)?role\b|{LEAD}(?:promote|demote)\s+\w+|\bmake\s+\w+\s+(?:an?\s+)?(?:admin|administrator|developer|tester|viewer|project manager|pm)\b"
    ))
    .unwrap()
});

static STATUS_CHANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:mark|set|move|change)\b.*?\b(?:as|to)\s+(open|closed|done|blocked|in[ _]progress)\b",
    )
    .unwrap()
});

static CLOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(close|resolve|reopen)\b").unwrap());

static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:add a comment|comment|note)\b[^:"]*[:"]\s*"?([^"]+?)"?\s*$"#).unwrap()
});

static REMIND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bremind me\b.*?\b(tomorrow|today|next week|in \d+ (?:hours?|days?|minutes?))\b")
        .unwrap()
});

static LINK_PR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\blink\b.*?\b(?:pr|pull request|commit)\s*#?(\d+)\b").unwrap()
});

static ADD_MEMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i){LEAD}(?:add|invite)\s+\w+\s+to\s+(?:the\s+)?(?:team|project|program)\b"
    ))
    .unwrap()
});

// "create"/"add" only count as writes with a concrete object;
// "add up the open bugs" is a question.
static OTHER_WRITE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i){LEAD}(?P<verb>create|add)\b(?:\s+(?:a|an|the|new|another))*\s+(?P<object>{ENTITY_OBJECT}|comments?|members?|users?|teammates?|labels?|tags?|subtasks?|attachments?)\b|{LEAD}(?P<verb2>assign|reassign|rename|invite)\b(?:\s+(?:a|an|the|new))*(?:\s+(?P<object2>\w+))?"
    ))
    .unwrap()
});

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "what", "whats", "what's", "who", "which", "show", "list", "find",
    "about", "with", "are", "is", "any", "all", "me", "my", "of", "on", "in", "to", "a", "an",
    "it", "its", "that", "this", "one", "there", "has", "have", "does", "do", "how", "many",
    "tell", "give", "please", "can", "you", "status", "owns", "own", "owner", "anything",
    "blocking", "blocked", "open", "closed", "done", "progress", "assigned", "last", "days",
    "today", "week", "month", "yesterday", "from", "were", "was", "updated", "where", "when",
    "why", "yet", "fixed", "latest", "recent",
];

/// Deterministic extractor. Handles entity ids, pronouns, a fixed set of
/// action phrasings, doc references and simple time expressions.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleExtractor;

impl RuleExtractor {
    pub fn extract_sync(&self, text: &str) -> Extraction {
        // "BUG-7" must not also read as a mention of the word "bug".
        let without_ids = ENTITY_ID_RE.replace_all(text, " ");
        let mut ex = Extraction {
            entity_refs: ENTITY_ID_RE
                .find_iter(text)
                .filter_map(|m| EntityRef::parse(m.as_str()))
                .fold(Vec::new(), |mut acc, r| {
                    if !acc.contains(&r) {
                        acc.push(r);
                    }
                    acc
                }),
            references_docs: DOCS_RE.is_match(&without_ids),
            time_range: time_range(text),
            ..Default::default()
        };

        if let Some(caps) = TYPED_REF_RE.captures(&without_ids) {
            ex.anaphora = Some(Anaphora {
                entity_type: caps[1].parse().ok(),
            });
        } else if PRONOUN_RE.is_match(text) {
            ex.anaphora = Some(Anaphora { entity_type: None });
        }

        ex.entity_type = ENTITY_TYPE_RE
            .captures(&without_ids)
            .and_then(|c| c[1].parse::<EntityType>().ok());

        if let Some((action, parameters)) = detect_action(text) {
            ex.kind = ExtractionKind::Action;
            ex.action = Some(action);
            ex.parameters = parameters;
            return ex;
        }

        ex.status = STATUS_RE
            .captures(text)
            .map(|c| c[1].to_lowercase().replace(' ', "_"));
        ex.assignee = ASSIGNEE_RE.captures(text).map(|c| match c.get(1) {
            Some(name) if !name.as_str().eq_ignore_ascii_case("me") => name.as_str().to_string(),
            _ => "me".to_string(),
        });
        ex.keywords = keywords(text);
        ex
    }
}

impl IntentExtractor for RuleExtractor {
    async fn extract(&self, text: &str, _history: &[ChatTurn]) -> Result<Extraction> {
        Ok(self.extract_sync(text))
    }
}

fn detect_action(text: &str) -> Option<(String, BTreeMap<String, String>)> {
    let mut params = BTreeMap::new();

    if let Some(caps) = DESTRUCTIVE_RE.captures(text) {
        let (Some(verb), Some(object)) = (
            caps.name("verb").or_else(|| caps.name("verb2")),
            caps.name("object").or_else(|| caps.name("object2")),
        ) else {
            return None;
        };
        let verb = verb.as_str().to_lowercase();
        let object = object.as_str().to_lowercase();
        let name = if matches!(
            object.trim_end_matches('s'),
            "member" | "user" | "teammate" | "people"
        ) || text.to_lowercase().contains("from the team")
        {
            "remove_team_member".to_string()
        } else {
            let noun = object
                .parse::<EntityType>()
                .ok()
                .or_else(|| EntityRef::parse(&object.to_uppercase()).map(|r| r.entity_type))
                .map(|t| t.to_string())
                .unwrap_or(object);
            let verb = if verb == "drop" { "delete".to_string() } else { verb };
            format!("{verb}_{noun}")
        };
        return Some((name, params));
    }
    if ROLE_CHANGE_RE.is_match(text) {
        return Some(("change_user_role".into(), params));
    }
    if let Some(caps) = STATUS_CHANGE_RE.captures(text) {
        params.insert(
            "status".into(),
            caps[1].to_lowercase().replace(' ', "_"),
        );
        return Some(("update_status".into(), params));
    }
    if let Some(caps) = CLOSE_RE.captures(text) {
        let status = if caps[1].eq_ignore_ascii_case("reopen") {
            "open"
        } else {
            "done"
        };
        params.insert("status".into(), status.into());
        return Some(("update_status".into(), params));
    }
    if let Some(caps) = COMMENT_RE.captures(text) {
        params.insert("body".into(), caps[1].trim().to_string());
        return Some(("create_comment".into(), params));
    }
    if let Some(caps) = REMIND_RE.captures(text) {
        params.insert("remind_at".into(), reminder_time(&caps[1]));
        return Some(("set_reminder".into(), params));
    }
    if let Some(caps) = LINK_PR_RE.captures(text) {
        params.insert("pr_id".into(), caps[1].to_string());
        return Some(("link_commit_by_pr_id".into(), params));
    }
    if ADD_MEMBER_RE.is_match(text) {
        return Some(("add_team_member".into(), params));
    }
    if let Some(caps) = OTHER_WRITE_RE.captures(text) {
        let verb = caps
            .name("verb")
            .or_else(|| caps.name("verb2"))
            .map(|m| m.as_str().to_lowercase())
            .unwrap_or_else(|| "update".into());
        let object = caps
            .name("object")
            .or_else(|| caps.name("object2"))
            .map(|m| m.as_str().to_lowercase())
            .unwrap_or_else(|| "entity".into());
        return Some((format!("{verb}_{}", object.trim_end_matches('s')), params));
    }
    None
}

fn reminder_time(phrase: &str) -> String {
    let now = Utc::now();
    let phrase = phrase.to_lowercase();
    let at = match phrase.as_str() {
        "today" => now + Duration::hours(1),
        "tomorrow" => now + Duration::days(1),
        "next week" => now + Duration::weeks(1),
        other => {
            let mut parts = other.split_whitespace().skip(1);
            let n: i64 = parts.next().and_then(|n| n.parse().ok()).unwrap_or(1);
            match parts.next() {
                Some(u) if u.starts_with("minute") => now + Duration::minutes(n),
                Some(u) if u.starts_with("day") => now + Duration::days(n),
                _ => now + Duration::hours(n),
            }
        }
    };
    at.format("%Y-%m-%dT%H:%M:00Z").to_string()
}

fn time_range(text: &str) -> Option<TimeRange> {
    let now = Utc::now();
    let lower = text.to_lowercase();
    let from = if let Some(caps) = LAST_DAYS_RE.captures(&lower) {
        let days: i64 = caps[1].parse().ok()?;
        now - Duration::days(days)
    } else if lower.contains("today") {
        now.date_naive().and_hms_opt(0, 0, 0)?.and_utc()
    } else if lower.contains("yesterday") {
        (now - Duration::days(1)).date_naive().and_hms_opt(0, 0, 0)?.and_utc()
    } else if lower.contains("this week") || lower.contains("past week") {
        now - Duration::days(7)
    } else if lower.contains("this month") {
        now - Duration::days(30)
    } else {
        return None;
    };
    Some(TimeRange { from, to: now })
}

fn keywords(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for word in text.split_whitespace() {
        let w = word
            .trim_matches(|c: char| !c.is_alphanumeric() && c != '-')
            .to_lowercase();
        if w.len() < 3
            || STOPWORDS.contains(&w.as_str())
            || ENTITY_ID_RE.is_match(&w)
            || w.parse::<EntityType>().is_ok()
        {
            continue;
        }
        let stem = w.trim_end_matches('s').to_string();
        if !out.contains(&stem) {
            out.push(stem);
        }
    }
    out
}

// -- LLM-backed --

const EXTRACTION_SYSTEM_PROMPT: &str = r#"You extract structured intent from a project-management chat message.
Entity ids look like PRG-1, PRJ-3, MS-2, TSK-42, BUG-7, DOC-5.
Respond with ONLY a JSON object, no prose:
{"kind":"query"|"action","entity_ids":["TSK-42"],"entity_type":"task"|"bug"|"project"|"milestone"|"program"|"document"|null,
 "action":null|"<verb_object, e.g. update_status, create_comment, set_reminder, link_commit_by_pr_id, delete_project>",
 "parameters":{"status":"done"},"pronoun":null|"it"|"task"|"bug"|...,"references_docs":false,
 "days":null|<int>,"keywords":["..."],"status":null|"open","assignee":null|"me"|"<user>"}
Use "pronoun" when the message refers to an earlier entity without naming it."#;

#[derive(Debug, Deserialize)]
struct LlmExtraction {
    #[serde(default)]
    kind: ExtractionKind,
    #[serde(default)]
    entity_ids: Vec<String>,
    #[serde(default)]
    entity_type: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pronoun: Option<String>,
    #[serde(default)]
    references_docs: bool,
    #[serde(default)]
    days: Option<i64>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    assignee: Option<String>,
}

/// Asks the configured LLM for a JSON extraction. Unparseable output or a
/// provider error falls back to [`RuleExtractor`].
pub struct LlmExtractor {
    llm: LlmService,
    fallback: RuleExtractor,
}

impl LlmExtractor {
    pub fn new(llm: LlmService) -> Self {
        Self {
            llm,
            fallback: RuleExtractor,
        }
    }

    fn build_prompt(text: &str, history: &[ChatTurn]) -> String {
        let mut prompt = String::from("Conversation so far:\n");
        for turn in history {
            prompt.push_str(&format!("{}: {}\n", turn.role, turn.text));
        }
        prompt.push_str(&format!("\nNew message:\n{text}\n"));
        prompt
    }
}

impl IntentExtractor for LlmExtractor {
    async fn extract(&self, text: &str, history: &[ChatTurn]) -> Result<Extraction> {
        let prompt = Self::build_prompt(text, history);
        match self.llm.generate(&prompt, Some(EXTRACTION_SYSTEM_PROMPT)).await {
            Ok(raw) => match parse_llm_extraction(&raw) {
                Some(ex) => Ok(ex),
                None => {
                    tracing::warn!("nlu: unparseable LLM extraction, using rules");
                    Ok(self.fallback.extract_sync(text))
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "nlu: LLM extraction failed, using rules");
                Ok(self.fallback.extract_sync(text))
            }
        }
    }
}

fn parse_llm_extraction(raw: &str) -> Option<Extraction> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let parsed: LlmExtraction = serde_json::from_str(cleaned).ok()?;

    let anaphora = parsed.pronoun.map(|p| Anaphora {
        entity_type: p.parse().ok(),
    });
    let time_range = parsed.days.filter(|d| *d > 0).map(|d| {
        let now = Utc::now();
        TimeRange {
            from: now - Duration::days(d),
            to: now,
        }
    });
    let parameters = parsed
        .parameters
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (k, v)
        })
        .collect();

    Some(Extraction {
        kind: if parsed.action.is_some() {
            ExtractionKind::Action
        } else {
            parsed.kind
        },
        entity_refs: parsed
            .entity_ids
            .iter()
            .filter_map(|id| EntityRef::parse(id))
            .collect(),
        entity_type: parsed.entity_type.and_then(|t| t.parse().ok()),
        action: parsed.action,
        parameters,
        time_range,
        references_docs: parsed.references_docs,
        anaphora,
        keywords: parsed.keywords.into_iter().map(|k| k.to_lowercase()).collect(),
        status: parsed.status,
        assignee: parsed.assignee,
    })
}
