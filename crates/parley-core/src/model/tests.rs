use std::collections::BTreeMap;

use chrono::{Duration, Utc};

use crate::model::*;

#[test]
fn test_validate_query_bounds() {
    assert!(validate_query("what's blocking TSK-42?", MAX_QUERY_LENGTH).is_ok());
    assert!(validate_query("", MAX_QUERY_LENGTH).is_err());
    assert!(validate_query("   ", MAX_QUERY_LENGTH).is_err());

    let exact = "a".repeat(MAX_QUERY_LENGTH);
    assert!(validate_query(&exact, MAX_QUERY_LENGTH).is_ok());

    let over = "a".repeat(MAX_QUERY_LENGTH + 1);
    let err = validate_query(&over, MAX_QUERY_LENGTH).unwrap_err();
    assert_eq!(err.result_status(), "validation_error");
}

#[test]
fn test_validate_query_counts_chars_not_bytes() {
    // 2000 two-byte characters is still within bounds.
    let text = "é".repeat(MAX_QUERY_LENGTH);
    assert!(validate_query(&text, MAX_QUERY_LENGTH).is_ok());
}

#[test]
fn test_entity_ref_parse() {
    let r = EntityRef::parse("tsk-42").unwrap();
    assert_eq!(r.entity_type, EntityType::Task);
    assert_eq!(r.id, "TSK-42");

    assert_eq!(
        EntityRef::parse("BUG-7").unwrap().entity_type,
        EntityType::Bug
    );
    assert!(EntityRef::parse("FOO-1").is_none());
    assert!(EntityRef::parse("TSK-").is_none());
    assert!(EntityRef::parse("TSK-4a").is_none());
}

#[test]
fn test_entity_type_from_str_plural() {
    assert_eq!("bugs".parse::<EntityType>().unwrap(), EntityType::Bug);
    assert_eq!("Tasks".parse::<EntityType>().unwrap(), EntityType::Task);
    assert_eq!("docs".parse::<EntityType>().unwrap(), EntityType::Document);
    assert!("spaceship".parse::<EntityType>().is_err());
}

#[test]
fn test_role_from_str() {
    assert_eq!("Tester".parse::<Role>().unwrap(), Role::Tester);
    assert_eq!("project_manager".parse::<Role>().unwrap(), Role::Manager);
    assert!("superuser".parse::<Role>().is_err());
}

#[test]
fn test_session_ring_buffer_drops_oldest() {
    let mut session = ChatSession::new("alice", "acme");
    for i in 0..11 {
        session.push_turn(ChatTurn::user(format!("turn {i}")), MAX_HISTORY_TURNS);
    }
    assert_eq!(session.history.len(), MAX_HISTORY_TURNS);
    assert_eq!(session.history.front().unwrap().text, "turn 1");
    assert_eq!(session.history.back().unwrap().text, "turn 10");
}

#[test]
fn test_session_expiry_boundary() {
    let mut session = ChatSession::new("alice", "acme");
    let ttl = Duration::minutes(30);
    let now = Utc::now();
    session.last_activity_at = now - Duration::minutes(30);
    assert!(session.is_expired(now, ttl));

    session.last_activity_at = now - Duration::minutes(29);
    assert!(!session.is_expired(now, ttl));
}

#[test]
fn test_session_ids_are_unique_and_opaque() {
    let a = ChatSession::new("u", "c");
    let b = ChatSession::new("u", "c");
    assert_ne!(a.session_id, b.session_id);
    assert_eq!(a.session_id.len(), 32);
    assert!(a.session_id.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn test_turn_entities_keyed_by_type() {
    let turn = ChatTurn::user("what's blocking TSK-42?").with_entities(vec![
        EntityRef::new(EntityType::Task, "TSK-42"),
        EntityRef::new(EntityType::Task, "TSK-43"),
        EntityRef::new(EntityType::Bug, "BUG-7"),
    ]);
    // First mention of a type wins.
    assert_eq!(turn.entity_of_type(EntityType::Task).unwrap().id, "TSK-42");
    assert_eq!(turn.entities["bug"].id, "BUG-7");
}

#[test]
fn test_classify_action() {
    assert_eq!(
        classify_action("update_status"),
        ActionClass::Allowed(ActionType::UpdateStatus)
    );
    assert_eq!(
        classify_action("link_commit_by_pr_id"),
        ActionClass::Allowed(ActionType::LinkCommit)
    );
    assert!(matches!(
        classify_action("delete_project"),
        ActionClass::Destructive(_)
    ));
    assert!(matches!(
        classify_action("Change-User-Role"),
        ActionClass::Destructive(_)
    ));
    assert!(matches!(
        classify_action("remove_team_member"),
        ActionClass::Destructive(_)
    ));
    assert!(matches!(
        classify_action("export_everything"),
        ActionClass::Unknown(_)
    ));
}

fn status_params(status: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("status".to_string(), status.to_string())])
}

#[test]
fn test_proposal_happy_path_transitions() {
    let mut p = ActionProposal::new(
        "s1",
        "alice",
        "acme",
        "update_status",
        Some(EntityRef::new(EntityType::Task, "TSK-42")),
        status_params("done"),
    );
    assert_eq!(p.state, ActionState::Proposed);
    assert_eq!(p.action_type, Some(ActionType::UpdateStatus));

    p.confirm(&status_params("done")).unwrap();
    assert_eq!(p.state, ActionState::Confirmed);

    p.mark_executed("TSK-42 is now done").unwrap();
    assert_eq!(p.state, ActionState::Executed);
    assert!(p.state.is_terminal());
}

#[test]
fn test_proposal_confirm_requires_matching_parameters() {
    let mut p = ActionProposal::new(
        "s1",
        "alice",
        "acme",
        "update_status",
        Some(EntityRef::new(EntityType::Task, "TSK-42")),
        status_params("done"),
    );
    assert!(p.confirm(&status_params("blocked")).is_err());
    assert_eq!(p.state, ActionState::Proposed);
}

#[test]
fn test_proposal_cannot_execute_without_confirm() {
    let mut p = ActionProposal::new("s1", "alice", "acme", "create_comment", None, BTreeMap::new());
    assert!(p.mark_executed("done").is_err());
    assert!(p.mark_failed("boom").is_err());
}

#[test]
fn test_terminal_states_are_final() {
    let mut p = ActionProposal::new("s1", "alice", "acme", "create_comment", None, BTreeMap::new());
    p.reject(Rejection::InsufficientPermission).unwrap();
    assert_eq!(p.state, ActionState::Rejected);
    assert_eq!(p.reason.as_deref(), Some("insufficient permission"));
    assert!(p.confirm(&BTreeMap::new()).is_err());
    assert!(p.reject(Rejection::Cancelled).is_err());
}

#[test]
fn test_proposal_describe_echoes_parameters() {
    let p = ActionProposal::new(
        "s1",
        "alice",
        "acme",
        "update_status",
        Some(EntityRef::new(EntityType::Task, "TSK-42")),
        status_params("done"),
    );
    assert_eq!(p.describe(), "update_status on TSK-42 (status=done)");
}

#[test]
fn test_intent_serde_tagged() {
    let intent = Intent::Clarification {
        question: "Which one?".into(),
        candidates: vec![EntityRef::new(EntityType::Bug, "BUG-1")],
    };
    let json = serde_json::to_value(&intent).unwrap();
    assert_eq!(json["type"], "clarification");
    assert_eq!(json["candidates"][0]["type"], "bug");
    assert_eq!(intent.type_name(), "clarification");
}

#[test]
fn test_filters_entity_types_dedup() {
    let filters = EntityFilters {
        entity_type: Some(EntityType::Task),
        ids: vec![
            EntityRef::new(EntityType::Task, "TSK-1"),
            EntityRef::new(EntityType::Bug, "BUG-2"),
        ],
        ..Default::default()
    };
    assert_eq!(
        filters.entity_types(),
        vec![EntityType::Task, EntityType::Bug]
    );
}

#[test]
fn test_principal_sole_client() {
    let one = Principal::new("alice", "acme", Role::Developer);
    assert_eq!(one.sole_client(), Some("acme"));

    let many = Principal {
        client_ids: vec!["acme".into(), "globex".into()],
        ..one.clone()
    };
    assert_eq!(many.sole_client(), None);

    let blank = Principal {
        client_ids: vec!["  ".into()],
        ..one
    };
    assert_eq!(blank.sole_client(), None);
}
