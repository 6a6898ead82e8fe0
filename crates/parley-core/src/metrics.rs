//! Metric names recorded through the `metrics` facade.
//!
//! The exporter is installed by the binary; without one these calls are no-ops.

/// Chat queries total (counter, labels: intent).
pub const CHAT_QUERIES_TOTAL: &str = "chat_queries_total";
/// Chat errors total (counter, labels: intent, `error_type`).
pub const CHAT_ERRORS_TOTAL: &str = "chat_errors_total";
/// Chat request duration seconds (histogram, labels: intent).
pub const CHAT_REQUEST_DURATION_SECONDS: &str = "chat_request_duration_seconds";
/// Live chat sessions (gauge).
pub const CHAT_SESSIONS_ACTIVE: &str = "chat_sessions_active";
/// Retrieval calls per data source (counter, labels: source).
pub const RETRIEVAL_SOURCE_TOTAL: &str = "retrieval_source_total";
/// Retrieval failures per data source (counter, labels: source).
pub const RETRIEVAL_SOURCE_ERRORS_TOTAL: &str = "retrieval_source_errors_total";
/// Requests denied by the rate limiter (counter).
pub const RATE_LIMITED_TOTAL: &str = "rate_limited_total";
/// Action proposals by final state (counter, labels: action, state).
pub const ACTIONS_TOTAL: &str = "actions_total";

pub const ALL: &[&str] = &[
    CHAT_QUERIES_TOTAL,
    CHAT_ERRORS_TOTAL,
    CHAT_REQUEST_DURATION_SECONDS,
    CHAT_SESSIONS_ACTIVE,
    RETRIEVAL_SOURCE_TOTAL,
    RETRIEVAL_SOURCE_ERRORS_TOTAL,
    RATE_LIMITED_TOTAL,
    ACTIONS_TOTAL,
];
