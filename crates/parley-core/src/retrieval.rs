//! Executes query intents against the data API and the document index,
//! under an [`AccessScope`].

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::access::AccessScope;
use crate::collab::{DataApi, DataApiBackend, DocHit, VectorBackend, VectorIndex};
use crate::config::RetrievalConfig;
use crate::error::Result;
use crate::model::{EntityRecord, EntityRef, EntityType, QueryIntent};

/// One row in a merged result set.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultItem {
    Entity(EntityRecord),
    Document(DocHit),
}

impl ResultItem {
    pub fn client_id(&self) -> &str {
        match self {
            Self::Entity(r) => &r.client_id,
            Self::Document(d) => &d.client_id,
        }
    }

    pub fn entity_ref(&self) -> Option<EntityRef> {
        match self {
            Self::Entity(r) => Some(r.entity_ref()),
            Self::Document(d) => EntityRef::parse(&d.doc_id),
        }
    }
}

/// A page of scoped, ranked results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultSet {
    pub items: Vec<ResultItem>,
    /// Size of the merged set before paging.
    pub total: usize,
    pub offset: usize,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_offset: Option<usize>,
    /// The caller asked about a type their role cannot see. Rendered exactly
    /// like an empty result.
    #[serde(skip)]
    pub denied: bool,
    /// Optional sources that failed and were skipped.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<&'static str>,
}

impl ResultSet {
    fn denied() -> Self {
        Self {
            denied: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn entities_accessed(&self) -> Vec<EntityRef> {
        self.items.iter().filter_map(ResultItem::entity_ref).collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.items.iter().filter_map(|i| match i {
            ResultItem::Entity(r) => Some(r),
            ResultItem::Document(_) => None,
        })
    }

    pub fn documents(&self) -> impl Iterator<Item = &DocHit> {
        self.items.iter().filter_map(|i| match i {
            ResultItem::Document(d) => Some(d),
            ResultItem::Entity(_) => None,
        })
    }
}

pub struct RetrievalOrchestrator {
    data_api: Arc<DataApiBackend>,
    vector: Arc<VectorBackend>,
    max_results: usize,
    vector_limit: usize,
}

impl RetrievalOrchestrator {
    pub fn new(
        data_api: Arc<DataApiBackend>,
        vector: Arc<VectorBackend>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            data_api,
            vector,
            max_results: config.max_results.max(1),
            vector_limit: config.vector_limit,
        }
    }

    /// Run `query` for the scope's client only.
    ///
    /// A data API failure fails the call. A vector index failure is logged
    /// and the structured rows are returned alone.
    pub async fn retrieve(&self, query: &QueryIntent, scope: &AccessScope) -> Result<ResultSet> {
        let filters = &query.entity_filters;
        if filters
            .entity_types()
            .into_iter()
            .any(|t| !scope.permits_type(t))
        {
            tracing::debug!(
                client_id = %scope.client_id,
                role = %scope.role,
                "retrieval: requested type outside scope"
            );
            return Ok(ResultSet::denied());
        }

        metrics::counter!(crate::metrics::RETRIEVAL_SOURCE_TOTAL, "source" => "data_api").increment(1);
        let rows = match self
            .data_api
            .search(&scope.client_id, filters, query.time_range)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                metrics::counter!(crate::metrics::RETRIEVAL_SOURCE_ERRORS_TOTAL, "source" => "data_api")
                    .increment(1);
                return Err(e);
            }
        };

        let fetched = rows.len();
        let rows: Vec<EntityRecord> = rows
            .into_iter()
            .filter(|r| r.client_id == scope.client_id && scope.permits_type(r.entity_type))
            .collect();
        if rows.len() < fetched {
            tracing::warn!(
                client_id = %scope.client_id,
                dropped = fetched - rows.len(),
                "retrieval: dropped out-of-scope rows from data api"
            );
        }

        let mut items: Vec<ResultItem> = rank_records(rows, query, Utc::now())
            .into_iter()
            .map(ResultItem::Entity)
            .collect();

        let mut degraded = Vec::new();
        if self.wants_documents(query, scope) {
            match self.similar_documents(query, scope).await {
                Ok(hits) => {
                    let seen: Vec<String> = items
                        .iter()
                        .filter_map(|i| i.entity_ref().map(|r| r.id))
                        .collect();
                    items.extend(
                        hits.into_iter()
                            .filter(|h| !seen.contains(&h.doc_id))
                            .map(ResultItem::Document),
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        client_id = %scope.client_id,
                        error = %e,
                        "retrieval: vector index unavailable, continuing without documents"
                    );
                    degraded.push("vector_index");
                }
            }
        }

        let mut set = paginate(items, query.offset, self.max_results);
        set.degraded = degraded;
        Ok(set)
    }

    fn wants_documents(&self, query: &QueryIntent, scope: &AccessScope) -> bool {
        query.references_docs
            && self.vector.is_enabled()
            && self.vector_limit > 0
            && scope.permits_type(EntityType::Document)
    }

    async fn similar_documents(&self, query: &QueryIntent, scope: &AccessScope) -> Result<Vec<DocHit>> {
        metrics::counter!(crate::metrics::RETRIEVAL_SOURCE_TOTAL, "source" => "vector_index").increment(1);
        let hits = self
            .vector
            .similar(&scope.client_id, &query.text, self.vector_limit)
            .await
            .inspect_err(|_| {
                metrics::counter!(
                    crate::metrics::RETRIEVAL_SOURCE_ERRORS_TOTAL,
                    "source" => "vector_index"
                )
                .increment(1);
            })?;
        Ok(hits
            .into_iter()
            .filter(|h| h.client_id == scope.client_id)
            .collect())
    }
}

/// Exponential decay on `updated_at`. Half-life of 7 days.
pub fn recency_score(updated_at: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
    let age_secs = (now - updated_at).num_seconds().max(0) as f64;
    let half_life_secs = 7.0 * 24.0 * 3600.0;
    (-age_secs * 2.0_f64.ln() / half_life_secs).exp() as f32
}

/// How well `record` matches the query: 1.0 for a requested id, otherwise
/// the fraction of keywords found in its text.
pub fn relevance_score(record: &EntityRecord, query: &QueryIntent) -> f32 {
    let filters = &query.entity_filters;
    if filters
        .ids
        .iter()
        .any(|r| r.id.eq_ignore_ascii_case(&record.id))
    {
        return 1.0;
    }
    if filters.keywords.is_empty() {
        return 0.0;
    }
    let haystack = record.search_text().to_lowercase();
    let matched = filters
        .keywords
        .iter()
        .filter(|k| haystack.contains(&k.to_lowercase()))
        .count();
    matched as f32 / filters.keywords.len() as f32
}

/// Sort by relevance, then recency, both descending.
pub fn rank_records(
    records: Vec<EntityRecord>,
    query: &QueryIntent,
    now: DateTime<Utc>,
) -> Vec<EntityRecord> {
    let mut scored: Vec<(f32, f32, EntityRecord)> = records
        .into_iter()
        .map(|r| {
            (
                relevance_score(&r, query),
                recency_score(r.updated_at, now),
                r,
            )
        })
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal))
    });
    scored.into_iter().map(|(_, _, r)| r).collect()
}

fn paginate(items: Vec<ResultItem>, offset: usize, page_size: usize) -> ResultSet {
    let total = items.len();
    let offset = offset.min(total);
    let end = (offset + page_size).min(total);
    let truncated = end < total;
    ResultSet {
        items: items.into_iter().skip(offset).take(end - offset).collect(),
        total,
        offset,
        truncated,
        next_offset: truncated.then_some(end),
        denied: false,
        degraded: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InMemoryDataApi, InMemoryVectorIndex};
    use crate::error::ParleyError;
    use crate::model::{EntityFilters, Principal, Role};

    fn orchestrator(data: InMemoryDataApi, vector: VectorBackend) -> RetrievalOrchestrator {
        RetrievalOrchestrator::new(
            Arc::new(DataApiBackend::Memory(data)),
            Arc::new(vector),
            &RetrievalConfig::default(),
        )
    }

    fn scope(role: Role) -> AccessScope {
        AccessScope::derive(&Principal::new("alice", "acme", role)).unwrap()
    }

    fn query(filters: EntityFilters) -> QueryIntent {
        QueryIntent {
            text: "q".into(),
            entity_filters: filters,
            ..Default::default()
        }
    }

    fn runbook_docs() -> VectorBackend {
        VectorBackend::Memory(InMemoryVectorIndex::with_docs(vec![
            DocHit {
                doc_id: "DOC-5".into(),
                client_id: "acme".into(),
                title: "Payments runbook".into(),
                snippet: "Rotate tokenization keys quarterly".into(),
                score: 0.0,
            },
            DocHit {
                doc_id: "DOC-77".into(),
                client_id: "acme".into(),
                title: "Tokenization design notes".into(),
                snippet: "Why tokenization uses a vault".into(),
                score: 0.0,
            },
            DocHit {
                doc_id: "DOC-99".into(),
                client_id: "globex".into(),
                title: "Globex tokenization secrets".into(),
                snippet: "tokenization".into(),
                score: 0.0,
            },
        ]))
    }

    #[tokio::test]
    async fn test_post_filter_strips_foreign_rows() {
        let data = InMemoryDataApi::demo();
        data.set_leak_across_clients(true);
        let orch = orchestrator(data, VectorBackend::Disabled);

        let set = orch
            .retrieve(
                &query(EntityFilters {
                    entity_type: Some(EntityType::Task),
                    ..Default::default()
                }),
                &scope(Role::Admin),
            )
            .await
            .unwrap();
        assert!(!set.is_empty());
        assert!(set.items.iter().all(|i| i.client_id() == "acme"));
        assert!(set.records().all(|r| r.id != "TSK-900"));
    }

    #[tokio::test]
    async fn test_restricted_type_reads_as_empty() {
        let orch = orchestrator(InMemoryDataApi::demo(), VectorBackend::Disabled);
        let set = orch
            .retrieve(
                &query(EntityFilters {
                    entity_type: Some(EntityType::Bug),
                    ..Default::default()
                }),
                &scope(Role::Viewer),
            )
            .await
            .unwrap();
        assert!(set.denied);
        assert!(set.is_empty());
        assert_eq!(set.total, 0);
    }

    #[tokio::test]
    async fn test_restricted_type_never_queried() {
        let data = Arc::new(DataApiBackend::Memory(InMemoryDataApi::demo()));
        let orch = RetrievalOrchestrator::new(
            Arc::clone(&data),
            Arc::new(VectorBackend::Disabled),
            &RetrievalConfig::default(),
        );
        let q = query(EntityFilters {
            ids: vec![EntityRef::new(EntityType::Bug, "BUG-7")],
            ..Default::default()
        });
        orch.retrieve(&q, &scope(Role::Viewer)).await.unwrap();
        assert_eq!(data.as_memory().unwrap().search_calls(), 0);
    }

    #[tokio::test]
    async fn test_untyped_search_hides_restricted_rows() {
        let orch = orchestrator(InMemoryDataApi::demo(), VectorBackend::Disabled);
        let set = orch
            .retrieve(&query(EntityFilters::default()), &scope(Role::Viewer))
            .await
            .unwrap();
        assert!(set.records().all(|r| r.entity_type != EntityType::Bug));
        assert!(set.records().all(|r| r.entity_type != EntityType::Milestone));
    }

    #[tokio::test]
    async fn test_caps_at_max_results_and_paginates() {
        let data = InMemoryDataApi::new();
        for n in 0..45 {
            data.insert(
                crate::model::EntityRecord::new(
                    EntityType::Task,
                    format!("TSK-{n}"),
                    "acme",
                    format!("task {n}"),
                )
                .with_updated_at(Utc::now() - chrono::Duration::minutes(n)),
            );
        }
        let orch = orchestrator(data, VectorBackend::Disabled);
        let mut q = query(EntityFilters {
            entity_type: Some(EntityType::Task),
            ..Default::default()
        });

        let first = orch.retrieve(&q, &scope(Role::Admin)).await.unwrap();
        assert_eq!(first.items.len(), 20);
        assert_eq!(first.total, 45);
        assert!(first.truncated);
        assert_eq!(first.next_offset, Some(20));
        // Newest first when relevance ties.
        assert_eq!(first.records().next().unwrap().id, "TSK-0");

        q.offset = 40;
        let last = orch.retrieve(&q, &scope(Role::Admin)).await.unwrap();
        assert_eq!(last.items.len(), 5);
        assert!(!last.truncated);
        assert_eq!(last.next_offset, None);
    }

    #[tokio::test]
    async fn test_documents_appended_after_rows() {
        let orch = orchestrator(InMemoryDataApi::demo(), runbook_docs());
        let q = QueryIntent {
            text: "tokenization docs".into(),
            entity_filters: EntityFilters {
                keywords: vec!["tokenization".into()],
                ..Default::default()
            },
            references_docs: true,
            ..Default::default()
        };
        let set = orch.retrieve(&q, &scope(Role::Developer)).await.unwrap();

        let first_doc = set
            .items
            .iter()
            .position(|i| matches!(i, ResultItem::Document(_)))
            .unwrap();
        assert!(set.items[..first_doc]
            .iter()
            .all(|i| matches!(i, ResultItem::Entity(_))));
        // DOC-5 already came back as a row.
        assert_eq!(set.documents().count(), 1);
        assert!(set.documents().all(|d| d.client_id == "acme"));
    }

    #[tokio::test]
    async fn test_foreign_documents_filtered() {
        let vector = runbook_docs();
        if let Some(v) = vector.as_memory() {
            v.set_leak_across_clients(true);
        }
        let orch = orchestrator(InMemoryDataApi::new(), vector);
        let q = QueryIntent {
            text: "tokenization".into(),
            references_docs: true,
            ..Default::default()
        };
        let set = orch.retrieve(&q, &scope(Role::Admin)).await.unwrap();
        assert!(set.documents().all(|d| d.doc_id != "DOC-99"));
        assert!(set.documents().count() >= 1);
    }

    #[tokio::test]
    async fn test_vector_outage_degrades() {
        let vector = runbook_docs();
        if let Some(v) = vector.as_memory() {
            v.set_unavailable(true);
        }
        let orch = orchestrator(InMemoryDataApi::demo(), vector);
        let q = QueryIntent {
            text: "payments runbook docs".into(),
            entity_filters: EntityFilters {
                keywords: vec!["payments".into()],
                ..Default::default()
            },
            references_docs: true,
            ..Default::default()
        };
        let set = orch.retrieve(&q, &scope(Role::Admin)).await.unwrap();
        assert_eq!(set.degraded, vec!["vector_index"]);
        assert!(!set.is_empty());
    }

    #[tokio::test]
    async fn test_data_api_outage_fails() {
        let data = InMemoryDataApi::demo();
        data.set_unavailable(true);
        let orch = orchestrator(data, VectorBackend::Disabled);
        let err = orch
            .retrieve(&query(EntityFilters::default()), &scope(Role::Admin))
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::DownstreamUnavailable(_)));
    }

    #[test]
    fn test_rank_prefers_relevance_over_recency() {
        let now = Utc::now();
        let old_match = EntityRecord::new(EntityType::Task, "TSK-1", "acme", "webhook retries")
            .with_updated_at(now - chrono::Duration::days(30));
        let fresh_miss = EntityRecord::new(EntityType::Task, "TSK-2", "acme", "billing page")
            .with_updated_at(now);
        let q = query(EntityFilters {
            keywords: vec!["webhook".into()],
            ..Default::default()
        });
        let ranked = rank_records(vec![fresh_miss, old_match], &q, now);
        assert_eq!(ranked[0].id, "TSK-1");
    }

    #[test]
    fn test_recency_half_life() {
        let now = Utc::now();
        assert!((recency_score(now, now) - 1.0).abs() < 0.01);
        let week = recency_score(now - chrono::Duration::days(7), now);
        assert!((week - 0.5).abs() < 0.01);
    }
}
