use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::VectorConfig;
use crate::error::{ParleyError, Result};

/// A long-form document passage returned by similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocHit {
    pub doc_id: String,
    pub client_id: String,
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    pub score: f32,
}

pub trait VectorIndex: Send + Sync {
    fn similar(
        &self,
        client_id: &str,
        text: &str,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<DocHit>>> + Send;

    fn health(&self) -> impl std::future::Future<Output = Result<()>> + Send;
}

pub enum VectorBackend {
    Http(HttpVectorIndex),
    Memory(InMemoryVectorIndex),
    Disabled,
}

impl VectorBackend {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    pub fn as_memory(&self) -> Option<&InMemoryVectorIndex> {
        match self {
            Self::Memory(m) => Some(m),
            _ => None,
        }
    }
}

impl VectorIndex for VectorBackend {
    async fn similar(&self, client_id: &str, text: &str, limit: usize) -> Result<Vec<DocHit>> {
        match self {
            Self::Http(v) => v.similar(client_id, text, limit).await,
            Self::Memory(v) => v.similar(client_id, text, limit).await,
            Self::Disabled => Err(ParleyError::DownstreamUnavailable(
                "vector index disabled".into(),
            )),
        }
    }

    async fn health(&self) -> Result<()> {
        match self {
            Self::Http(v) => v.health().await,
            Self::Memory(v) => v.health().await,
            Self::Disabled => Err(ParleyError::DownstreamUnavailable(
                "vector index disabled".into(),
            )),
        }
    }
}

pub fn create_vector_index(config: &VectorConfig) -> Result<VectorBackend> {
    if !config.enabled {
        return Ok(VectorBackend::Disabled);
    }
    Ok(VectorBackend::Http(HttpVectorIndex::new(
        &config.base_url,
        Duration::from_secs(config.timeout_secs),
    )?))
}

/// Similarity search over HTTP: `POST {base}/search`.
pub struct HttpVectorIndex {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct SimilarRequest<'a> {
    client_id: &'a str,
    text: &'a str,
    limit: usize,
}

#[derive(Deserialize)]
struct SimilarResponse {
    #[serde(default)]
    hits: Vec<DocHit>,
}

impl HttpVectorIndex {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(2))
                .build()?,
        })
    }
}

impl VectorIndex for HttpVectorIndex {
    async fn similar(&self, client_id: &str, text: &str, limit: usize) -> Result<Vec<DocHit>> {
        let resp = self
            .http
            .post(format!("{}/search", self.base_url))
            .json(&SimilarRequest {
                client_id,
                text,
                limit,
            })
            .send()
            .await
            .map_err(|e| ParleyError::DownstreamUnavailable(format!("vector index: {e}")))?;
        if !resp.status().is_success() {
            return Err(ParleyError::DownstreamUnavailable(format!(
                "vector index returned {}",
                resp.status().as_u16()
            )));
        }
        let body: SimilarResponse = resp.json().await?;
        Ok(body.hits)
    }

    async fn health(&self) -> Result<()> {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| ParleyError::DownstreamUnavailable(format!("vector index: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ParleyError::DownstreamUnavailable(format!(
                "vector index health returned {}",
                resp.status().as_u16()
            )))
        }
    }
}

/// Keyword-overlap stand-in for a real index.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    docs: RwLock<Vec<DocHit>>,
    unavailable: AtomicBool,
    // Ignore `client_id` in `similar`, like a misconfigured index would.
    leak_across_clients: AtomicBool,
}

impl InMemoryVectorIndex {
    pub fn with_docs(docs: Vec<DocHit>) -> Self {
        Self {
            docs: RwLock::new(docs),
            ..Default::default()
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_leak_across_clients(&self, leak: bool) {
        self.leak_across_clients.store(leak, Ordering::SeqCst);
    }
}

impl VectorIndex for InMemoryVectorIndex {
    async fn similar(&self, client_id: &str, text: &str, limit: usize) -> Result<Vec<DocHit>> {
        self.health().await?;
        let leak = self.leak_across_clients.load(Ordering::SeqCst);
        let terms: Vec<String> = text
            .split_whitespace()
            .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .filter(|t| t.len() > 2)
            .collect();

        let docs = self
            .docs
            .read()
            .map_err(|e| ParleyError::Storage(format!("vector fixture lock poisoned: {e}")))?;
        let mut hits: Vec<DocHit> = docs
            .iter()
            .filter(|d| leak || d.client_id == client_id)
            .filter_map(|d| {
                let haystack = format!("{} {}", d.title, d.snippet).to_lowercase();
                let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                (matched > 0).then(|| DocHit {
                    score: matched as f32 / terms.len().max(1) as f32,
                    ..d.clone()
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn health(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ParleyError::DownstreamUnavailable(
                "vector index: connection refused".into(),
            ));
        }
        Ok(())
    }
}
