//! External collaborators: the project data API, language understanding,
//! the document similarity index, and per-entity authorization.

pub mod authz;
pub mod data_api;
pub mod llm;
pub mod nlu;
pub mod vector;

pub use authz::{Authorizer, RoleAuthorizer};
pub use data_api::{
    create_data_api, DataApi, DataApiBackend, HttpDataApi, InMemoryDataApi, WriteOutcome,
};
pub use llm::LlmService;
pub use nlu::{
    Anaphora, Extraction, ExtractionKind, Extractor, IntentExtractor, LlmExtractor, RuleExtractor,
};
pub use vector::{
    create_vector_index, DocHit, HttpVectorIndex, InMemoryVectorIndex, VectorBackend, VectorIndex,
};

use crate::config::LlmConfig;
use crate::error::Result;

/// Pick the extractor for the given LLM settings.
pub fn create_extractor(config: &LlmConfig) -> Result<Extractor> {
    if !config.enabled {
        return Ok(Extractor::Rules(RuleExtractor));
    }
    let llm = LlmService::from_config(config)?;
    tracing::info!(provider = llm.provider_name(), model = llm.model(), "nlu: using LLM extractor");
    Ok(Extractor::Llm(LlmExtractor::new(llm)))
}
