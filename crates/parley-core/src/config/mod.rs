use crate::error::{ParleyError, Result};
use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParleyConfig {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub data_api: DataApiConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub scrub: crate::scrub::ScrubConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_port")]
    pub port: u16,
    #[serde(default = "default_web_host")]
    pub host: String,
    /// Overall budget per chat request, measured from receipt.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: default_web_port(),
            host: default_web_host(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret. Falls back to `env_var` (default `PARLEY_JWT_SECRET`).
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default)]
    pub env_var: Option<String>,
    #[serde(default = "default_jwt_issuer")]
    pub jwt_issuer: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            env_var: None,
            jwt_issuer: default_jwt_issuer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Mirror sessions into SQLite so they survive restarts.
    #[serde(default)]
    pub persist: bool,
    /// Custom path for the session database. Defaults to `~/.config/parley/sessions.db`.
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            max_history: default_max_history(),
            sweep_interval_secs: default_sweep_interval_secs(),
            persist: false,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rate_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_rate_max_requests")]
    pub max_requests: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: default_rate_window_secs(),
            max_requests: default_rate_max_requests(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            max_query_chars: default_max_query_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_vector_limit")]
    pub vector_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            vector_limit: default_vector_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataApiConfig {
    /// `"memory"` serves the built-in fixture store; `"http"` talks to `base_url`.
    #[serde(default = "default_data_api_backend")]
    pub backend: String,
    #[serde(default = "default_data_api_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub env_var: Option<String>,
    #[serde(default = "default_collaborator_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DataApiConfig {
    fn default() -> Self {
        Self {
            backend: default_data_api_backend(),
            base_url: default_data_api_url(),
            api_key: None,
            env_var: None,
            timeout_secs: default_collaborator_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_vector_url")]
    pub base_url: String,
    #[serde(default = "default_collaborator_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_vector_url(),
            timeout_secs: default_collaborator_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub env_var: Option<String>,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: usize,
    /// Let the LLM phrase query replies from already-filtered rows.
    #[serde(default)]
    pub generate_replies: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_llm_provider(),
            model: default_llm_model(),
            api_key: None,
            base_url: None,
            env_var: None,
            max_tokens: default_llm_max_tokens(),
            generate_replies: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// JSONL file. Defaults to `~/.config/parley/audit.jsonl`.
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

/// Valid LLM provider names.
pub const VALID_LLM_PROVIDERS: &[&str] = &["ollama", "openai", "gemini", "anthropic", "claude"];

/// Valid data API backend names.
pub const VALID_DATA_API_BACKENDS: &[&str] = &["memory", "http"];

// -- Defaults --

fn default_web_port() -> u16 {
    8088
}
fn default_web_host() -> String {
    "127.0.0.1".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_jwt_issuer() -> String {
    "parley".to_string()
}
fn default_session_ttl_secs() -> u64 {
    30 * 60
}
fn default_max_history() -> usize {
    crate::model::MAX_HISTORY_TURNS
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_rate_window_secs() -> u64 {
    60
}
fn default_rate_max_requests() -> usize {
    60
}
fn default_max_query_chars() -> usize {
    crate::model::MAX_QUERY_LENGTH
}
fn default_max_results() -> usize {
    20
}
fn default_vector_limit() -> usize {
    5
}
fn default_data_api_backend() -> String {
    "memory".to_string()
}
fn default_data_api_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_vector_url() -> String {
    "http://localhost:6333".to_string()
}
fn default_collaborator_timeout_secs() -> u64 {
    10
}
fn default_llm_provider() -> String {
    "ollama".to_string()
}
fn default_llm_model() -> String {
    "llama3.2".to_string()
}
fn default_llm_max_tokens() -> usize {
    512
}

impl ParleyConfig {
    /// Load configuration with three-layer TOML merge:
    /// 1. ~/.config/parley/config.toml (global)
    /// 2. .parley/config.toml (project)
    /// 3. .parley/config.local.toml (local, gitignored)
    pub fn load(project_dir: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(global_path) = global_config_path() {
            if global_path.exists() {
                builder = builder.add_source(File::from(global_path).required(false));
            }
        }

        if let Some(dir) = project_dir {
            let project_config = dir.join(".parley").join("config.toml");
            if project_config.exists() {
                builder = builder.add_source(File::from(project_config).required(false));
            }

            let local_config = dir.join(".parley").join("config.local.toml");
            if local_config.exists() {
                builder = builder.add_source(File::from(local_config).required(false));
            }
        }

        let config = builder
            .build()
            .map_err(|e| ParleyError::Config(e.to_string()))?;

        let mut cfg: Self = config
            .try_deserialize()
            .map_err(|e| ParleyError::Config(e.to_string()))?;

        cfg.validate();
        Ok(cfg)
    }

    /// Load a single explicit TOML file on top of the defaults.
    pub fn load_file(path: &Path) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.to_path_buf()).required(true))
            .build()
            .map_err(|e| ParleyError::Config(e.to_string()))?;
        let mut cfg: Self = config
            .try_deserialize()
            .map_err(|e| ParleyError::Config(e.to_string()))?;
        cfg.validate();
        Ok(cfg)
    }

    /// Load with defaults only (no files).
    pub fn default_config() -> Self {
        Self {
            web: WebConfig::default(),
            auth: AuthConfig::default(),
            session: SessionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            input: InputConfig::default(),
            retrieval: RetrievalConfig::default(),
            data_api: DataApiConfig::default(),
            vector: VectorConfig::default(),
            llm: LlmConfig::default(),
            scrub: crate::scrub::ScrubConfig::default(),
            audit: AuditConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate config values, clamping out-of-range values and logging warnings.
    /// This is lenient — it fixes values rather than rejecting the config.
    pub fn validate(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !VALID_DATA_API_BACKENDS.contains(&self.data_api.backend.as_str()) {
            warnings.push(format!(
                "unknown data_api backend '{}', valid: {}",
                self.data_api.backend,
                VALID_DATA_API_BACKENDS.join(", ")
            ));
        }

        if self.llm.enabled && !VALID_LLM_PROVIDERS.contains(&self.llm.provider.as_str()) {
            warnings.push(format!(
                "unknown LLM provider '{}', valid: {}",
                self.llm.provider,
                VALID_LLM_PROVIDERS.join(", ")
            ));
        }

        if self.llm.max_tokens == 0 {
            warnings.push("llm.max_tokens = 0, setting to 256".to_string());
            self.llm.max_tokens = 256;
        }

        if self.llm.generate_replies && !self.llm.enabled {
            warnings.push(
                "llm.generate_replies = true but llm.enabled = false; template replies will be used"
                    .to_string(),
            );
        }

        // Positive integer checks
        let positive_u64: Vec<(&str, &mut u64, u64)> = vec![
            ("web.request_timeout_secs", &mut self.web.request_timeout_secs, 30),
            ("session.ttl_secs", &mut self.session.ttl_secs, 30 * 60),
            ("session.sweep_interval_secs", &mut self.session.sweep_interval_secs, 60),
            ("rate_limit.window_secs", &mut self.rate_limit.window_secs, 60),
            ("data_api.timeout_secs", &mut self.data_api.timeout_secs, 10),
            ("vector.timeout_secs", &mut self.vector.timeout_secs, 10),
        ];
        for (name, val, fallback) in positive_u64 {
            if *val == 0 {
                warnings.push(format!("{name} = 0, setting to {fallback}"));
                *val = fallback;
            }
        }

        let positive_usize: Vec<(&str, &mut usize, usize)> = vec![
            ("session.max_history", &mut self.session.max_history, 10),
            ("rate_limit.max_requests", &mut self.rate_limit.max_requests, 60),
            ("input.max_query_chars", &mut self.input.max_query_chars, 2000),
            ("retrieval.max_results", &mut self.retrieval.max_results, 20),
        ];
        for (name, val, fallback) in positive_usize {
            if *val == 0 {
                warnings.push(format!("{name} = 0, setting to {fallback}"));
                *val = fallback;
            }
        }

        if self.retrieval.vector_limit > self.retrieval.max_results {
            warnings.push(format!(
                "retrieval.vector_limit ({}) > retrieval.max_results ({}), clamping",
                self.retrieval.vector_limit, self.retrieval.max_results
            ));
            self.retrieval.vector_limit = self.retrieval.max_results;
        }

        for w in &warnings {
            tracing::warn!("config: {}", w);
        }

        warnings
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session.ttl_secs as i64)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.web.request_timeout_secs)
    }
}

fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("parley").join("config.toml"))
}

/// Directory for parley's own state files: `~/.config/parley/`.
pub fn state_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|p| p.join("parley"))
        .ok_or_else(|| ParleyError::Config("cannot determine config directory".to_string()))
}

/// Resolve a secret: check the config field first, then an environment variable.
/// Used by the data API client, the LLM service, and JWT verification.
pub fn resolve_secret(
    value: Option<&str>,
    env_var_override: Option<&str>,
    default_env_var: &str,
    what: &str,
) -> Result<String> {
    if let Some(v) = value {
        if !v.is_empty() {
            return Ok(v.to_string());
        }
    }

    let env_var_name = env_var_override.unwrap_or(default_env_var);

    std::env::var(env_var_name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ParleyError::Config(format!("{what} is not set (configure it or set {env_var_name})")))
}
