//! PII masking — replace emails, credentials, and other configured patterns
//! with a fixed placeholder before query text reaches the audit trail.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Configuration for PII masking patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrubConfig {
    /// Mask email addresses (default true)
    #[serde(default = "default_true")]
    pub emails: bool,

    /// Mask API keys, bearer tokens, and JWT-shaped strings (default true)
    #[serde(default = "default_true")]
    pub tokens: bool,

    /// Mask phone numbers (default true)
    #[serde(default = "default_true")]
    pub phone_numbers: bool,

    /// Additional custom regex patterns to mask
    #[serde(default)]
    pub custom_patterns: Vec<String>,

    /// Placeholder written in place of masked content
    #[serde(default = "default_replacement")]
    pub replacement: String,
}

fn default_true() -> bool {
    true
}

fn default_replacement() -> String {
    "[MASKED]".to_string()
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self {
            emails: true,
            tokens: true,
            phone_numbers: true,
            custom_patterns: Vec::new(),
            replacement: default_replacement(),
        }
    }
}

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").unwrap());

static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(?:api[_-]?key|bearer|token|secret|password|passwd|auth)[=:\s]+['"]?[a-zA-Z0-9_\-./+=]{8,}['"]?"#,
    )
    .unwrap()
});

static JWT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\beyJ[a-zA-Z0-9_-]{5,}\.[a-zA-Z0-9_-]{5,}\.[a-zA-Z0-9_-]{5,}\b").unwrap()
});

static SECRET_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:sk|pk|ghp|gho|xox[bp])[-_][a-zA-Z0-9_-]{16,}\b").unwrap());

static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+\d{1,3}[\s.-]?)?\(?\b\d{3}\)?[\s.-]\d{3}[\s.-]\d{4}\b").unwrap()
});

/// Compiled form of [`ScrubConfig`]. Custom patterns are compiled once;
/// invalid ones are logged and skipped.
#[derive(Debug, Clone)]
pub struct Masker {
    config: ScrubConfig,
    custom: Vec<Regex>,
}

impl Masker {
    pub fn new(config: ScrubConfig) -> Self {
        let custom = config
            .custom_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, "scrub: ignoring invalid custom pattern: {e}");
                    None
                }
            })
            .collect();
        Self { config, custom }
    }

    /// Replace every configured PII match in `text` with the placeholder.
    pub fn mask(&self, text: &str) -> String {
        let replacement = self.config.replacement.as_str();
        let mut result = text.to_string();

        if self.config.tokens {
            result = CREDENTIAL_RE.replace_all(&result, replacement).to_string();
            result = JWT_RE.replace_all(&result, replacement).to_string();
            result = SECRET_KEY_RE.replace_all(&result, replacement).to_string();
        }

        if self.config.emails {
            result = EMAIL_RE.replace_all(&result, replacement).to_string();
        }

        if self.config.phone_numbers {
            result = PHONE_RE.replace_all(&result, replacement).to_string();
        }

        for re in &self.custom {
            result = re.replace_all(&result, replacement).to_string();
        }

        result
    }

    /// Number of matches `mask` would replace.
    pub fn count(&self, text: &str) -> usize {
        let mut n = 0;
        if self.config.tokens {
            n += CREDENTIAL_RE.find_iter(text).count();
            n += JWT_RE.find_iter(text).count();
            n += SECRET_KEY_RE.find_iter(text).count();
        }
        if self.config.emails {
            n += EMAIL_RE.find_iter(text).count();
        }
        if self.config.phone_numbers {
            n += PHONE_RE.find_iter(text).count();
        }
        n + self
            .custom
            .iter()
            .map(|re| re.find_iter(text).count())
            .sum::<usize>()
    }
}

impl Default for Masker {
    fn default() -> Self {
        Self::new(ScrubConfig::default())
    }
}
