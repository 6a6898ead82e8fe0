use std::time::Duration;

use crate::config::{resolve_secret, LlmConfig};
use crate::error::{ParleyError, Result};

/// Text generation over one of the supported chat-completion providers.
/// Used for intent extraction and, optionally, for phrasing query replies.
pub struct LlmService {
    provider: LlmProvider,
    config: LlmConfig,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for LlmService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmService")
            .field("provider", &self.provider)
            .field("model", &self.config.model)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LlmProvider {
    Ollama,
    OpenAI,
    Gemini,
    Anthropic,
}

impl LlmProvider {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            other => Err(ParleyError::Config(format!(
                "unknown LLM provider: '{other}' (expected 'ollama', 'openai', 'gemini', or 'anthropic')"
            ))),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Ollama => "Ollama",
            Self::OpenAI => "OpenAI",
            Self::Gemini => "Gemini",
            Self::Anthropic => "Anthropic",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            Self::Ollama => "http://localhost:11434",
            Self::OpenAI => "https://api.openai.com",
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::Anthropic => "https://api.anthropic.com",
        }
    }

    fn key_env_var(&self) -> Option<&'static str> {
        match self {
            Self::Ollama => None,
            Self::OpenAI => Some("OPENAI_API_KEY"),
            Self::Gemini => Some("GEMINI_API_KEY"),
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
        }
    }
}

impl LlmService {
    /// Build from configuration. Hosted providers fail here when no API key
    /// can be resolved, so misconfiguration surfaces at startup.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let provider = LlmProvider::parse(&config.provider)?;

        let api_key = match provider.key_env_var() {
            Some(default_env) => Some(resolve_secret(
                config.api_key.as_deref(),
                config.env_var.as_deref(),
                default_env,
                &format!("{} LLM provider API key", config.provider),
            )?),
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            provider,
            config: config.clone(),
            api_key,
            client,
        })
    }

    pub fn provider_name(&self) -> &str {
        &self.config.provider
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Generate text from a prompt with an optional system message.
    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        let base_url = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(self.provider.default_base_url())
            .trim_end_matches('/')
            .to_string();
        let key = self.api_key.as_deref().unwrap_or_default();

        let request = match self.provider {
            LlmProvider::Ollama => {
                let mut body = serde_json::json!({
                    "model": self.config.model,
                    "prompt": prompt,
                    "stream": false,
                    "options": { "num_predict": self.config.max_tokens },
                });
                if let Some(sys) = system {
                    body["system"] = serde_json::Value::String(sys.to_string());
                }
                self.client
                    .post(format!("{base_url}/api/generate"))
                    .json(&body)
            }
            LlmProvider::OpenAI => {
                let mut messages = Vec::new();
                if let Some(sys) = system {
                    messages.push(serde_json::json!({"role": "system", "content": sys}));
                }
                messages.push(serde_json::json!({"role": "user", "content": prompt}));
                self.client
                    .post(format!("{base_url}/v1/chat/completions"))
                    .bearer_auth(key)
                    .json(&serde_json::json!({
                        "model": self.config.model,
                        "messages": messages,
                        "max_tokens": self.config.max_tokens,
                    }))
            }
            LlmProvider::Anthropic => {
                let mut body = serde_json::json!({
                    "model": self.config.model,
                    "max_tokens": self.config.max_tokens,
                    "messages": [{"role": "user", "content": prompt}],
                });
                if let Some(sys) = system {
                    body["system"] = serde_json::Value::String(sys.to_string());
                }
                self.client
                    .post(format!("{base_url}/v1/messages"))
                    .header("x-api-key", key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&body)
            }
            LlmProvider::Gemini => {
                let mut body = serde_json::json!({
                    "contents": [{"parts": [{"text": prompt}]}],
                    "generationConfig": { "maxOutputTokens": self.config.max_tokens },
                });
                if let Some(sys) = system {
                    body["systemInstruction"] = serde_json::json!({"parts": [{"text": sys}]});
                }
                self.client
                    .post(format!(
                        "{base_url}/v1beta/models/{}:generateContent?key={key}",
                        self.config.model
                    ))
                    .json(&body)
            }
        };

        let label = self.provider.label();
        let resp = request
            .send()
            .await
            .map_err(|e| ParleyError::Llm(format!("{label} request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ParleyError::Llm(format!("{label} error {status}: {text}")));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ParleyError::Llm(format!("{label} response parse error: {e}")))?;

        extract_text(self.provider, &json)
            .ok_or_else(|| ParleyError::Llm(format!("{label} response missing text content")))
    }
}

fn extract_text(provider: LlmProvider, json: &serde_json::Value) -> Option<String> {
    let text = match provider {
        LlmProvider::Ollama => json["response"].as_str(),
        LlmProvider::OpenAI => json["choices"][0]["message"]["content"].as_str(),
        LlmProvider::Anthropic => json["content"][0]["text"].as_str(),
        LlmProvider::Gemini => json["candidates"][0]["content"]["parts"][0]["text"].as_str(),
    };
    text.map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_ollama_needs_no_key() {
        let config = LlmConfig {
            enabled: true,
            provider: "ollama".into(),
            ..Default::default()
        };
        let service = LlmService::from_config(&config).unwrap();
        assert_eq!(service.provider_name(), "ollama");
        assert_eq!(service.model(), "llama3.2");
    }

    #[test]
    fn test_from_config_unknown_provider() {
        let config = LlmConfig {
            provider: "banana".into(),
            ..Default::default()
        };
        let err = LlmService::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("unknown LLM provider"));
    }

    #[test]
    fn test_from_config_hosted_without_key_errors() {
        let config = LlmConfig {
            provider: "anthropic".into(),
            api_key: None,
            env_var: Some("PARLEY_TEST_UNSET_LLM_KEY".into()),
            ..Default::default()
        };
        let err = LlmService::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("PARLEY_TEST_UNSET_LLM_KEY"));
    }

    #[test]
    fn test_from_config_claude_alias_with_key() {
        let config = LlmConfig {
            provider: "claude".into(),
            api_key: Some("sk-ant-test".into()),
            ..Default::default()
        };
        assert!(LlmService::from_config(&config).is_ok());
    }

    #[test]
    fn test_extract_text_shapes() {
        let ollama = serde_json::json!({"response": "hi"});
        assert_eq!(extract_text(LlmProvider::Ollama, &ollama).as_deref(), Some("hi"));

        let openai = serde_json::json!({"choices": [{"message": {"content": "yo"}}]});
        assert_eq!(extract_text(LlmProvider::OpenAI, &openai).as_deref(), Some("yo"));

        let anthropic = serde_json::json!({"content": [{"type": "text", "text": "hey"}]});
        assert_eq!(
            extract_text(LlmProvider::Anthropic, &anthropic).as_deref(),
            Some("hey")
        );

        assert!(extract_text(LlmProvider::Gemini, &serde_json::json!({})).is_none());
    }
}
