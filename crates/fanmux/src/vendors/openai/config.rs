use std::time::Duration;

use crate::errors::OrchestratorError;

/// Connection parameters for one OpenAI-compatible backend.
///
/// Several adapters can coexist (one per backend) as long as each is given
/// a distinct provider id.
#[derive(Clone, Debug)]
pub struct OpenAiClientConfig {
    /// Provider id this adapter registers under.
    pub provider_id: String,
    /// API key used for bearer auth.
    pub api_key: String,
    /// Base URL, overridable for proxies and local test servers.
    pub base_url: String,
    /// Model name sent with every request.
    pub model: String,
    /// HTTP timeout for the whole streaming call.
    pub timeout: Duration,
    /// Ask the backend to stream a reasoning summary alongside the answer.
    pub request_reasoning: bool,
}

impl OpenAiClientConfig {
    /// Creates a config with defaults for the hosted OpenAI endpoint.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider_id: "openai".to_string(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com".to_string(),
            model: model.into(),
            timeout: Duration::from_secs(120),
            request_reasoning: false,
        }
    }

    /// Builds a config from `OPENAI_API_KEY` (and `OPENAI_BASE_URL` when set).
    pub fn from_env(model: impl Into<String>) -> Result<Self, OrchestratorError> {
        let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        if api_key.trim().is_empty() {
            return Err(OrchestratorError::Config(
                "missing OPENAI_API_KEY for OpenAI provider".into(),
            ));
        }
        let mut config = Self::new(api_key, model);
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL")
            && !base_url.trim().is_empty()
        {
            config.base_url = base_url;
        }
        Ok(config)
    }

    /// Overrides the provider id (for registering several backends).
    pub fn provider_id(mut self, id: impl Into<String>) -> Self {
        self.provider_id = id.into();
        self
    }

    /// Overrides the base URL.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the HTTP timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Requests a streamed reasoning summary.
    pub fn request_reasoning(mut self, enabled: bool) -> Self {
        self.request_reasoning = enabled;
        self
    }

    pub(crate) fn responses_url(&self) -> String {
        format!("{}/v1/responses", self.base_url.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_url_tolerates_trailing_slash() {
        let config = OpenAiClientConfig::new("k", "m").base_url("http://localhost:8080/");
        assert_eq!(config.responses_url(), "http://localhost:8080/v1/responses");
    }
}
