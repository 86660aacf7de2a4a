//! OpenAI-compatible LLM Provider
//!
//! Implementation of `LlmProvider` for any server speaking the `OpenAI`
//! chat completions dialect: the `OpenAI` API itself, NVIDIA NIM, `DeepSeek`,
//! Ollama's `/v1` endpoint and similar gateways.

use std::time::Duration;

use agentloop_core::provider::EventStream;
use agentloop_core::stream::collect;
use agentloop_core::{AgentError, CallContext, ChatRequest, ChatResponse, LlmProvider, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use crate::capabilities::ProviderCapabilities;
use crate::convert::{decode_response, encode_request, postprocess};
use crate::protocol::{WireErrorResponse, WireRequest, WireResponse};
use crate::sse::decode_sse;

/// Default `OpenAI` API base URL
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible provider configuration
#[derive(Clone, Debug, Deserialize)]
pub struct OpenAiConfig {
    /// Name used in logs and metrics
    #[serde(default = "default_name")]
    pub name: String,

    /// API base URL, up to and including the version segment.
    /// Defaults to the `OpenAI` API.
    #[serde(default)]
    pub base_url: Option<Url>,

    /// Bearer token; omitted for local servers
    #[serde(default)]
    pub api_key: Option<SecretString>,

    /// Overrides the capabilities derived from `base_url`
    #[serde(default)]
    pub capabilities: Option<ProviderCapabilities>,

    /// HTTP connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_name() -> String {
    "openai".into()
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            base_url: None,
            api_key: None,
            capabilities: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl OpenAiConfig {
    /// Configuration for a base URL, e.g. `http://localhost:11434/v1`
    pub fn with_base_url(base_url: Url) -> Self {
        Self {
            base_url: Some(base_url),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(key.into()));
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }
}

/// OpenAI-compatible provider
pub struct OpenAiProvider {
    name: String,
    client: Client,
    base_url: Url,
    api_key: Option<SecretString>,
    capabilities: ProviderCapabilities,
}

impl OpenAiProvider {
    /// Create a provider from configuration
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Config` if the HTTP client cannot be built.
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let base_url = match config.base_url {
            Some(url) => url,
            None => Url::parse(DEFAULT_BASE_URL)
                .map_err(|e| AgentError::Config(format!("invalid default base URL: {e}")))?,
        };

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {e}")))?;

        let capabilities = config
            .capabilities
            .unwrap_or_else(|| ProviderCapabilities::from_base_url(&base_url));

        tracing::debug!(
            provider = %config.name,
            base_url = %base_url,
            ?capabilities,
            "provider configured"
        );

        Ok(Self {
            name: config.name,
            client,
            base_url,
            api_key: config.api_key,
            capabilities,
        })
    }

    /// Dialect features this endpoint is treated as supporting
    pub const fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    /// Stream a completion and fold it into a response.
    ///
    /// Applies the same reasoning and tool-call recovery as [`LlmProvider::send`].
    pub async fn send_streaming(&self, ctx: &CallContext, request: &ChatRequest) -> Result<ChatResponse> {
        let stream = self.start_stream(ctx, request).await?;
        let response = collect(stream).await?;
        Ok(postprocess(response, &self.capabilities, &request.tools))
    }

    /// Build the chat completions URL
    fn completions_url(&self) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        format!("{base}/chat/completions")
    }

    /// POST the body; non-2xx statuses become transport errors
    async fn post(&self, ctx: &CallContext, body: &WireRequest) -> Result<reqwest::Response> {
        let mut builder = self.client.post(self.completions_url()).json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = ctx
            .run(async {
                builder.send().await.map_err(|e| {
                    tracing::error!(provider = %self.name, error = %e, "upstream request failed");
                    AgentError::transport(e.to_string())
                })
            })
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<WireErrorResponse>(&text)
            .map_or(text, |body| body.error.message);
        tracing::warn!(provider = %self.name, status = %status, "upstream returned error");
        Err(AgentError::http_status(status.as_u16(), message))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, ctx: &CallContext, request: &ChatRequest) -> Result<ChatResponse> {
        let body = encode_request(request, &self.capabilities, false)?;
        let response = self.post(ctx, &body).await?;

        let bytes = ctx
            .run(async {
                response
                    .bytes()
                    .await
                    .map_err(|e| AgentError::transport(format!("failed to read response: {e}")))
            })
            .await?;
        if bytes.is_empty() {
            return Err(AgentError::MalformedResponse("empty response body".into()));
        }

        let wire: WireResponse = serde_json::from_slice(&bytes)
            .map_err(|e| AgentError::MalformedResponse(format!("failed to parse response: {e}")))?;
        decode_response(wire, &self.capabilities, &request.tools)
    }

    async fn start_stream(&self, ctx: &CallContext, request: &ChatRequest) -> Result<EventStream> {
        let body = encode_request(request, &self.capabilities, true)?;
        let response = self.post(ctx, &body).await?;

        Ok(decode_sse(response.bytes_stream(), ctx.token().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_json() {
        let config: OpenAiConfig =
            serde_json::from_str(r#"{"base_url": "http://localhost:11434/v1/", "api_key": "sk-test"}"#).unwrap();
        assert_eq!(config.name, "openai");
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.api_key.as_ref().map(|k| k.expose_secret()), Some("sk-test"));

        let provider = OpenAiProvider::new(config).unwrap();
        assert_eq!(provider.completions_url(), "http://localhost:11434/v1/chat/completions");
        assert!(provider.capabilities().text_tool_calls);
    }

    #[test]
    fn test_capability_override() {
        let config = OpenAiConfig::with_base_url(Url::parse("https://api.openai.com/v1").unwrap())
            .capabilities(ProviderCapabilities::default());
        let provider = OpenAiProvider::new(config).unwrap();
        assert!(!provider.capabilities().json_schema);
    }

    #[test]
    fn test_api_key_is_redacted() {
        let config = OpenAiConfig::default().api_key("sk-secret");
        assert!(!format!("{config:?}").contains("sk-secret"));
    }
}
