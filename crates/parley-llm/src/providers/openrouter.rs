use async_trait::async_trait;
use futures::TryStreamExt;
use parley_core::CompletionRequest;
use reqwest::{header, Client};
use tracing::debug;

use crate::error::{LLMError, Result};
use crate::provider::{CompletionProvider, DeltaStream, ProviderConfig};
use crate::sse::delta_stream;
use crate::transformer::OpenAiTransformer;

/// OpenRouter Provider
/// Speaks the OpenAI-compatible chat completions API
pub struct OpenRouterProvider {
    config: ProviderConfig,
    http_client: Client,
    transformer: OpenAiTransformer,
}

impl std::fmt::Debug for OpenRouterProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterProvider")
            .field("provider_id", &self.config.provider_id)
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .finish()
    }
}

impl OpenRouterProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LLMError::Config(e.to_string()))?;

        Ok(Self {
            config,
            http_client,
            transformer: OpenAiTransformer::new(),
        })
    }

    /// Get the config
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Build request headers
    fn build_headers(&self, streaming: bool) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        if streaming {
            headers.insert(
                header::ACCEPT,
                header::HeaderValue::from_static("text/event-stream"),
            );
        }

        if let Some(key) = &self.config.api_key {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| LLMError::Config(format!("Invalid API key header: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        for (key, value) in &self.config.headers {
            let header_name = header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| LLMError::Config(format!("Invalid header name: {}", e)))?;
            let header_value = header::HeaderValue::from_str(value)
                .map_err(|e| LLMError::Config(format!("Invalid header value: {}", e)))?;
            headers.insert(header_name, header_value);
        }

        Ok(headers)
    }

    /// POST the request and reject non-2xx statuses
    async fn send(&self, request: &CompletionRequest, streaming: bool) -> Result<reqwest::Response> {
        let body = self
            .transformer
            .transform_request(request, &self.config.model, streaming);
        let headers = self.build_headers(streaming)?;
        let url = self.config.completions_url();

        debug!(
            url = %url,
            model = body.model,
            messages = body.messages.len(),
            streaming,
            "sending completion request"
        );

        let response = self
            .http_client
            .post(&url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| LLMError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::Api {
                status: status.as_u16(),
                message: error_text,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for OpenRouterProvider {
    fn provider_id(&self) -> &str {
        &self.config.provider_id
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let response = self.send(&request, false).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| LLMError::Network(e.to_string()))?;
        Ok(self.transformer.parse_response(&body)?)
    }

    async fn stream(&self, request: CompletionRequest) -> Result<DeltaStream> {
        let response = self.send(&request, true).await?;
        Ok(delta_stream(response.bytes_stream().map_err(|e| e.to_string())))
    }
}
