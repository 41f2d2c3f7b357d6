use crate::error::{LlmError, Result};
use crate::types::{GenerateContentRequest, GenerateContentResponse};
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// One `generateContent` call per invocation, bounded by `timeout`.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_base_url: String,
    api_key: String,
    timeout: Duration,
}

impl GeminiClient {
    pub fn new(http: reqwest::Client, api_base_url: &str, api_key: &str, timeout: Duration) -> Self {
        Self {
            http,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{model}:generateContent", self.api_base_url)
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %model))]
    pub async fn generate(&self, model: &str, req: &GenerateContentRequest) -> Result<String> {
        if model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model name is empty".to_string()));
        }
        match tokio::time::timeout(self.timeout, self.generate_unbounded(model, req)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.timeout)),
        }
    }

    async fn generate_unbounded(&self, model: &str, req: &GenerateContentRequest) -> Result<String> {
        let response = self
            .http
            .post(self.endpoint(model))
            .header("x-goog-api-key", self.api_key.as_str())
            .json(req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "generateContent status={status} body={body}"
            )));
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&body)?;
        parsed.into_text()
    }
}
