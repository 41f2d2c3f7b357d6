use crate::error::{LlmError, Result};
use crate::gemini::GeminiClient;
use crate::types::{GenerateContentRequest, PromptShape};
use std::time::{Duration, Instant};

/// Ordered model list plus the prompt text each family expects.
#[derive(Debug, Clone)]
pub struct ModelChain {
    pub priority_models: Vec<String>,
    pub fallback_model: Option<String>,
    /// Sent as `system_instruction` to priority models.
    pub system_prompt: String,
    /// Prepended to the user text for the fallback model.
    pub fallback_preamble: String,
}

impl ModelChain {
    pub fn len(&self) -> usize {
        self.priority_models.len() + usize::from(self.fallback_model.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub model: String,
    pub text: String,
    /// Backend calls made, including the successful one.
    pub attempts: usize,
}

#[derive(Clone)]
pub struct LlmClient {
    gemini: GeminiClient,
    chain: ModelChain,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_base_url: &str, api_key: &str, request_timeout: Duration, chain: ModelChain) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            gemini: GeminiClient::new(http, api_base_url, api_key, request_timeout),
            chain,
        }
    }

    pub fn chain(&self) -> &ModelChain {
        &self.chain
    }

    /// Generate a reply for `prompt`.
    ///
    /// Priority models are tried in order with the structured prompt shape; the
    /// first non-empty completion wins. If all of them fail the fallback model
    /// gets exactly one attempt with the inline shape.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn generate_reply(&self, prompt: &str) -> Result<Completion> {
        if self.chain.is_empty() {
            return Err(LlmError::InvalidInput("no models configured".to_string()));
        }

        let mut attempts = 0usize;
        let structured = GenerateContentRequest::build(
            PromptShape::SystemInstruction,
            &self.chain.system_prompt,
            prompt,
        );
        for model in &self.chain.priority_models {
            attempts += 1;
            if let Some(completion) = self.attempt(model, &structured, attempts).await {
                return Ok(completion);
            }
        }

        if let Some(model) = self.chain.fallback_model.as_deref() {
            tracing::info!(model = %model, "priority models exhausted; switching to fallback");
            let inline = GenerateContentRequest::build(
                PromptShape::InlinePreamble,
                &self.chain.fallback_preamble,
                prompt,
            );
            attempts += 1;
            if let Some(completion) = self.attempt(model, &inline, attempts).await {
                return Ok(completion);
            }
        }

        Err(LlmError::AllModelsFailed { attempts })
    }

    async fn attempt(
        &self,
        model: &str,
        req: &GenerateContentRequest,
        attempts: usize,
    ) -> Option<Completion> {
        tracing::info!(model = %model, attempt = attempts, "generating");
        let started = Instant::now();
        match self.gemini.generate(model, req).await {
            Ok(text) => {
                tracing::info!(
                    model = %model,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "completion received"
                );
                Some(Completion {
                    model: model.to_string(),
                    text,
                    attempts,
                })
            }
            Err(e) => {
                tracing::warn!(
                    model = %model,
                    %e,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "model attempt failed"
                );
                None
            }
        }
    }
}
