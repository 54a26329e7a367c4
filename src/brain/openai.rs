use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, error, info};

use super::{ModelClient, Prompt, classify_http_error};
use crate::config::ModelSettings;
use crate::error::ReasoningError;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const NAME: &str = "openai";

/// Fallback model endpoint: any OpenAI-compatible `/chat/completions` API.
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    temperature: f32,
}

impl OpenAiClient {
    pub fn new(api_key: &str, api_base: Option<&str>, models: &ModelSettings) -> Self {
        let client = Client::builder()
            .timeout(models.request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_key: api_key.to_string(),
            api_base: api_base
                .unwrap_or(OPENAI_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            model: models.fallback_model.clone(),
            temperature: models.temperature,
        }
    }

    fn request_body(&self, prompt: &Prompt) -> Value {
        json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user},
            ],
            "temperature": self.temperature,
            "response_format": {"type": "json_object"},
        })
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn name(&self) -> &str {
        NAME
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, ReasoningError> {
        info!(model = %self.model, prompt_len = prompt.user.len(), "Calling chat completions API");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|e| ReasoningError::transient(NAME, format!("request failed: {e}")))?;

        let status = response.status();
        let raw_body = response
            .text()
            .await
            .map_err(|e| ReasoningError::transient(NAME, format!("reading body failed: {e}")))?;

        if !status.is_success() {
            error!(status = %status, body = %raw_body, "Chat completions API error");
            return Err(classify_http_error(NAME, status.as_u16(), &raw_body));
        }

        debug!(body_len = raw_body.len(), "Chat completions raw response");
        extract_content(&raw_body)
    }
}

fn extract_content(raw_body: &str) -> Result<String, ReasoningError> {
    let json_resp: Value = serde_json::from_str(raw_body)
        .map_err(|e| ReasoningError::transient(NAME, format!("unreadable response: {e}")))?;

    let content = json_resp["choices"][0]["message"]["content"]
        .as_str()
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| {
            let finish = json_resp["choices"][0]["finish_reason"]
                .as_str()
                .unwrap_or("unknown");
            ReasoningError::transient(NAME, format!("no content in response (finish reason {finish})"))
        })?;
    Ok(content.to_string())
}
