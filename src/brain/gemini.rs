use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info};

use super::{ModelClient, Prompt, classify_http_error};
use crate::config::ModelSettings;
use crate::error::ReasoningError;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const NAME: &str = "gemini";

/// Primary model endpoint: Google Generative Language `generateContent` with JSON output.
pub struct GeminiClient {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    temperature: f32,
}

impl GeminiClient {
    pub fn new(api_key: &str, api_base: Option<&str>, models: &ModelSettings) -> Self {
        let client = Client::builder()
            .timeout(models.request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_key: api_key.to_string(),
            api_base: api_base
                .unwrap_or(GEMINI_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            model: models.primary_model.clone(),
            temperature: models.temperature,
        }
    }

    /// Config may say "gemini/gemini-2.0-flash"; the API expects the bare model name.
    fn normalize_model(model: &str) -> &str {
        model.strip_prefix("gemini/").unwrap_or(model)
    }

    fn request_body(&self, prompt: &Prompt) -> serde_json::Value {
        json!({
            "systemInstruction": { "parts": [{ "text": prompt.system }] },
            "contents": [{ "role": "user", "parts": [{ "text": prompt.user }] }],
            "generationConfig": {
                "temperature": self.temperature,
                "responseMimeType": "application/json",
            }
        })
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    fn name(&self) -> &str {
        NAME
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, ReasoningError> {
        let model = Self::normalize_model(&self.model);
        let url = format!("{}/models/{}:generateContent", self.api_base, model);

        info!(model = %model, prompt_len = prompt.user.len(), "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
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
            error!(status = %status, body = %raw_body, "Gemini API error");
            return Err(classify_http_error(NAME, status.as_u16(), &raw_body));
        }

        debug!(body_len = raw_body.len(), "Gemini raw response");
        extract_text(&raw_body)
    }
}

fn extract_text(raw_body: &str) -> Result<String, ReasoningError> {
    let resp: GeminiResponse = serde_json::from_str(raw_body).map_err(|e| {
        ReasoningError::transient(
            NAME,
            format!(
                "unreadable response: {e}. Body: {}",
                raw_body.chars().take(300).collect::<String>()
            ),
        )
    })?;

    if let Some(reason) = resp.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ReasoningError::permanent(
            NAME,
            format!("prompt blocked: {reason}"),
        ));
    }

    let candidate = resp
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| ReasoningError::transient(NAME, "no candidates in response"))?;

    let text: Vec<String> = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.is_empty() {
        return Err(ReasoningError::transient(
            NAME,
            format!(
                "empty candidate (finish reason {})",
                candidate.finish_reason.as_deref().unwrap_or("unknown")
            ),
        ));
    }
    Ok(text.join("\n"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}
