use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Where and how to reach one OpenAI-compatible chat model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEndpoint {
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Language model gateway. Implementations may fail or hang; callers bound
/// every call with their own timeout.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, endpoint: &ModelEndpoint, messages: Vec<Message>) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Clone)]
pub struct LlmClient {
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn complete(&self, endpoint: &ModelEndpoint, messages: Vec<Message>) -> Result<String> {
        let url = format!("{}/chat/completions", endpoint.api_url.trim_end_matches('/'));

        let request = ChatCompletionRequest {
            model: endpoint.model.clone(),
            messages,
            temperature: Some(0.8),
            max_tokens: Some(endpoint.max_tokens),
        };

        let mut req = self.client.post(&url).json(&request);

        // Local models usually run without a key
        if let Some(key) = endpoint.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))
    }
}

/// Parses JSON out of a model reply, tolerating `<think>` preambles and
/// markdown fences around the payload.
pub fn parse_json_reply<T>(response: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    if let Ok(parsed) = serde_json::from_str::<T>(response) {
        return Ok(parsed);
    }

    let cleaned = match response.rfind("</think>") {
        Some(think_end) => &response[think_end + 8..],
        None => response,
    };

    if let Ok(parsed) = serde_json::from_str::<T>(cleaned.trim()) {
        return Ok(parsed);
    }

    let json_content = if let Some(start) = cleaned.find("```json") {
        let after_start = &cleaned[start + 7..];
        match after_start.find("```") {
            Some(end) => after_start[..end].trim(),
            None => cleaned,
        }
    } else {
        outermost_json(cleaned).unwrap_or(cleaned)
    };

    serde_json::from_str::<T>(json_content.trim()).with_context(|| {
        format!(
            "Failed to parse JSON. Extracted: {} | Original: {}",
            json_content,
            response.chars().take(500).collect::<String>()
        )
    })
}

/// Widest `[...]` or `{...}` span, whichever opens first.
fn outermost_json(text: &str) -> Option<&str> {
    let open = text.find(['[', '{'])?;
    let close_char = if text[open..].starts_with('[') { ']' } else { '}' };
    let close = text.rfind(close_char)?;
    (close > open).then(|| &text[open..=close])
}
