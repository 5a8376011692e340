//! Client for the hosted chat-completion deployment. One request per
//! generation, bounded timeout, no retry: the handler maps any failure to a
//! generic 500 while the upstream detail stays in the server log.

use serde::{Deserialize, Serialize};

use crate::config::CompletionConfig;
use crate::prompt::ChatMessage;

/// Returned in place of a structurally missing candidate. The original service
/// answered 200 with this text rather than failing, and callers rely on that.
pub const ANALYSIS_UNAVAILABLE: &str = "Não foi possível gerar análise.";

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("completion endpoint returned {status}")]
    Status { status: u16, body: String },
    #[error("completion request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    messages: &'a [ChatMessage],
    max_completion_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Clone)]
pub struct CompletionClient {
    url: String,
    api_key: String,
    max_completion_tokens: u32,
    client: reqwest::Client,
}

impl CompletionClient {
    pub fn new(cfg: &CompletionConfig) -> Self {
        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            cfg.endpoint, cfg.model, cfg.api_version
        );
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url,
            api_key: cfg.api_key.clone(),
            max_completion_tokens: cfg.max_completion_tokens,
            client,
        }
    }

    /// Perform the single upstream request and return the first candidate's
    /// text. A success response without a usable candidate degrades to the
    /// fixed placeholder instead of erroring.
    pub async fn generate(&self, messages: &[ChatMessage]) -> Result<String, CompletionError> {
        let body = CompletionRequest {
            messages,
            max_completion_tokens: self.max_completion_tokens,
        };
        let resp = self
            .client
            .post(&self.url)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CompletionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CompletionResponse = resp.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| ANALYSIS_UNAVAILABLE.to_string());
        Ok(content)
    }
}
