use std::env;
use std::fs;

use anyhow::{anyhow, Context, Result};

/// Default persona shipped with the binary. Operators can swap tone without a
/// rebuild via `BANCADA_PERSONA_FILE`.
const DEFAULT_PERSONA: &str = include_str!("../prompts/persona.txt");

#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub endpoint: String,
    pub api_key: String,
    pub api_version: String,
    pub model: String,
    pub max_completion_tokens: u32,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub account: String,
    pub key: String,
    /// Override for tests / emulators. Defaults to the public table endpoint
    /// derived from the account name.
    pub table_endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub completion: CompletionConfig,
    /// `None` when either storage credential is absent: persistence is then a
    /// silent no-op and the recent listing is always empty.
    pub storage: Option<StorageConfig>,
    pub persona: String,
    pub max_request_bytes: Option<usize>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let endpoint = env::var("AZURE_OPENAI_ENDPOINT")
            .map_err(|_| anyhow!("AZURE_OPENAI_ENDPOINT must be set"))?
            .trim_end_matches('/')
            .to_string();
        let api_key = env::var("AZURE_OPENAI_API_KEY")
            .map_err(|_| anyhow!("AZURE_OPENAI_API_KEY must be set"))?;

        let completion = CompletionConfig {
            endpoint,
            api_key,
            api_version: env::var("AZURE_OPENAI_API_VERSION")
                .unwrap_or_else(|_| "2025-01-01-preview".to_string()),
            model: env::var("AZURE_OPENAI_MODEL_NAME").unwrap_or_else(|_| "gpt-5-mini".to_string()),
            max_completion_tokens: parse_optional_u64("BANCADA_MAX_COMPLETION_TOKENS")?
                .unwrap_or(1000) as u32,
            timeout_ms: parse_optional_u64("BANCADA_UPSTREAM_TIMEOUT_MS")?.unwrap_or(30_000),
        };

        // Persistence is opt-in: both credentials must be present.
        let storage = match (
            non_empty_var("AZURE_STORAGE_ACCOUNT"),
            non_empty_var("AZURE_STORAGE_KEY"),
        ) {
            (Some(account), Some(key)) => Some(StorageConfig {
                account,
                key,
                table_endpoint: non_empty_var("AZURE_STORAGE_TABLE_ENDPOINT"),
            }),
            _ => None,
        };

        let persona = match env::var("BANCADA_PERSONA_FILE") {
            Ok(path) => fs::read_to_string(&path)
                .with_context(|| format!("Failed to read BANCADA_PERSONA_FILE '{}'", path))?,
            Err(_) => DEFAULT_PERSONA.to_string(),
        };

        let max_request_bytes = parse_optional_u64("BANCADA_MAX_REQUEST_BYTES")?.map(|v| v as usize);

        Ok(Self {
            completion,
            storage,
            persona,
            max_request_bytes,
        })
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}
