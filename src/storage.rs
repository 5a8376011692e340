//! Best-effort archive of generated analyses in an Azure Storage table,
//! spoken over the table service REST contract with `SharedKeyLite`
//! authorization. Missing credentials produce the disabled variant: writes
//! become no-ops and reads yield an empty list, never an error.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::config::StorageConfig;

const TABLE: &str = "analyses";
const PARTITION: &str = "analysis";
const STORAGE_API_VERSION: &str = "2019-02-02";

/// RowKeys count down from this constant so ascending lexicographic order is
/// reverse-chronological. 13 digits covers epoch milliseconds until the year
/// 2286.
const ROW_KEY_BASE: i64 = 9_999_999_999_999;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    pub event: String,
    pub analysis: String,
    pub created_at: String,
}

#[derive(Debug, thiserror::Error)]
enum StorageError {
    #[error("table service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("table request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

struct TableClient {
    account: String,
    key: Vec<u8>,
    endpoint: String,
    client: reqwest::Client,
}

/// Write-once archive handle shared by the handlers. Constructed exactly once
/// at startup; read-only afterwards.
#[derive(Clone)]
pub struct Archive {
    inner: Option<std::sync::Arc<TableClient>>,
}

impl Archive {
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn from_config(cfg: Option<&StorageConfig>) -> Self {
        let Some(cfg) = cfg else {
            tracing::info!("archive disabled: storage credentials not configured");
            return Self::disabled();
        };
        let key = match BASE64.decode(cfg.key.as_bytes()) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(error=%err, "archive disabled: storage key is not valid base64");
                return Self::disabled();
            }
        };
        let endpoint = cfg
            .table_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.table.core.windows.net", cfg.account))
            .trim_end_matches('/')
            .to_string();
        Self {
            inner: Some(std::sync::Arc::new(TableClient {
                account: cfg.account.clone(),
                key,
                endpoint,
                client: reqwest::Client::new(),
            })),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Persist one (event, analysis) pair. Never reports failure: any error is
    /// logged and swallowed so storage health cannot leak into the response
    /// path. Callers spawn this without awaiting the outcome.
    pub async fn record(&self, event: &str, analysis: &str) {
        let Some(table) = &self.inner else {
            return;
        };
        if let Err(err) = table.insert(event, analysis).await {
            tracing::warn!(error=%err, "failed to archive analysis");
        }
    }

    /// Fetch up to `limit` most recent records, newest first. Any failure or
    /// the disabled state yields an empty list.
    pub async fn recent(&self, limit: usize) -> Vec<AnalysisRecord> {
        let Some(table) = &self.inner else {
            return Vec::new();
        };
        match table.query_recent(limit).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error=%err, "failed to list recent analyses");
                Vec::new()
            }
        }
    }
}

impl TableClient {
    async fn insert(&self, event: &str, analysis: &str) -> Result<(), StorageError> {
        let now = Utc::now();
        let entity = serde_json::json!({
            "PartitionKey": PARTITION,
            "RowKey": reverse_row_key(now.timestamp_millis()),
            "event": event,
            "analysis": analysis,
            "createdAt": now.to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        let url = format!("{}/{}", self.endpoint, TABLE);
        let resource = format!("/{}/{}", self.account, TABLE);
        let date = http_date();
        let resp = self
            .client
            .post(&url)
            .header("x-ms-date", &date)
            .header("x-ms-version", STORAGE_API_VERSION)
            .header("Authorization", self.authorization(&date, &resource))
            .header("Accept", "application/json;odata=nometadata")
            .json(&entity)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn query_recent(&self, limit: usize) -> Result<Vec<AnalysisRecord>, StorageError> {
        // RowKeys are reverse-chronological, so the table's native ascending
        // order already yields newest first.
        let url = format!(
            "{}/{}()?$filter=PartitionKey%20eq%20'{}'&$top={}",
            self.endpoint, TABLE, PARTITION, limit
        );
        let resource = format!("/{}/{}()", self.account, TABLE);
        let date = http_date();
        let resp = self
            .client
            .get(&url)
            .header("x-ms-date", &date)
            .header("x-ms-version", STORAGE_API_VERSION)
            .header("Authorization", self.authorization(&date, &resource))
            .header("Accept", "application/json;odata=nometadata")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let page: EntityPage = resp.json().await?;
        Ok(page.value.into_iter().take(limit).collect())
    }

    fn authorization(&self, date: &str, canonical_resource: &str) -> String {
        let string_to_sign = format!("{}\n{}", date, canonical_resource);
        let key = hmac::Key::new(hmac::HMAC_SHA256, &self.key);
        let tag = hmac::sign(&key, string_to_sign.as_bytes());
        format!(
            "SharedKeyLite {}:{}",
            self.account,
            BASE64.encode(tag.as_ref())
        )
    }
}

#[derive(Deserialize)]
struct EntityPage {
    #[serde(default)]
    value: Vec<AnalysisRecord>,
}

fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn reverse_row_key(millis: i64) -> String {
    format!("{:013}", ROW_KEY_BASE - millis)
}
