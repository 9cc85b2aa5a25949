//! BigQuery REST client: `tabledata.insertAll` for rows and `jobs.query`
//! for DDL.

use std::time::Duration;

use async_trait::async_trait;
use schema::{FailedRow, InsertOutcome, RowError, RowRecord};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, instrument, warn};

use crate::{
    AccessTokenCache, TableRef, TokenSource, WarehouseClient, WarehouseError,
    map_transport_error,
};

pub const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const INSERT_ALL_KIND: &str = "bigquery#tableDataInsertAllRequest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigQueryConfig {
    pub endpoint: String,
    pub timeout: Duration,
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Owns the HTTP connection pool and the token cache. Build one per process
/// and share it behind an `Arc`.
#[derive(Debug)]
pub struct BigQueryClient {
    endpoint: String,
    http: reqwest::Client,
    tokens: AccessTokenCache,
}

impl BigQueryClient {
    pub fn new(config: BigQueryConfig, token_source: TokenSource) -> Result<Self, WarehouseError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|err| WarehouseError::Connection(err.to_string()))?;
        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            http,
            tokens: AccessTokenCache::new(token_source),
        })
    }

    fn insert_all_url(&self, table: &TableRef) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/datasets/{}/tables/{}/insertAll",
            self.endpoint, table.project_id, table.dataset_id, table.table_id
        )
    }

    fn query_url(&self, project_id: &str) -> String {
        format!("{}/bigquery/v2/projects/{project_id}/queries", self.endpoint)
    }

    async fn post_json<B, R>(&self, url: &str, body: &B) -> Result<R, WarehouseError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let token = self.tokens.bearer(&self.http).await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error_status(status.as_u16(), &body));
        }
        response
            .json()
            .await
            .map_err(|err| WarehouseError::Serialization(err.to_string()))
    }
}

#[async_trait]
impl WarehouseClient for BigQueryClient {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    #[instrument(skip(self, rows), fields(table = %table.qualified_name(), rows = rows.len()))]
    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: &[RowRecord],
    ) -> Result<InsertOutcome, WarehouseError> {
        let request = InsertAllRequest {
            kind: INSERT_ALL_KIND,
            rows: rows.iter().map(|json| InsertAllRow { json }).collect(),
        };
        let response: InsertAllResponse =
            self.post_json(&self.insert_all_url(table), &request).await?;
        let outcome = response.into_outcome();
        if outcome.is_successful() {
            debug!("rows streamed");
        } else {
            warn!(failed_rows = outcome.failed_rows().len(), "insertAll rejected rows");
        }
        Ok(outcome)
    }

    #[instrument(skip(self, sql))]
    async fn execute_query(&self, project_id: &str, sql: &str) -> Result<(), WarehouseError> {
        let request = QueryRequest {
            query: sql,
            use_legacy_sql: false,
        };
        let response: QueryResponse = self.post_json(&self.query_url(project_id), &request).await?;
        if response.job_complete == Some(false) {
            debug!("query accepted, job still running");
        }
        Ok(())
    }
}

fn classify_error_status(status: u16, body: &str) -> WarehouseError {
    let message = serde_json::from_str::<GoogleErrorEnvelope>(body)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| body.to_string());
    match status {
        401 | 403 => WarehouseError::Authentication(message),
        429 => WarehouseError::RateLimited,
        status => WarehouseError::Service { status, message },
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct InsertAllRequest<'a> {
    kind: &'static str,
    rows: Vec<InsertAllRow<'a>>,
}

#[derive(Debug, Serialize)]
struct InsertAllRow<'a> {
    json: &'a RowRecord,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<InsertErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct InsertErrorEntry {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

impl InsertAllResponse {
    fn into_outcome(self) -> InsertOutcome {
        if self.insert_errors.is_empty() {
            return InsertOutcome::success();
        }
        InsertOutcome::with_failures(
            self.insert_errors
                .into_iter()
                .map(|entry| FailedRow {
                    index: entry.index,
                    errors: entry
                        .errors
                        .into_iter()
                        .map(|error| RowError::new(error.reason, error.message))
                        .collect(),
                })
                .collect(),
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorEnvelope {
    error: GoogleError,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    #[serde(default)]
    message: String,
}
