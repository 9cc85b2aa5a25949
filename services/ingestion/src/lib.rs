pub mod api;
pub mod transport;
pub mod transport_axum;

use chrono::{DateTime, Utc};
use schema::{IngestEnvelope, OK_MESSAGE, ScanReport, build_rows};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use warehouse::{TableRef, WarehouseClient, WarehouseError, latest_scan_view_sql};

use crate::api::ScanReportPayload;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("could not parse body: {0}")]
    Parse(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("warehouse insert failed: {0}")]
    Warehouse(#[source] WarehouseError),

    #[error("latest scan view refresh failed: {0}")]
    ViewRefresh(#[source] WarehouseError),
}

impl IngestError {
    /// Faults caused by the request itself; nothing was sent to the warehouse.
    pub fn is_client_fault(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::MissingField(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestViewRefresh {
    pub view_id: String,
    /// Fail the request when the refresh statement fails. When false the
    /// failure is logged and the insert result is returned unchanged.
    pub strict: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSettings {
    pub table: TableRef,
    pub latest_view: Option<LatestViewRefresh>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewRefreshResult {
    Skipped,
    Refreshed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub envelope: IngestEnvelope,
    pub rows_submitted: usize,
    pub view_refresh: ViewRefreshResult,
}

/// Decodes a request body. A zero-length body is an empty report; any other
/// body must be a JSON object.
pub fn parse_scan_report(body: &[u8]) -> Result<ScanReport, IngestError> {
    if body.is_empty() {
        return Ok(ScanReport::default());
    }
    let text = std::str::from_utf8(body).map_err(|err| IngestError::Parse(err.to_string()))?;
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|err| IngestError::Parse(err.to_string()))?;
    if !value.is_object() {
        return Err(IngestError::Parse(format!(
            "expected a JSON object, found {}",
            json_kind(&value)
        )));
    }
    let payload: ScanReportPayload =
        serde_json::from_value(value).map_err(|err| IngestError::Parse(err.to_string()))?;
    payload.into_report()
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Streams one report into the configured table and, when configured,
/// republishes the latest-scan view. `now` is read once by the caller so all
/// rows share it.
#[instrument(skip_all, fields(scanner_id = %report.scanner_id, addresses = report.mac_addresses.len()))]
pub async fn ingest_scan_report(
    client: &dyn WarehouseClient,
    settings: &IngestSettings,
    report: &ScanReport,
    now: DateTime<Utc>,
) -> Result<IngestSummary, IngestError> {
    let rows = build_rows(report, now);
    if rows.is_empty() {
        debug!("scan report carries no addresses, insert and view refresh skipped");
        return Ok(IngestSummary {
            envelope: IngestEnvelope::ok(OK_MESSAGE),
            rows_submitted: 0,
            view_refresh: ViewRefreshResult::Skipped,
        });
    }

    let outcome = client
        .insert_rows(&settings.table, &rows)
        .await
        .map_err(IngestError::Warehouse)?;
    if outcome.is_successful() {
        info!(
            backend = client.name(),
            table = %settings.table.qualified_name(),
            rows = rows.len(),
            "scan streamed"
        );
    } else {
        warn!(
            backend = client.name(),
            table = %settings.table.qualified_name(),
            failed_rows = outcome.failed_rows().len(),
            "scan rows rejected"
        );
    }

    let view_refresh = refresh_latest_view(client, settings).await?;
    Ok(IngestSummary {
        envelope: IngestEnvelope::from_outcome(&outcome),
        rows_submitted: rows.len(),
        view_refresh,
    })
}

async fn refresh_latest_view(
    client: &dyn WarehouseClient,
    settings: &IngestSettings,
) -> Result<ViewRefreshResult, IngestError> {
    let Some(view) = settings.latest_view.as_ref() else {
        return Ok(ViewRefreshResult::Skipped);
    };
    let sql = latest_scan_view_sql(&settings.table, &view.view_id);
    match client.execute_query(&settings.table.project_id, &sql).await {
        Ok(()) => {
            debug!(view = %view.view_id, "latest scan view refreshed");
            Ok(ViewRefreshResult::Refreshed)
        }
        Err(err) if view.strict => Err(IngestError::ViewRefresh(err)),
        Err(err) => {
            warn!(view = %view.view_id, error = %err, "latest scan view refresh failed");
            Ok(ViewRefreshResult::Failed)
        }
    }
}

/// Full request pass: parse, build rows, insert, optional view refresh.
pub async fn handle(
    client: &dyn WarehouseClient,
    settings: &IngestSettings,
    body: &[u8],
) -> Result<IngestSummary, IngestError> {
    let report = parse_scan_report(body)?;
    ingest_scan_report(client, settings, &report, Utc::now()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use schema::{EnvelopeStatus, FailedRow, RowError};
    use warehouse::InMemoryWarehouse;

    fn settings() -> IngestSettings {
        IngestSettings {
            table: TableRef::new("proj", "macscan", "scans"),
            latest_view: None,
        }
    }

    fn settings_with_view(strict: bool) -> IngestSettings {
        IngestSettings {
            latest_view: Some(LatestViewRefresh {
                view_id: "scans_latest".into(),
                strict,
            }),
            ..settings()
        }
    }

    const SAMPLE_BODY: &str = r#"{
        "scannerId": "scanner-lab-1",
        "scanTime": "2024-05-01 08:15:00",
        "macAddresses": ["aa:bb:cc:00:00:01", "aa:bb:cc:00:00:02", "aa:bb:cc:00:00:03"]
    }"#;

    #[test]
    fn parse_scan_report_reads_all_fields() {
        let report = parse_scan_report(SAMPLE_BODY.as_bytes()).unwrap();
        assert_eq!(report.scanner_id, "scanner-lab-1");
        assert_eq!(report.scan_time, "2024-05-01 08:15:00");
        assert_eq!(report.mac_addresses.len(), 3);
    }

    #[test]
    fn parse_scan_report_treats_empty_body_as_empty_report() {
        assert_eq!(parse_scan_report(b"").unwrap(), ScanReport::default());
    }

    #[test]
    fn parse_scan_report_rejects_whitespace_only_body() {
        let err = parse_scan_report(b"   \n").unwrap_err();
        assert!(matches!(err, IngestError::Parse(ref message) if message.contains("EOF")));
    }

    #[test]
    fn parse_scan_report_rejects_malformed_json_with_diagnostic() {
        let err = parse_scan_report(b"{not valid").unwrap_err();
        assert!(matches!(err, IngestError::Parse(_)));
        assert!(err.to_string().starts_with("could not parse body: "));
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn parse_scan_report_rejects_non_object_payload() {
        let err = parse_scan_report(br#"["s1","t1",["m1"]]"#).unwrap_err();
        assert!(matches!(err, IngestError::Parse(ref message) if message.contains("an array")));
    }

    #[test]
    fn parse_scan_report_rejects_wrongly_typed_field() {
        let err = parse_scan_report(br#"{"scannerId":"s1","scanTime":"t1","macAddresses":"m1"}"#)
            .unwrap_err();
        assert!(matches!(err, IngestError::Parse(_)));
    }

    #[test]
    fn parse_scan_report_names_first_missing_field() {
        let err = parse_scan_report(br#"{"scanTime":"t1"}"#).unwrap_err();
        assert!(matches!(err, IngestError::MissingField("scannerId")));

        let err = parse_scan_report(br#"{"scannerId":"s1","scanTime":"t1"}"#).unwrap_err();
        assert!(matches!(err, IngestError::MissingField("macAddresses")));
        assert!(err.is_client_fault());

        let err = parse_scan_report(br#"{"scannerId":"s1","scanTime":null,"macAddresses":[]}"#)
            .unwrap_err();
        assert!(matches!(err, IngestError::MissingField("scanTime")));
    }

    #[tokio::test]
    async fn handle_submits_one_row_per_address_with_shared_fields() {
        let warehouse = InMemoryWarehouse::new();
        let settings = settings();

        let summary = handle(&warehouse, &settings, SAMPLE_BODY.as_bytes())
            .await
            .unwrap();

        assert_eq!(summary.rows_submitted, 3);
        assert_eq!(warehouse.insert_calls(), 1);
        let rows = warehouse.rows(&settings.table);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.ingested_at == rows[0].ingested_at));
        assert!(rows.iter().all(|row| row.scanner_id == "scanner-lab-1"));
        assert!(rows.iter().all(|row| row.scan_time == "2024-05-01 08:15:00"));
    }

    #[tokio::test]
    async fn handle_returns_exact_ok_envelope_on_success() {
        let warehouse = InMemoryWarehouse::new();
        let summary = handle(&warehouse, &settings(), SAMPLE_BODY.as_bytes())
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_string(&summary.envelope).unwrap(),
            r#"{"status":"ok","message":"Data streamed into BigQuery successfully\n"}"#
        );
    }

    #[tokio::test]
    async fn handle_skips_insert_for_empty_body() {
        let warehouse = InMemoryWarehouse::new();
        let summary = handle(&warehouse, &settings_with_view(true), b"")
            .await
            .unwrap();

        assert!(summary.envelope.is_ok());
        assert_eq!(summary.rows_submitted, 0);
        assert_eq!(summary.view_refresh, ViewRefreshResult::Skipped);
        assert_eq!(warehouse.insert_calls(), 0);
        assert_eq!(warehouse.query_calls(), 0);
    }

    #[tokio::test]
    async fn handle_skips_warehouse_for_report_without_addresses() {
        let warehouse = InMemoryWarehouse::new();
        let body = br#"{"scannerId":"scanner-lab-1","scanTime":"2024-05-01 08:15:00","macAddresses":[]}"#;

        let summary = handle(&warehouse, &settings_with_view(true), body)
            .await
            .unwrap();

        assert!(summary.envelope.is_ok());
        assert_eq!(summary.rows_submitted, 0);
        assert_eq!(summary.view_refresh, ViewRefreshResult::Skipped);
        assert_eq!(warehouse.insert_calls(), 0);
        assert_eq!(warehouse.query_calls(), 0);
    }

    #[tokio::test]
    async fn handle_rejects_whitespace_body_without_warehouse_calls() {
        let warehouse = InMemoryWarehouse::new();
        let err = handle(&warehouse, &settings_with_view(false), b" \r\n")
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Parse(_)));
        assert!(err.is_client_fault());
        assert_eq!(warehouse.insert_calls(), 0);
        assert_eq!(warehouse.query_calls(), 0);
    }

    #[tokio::test]
    async fn handle_fails_before_any_warehouse_call_on_malformed_json() {
        let warehouse = InMemoryWarehouse::new();
        let err = handle(&warehouse, &settings_with_view(false), b"{not valid")
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Parse(_)));
        assert_eq!(warehouse.insert_calls(), 0);
        assert_eq!(warehouse.query_calls(), 0);
    }

    #[tokio::test]
    async fn handle_translates_rejected_rows_into_failed_envelope() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.reject_next_insert(vec![FailedRow {
            index: 0,
            errors: vec![RowError::new("invalid", "bad value")],
        }]);

        let summary = handle(&warehouse, &settings(), SAMPLE_BODY.as_bytes())
            .await
            .unwrap();

        assert_eq!(summary.envelope.status, EnvelopeStatus::Failed);
        assert!(summary.envelope.message.contains("invalid: bad value"));
    }

    #[tokio::test]
    async fn replaying_a_request_inserts_duplicate_rows() {
        let warehouse = InMemoryWarehouse::new();
        let settings = settings();

        handle(&warehouse, &settings, SAMPLE_BODY.as_bytes()).await.unwrap();
        handle(&warehouse, &settings, SAMPLE_BODY.as_bytes()).await.unwrap();

        assert_eq!(warehouse.insert_calls(), 2);
        assert_eq!(warehouse.rows(&settings.table).len(), 6);
    }

    #[tokio::test]
    async fn insert_fault_propagates_as_warehouse_error_without_view_refresh() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.fail_inserts("connection reset");

        let err = handle(&warehouse, &settings_with_view(false), SAMPLE_BODY.as_bytes())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Warehouse(_)));
        assert!(!err.is_client_fault());
        assert_eq!(warehouse.query_calls(), 0);
    }

    #[tokio::test]
    async fn view_refresh_runs_after_insert_with_latest_scan_sql() {
        let warehouse = InMemoryWarehouse::new();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 16, 42).unwrap();
        let report = parse_scan_report(SAMPLE_BODY.as_bytes()).unwrap();

        let summary = ingest_scan_report(&warehouse, &settings_with_view(false), &report, now)
            .await
            .unwrap();

        assert_eq!(summary.view_refresh, ViewRefreshResult::Refreshed);
        assert_eq!(
            warehouse.statements(),
            vec![latest_scan_view_sql(
                &TableRef::new("proj", "macscan", "scans"),
                "scans_latest"
            )]
        );
        assert!(
            warehouse
                .rows(&TableRef::new("proj", "macscan", "scans"))
                .iter()
                .all(|row| row.ingested_at == "2024-05-01 08:16:42")
        );
    }

    #[tokio::test]
    async fn view_refresh_runs_even_when_rows_are_rejected() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.reject_next_insert(vec![FailedRow {
            index: 1,
            errors: vec![RowError::new("invalid", "bad value")],
        }]);

        let summary = handle(&warehouse, &settings_with_view(false), SAMPLE_BODY.as_bytes())
            .await
            .unwrap();

        assert_eq!(summary.envelope.status, EnvelopeStatus::Failed);
        assert_eq!(summary.view_refresh, ViewRefreshResult::Refreshed);
        assert_eq!(warehouse.query_calls(), 1);
    }

    #[tokio::test]
    async fn best_effort_view_refresh_failure_keeps_insert_envelope() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.fail_queries("Not found: Dataset proj:macscan");

        let summary = handle(&warehouse, &settings_with_view(false), SAMPLE_BODY.as_bytes())
            .await
            .unwrap();

        assert!(summary.envelope.is_ok());
        assert_eq!(summary.view_refresh, ViewRefreshResult::Failed);
    }

    #[tokio::test]
    async fn strict_view_refresh_failure_fails_the_request() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.fail_queries("Not found: Dataset proj:macscan");

        let err = handle(&warehouse, &settings_with_view(true), SAMPLE_BODY.as_bytes())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::ViewRefresh(_)));
        assert_eq!(warehouse.rows(&settings().table).len(), 3);
    }
}
