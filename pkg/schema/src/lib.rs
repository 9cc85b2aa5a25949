use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Scan input
// ---------------------------------------------------------------------------

/// One scan as reported by a scanner. Addresses keep caller order and may
/// repeat.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanReport {
    pub scanner_id: String,
    pub scan_time: String,
    pub mac_addresses: Vec<String>,
}

// ---------------------------------------------------------------------------
// Warehouse rows
// ---------------------------------------------------------------------------

/// `YYYY-MM-DD HH:MM:SS`, accepted by both TIMESTAMP and DATETIME columns.
pub const INGESTION_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One warehouse table row. Field names follow the table's column names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRecord {
    #[serde(rename = "timestamp")]
    pub ingested_at: String,
    #[serde(rename = "scannerId")]
    pub scanner_id: String,
    #[serde(rename = "scanTime")]
    pub scan_time: String,
    #[serde(rename = "macAddress")]
    pub mac_address: String,
}

pub fn format_ingestion_timestamp(now: DateTime<Utc>) -> String {
    now.format(INGESTION_TIMESTAMP_FORMAT).to_string()
}

/// Expands a report into one row per address. Every row carries the same
/// `ingested_at` value.
pub fn build_rows(report: &ScanReport, ingested_at: DateTime<Utc>) -> Vec<RowRecord> {
    let ingested_at = format_ingestion_timestamp(ingested_at);
    report
        .mac_addresses
        .iter()
        .map(|mac_address| RowRecord {
            ingested_at: ingested_at.clone(),
            scanner_id: report.scanner_id.clone(),
            scan_time: report.scan_time.clone(),
            mac_address: mac_address.clone(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Insert outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub reason: String,
    pub message: String,
}

impl RowError {
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRow {
    /// Position of the row in the submitted batch.
    pub index: usize,
    pub errors: Vec<RowError>,
}

/// Result of a batch insert that reached the warehouse. Transport and
/// service failures are not represented here.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InsertOutcome {
    failed_rows: Vec<FailedRow>,
}

impl InsertOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_failures(failed_rows: Vec<FailedRow>) -> Self {
        Self { failed_rows }
    }

    pub fn is_successful(&self) -> bool {
        self.failed_rows.is_empty()
    }

    pub fn failed_rows(&self) -> &[FailedRow] {
        &self.failed_rows
    }

    /// Header line followed by one `reason: message` line per error, rows
    /// and errors in reported order.
    pub fn failure_message(&self) -> String {
        let mut message = String::from(FAILED_MESSAGE);
        for row in &self.failed_rows {
            for error in &row.errors {
                message.push_str(&error.reason);
                message.push_str(": ");
                message.push_str(&error.message);
                message.push('\n');
            }
        }
        message
    }
}

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

pub const OK_MESSAGE: &str = "Data streamed into BigQuery successfully\n";
pub const FAILED_MESSAGE: &str = "Data failed to stream into BigQuery\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestEnvelope {
    pub status: EnvelopeStatus,
    pub message: String,
}

impl IngestEnvelope {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: EnvelopeStatus::Ok,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: EnvelopeStatus::Failed,
            message: message.into(),
        }
    }

    pub fn from_outcome(outcome: &InsertOutcome) -> Self {
        if outcome.is_successful() {
            Self::ok(OK_MESSAGE)
        } else {
            Self::failed(outcome.failure_message())
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == EnvelopeStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_report() -> ScanReport {
        ScanReport {
            scanner_id: "scanner-lab-1".into(),
            scan_time: "2024-05-01 08:15:00".into(),
            mac_addresses: vec![
                "aa:bb:cc:00:00:01".into(),
                "aa:bb:cc:00:00:02".into(),
                "aa:bb:cc:00:00:01".into(),
            ],
        }
    }

    #[test]
    fn build_rows_emits_one_row_per_address_with_shared_timestamp() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 16, 42).unwrap();
        let rows = build_rows(&sample_report(), now);

        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.ingested_at == "2024-05-01 08:16:42"));
        assert!(rows.iter().all(|row| row.scanner_id == "scanner-lab-1"));
        assert!(rows.iter().all(|row| row.scan_time == "2024-05-01 08:15:00"));
    }

    #[test]
    fn build_rows_keeps_address_order_and_duplicates() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let macs: Vec<_> = build_rows(&sample_report(), now)
            .into_iter()
            .map(|row| row.mac_address)
            .collect();
        assert_eq!(
            macs,
            vec!["aa:bb:cc:00:00:01", "aa:bb:cc:00:00:02", "aa:bb:cc:00:00:01"]
        );
    }

    #[test]
    fn build_rows_for_empty_report_is_empty() {
        let rows = build_rows(&ScanReport::default(), Utc::now());
        assert!(rows.is_empty());
    }

    #[test]
    fn row_record_serializes_with_column_names() {
        let row = RowRecord {
            ingested_at: "2024-05-01 08:16:42".into(),
            scanner_id: "s1".into(),
            scan_time: "t1".into(),
            mac_address: "m1".into(),
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "timestamp": "2024-05-01 08:16:42",
                "scannerId": "s1",
                "scanTime": "t1",
                "macAddress": "m1"
            })
        );
    }

    #[test]
    fn successful_outcome_yields_exact_ok_envelope() {
        let envelope = IngestEnvelope::from_outcome(&InsertOutcome::success());
        assert_eq!(
            serde_json::to_string(&envelope).unwrap(),
            r#"{"status":"ok","message":"Data streamed into BigQuery successfully\n"}"#
        );
    }

    #[test]
    fn failure_message_flattens_rows_and_errors_in_order() {
        let outcome = InsertOutcome::with_failures(vec![
            FailedRow {
                index: 0,
                errors: vec![
                    RowError::new("invalid", "bad value"),
                    RowError::new("invalid", "no such field: foo"),
                ],
            },
            FailedRow {
                index: 2,
                errors: vec![RowError::new("stopped", "")],
            },
        ]);

        assert!(!outcome.is_successful());
        assert_eq!(
            outcome.failure_message(),
            "Data failed to stream into BigQuery\n\
invalid: bad value\n\
invalid: no such field: foo\n\
stopped: \n"
        );

        let envelope = IngestEnvelope::from_outcome(&outcome);
        assert_eq!(envelope.status, EnvelopeStatus::Failed);
        assert!(envelope.message.contains("invalid: bad value"));
    }
}
