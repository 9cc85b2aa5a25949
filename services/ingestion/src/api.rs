use schema::ScanReport;
use serde::{Deserialize, Serialize};

use crate::IngestError;

/// Body of `POST /` as sent by scanners. Every key is required; `Option`
/// lets absence surface as [`IngestError::MissingField`] instead of a serde
/// diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReportPayload {
    pub scanner_id: Option<String>,
    pub scan_time: Option<String>,
    pub mac_addresses: Option<Vec<String>>,
}

impl ScanReportPayload {
    pub fn into_report(self) -> Result<ScanReport, IngestError> {
        Ok(ScanReport {
            scanner_id: self
                .scanner_id
                .ok_or(IngestError::MissingField("scannerId"))?,
            scan_time: self.scan_time.ok_or(IngestError::MissingField("scanTime"))?,
            mac_addresses: self
                .mac_addresses
                .ok_or(IngestError::MissingField("macAddresses"))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
