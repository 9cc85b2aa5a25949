mod config;
mod http;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use serde_json::json;
use tracing::{error, warn};
use warehouse::WarehouseClient;

use crate::{IngestError, IngestSettings, IngestSummary, ViewRefreshResult, handle};

pub use config::{
    ConfigError, CredentialConfig, LoggingConfig, RuntimeConfig, WarehouseBackend,
    build_warehouse_client,
};
pub use http::{HttpRequest, HttpResponse};

pub(crate) const MAX_HTTP_BODY_BYTES: usize = 16 * 1024 * 1024;

pub type SharedRuntime = Arc<IngestionRuntime>;

/// Everything a request needs: the shared warehouse client, the target
/// table settings, and process-wide counters.
pub struct IngestionRuntime {
    client: Arc<dyn WarehouseClient>,
    settings: IngestSettings,
    metrics: IngestMetrics,
    started_at: Instant,
}

#[derive(Debug, Default)]
struct IngestMetrics {
    requests_total: AtomicU64,
    ok_total: AtomicU64,
    failed_total: AtomicU64,
    rows_submitted_total: AtomicU64,
    rejected_requests_total: AtomicU64,
    service_faults_total: AtomicU64,
    view_refresh_success_total: AtomicU64,
    view_refresh_failure_total: AtomicU64,
}

impl IngestMetrics {
    fn observe(&self, result: &Result<IngestSummary, IngestError>) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(summary) => {
                if summary.envelope.is_ok() {
                    self.ok_total.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.failed_total.fetch_add(1, Ordering::Relaxed);
                }
                self.rows_submitted_total
                    .fetch_add(summary.rows_submitted as u64, Ordering::Relaxed);
                match summary.view_refresh {
                    ViewRefreshResult::Refreshed => {
                        self.view_refresh_success_total
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    ViewRefreshResult::Failed => {
                        self.view_refresh_failure_total
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    ViewRefreshResult::Skipped => {}
                }
            }
            Err(err) if err.is_client_fault() => {
                self.rejected_requests_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                if matches!(err, IngestError::ViewRefresh(_)) {
                    self.view_refresh_failure_total
                        .fetch_add(1, Ordering::Relaxed);
                }
                self.service_faults_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl IngestionRuntime {
    pub fn new(client: Arc<dyn WarehouseClient>, settings: IngestSettings) -> Self {
        Self {
            client,
            settings,
            metrics: IngestMetrics::default(),
            started_at: Instant::now(),
        }
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    pub async fn ingest(&self, body: &[u8]) -> Result<IngestSummary, IngestError> {
        let result = handle(self.client.as_ref(), &self.settings, body).await;
        self.metrics.observe(&result);
        result
    }

    pub fn metrics_text(&self) -> String {
        let metrics = &self.metrics;
        format!(
            "# TYPE macscan_ingest_requests_total counter\n\
macscan_ingest_requests_total {}\n\
# TYPE macscan_ingest_ok_total counter\n\
macscan_ingest_ok_total {}\n\
# TYPE macscan_ingest_failed_total counter\n\
macscan_ingest_failed_total {}\n\
# TYPE macscan_ingest_rows_submitted_total counter\n\
macscan_ingest_rows_submitted_total {}\n\
# TYPE macscan_ingest_rejected_requests_total counter\n\
macscan_ingest_rejected_requests_total {}\n\
# TYPE macscan_ingest_service_faults_total counter\n\
macscan_ingest_service_faults_total {}\n\
# TYPE macscan_ingest_view_refresh_success_total counter\n\
macscan_ingest_view_refresh_success_total {}\n\
# TYPE macscan_ingest_view_refresh_failure_total counter\n\
macscan_ingest_view_refresh_failure_total {}\n\
# TYPE macscan_ingest_uptime_seconds gauge\n\
macscan_ingest_uptime_seconds {:.4}\n",
            metrics.requests_total.load(Ordering::Relaxed),
            metrics.ok_total.load(Ordering::Relaxed),
            metrics.failed_total.load(Ordering::Relaxed),
            metrics.rows_submitted_total.load(Ordering::Relaxed),
            metrics.rejected_requests_total.load(Ordering::Relaxed),
            metrics.service_faults_total.load(Ordering::Relaxed),
            metrics.view_refresh_success_total.load(Ordering::Relaxed),
            metrics.view_refresh_failure_total.load(Ordering::Relaxed),
            self.started_at.elapsed().as_secs_f64()
        )
    }
}

pub async fn handle_request(runtime: &IngestionRuntime, request: &HttpRequest) -> HttpResponse {
    match (request.method.as_str(), request.path()) {
        ("GET", "/health") => HttpResponse::ok_json(json!({ "status": "ok" }).to_string()),
        ("GET", "/metrics") => HttpResponse::ok_text(runtime.metrics_text()),
        ("POST", "/" | "/v1/scans") => match runtime.ingest(&request.body).await {
            Ok(summary) => match serde_json::to_string(&summary.envelope) {
                Ok(body) => HttpResponse::ok_json(body),
                Err(err) => HttpResponse::internal_server_error(&format!(
                    "failed to encode response: {err}"
                )),
            },
            Err(err) => {
                let (status, message) = map_ingest_error(&err);
                if status >= 500 {
                    error!(status, error = %err, "scan ingest failed");
                } else {
                    warn!(status, error = %err, "scan ingest rejected");
                }
                HttpResponse::error_with_status(status, &message)
            }
        },
        (_, "/" | "/v1/scans") => {
            HttpResponse::method_not_allowed("scan reports must be sent with POST")
        }
        (_, "/health" | "/metrics") => HttpResponse::method_not_allowed("only GET is supported"),
        (_, path) => HttpResponse::not_found(&format!("no route for {path}")),
    }
}

pub(crate) fn map_ingest_error(error: &IngestError) -> (u16, String) {
    match error {
        IngestError::Parse(_) | IngestError::MissingField(_) => (400, error.to_string()),
        IngestError::Warehouse(_) | IngestError::ViewRefresh(_) => (500, error.to_string()),
    }
}
