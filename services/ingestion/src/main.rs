use ingestion::{
    transport::{IngestionRuntime, LoggingConfig, RuntimeConfig, build_warehouse_client},
    transport_axum::serve,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use warehouse::WarehouseClient;

fn main() {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("ingestion configuration error: {err}");
            std::process::exit(2);
        }
    };

    if let Err(err) = init_logging(&config.logging) {
        eprintln!("ingestion logging setup failed: {err}");
        std::process::exit(2);
    }

    let client = match build_warehouse_client(&config) {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, backend = config.backend.as_str(), "failed to build warehouse client");
            std::process::exit(2);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = client.name(),
        table = %config.ingest.table.qualified_name(),
        "ingestion starting"
    );
    match config.ingest.latest_view.as_ref() {
        Some(view) => info!(
            view = %config.ingest.table.sibling(view.view_id.as_str()).qualified_name(),
            strict = view.strict,
            "latest scan view refresh enabled"
        ),
        None => info!("latest scan view refresh disabled"),
    }
    info!("ingestion health endpoint: http://{}/health", config.bind_addr);
    info!("ingestion metrics endpoint: http://{}/metrics", config.bind_addr);
    info!("ingestion API endpoint: http://{}/v1/scans", config.bind_addr);

    let runtime = IngestionRuntime::new(client, config.ingest.clone());
    if let Err(err) = serve(runtime, &config.bind_addr, config.http_workers) {
        error!(error = %err, "ingestion transport failed");
        std::process::exit(1);
    }
}

fn init_logging(logging: &LoggingConfig) -> Result<(), String> {
    let level = logging
        .level
        .parse::<tracing::Level>()
        .map_err(|err| format!("invalid log level '{}': {err}", logging.level))?;
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if logging.json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true),
            )
            .with(filter)
            .try_init()
            .map_err(|err| err.to_string())
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .with(filter)
            .try_init()
            .map_err(|err| err.to_string())
    }
}
