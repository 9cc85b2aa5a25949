use std::{io, sync::Arc};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, FromRequest, State},
    http::{Request, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::transport::{
    HttpRequest, HttpResponse, IngestionRuntime, MAX_HTTP_BODY_BYTES, SharedRuntime,
    handle_request,
};

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to build tokio runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("http server failed: {0}")]
    Serve(#[source] io::Error),
}

#[derive(Clone)]
struct AppState {
    runtime: SharedRuntime,
}

/// All routing happens in [`handle_request`]; axum only buffers the body and
/// enforces its size limit.
pub fn router(runtime: SharedRuntime) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(AppState { runtime })
        .layer(DefaultBodyLimit::max(MAX_HTTP_BODY_BYTES))
}

/// Blocks on a dedicated multi-thread runtime until ctrl-c.
pub fn serve(
    runtime: IngestionRuntime,
    bind_addr: &str,
    worker_threads: usize,
) -> Result<(), ServeError> {
    let worker_threads = worker_threads.max(1);
    let executor = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .map_err(ServeError::Runtime)?;

    executor.block_on(async move {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| ServeError::Bind {
                addr: bind_addr.to_string(),
                source,
            })?;
        info!(bind_addr, worker_threads, "scan ingestion listening");

        axum::serve(listener, router(Arc::new(runtime)))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(ServeError::Serve)
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to install shutdown handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn dispatch(State(state): State<AppState>, request: Request<Body>) -> Response {
    let method = request.method().as_str().to_owned();
    let target = request.uri().path_and_query().map_or_else(
        || request.uri().path().to_owned(),
        |path_and_query| path_and_query.as_str().to_owned(),
    );

    let body = match Bytes::from_request(request, &state).await {
        Ok(body) => body.to_vec(),
        Err(rejection) => {
            let status = rejection.status().as_u16();
            warn!(status, %target, "request body rejected");
            return HttpResponse::error_with_status(status, &rejection.body_text())
                .into_response();
        }
    };

    handle_request(&state.runtime, &HttpRequest::new(method, target, body))
        .await
        .into_response()
}

impl IntoResponse for HttpResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, [(CONTENT_TYPE, self.content_type)], self.body).into_response()
    }
}
