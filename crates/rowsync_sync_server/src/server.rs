//! HTTP binding of the web server.

use crate::error::{ServerError, ServerResult};
use crate::handler::WebServerOrchestrator;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use rowsync_core::StorageProvider;
use rowsync_sync_protocol::endpoints;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Content type of every request and response body.
pub const CBOR_CONTENT_TYPE: &str = "application/cbor";

/// Builds the router exposing the sync endpoints of `server`.
pub fn router<P: StorageProvider>(server: Arc<WebServerOrchestrator<P>>) -> Router {
    let body_limit = server.config().body_limit;
    Router::new()
        .route(endpoints::ENSURE_SCOPE, post(dispatch::<P>))
        .route(endpoints::SEND_CHANGES, post(dispatch::<P>))
        .route(endpoints::GET_MORE_CHANGES, post(dispatch::<P>))
        .route(endpoints::END_SESSION, post(dispatch::<P>))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

async fn dispatch<P: StorageProvider>(
    State(server): State<Arc<WebServerOrchestrator<P>>>,
    uri: Uri,
    body: Bytes,
) -> Response {
    match server.handle(uri.path(), &body).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, CBOR_CONTENT_TYPE)], bytes).into_response(),
        Err(e) => {
            let status = if e.is_client_error() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            tracing::warn!(path = uri.path(), status = status.as_u16(), error = %e, "request failed");
            (status, e.to_string()).into_response()
        }
    }
}

/// Serves `server` on `listener` until the task is dropped, purging expired
/// sessions in the background.
pub async fn serve_on<P: StorageProvider>(
    server: Arc<WebServerOrchestrator<P>>,
    listener: TcpListener,
) -> ServerResult<()> {
    let addr = listener.local_addr()?;
    let reaper = tokio::spawn(purge_sessions(Arc::clone(&server)));
    tracing::info!(%addr, scopes = ?server.scope_names(), "sync server listening");
    let result = axum::serve(listener, router(server)).await;
    reaper.abort();
    result.map_err(ServerError::Io)
}

/// Binds the configured address and serves `server`.
pub async fn serve<P: StorageProvider>(server: Arc<WebServerOrchestrator<P>>) -> ServerResult<()> {
    let listener = TcpListener::bind(server.config().bind_addr).await?;
    serve_on(server, listener).await
}

async fn purge_sessions<P: StorageProvider>(server: Arc<WebServerOrchestrator<P>>) {
    let period = (server.config().session_expiry / 2).max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        if let Err(e) = server.purge_expired_sessions() {
            tracing::warn!(error = %e, "failed to purge sessions");
        }
    }
}
