use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::{QueueError, Result};
use crate::manager::lease::LeaseManager;
use crate::protocol::{
    CompleteRequest, DequeueRequest, HeartbeatRequest, SetLogRequest, COMPLETE_ROUTE,
    DEQUEUE_ROUTE, HEARTBEAT_ROUTE, SET_LOG_ROUTE,
};
use crate::queue::store::RecordStore;

/// A failed manager operation, reported as a plain-text 500.
struct ApiError {
    op: &'static str,
    source: QueueError,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(op = self.op, error = %self.source, "Queue operation failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to {}: {}", self.op, self.source),
        )
            .into_response()
    }
}

/// Run a manager operation on its own task.
///
/// The request future is dropped if the client disconnects. Lease table
/// updates and transaction finalization must still run to the end, so the
/// operation is detached from the request.
async fn detached<T, F>(op: &'static str, fut: F) -> std::result::Result<T, ApiError>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(ApiError { op, source }),
        Err(e) => Err(ApiError {
            op,
            source: QueueError::Internal(e.to_string()),
        }),
    }
}

/// Build the queue routes, mounted under `prefix` (an empty prefix mounts at
/// the root).
pub fn router<S: RecordStore>(manager: Arc<LeaseManager<S>>, prefix: &str) -> Router {
    let routes = Router::new()
        .route(DEQUEUE_ROUTE, post(dequeue::<S>))
        .route(SET_LOG_ROUTE, post(set_log_contents::<S>))
        .route(COMPLETE_ROUTE, post(complete::<S>))
        .route(HEARTBEAT_ROUTE, post(heartbeat::<S>))
        .with_state(manager);

    let prefix = prefix.trim_matches('/');
    let app = if prefix.is_empty() {
        routes
    } else {
        Router::new().nest(&format!("/{}", prefix), routes)
    };
    app.layer(TraceLayer::new_for_http())
}

/// Serve the queue API until `shutdown` fires.
pub async fn run_api_server<S: RecordStore>(
    addr: SocketAddr,
    manager: Arc<LeaseManager<S>>,
    prefix: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| QueueError::from(e).context(format!("failed to bind {}", addr)))?;
    serve(listener, manager, prefix, shutdown).await
}

/// Serve the queue API on an already bound listener.
pub async fn serve<S: RecordStore>(
    listener: tokio::net::TcpListener,
    manager: Arc<LeaseManager<S>>,
    prefix: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = router(manager, prefix);
    tracing::info!(addr = ?listener.local_addr().ok(), prefix, "Starting queue API server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn dequeue<S: RecordStore>(
    State(manager): State<Arc<LeaseManager<S>>>,
    Json(req): Json<DequeueRequest>,
) -> std::result::Result<Response, ApiError> {
    let record = detached("dequeue", async move { manager.dequeue(&req.indexer_name).await }).await?;

    Ok(match record {
        Some(record) => (StatusCode::OK, Json(record)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn set_log_contents<S: RecordStore>(
    State(manager): State<Arc<LeaseManager<S>>>,
    Json(req): Json<SetLogRequest>,
) -> std::result::Result<StatusCode, ApiError> {
    detached("set log contents", async move {
        manager
            .set_log_contents(&req.indexer_name, req.index_id, &req.contents)
            .await
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn complete<S: RecordStore>(
    State(manager): State<Arc<LeaseManager<S>>>,
    Json(req): Json<CompleteRequest>,
) -> std::result::Result<StatusCode, ApiError> {
    let found = detached("complete", async move {
        manager
            .complete(&req.indexer_name, req.index_id, req.error_message.as_deref())
            .await
    })
    .await?;

    Ok(if found {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}

async fn heartbeat<S: RecordStore>(
    State(manager): State<Arc<LeaseManager<S>>>,
    Json(req): Json<HeartbeatRequest>,
) -> std::result::Result<StatusCode, ApiError> {
    detached("heartbeat", async move {
        manager.heartbeat(&req.indexer_name, &req.index_ids).await
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}
