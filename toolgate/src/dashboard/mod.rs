//! Web dashboard: live audit stream, approval actions, stats, and the
//! side-effect-free policy check endpoint.
//!
//! HTML views are deliberately spartan; the dashboard's contract is the
//! data: `/api/v1/stats`, `/api/v1/audit`, `/api/v1/check`, the SSE stream at
//! `/audit/stream`, and the approve/deny actions.

mod html;

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use toolgate_core::approval::ApprovalQueue;
use toolgate_core::audit::{AuditStore, QueryFilter};
use toolgate_core::policy::{CheckRequest, CheckResponse, PolicyBackend};

use crate::error::GatewayError;

/// Shared handler state.
#[derive(Clone)]
pub struct DashboardState {
    pub store: Arc<dyn AuditStore>,
    pub approvals: Arc<ApprovalQueue>,
    pub backend: Arc<dyn PolicyBackend>,
}

/// Build the dashboard router.
pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/", get(overview_page))
        .route("/audit", get(audit_page))
        .route("/audit/stream", get(audit_stream))
        .route("/approval", get(approval_page))
        .route("/approval/{id}/approve", post(approve_action))
        .route("/approval/{id}/deny", post(deny_action))
        .route("/policy", get(policy_page))
        .route("/api/v1/stats", get(api_stats))
        .route("/api/v1/audit", get(api_audit))
        .route("/api/v1/check", post(api_check))
        .with_state(state)
}

/// Bind and serve until the token is cancelled.
pub async fn serve(
    state: DashboardState,
    addr: &str,
    cancel: CancellationToken,
) -> Result<(), GatewayError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| GatewayError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    tracing::info!(listen = addr, "dashboard listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// HTML Views
// ─────────────────────────────────────────────────────────────────────────────

async fn overview_page(State(state): State<DashboardState>) -> Html<String> {
    Html(html::overview(&state.store.stats()))
}

async fn audit_page(State(state): State<DashboardState>) -> Html<String> {
    let mut records = state.store.query(&QueryFilter {
        limit: 100,
        ..Default::default()
    });
    // Newest first.
    records.reverse();
    Html(html::audit(&records))
}

async fn approval_page(State(state): State<DashboardState>) -> Html<String> {
    Html(html::approval(
        &state.approvals.pending(),
        &state.approvals.all(),
    ))
}

async fn policy_page(State(state): State<DashboardState>) -> Html<String> {
    let source = state
        .backend
        .policy()
        .and_then(|file| serde_yaml::to_string(&*file).ok())
        .unwrap_or_else(|| "# external policy backend\n".to_string());
    Html(html::policy(&source))
}

// ─────────────────────────────────────────────────────────────────────────────
// Reviewer Actions
// ─────────────────────────────────────────────────────────────────────────────

async fn approve_action(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Response {
    match state.approvals.approve(&id) {
        Ok(()) => {
            tracing::info!(id, "approval granted by reviewer");
            Redirect::to("/approval").into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn deny_action(State(state): State<DashboardState>, Path(id): Path<String>) -> Response {
    match state.approvals.deny(&id) {
        Ok(()) => {
            tracing::info!(id, "approval denied by reviewer");
            Redirect::to("/approval").into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON API
// ─────────────────────────────────────────────────────────────────────────────

async fn api_stats(State(state): State<DashboardState>) -> Response {
    Json(state.store.stats()).into_response()
}

async fn api_audit(
    State(state): State<DashboardState>,
    Query(filter): Query<QueryFilter>,
) -> Response {
    Json(state.store.query(&filter)).into_response()
}

async fn api_check(
    State(state): State<DashboardState>,
    Json(request): Json<CheckRequest>,
) -> Response {
    match state.backend.evaluate(&request.into_eval_input()) {
        Ok(result) => Json(CheckResponse::from(result)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("evaluation error: {e}"),
        )
            .into_response(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Live Stream
// ─────────────────────────────────────────────────────────────────────────────

/// Server-sent events carrying one JSON audit record per `audit` event.
/// Slow consumers lose records (the subscription buffer drops on full) and
/// never backpressure the proxied data path.
async fn audit_stream(
    State(state): State<DashboardState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (rx, subscription) = state.store.subscribe();

    let stream = ReceiverStream::new(rx).map(move |record| {
        // The subscription lives as long as the stream; dropping the stream
        // (client gone) detaches it from the store.
        let _attached = &subscription;
        let data =
            serde_json::to_string(&record).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event("audit").data(data))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
