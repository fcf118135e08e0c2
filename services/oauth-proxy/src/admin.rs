//! Control surface for the account pool.
//!
//! Runs on a separate listener from the proxy route (default port 9090) so
//! it can be exposed only on a private network/port-forward. There is
//! deliberately no account-creation endpoint here — accounts are added only
//! by editing the credentials document on disk; the watcher picks the
//! change up.
//!
//! Endpoints:
//! - GET   /admin/pool                    — read-only pool snapshot
//! - POST  /admin/accounts/{name}/enable   — move an account to `available`
//! - POST  /admin/accounts/{name}/disable  — move an account to `disabled`
//! - POST  /admin/accounts/{name}/force-refresh — queue an out-of-cycle refresh
//! - GET   /metrics                       — Prometheus exposition

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;

use anthropic_pool::Pool;

use crate::error::Error;

#[derive(Clone)]
pub struct AdminState {
    pool: Arc<Pool>,
    metrics_handle: PrometheusHandle,
}

impl AdminState {
    pub fn new(pool: Arc<Pool>, metrics_handle: PrometheusHandle) -> Self {
        Self {
            pool,
            metrics_handle,
        }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/pool", get(pool_view))
        .route("/admin/accounts/{name}/enable", post(enable_account))
        .route("/admin/accounts/{name}/disable", post(disable_account))
        .route(
            "/admin/accounts/{name}/force-refresh",
            post(force_refresh_account),
        )
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// GET /metrics — Prometheus text exposition format.
async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics_handle.render())
}

/// GET /admin/pool — a read-only snapshot of every account's state.
async fn pool_view(State(state): State<AdminState>) -> impl IntoResponse {
    (StatusCode::OK, axum::Json(state.pool.view()))
}

/// POST /admin/accounts/{name}/enable
async fn enable_account(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.pool.enable(&name)?;
    Ok((StatusCode::OK, axum::Json(state.pool.view())))
}

/// POST /admin/accounts/{name}/disable
async fn disable_account(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.pool.disable(&name)?;
    Ok((StatusCode::OK, axum::Json(state.pool.view())))
}

/// POST /admin/accounts/{name}/force-refresh — queue a refresh bypassing
/// the scheduler's normal backoff window; responds before the refresh runs.
async fn force_refresh_account(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.pool.request_force_refresh(&name)?;
    Ok((StatusCode::ACCEPTED, axum::Json(state.pool.view())))
}
