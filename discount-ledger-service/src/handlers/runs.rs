//! Calculation run handlers: start, stage, finalize, abort, heartbeat and
//! the stale-run sweep.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::{CleanupReport, ReconcileSummary, StagedDiscount};
use crate::services::metrics::{ERRORS_TOTAL, FINALIZE_TOTAL};
use crate::startup::AppState;
use service_core::error::AppError;

// ============================================================================
// Request/Response DTOs
// ============================================================================

/// Start-run request.
#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub reference_date: NaiveDate,
    pub actor_id: i64,
}

/// Start-run response.
#[derive(Debug, Serialize)]
pub struct StartRunResponse {
    pub run_id: Uuid,
    pub reference_date: NaiveDate,
}

/// Staging request: the batch produced by the upstream calculation.
#[derive(Debug, Deserialize)]
pub struct StageDiscountsRequest {
    pub entries: Vec<StagedDiscount>,
}

/// Staging response.
#[derive(Debug, Serialize)]
pub struct StageDiscountsResponse {
    pub staged: u64,
}

/// Finalize request.
#[derive(Debug, Deserialize)]
pub struct FinalizeRequest {
    pub actor_id: i64,
}

/// Abort response.
#[derive(Debug, Serialize)]
pub struct AbortResponse {
    pub canceled: u64,
}

/// Cleanup request; the staleness threshold defaults to configuration.
#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    pub stale_after_minutes: Option<i64>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Start a calculation run for a period.
///
/// POST /runs
pub async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<StartRunResponse>), AppError> {
    if req.actor_id <= 0 {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "actor_id must be positive"
        )));
    }

    let session = state
        .db
        .start_run(
            req.reference_date,
            req.actor_id,
            state.config.reconciliation.lock_ttl(),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(StartRunResponse {
            run_id: session.run_id,
            reference_date: session.reference_date,
        }),
    ))
}

/// Stage a batch of computed discounts for a run.
///
/// POST /runs/{run_id}/discounts
pub async fn stage_discounts(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Json(req): Json<StageDiscountsRequest>,
) -> Result<Json<StageDiscountsResponse>, AppError> {
    if req.entries.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "entries must not be empty"
        )));
    }
    for entry in &req.entries {
        entry.validate()?;
    }

    let staged = state.db.stage_discounts(run_id, &req.entries).await?;

    Ok(Json(StageDiscountsResponse { staged }))
}

/// Reconcile a run's staging rows into the authoritative ledger.
///
/// POST /runs/{run_id}/finalize
pub async fn finalize_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Json(req): Json<FinalizeRequest>,
) -> Result<Json<ReconcileSummary>, AppError> {
    if req.actor_id <= 0 {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "actor_id must be positive"
        )));
    }

    let summary = state
        .db
        .finalize_run(run_id, req.actor_id)
        .await
        .map_err(|e| {
            FINALIZE_TOTAL.with_label_values(&["error"]).inc();
            match e {
                // The transaction is all-or-nothing: on a storage failure the
                // operator must know the ledger is unchanged and a retry is safe.
                AppError::DatabaseError(err) => {
                    ERRORS_TOTAL.with_label_values(&["db_error"]).inc();
                    AppError::DatabaseError(anyhow::anyhow!(
                        "finalize failed with no ledger change; the lock is still held and it is safe to retry: {}",
                        err
                    ))
                }
                other => other,
            }
        })?;

    FINALIZE_TOTAL.with_label_values(&["ok"]).inc();
    Ok(Json(summary))
}

/// Reject a computed batch: cancel staging rows and release the period.
///
/// POST /runs/{run_id}/abort
pub async fn abort_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<AbortResponse>, AppError> {
    let canceled = state.db.abort_run(run_id).await?;
    Ok(Json(AbortResponse { canceled }))
}

/// Keep a long-running calculation alive.
///
/// POST /runs/{run_id}/heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.db.touch_session(run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Reap runs that stopped heartbeating.
///
/// POST /maintenance/cleanup
pub async fn cleanup(
    State(state): State<AppState>,
    req: Option<Json<CleanupRequest>>,
) -> Result<Json<CleanupReport>, AppError> {
    let stale_after = req
        .and_then(|Json(r)| r.stale_after_minutes)
        .map(chrono::Duration::minutes)
        .unwrap_or_else(|| state.config.reconciliation.session_staleness());

    if stale_after < chrono::Duration::zero() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "stale_after_minutes must not be negative"
        )));
    }

    let report = state.db.cleanup_stale_runs(stale_after).await?;
    Ok(Json(report))
}
