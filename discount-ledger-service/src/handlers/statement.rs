//! Read-side handlers over the authoritative ledger view.
//!
//! Everything here filters with exactly `status = 'finalizado' AND
//! is_active = TRUE`; superseded and staging rows never appear.

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{DiscountEntry, EntryFilter, SubjectBalance};
use crate::startup::AppState;
use service_core::error::AppError;

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EntryListQuery {
    pub document_id: Option<String>,
    pub subject_name: Option<String>,
    pub proposal: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
    pub total_pages: i64,
}

#[derive(Debug, Serialize)]
pub struct EntryListResponse {
    pub data: Vec<DiscountEntry>,
    pub pagination: Pagination,
    pub total_balance: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    pub document_id: String,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub document_id: String,
    pub balance: Decimal,
}

#[derive(Debug, Serialize)]
pub struct SubjectBalancesResponse {
    pub balances: Vec<SubjectBalance>,
}

// ============================================================================
// Handlers
// ============================================================================

/// List active finalized discount entries.
///
/// GET /discounts
pub async fn list_entries(
    State(state): State<AppState>,
    Query(query): Query<EntryListQuery>,
) -> Result<Json<EntryListResponse>, AppError> {
    let filter = EntryFilter {
        document_id: query.document_id,
        subject_name: query.subject_name,
        proposal: query.proposal,
    };
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(20).clamp(1, 100);

    let (data, total, total_balance) = state.db.active_entries(&filter, page, page_size).await?;

    let total_pages = if total == 0 {
        0
    } else {
        (total + page_size - 1) / page_size
    };

    Ok(Json(EntryListResponse {
        data,
        pagination: Pagination {
            page,
            page_size,
            total,
            total_pages,
        },
        total_balance,
    }))
}

/// Balance for one subject, optionally restricted to a period range.
///
/// GET /discounts/balance
pub async fn balance(
    State(state): State<AppState>,
    Query(query): Query<BalanceQuery>,
) -> Result<Json<BalanceResponse>, AppError> {
    let balance = state
        .db
        .active_balance(&query.document_id, query.from, query.to)
        .await?;

    Ok(Json(BalanceResponse {
        document_id: query.document_id,
        balance,
    }))
}

/// Per-subject balances, used by payout netting.
///
/// GET /discounts/balances
pub async fn subject_balances(
    State(state): State<AppState>,
) -> Result<Json<SubjectBalancesResponse>, AppError> {
    let balances = state.db.balance_by_subject().await?;
    Ok(Json(SubjectBalancesResponse { balances }))
}
