//! Domain models for discount-ledger-service.

#![allow(clippy::should_implement_trait)]

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Reason recorded on every compensating entry, kept in the wording the
/// accounting team uses.
pub const COMPENSATION_REASON: &str = "Ajuste compensatório";

// ============================================================================
// Entry Status / Origin
// ============================================================================

/// Ledger entry status. Database values are the ones the downstream
/// reporting stack already filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Staging,
    Finalized,
    Canceled,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Finalized => "finalizado",
            Self::Canceled => "cancelado",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "staging" => Self::Staging,
            "finalizado" => Self::Finalized,
            "cancelado" => Self::Canceled,
            _ => Self::Staging,
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a ledger entry was typed in by an operator or produced by a
/// calculation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryOrigin {
    Manual,
    System,
}

impl EntryOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "manual" => Self::Manual,
            _ => Self::System,
        }
    }
}

// ============================================================================
// Ledger Rows
// ============================================================================

/// One row of the discount ledger.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DiscountEntry {
    pub id: i64,
    pub run_id: Option<Uuid>,
    pub reference_date: NaiveDate,
    pub business_key: String,
    pub amount: Decimal,
    pub document_id: Option<String>,
    pub subject_name: Option<String>,
    pub movement_date: Option<NaiveDate>,
    pub assessment_date: Option<NaiveDate>,
    pub movement_kind: Option<String>,
    pub proposal: Option<String>,
    pub proposal_canceled_date: Option<NaiveDate>,
    pub status: String,
    pub is_active: bool,
    pub parent_id: Option<i64>,
    pub reason: Option<String>,
    pub origin: String,
    pub actor_id: Option<i64>,
    pub finalized_utc: Option<DateTime<Utc>>,
    pub canceled_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl DiscountEntry {
    pub fn parsed_status(&self) -> EntryStatus {
        EntryStatus::from_str(&self.status)
    }
}

/// Exclusive lock on one accounting period.
#[derive(Debug, Clone, FromRow)]
pub struct PeriodLock {
    pub reference_date: NaiveDate,
    pub holder_run_id: Uuid,
    pub acquired_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
}

/// Bookkeeping record for an in-flight calculation run.
#[derive(Debug, Clone, FromRow)]
pub struct CalculationSession {
    pub run_id: Uuid,
    pub reference_date: NaiveDate,
    pub actor_id: i64,
    pub created_utc: DateTime<Utc>,
    pub heartbeat_utc: DateTime<Utc>,
}

// ============================================================================
// Staging Input
// ============================================================================

/// Input row for the staging ledger, as produced by the upstream
/// calculation. The business key is derived here when the caller does not
/// supply one.
#[derive(Debug, Clone, Deserialize, validator::Validate)]
pub struct StagedDiscount {
    pub amount: Decimal,
    #[validate(length(max = 32))]
    pub document_id: Option<String>,
    pub subject_name: Option<String>,
    pub movement_date: Option<NaiveDate>,
    pub assessment_date: Option<NaiveDate>,
    pub movement_kind: Option<String>,
    pub proposal: Option<String>,
    pub proposal_canceled_date: Option<NaiveDate>,
    pub origin: Option<EntryOrigin>,
    #[validate(length(min = 1, max = 256))]
    pub business_key: Option<String>,
}

impl StagedDiscount {
    /// The business key identifies "this deduction, for this subject, in
    /// this period" independently of the amount.
    pub fn business_key(&self) -> String {
        match &self.business_key {
            Some(key) => key.clone(),
            None => derive_business_key(
                self.assessment_date,
                self.movement_date,
                self.document_id.as_deref(),
                self.proposal.as_deref(),
                self.movement_kind.as_deref(),
            ),
        }
    }

    pub fn origin(&self) -> EntryOrigin {
        self.origin.unwrap_or(EntryOrigin::System)
    }

    /// Document id normalized for storage: digits only, left-padded to the
    /// 11 positions the payroll files use.
    pub fn normalized_document(&self) -> Option<String> {
        self.document_id.as_deref().and_then(normalize_document)
    }
}

/// Derive the business key the way the payout pipeline always has:
/// `date|document|proposal|movement-kind`, each part falling back to `N/A`.
/// The assessment date wins over the movement date when both are present.
pub fn derive_business_key(
    assessment_date: Option<NaiveDate>,
    movement_date: Option<NaiveDate>,
    document_id: Option<&str>,
    proposal: Option<&str>,
    movement_kind: Option<&str>,
) -> String {
    let date_part = assessment_date
        .or(movement_date)
        .map(|d| d.format("%Y%m%d").to_string())
        .unwrap_or_else(|| "N/A".to_string());

    let document_part = document_id
        .and_then(normalize_document)
        .unwrap_or_else(|| "N/A".to_string());

    let proposal_part = proposal.filter(|p| !p.is_empty()).unwrap_or("N/A");
    let kind_part = movement_kind.filter(|k| !k.is_empty()).unwrap_or("N/A");

    format!("{date_part}|{document_part}|{proposal_part}|{kind_part}")
}

/// Strip everything but digits and left-pad to 11 positions. Returns `None`
/// when the input carries no digits at all.
pub fn normalize_document(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(format!("{digits:0>11}"))
    }
}

/// Amounts within a cent of each other are the same money; the tolerance
/// absorbs rounding differences between recalculations.
pub fn amounts_match(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() < Decimal::new(1, 2)
}

// ============================================================================
// Reconciliation Outcomes
// ============================================================================

/// Diff recorded for each business key whose authoritative value changed.
#[derive(Debug, Clone, Serialize)]
pub struct AmountDiff {
    pub business_key: String,
    pub old_amount: Decimal,
    pub new_amount: Decimal,
    pub delta: Decimal,
}

/// Outcome of one finalize call: the full distribution of per-key results,
/// not a boolean.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub promoted: i64,
    pub compensated: i64,
    pub discarded: i64,
    pub diffs: Vec<AmountDiff>,
}

/// Report from the stale-run sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub sessions_reaped: u64,
    pub entries_canceled: u64,
    pub locks_released: u64,
}

/// Per-subject balance over active finalized entries.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SubjectBalance {
    pub document_id: String,
    pub balance: Decimal,
}

/// Filters for the active-entries listing. All contains-style matches.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntryFilter {
    pub document_id: Option<String>,
    pub subject_name: Option<String>,
    pub proposal: Option<String>,
}
