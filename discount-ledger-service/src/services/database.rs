//! Database service for discount-ledger-service.
//!
//! Holds every operation that touches the discount ledger: period lock
//! acquisition, calculation sessions, the staging ledger, the
//! reconciliation engine, and the active-entries read side.

use crate::models::{
    amounts_match, normalize_document, AmountDiff, CalculationSession, CleanupReport,
    DiscountEntry, EntryFilter, ReconcileSummary, StagedDiscount, SubjectBalance,
    COMPENSATION_REASON,
};
use crate::services::metrics::{DB_QUERY_DURATION, RECONCILE_ROWS_TOTAL, RUNS_STARTED_TOTAL};
use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use tracing::{info, instrument};
use uuid::Uuid;

const ENTRY_COLUMNS: &str = "id, run_id, reference_date, business_key, amount, document_id, \
     subject_name, movement_date, assessment_date, movement_kind, proposal, \
     proposal_canceled_date, status, is_active, parent_id, reason, origin, actor_id, \
     finalized_utc, canceled_utc, created_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "discount-ledger-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .idle_timeout(std::time::Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Period Lock + Calculation Session
    // -------------------------------------------------------------------------

    /// Start a calculation run for a period: acquire the period lock and open
    /// a session, both in one transaction.
    ///
    /// The primary key on `period_locks.reference_date` is what makes two
    /// concurrent acquisitions impossible; the conditional upsert only steals
    /// a lock whose TTL has lapsed. There is no wait queue: a live holder
    /// means `Conflict` and the caller retries later.
    #[instrument(skip(self), fields(reference_date = %reference_date, actor_id = actor_id))]
    pub async fn start_run(
        &self,
        reference_date: NaiveDate,
        actor_id: i64,
        lock_ttl: Duration,
    ) -> Result<CalculationSession, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["start_run"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let run_id = Uuid::new_v4();
        let now = Utc::now();
        let expires = now + lock_ttl;

        let claimed: Option<NaiveDate> = sqlx::query_scalar(
            r#"
            INSERT INTO period_locks (reference_date, holder_run_id, acquired_utc, expires_utc)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (reference_date) DO UPDATE
            SET holder_run_id = EXCLUDED.holder_run_id,
                acquired_utc = EXCLUDED.acquired_utc,
                expires_utc = EXCLUDED.expires_utc
            WHERE period_locks.expires_utc < now()
            RETURNING reference_date
            "#,
        )
        .bind(reference_date)
        .bind(run_id)
        .bind(now)
        .bind(expires)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to acquire lock: {}", e)))?;

        if claimed.is_none() {
            tx.rollback().await.ok();
            RUNS_STARTED_TOTAL.with_label_values(&["conflict"]).inc();
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Period {} is currently being processed by another run",
                reference_date
            )));
        }

        // Reclaiming an expired lock can leave sessions and staging rows from
        // the dead holder behind; retire them before opening the new session.
        let stale_runs: Vec<Uuid> = sqlx::query_scalar(
            "DELETE FROM calculation_sessions WHERE reference_date = $1 RETURNING run_id",
        )
        .bind(reference_date)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to clear stale sessions: {}", e))
        })?;

        if !stale_runs.is_empty() {
            sqlx::query(
                r#"
                UPDATE discount_entries
                SET status = 'cancelado', canceled_utc = now(), is_active = FALSE
                WHERE run_id = ANY($1) AND status = 'staging'
                "#,
            )
            .bind(&stale_runs)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to cancel stale staging: {}", e))
            })?;
        }

        let session = sqlx::query_as::<_, CalculationSession>(
            r#"
            INSERT INTO calculation_sessions (run_id, reference_date, actor_id, created_utc, heartbeat_utc)
            VALUES ($1, $2, $3, $4, $4)
            RETURNING run_id, reference_date, actor_id, created_utc, heartbeat_utc
            "#,
        )
        .bind(run_id)
        .bind(reference_date)
        .bind(actor_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to open session: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        RUNS_STARTED_TOTAL.with_label_values(&["acquired"]).inc();

        info!(
            run_id = %session.run_id,
            reference_date = %reference_date,
            stale_runs_cleared = stale_runs.len(),
            "Calculation run started"
        );

        Ok(session)
    }

    /// Refresh a session's heartbeat so the stale-run sweep leaves it alone.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn touch_session(&self, run_id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE calculation_sessions SET heartbeat_utc = now() WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to update heartbeat: {}", e))
            })?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "No session for run {}",
                run_id
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Staging Ledger
    // -------------------------------------------------------------------------

    /// Write a batch of staged discounts for a run. Rows land with status
    /// `staging` and stay invisible to every read surface until finalize.
    /// Duplicate business keys are allowed here; the reconciliation engine
    /// is the one that collapses or rejects them.
    #[instrument(skip(self, entries), fields(run_id = %run_id, entry_count = entries.len()))]
    pub async fn stage_discounts(
        &self,
        run_id: Uuid,
        entries: &[StagedDiscount],
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["stage_discounts"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let session = self.session_for_update(&mut tx, run_id).await?;
        let session = session.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("No session for run {}", run_id))
        })?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO discount_entries
                    (run_id, reference_date, business_key, amount, document_id, subject_name,
                     movement_date, assessment_date, movement_kind, proposal,
                     proposal_canceled_date, status, is_active, origin)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'staging', FALSE, $12)
                "#,
            )
            .bind(run_id)
            .bind(session.reference_date)
            .bind(entry.business_key())
            .bind(entry.amount)
            .bind(entry.normalized_document())
            .bind(&entry.subject_name)
            .bind(entry.movement_date)
            .bind(entry.assessment_date)
            .bind(&entry.movement_kind)
            .bind(&entry.proposal)
            .bind(entry.proposal_canceled_date)
            .bind(entry.origin().as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert staging row: {}", e))
            })?;
        }

        sqlx::query("UPDATE calculation_sessions SET heartbeat_utc = now() WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to update heartbeat: {}", e))
            })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(
            run_id = %run_id,
            staged = entries.len(),
            "Discounts staged"
        );

        Ok(entries.len() as u64)
    }

    // -------------------------------------------------------------------------
    // Reconciliation Engine
    // -------------------------------------------------------------------------

    /// Promote, discard, or compensate every staging row of a run against the
    /// authoritative ledger, then release the period lock and close the
    /// session. Runs as a single REPEATABLE READ transaction: either the whole
    /// run becomes authoritative or nothing changes.
    #[instrument(skip(self), fields(run_id = %run_id, actor_id = actor_id))]
    pub async fn finalize_run(
        &self,
        run_id: Uuid,
        actor_id: i64,
    ) -> Result<ReconcileSummary, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finalize_run"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to set isolation level: {}", e))
            })?;

        let session = self.session_for_update(&mut tx, run_id).await?;
        let session = match session {
            Some(s) => s,
            None => {
                tx.rollback().await.ok();
                return Err(self.missing_session_error(run_id).await?);
            }
        };

        // Row-lock the period lock so a concurrent writer cannot race the
        // release at the end of this transaction.
        sqlx::query("SELECT reference_date FROM period_locks WHERE reference_date = $1 FOR UPDATE")
            .bind(session.reference_date)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to lock period row: {}", e))
            })?;

        let staging: Vec<DiscountEntry> = sqlx::query_as(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM discount_entries
            WHERE run_id = $1 AND status = 'staging'
            ORDER BY id
            "#
        ))
        .bind(run_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load staging rows: {}", e))
        })?;

        if staging.is_empty() {
            tx.rollback().await.ok();
            return Err(self.missing_session_error(run_id).await?);
        }

        // An upstream calculation bug can repeat a business key within one
        // batch. Conflicting amounts are rejected before any write rather
        // than letting insertion order pick a winner; equal amounts collapse
        // through the discard path below.
        let mut batch_amounts: HashMap<&str, Decimal> = HashMap::new();
        for row in &staging {
            if let Some(first) = batch_amounts.get(row.business_key.as_str()) {
                if !amounts_match(*first, row.amount) {
                    tx.rollback().await.ok();
                    return Err(AppError::BadRequest(anyhow::anyhow!(
                        "Business key '{}' staged twice with conflicting amounts ({} and {})",
                        row.business_key,
                        first,
                        row.amount
                    )));
                }
            } else {
                batch_amounts.insert(row.business_key.as_str(), row.amount);
            }
        }

        let mut summary = ReconcileSummary::default();

        for row in &staging {
            let existing: Option<DiscountEntry> = sqlx::query_as(&format!(
                r#"
                SELECT {ENTRY_COLUMNS}
                FROM discount_entries
                WHERE reference_date = $1
                  AND business_key = $2
                  AND status = 'finalizado'
                  AND is_active = TRUE
                LIMIT 1
                FOR UPDATE
                "#
            ))
            .bind(session.reference_date)
            .bind(&row.business_key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to look up active row: {}", e))
            })?;

            match existing {
                None => {
                    self.promote(&mut tx, row.id, actor_id).await?;
                    summary.promoted += 1;
                }
                Some(ref active) if amounts_match(active.amount, row.amount) => {
                    // Same value already authoritative: this run's result is
                    // redundant and the retry becomes a no-op.
                    self.discard(&mut tx, row.id).await?;
                    summary.discarded += 1;
                }
                Some(active) => {
                    self.compensate(&mut tx, &active, row, actor_id).await?;
                    summary.compensated += 1;
                    summary.diffs.push(AmountDiff {
                        business_key: row.business_key.clone(),
                        old_amount: active.amount,
                        new_amount: row.amount,
                        delta: row.amount - active.amount,
                    });
                }
            }
        }

        sqlx::query("DELETE FROM period_locks WHERE reference_date = $1")
            .bind(session.reference_date)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to release lock: {}", e))
            })?;

        sqlx::query("DELETE FROM calculation_sessions WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to close session: {}", e))
            })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        RECONCILE_ROWS_TOTAL
            .with_label_values(&["promoted"])
            .inc_by(summary.promoted as f64);
        RECONCILE_ROWS_TOTAL
            .with_label_values(&["compensated"])
            .inc_by(summary.compensated as f64);
        RECONCILE_ROWS_TOTAL
            .with_label_values(&["discarded"])
            .inc_by(summary.discarded as f64);

        info!(
            run_id = %run_id,
            reference_date = %session.reference_date,
            promoted = summary.promoted,
            compensated = summary.compensated,
            discarded = summary.discarded,
            "Run finalized"
        );

        Ok(summary)
    }

    /// Cancel the remaining staging rows of a run and release its lock and
    /// session, leaving finalized rows untouched. Safe to call twice.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn abort_run(&self, run_id: Uuid) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["abort_run"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let canceled = sqlx::query(
            r#"
            UPDATE discount_entries
            SET status = 'cancelado', canceled_utc = now(), is_active = FALSE
            WHERE run_id = $1 AND status = 'staging'
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to cancel staging rows: {}", e))
        })?
        .rows_affected();

        let session = self.session_for_update(&mut tx, run_id).await?;
        if let Some(session) = session {
            sqlx::query("DELETE FROM period_locks WHERE reference_date = $1")
                .bind(session.reference_date)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to release lock: {}", e))
                })?;

            sqlx::query("DELETE FROM calculation_sessions WHERE run_id = $1")
                .bind(run_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to close session: {}", e))
                })?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(run_id = %run_id, canceled = canceled, "Run aborted");

        Ok(canceled)
    }

    /// Reap runs whose heartbeat went silent: cancel their staging rows and
    /// release their locks and sessions. Also drops expired locks that lost
    /// their session some other way.
    #[instrument(skip(self))]
    pub async fn cleanup_stale_runs(&self, stale_after: Duration) -> Result<CleanupReport, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["cleanup_stale_runs"])
            .start_timer();

        let cutoff = Utc::now() - stale_after;

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let stale: Vec<CalculationSession> = sqlx::query_as(
            r#"
            SELECT run_id, reference_date, actor_id, created_utc, heartbeat_utc
            FROM calculation_sessions
            WHERE heartbeat_utc < $1
            FOR UPDATE
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find stale sessions: {}", e))
        })?;

        let mut report = CleanupReport::default();

        if !stale.is_empty() {
            let run_ids: Vec<Uuid> = stale.iter().map(|s| s.run_id).collect();
            let dates: Vec<NaiveDate> = stale.iter().map(|s| s.reference_date).collect();

            report.entries_canceled = sqlx::query(
                r#"
                UPDATE discount_entries
                SET status = 'cancelado', canceled_utc = now(), is_active = FALSE
                WHERE run_id = ANY($1) AND status = 'staging'
                "#,
            )
            .bind(&run_ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to cancel stale staging: {}", e))
            })?
            .rows_affected();

            report.locks_released = sqlx::query(
                "DELETE FROM period_locks WHERE reference_date = ANY($1) AND holder_run_id = ANY($2)",
            )
            .bind(&dates)
            .bind(&run_ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to release stale locks: {}", e))
            })?
            .rows_affected();

            report.sessions_reaped = sqlx::query(
                "DELETE FROM calculation_sessions WHERE run_id = ANY($1)",
            )
            .bind(&run_ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to reap sessions: {}", e))
            })?
            .rows_affected();
        }

        report.locks_released += sqlx::query(
            r#"
            DELETE FROM period_locks
            WHERE expires_utc < now()
              AND NOT EXISTS (
                  SELECT 1 FROM calculation_sessions s
                  WHERE s.reference_date = period_locks.reference_date
              )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to drop expired locks: {}", e))
        })?
        .rows_affected();

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(
            sessions_reaped = report.sessions_reaped,
            entries_canceled = report.entries_canceled,
            locks_released = report.locks_released,
            "Stale-run cleanup finished"
        );

        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Authoritative Ledger View
    // -------------------------------------------------------------------------

    /// List active finalized entries. This is the only read surface; the
    /// predicate `status = 'finalizado' AND is_active` is what makes
    /// compensation externally consistent.
    #[instrument(skip(self, filter))]
    pub async fn active_entries(
        &self,
        filter: &EntryFilter,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<DiscountEntry>, i64, Decimal), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["active_entries"])
            .start_timer();

        let page = page.max(1);
        let limit = page_size.clamp(1, 100);
        let offset = (page - 1) * limit;

        let document_filter = filter
            .document_id
            .as_deref()
            .map(|d| d.chars().filter(|c| c.is_ascii_digit()).collect::<String>())
            .filter(|d| !d.is_empty());

        let predicate = r#"
            WHERE status = 'finalizado'
              AND is_active = TRUE
              AND ($1::text IS NULL OR document_id LIKE '%' || $1 || '%')
              AND ($2::text IS NULL OR subject_name ILIKE '%' || $2 || '%')
              AND ($3::text IS NULL OR proposal LIKE '%' || $3 || '%')
        "#;

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM discount_entries {predicate}"
        ))
        .bind(&document_filter)
        .bind(&filter.subject_name)
        .bind(&filter.proposal)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to count entries: {}", e)))?;

        let total_balance: Decimal = sqlx::query_scalar(&format!(
            "SELECT COALESCE(SUM(amount), 0) FROM discount_entries {predicate}"
        ))
        .bind(&document_filter)
        .bind(&filter.subject_name)
        .bind(&filter.proposal)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to sum entries: {}", e)))?;

        // Deterministic order, newest registration first.
        let entries: Vec<DiscountEntry> = sqlx::query_as(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM discount_entries
            {predicate}
            ORDER BY id DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(&document_filter)
        .bind(&filter.subject_name)
        .bind(&filter.proposal)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list entries: {}", e)))?;

        timer.observe_duration();

        Ok((entries, total, total_balance))
    }

    /// Balance for one subject over active finalized entries, optionally
    /// restricted to a period range.
    #[instrument(skip(self), fields(document_id = %document_id))]
    pub async fn active_balance(
        &self,
        document_id: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Decimal, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["active_balance"])
            .start_timer();

        let normalized = normalize_document(document_id).ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("document_id must contain digits"))
        })?;

        let balance: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM discount_entries
            WHERE status = 'finalizado'
              AND is_active = TRUE
              AND document_id = $1
              AND ($2::date IS NULL OR reference_date >= $2)
              AND ($3::date IS NULL OR reference_date <= $3)
            "#,
        )
        .bind(&normalized)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get balance: {}", e)))?;

        timer.observe_duration();

        Ok(balance)
    }

    /// Per-subject balances over active finalized entries, used by payout
    /// netting.
    #[instrument(skip(self))]
    pub async fn balance_by_subject(&self) -> Result<Vec<SubjectBalance>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["balance_by_subject"])
            .start_timer();

        let balances = sqlx::query_as(
            r#"
            SELECT document_id, COALESCE(SUM(amount), 0) AS balance
            FROM discount_entries
            WHERE status = 'finalizado' AND is_active = TRUE AND document_id IS NOT NULL
            GROUP BY document_id
            ORDER BY document_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get subject balances: {}", e))
        })?;

        timer.observe_duration();

        Ok(balances)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    async fn session_for_update(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        run_id: Uuid,
    ) -> Result<Option<CalculationSession>, AppError> {
        sqlx::query_as::<_, CalculationSession>(
            r#"
            SELECT run_id, reference_date, actor_id, created_utc, heartbeat_utc
            FROM calculation_sessions
            WHERE run_id = $1
            FOR UPDATE
            "#,
        )
        .bind(run_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load session: {}", e)))
    }

    /// A finalize without a usable session is either a stale retry of a run
    /// that already resolved (every staging row terminally transitioned) or
    /// a plain unknown/never-staged run.
    async fn missing_session_error(&self, run_id: Uuid) -> Result<AppError, AppError> {
        let resolved: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM discount_entries WHERE run_id = $1 AND status <> 'staging'",
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to inspect run rows: {}", e))
        })?;

        if resolved > 0 {
            Ok(AppError::AlreadyResolved(anyhow::anyhow!(
                "Run {} was already finalized; re-stage to recalculate",
                run_id
            )))
        } else {
            Ok(AppError::NotFound(anyhow::anyhow!(
                "No staged discounts found for run {}",
                run_id
            )))
        }
    }

    async fn promote(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        entry_id: i64,
        actor_id: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE discount_entries
            SET status = 'finalizado', is_active = TRUE, finalized_utc = now(), actor_id = $2
            WHERE id = $1
            "#,
        )
        .bind(entry_id)
        .bind(actor_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to promote row: {}", e)))?;
        Ok(())
    }

    async fn discard(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        entry_id: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE discount_entries
            SET status = 'cancelado', canceled_utc = now(), is_active = FALSE
            WHERE id = $1
            "#,
        )
        .bind(entry_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to discard row: {}", e)))?;
        Ok(())
    }

    /// Supersede `existing` with the staged value: record a compensating
    /// sibling documenting the neutralized amount, deactivate the old row,
    /// then promote the staged row as the single active value for the key.
    /// The deactivation happens before the promotion so the one-active-row
    /// unique index holds at every statement boundary.
    async fn compensate(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        existing: &DiscountEntry,
        staged: &DiscountEntry,
        actor_id: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO discount_entries
                (run_id, reference_date, business_key, amount, document_id, subject_name,
                 movement_date, assessment_date, movement_kind, proposal,
                 proposal_canceled_date, status, is_active, parent_id, reason, origin,
                 actor_id, finalized_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                    'finalizado', FALSE, $12, $13, $14, $15, now())
            "#,
        )
        .bind(staged.run_id)
        .bind(existing.reference_date)
        .bind(&existing.business_key)
        .bind(-existing.amount)
        .bind(&existing.document_id)
        .bind(&existing.subject_name)
        .bind(existing.movement_date)
        .bind(existing.assessment_date)
        .bind(&existing.movement_kind)
        .bind(&existing.proposal)
        .bind(existing.proposal_canceled_date)
        .bind(existing.id)
        .bind(COMPENSATION_REASON)
        .bind(&staged.origin)
        .bind(actor_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to insert compensation: {}", e))
        })?;

        sqlx::query("UPDATE discount_entries SET is_active = FALSE WHERE id = $1")
            .bind(existing.id)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to deactivate row: {}", e))
            })?;

        self.promote(tx, staged.id, actor_id).await
    }
}
