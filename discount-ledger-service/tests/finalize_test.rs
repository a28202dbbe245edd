//! Reconciliation engine integration tests.
//!
//! Run with: ./scripts/integ-tests.sh

mod common;

use common::{dec, entry, spawn_app, unique_document, unique_key, unique_reference_date};
use serde_json::json;
use uuid::Uuid;

/// A staged value with no authoritative counterpart is promoted as-is.
#[tokio::test]
#[ignore]
async fn promotes_new_discount() {
    let app = spawn_app().await;
    let date = unique_reference_date();
    let (doc, key) = (unique_document(), unique_key());

    let run_id = app.start_run_ok(date, 1).await;
    app.stage_ok(run_id, json!([entry(&key, &doc, "100.00")])).await;

    let summary = app.finalize_ok(run_id, 1).await;
    assert_eq!(summary["promoted"], 1);
    assert_eq!(summary["compensated"], 0);
    assert_eq!(summary["discarded"], 0);
    assert!(summary["diffs"].as_array().unwrap().is_empty());

    assert_eq!(app.balance(&doc).await, dec("100.00"));
}

/// Re-running a period with unchanged values is a no-op: everything lands
/// in the discard bucket and the ledger view stays identical.
#[tokio::test]
#[ignore]
async fn refinalizing_equal_values_discards() {
    let app = spawn_app().await;
    let date = unique_reference_date();
    let (doc, key) = (unique_document(), unique_key());

    let first = app.start_run_ok(date, 1).await;
    app.stage_ok(first, json!([entry(&key, &doc, "100.00")])).await;
    app.finalize_ok(first, 1).await;

    let second = app.start_run_ok(date, 1).await;
    app.stage_ok(second, json!([entry(&key, &doc, "100.00")])).await;

    let summary = app.finalize_ok(second, 1).await;
    assert_eq!(summary["promoted"], 0);
    assert_eq!(summary["compensated"], 0);
    assert_eq!(summary["discarded"], 1);

    assert_eq!(app.balance(&doc).await, dec("100.00"));

    // The authoritative row is still the one the first run promoted.
    let (active_count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM discount_entries \
         WHERE reference_date = $1 AND business_key = $2 \
           AND status = 'finalizado' AND is_active",
    )
    .bind(date)
    .bind(&key)
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(active_count, 1);
}

/// A changed value supersedes the old one through a compensating entry;
/// the subject's balance moves to exactly the new value.
#[tokio::test]
#[ignore]
async fn compensates_changed_value() {
    let app = spawn_app().await;
    let date = unique_reference_date();
    let (doc, key) = (unique_document(), unique_key());

    let first = app.start_run_ok(date, 1).await;
    app.stage_ok(first, json!([entry(&key, &doc, "100.00")])).await;
    app.finalize_ok(first, 1).await;

    let second = app.start_run_ok(date, 2).await;
    app.stage_ok(second, json!([entry(&key, &doc, "150.00")])).await;

    let summary = app.finalize_ok(second, 2).await;
    assert_eq!(summary["compensated"], 1);
    assert_eq!(summary["promoted"], 0);
    assert_eq!(summary["discarded"], 0);

    let diffs = summary["diffs"].as_array().unwrap();
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0]["business_key"], key.as_str());
    assert_eq!(dec(diffs[0]["old_amount"].as_str().unwrap()), dec("100.00"));
    assert_eq!(dec(diffs[0]["new_amount"].as_str().unwrap()), dec("150.00"));
    assert_eq!(dec(diffs[0]["delta"].as_str().unwrap()), dec("50.00"));

    // Conservation: the key's active contribution is exactly the new value.
    assert_eq!(app.balance(&doc).await, dec("150.00"));
}

/// Exclusivity and audit shape after a compensation: one active row per key,
/// the superseded row deactivated but preserved, and a compensating sibling
/// documenting the neutralized amount.
#[tokio::test]
#[ignore]
async fn compensation_preserves_history_and_exclusivity() {
    let app = spawn_app().await;
    let date = unique_reference_date();
    let (doc, key) = (unique_document(), unique_key());

    let first = app.start_run_ok(date, 1).await;
    app.stage_ok(first, json!([entry(&key, &doc, "100.00")])).await;
    app.finalize_ok(first, 1).await;

    let second = app.start_run_ok(date, 1).await;
    app.stage_ok(second, json!([entry(&key, &doc, "150.00")])).await;
    app.finalize_ok(second, 1).await;

    // Never fewer rows over time: original, compensation, and new value.
    let rows: Vec<(i64, String, bool, String, Option<i64>, Option<String>)> = sqlx::query_as(
        "SELECT id, status, is_active, amount::text, parent_id, reason \
         FROM discount_entries \
         WHERE reference_date = $1 AND business_key = $2 \
         ORDER BY id",
    )
    .bind(date)
    .bind(&key)
    .fetch_all(&app.pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 3, "history only grows: old, compensation, new");

    let (_, old_status, old_active, old_amount, _, _) = &rows[0];
    assert_eq!(old_status, "finalizado");
    assert!(!old_active, "superseded row is deactivated, not deleted");
    assert_eq!(dec(old_amount), dec("100.00"));

    let (_, comp_status, comp_active, comp_amount, comp_parent, comp_reason) = &rows[2];
    assert_eq!(comp_status, "finalizado");
    assert!(!comp_active, "compensation is an audit record, not a balance row");
    assert_eq!(dec(comp_amount), dec("-100.00"));
    assert_eq!(*comp_parent, Some(rows[0].0));
    assert_eq!(comp_reason.as_deref(), Some("Ajuste compensatório"));

    let (_, new_status, new_active, new_amount, _, _) = &rows[1];
    assert_eq!(new_status, "finalizado");
    assert!(new_active);
    assert_eq!(dec(new_amount), dec("150.00"));

    // At most one active finalized row per key, right after the compensation.
    let (active_count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM discount_entries \
         WHERE reference_date = $1 AND business_key = $2 \
           AND status = 'finalizado' AND is_active",
    )
    .bind(date)
    .bind(&key)
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(active_count, 1);
}

/// Finalizing a run nobody ever opened is a caller error.
#[tokio::test]
#[ignore]
async fn finalize_unknown_run_returns_not_found() {
    let app = spawn_app().await;
    let resp = app.finalize(Uuid::new_v4(), 1).await;
    assert_eq!(resp.status().as_u16(), 404);
}

/// Finalizing a run that staged nothing fails instead of silently
/// succeeding; the lock stays held for the caller to sort out.
#[tokio::test]
#[ignore]
async fn finalize_without_staging_returns_not_found() {
    let app = spawn_app().await;
    let date = unique_reference_date();

    let run_id = app.start_run_ok(date, 1).await;
    let resp = app.finalize(run_id, 1).await;
    assert_eq!(resp.status().as_u16(), 404);

    // Lock still held.
    let resp = app.start_run(date, 1).await;
    assert_eq!(resp.status().as_u16(), 409);

    app.abort(run_id).await;
}

/// A stale retry of an already-finalized run reports already_resolved so
/// idempotent callers can treat it as success.
#[tokio::test]
#[ignore]
async fn double_finalize_reports_already_resolved() {
    let app = spawn_app().await;
    let date = unique_reference_date();
    let (doc, key) = (unique_document(), unique_key());

    let run_id = app.start_run_ok(date, 1).await;
    app.stage_ok(run_id, json!([entry(&key, &doc, "75.00")])).await;
    app.finalize_ok(run_id, 1).await;

    let resp = app.finalize(run_id, 1).await;
    assert_eq!(resp.status().as_u16(), 409);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "already_resolved");
}

/// The same business key staged twice with conflicting amounts aborts the
/// whole finalize before anything is written.
#[tokio::test]
#[ignore]
async fn conflicting_duplicate_keys_are_rejected() {
    let app = spawn_app().await;
    let date = unique_reference_date();
    let (doc, key) = (unique_document(), unique_key());

    let run_id = app.start_run_ok(date, 1).await;
    app.stage_ok(
        run_id,
        json!([entry(&key, &doc, "100.00"), entry(&key, &doc, "200.00")]),
    )
    .await;

    let resp = app.finalize(run_id, 1).await;
    assert_eq!(resp.status().as_u16(), 400);

    // Nothing was promoted and the staging rows are untouched.
    assert_eq!(app.balance(&doc).await, dec("0"));
    let (staging_count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM discount_entries WHERE run_id = $1 AND status = 'staging'",
    )
    .bind(run_id)
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(staging_count, 2);

    app.abort(run_id).await;
}

/// Equal-amount repeats of a key collapse: the first is promoted, the rest
/// fall through the discard path.
#[tokio::test]
#[ignore]
async fn equal_duplicate_keys_collapse() {
    let app = spawn_app().await;
    let date = unique_reference_date();
    let (doc, key) = (unique_document(), unique_key());

    let run_id = app.start_run_ok(date, 1).await;
    app.stage_ok(
        run_id,
        json!([entry(&key, &doc, "100.00"), entry(&key, &doc, "100.00")]),
    )
    .await;

    let summary = app.finalize_ok(run_id, 1).await;
    assert_eq!(summary["promoted"], 1);
    assert_eq!(summary["discarded"], 1);
    assert_eq!(summary["compensated"], 0);

    assert_eq!(app.balance(&doc).await, dec("100.00"));
}

/// Staging rows are invisible to every read surface until finalized.
#[tokio::test]
#[ignore]
async fn staging_is_invisible_until_finalized() {
    let app = spawn_app().await;
    let date = unique_reference_date();
    let (doc, key) = (unique_document(), unique_key());

    let run_id = app.start_run_ok(date, 1).await;
    app.stage_ok(run_id, json!([entry(&key, &doc, "100.00")])).await;

    assert_eq!(app.balance(&doc).await, dec("0"));
    let listing = app.list_by_document(&doc).await;
    assert_eq!(listing["pagination"]["total"], 0);

    app.abort(run_id).await;
}

/// Aborting a run cancels its staging rows without touching anything
/// already authoritative, and frees the period.
#[tokio::test]
#[ignore]
async fn abort_cancels_staging_and_keeps_finalized() {
    let app = spawn_app().await;
    let date = unique_reference_date();
    let (doc, key) = (unique_document(), unique_key());

    let first = app.start_run_ok(date, 1).await;
    app.stage_ok(first, json!([entry(&key, &doc, "100.00")])).await;
    app.finalize_ok(first, 1).await;

    let second = app.start_run_ok(date, 1).await;
    app.stage_ok(second, json!([entry(&key, &doc, "999.00")])).await;

    let resp = app.abort(second).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["canceled"], 1);

    // The rejected batch never reached the ledger.
    assert_eq!(app.balance(&doc).await, dec("100.00"));

    let (canceled_count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM discount_entries WHERE run_id = $1 AND status = 'cancelado'",
    )
    .bind(second)
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(canceled_count, 1);

    // Period is free again.
    let third = app.start_run_ok(date, 1).await;
    app.abort(third).await;
}

/// Amounts within the cent tolerance count as unchanged.
#[tokio::test]
#[ignore]
async fn sub_cent_difference_is_discarded_not_compensated() {
    let app = spawn_app().await;
    let date = unique_reference_date();
    let (doc, key) = (unique_document(), unique_key());

    let first = app.start_run_ok(date, 1).await;
    app.stage_ok(first, json!([entry(&key, &doc, "100.00")])).await;
    app.finalize_ok(first, 1).await;

    let second = app.start_run_ok(date, 1).await;
    app.stage_ok(second, json!([entry(&key, &doc, "100.004")])).await;

    let summary = app.finalize_ok(second, 1).await;
    assert_eq!(summary["discarded"], 1);
    assert_eq!(summary["compensated"], 0);

    assert_eq!(app.balance(&doc).await, dec("100.00"));
}
