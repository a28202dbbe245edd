//! Common test utilities for discount-ledger-service integration tests.

#![allow(dead_code)]

use chrono::NaiveDate;
use discount_ledger_service::config::{DatabaseConfig, ReconciliationSettings, ServiceConfig};
use discount_ledger_service::startup::Application;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use service_core::config::Config as CommonConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Once;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,discount_ledger_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn database_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set - use scripts/integ-tests.sh to run tests")
}

fn test_config() -> ServiceConfig {
    ServiceConfig {
        common: CommonConfig { port: 0 },
        service_name: "discount-ledger-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: database_url(),
            max_connections: 4,
            min_connections: 1,
        },
        reconciliation: ReconciliationSettings {
            lock_ttl_minutes: 120,
            session_stale_minutes: 30,
        },
    }
}

/// Test application wrapper: HTTP client plus a direct pool for asserting
/// on ledger history the read surface deliberately hides.
pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub pool: PgPool,
}

/// Spawn a test application listening on a random port.
pub async fn spawn_app() -> TestApp {
    init_tracing();

    let config = test_config();

    let app = Application::build(config)
        .await
        .expect("Failed to build application");

    let port = app.port();
    let address = format!("http://127.0.0.1:{}", port);

    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    let client = reqwest::Client::new();

    // Wait for the server to answer its health probe.
    let mut attempts = 0;
    loop {
        match client.get(format!("{}/health", address)).send().await {
            Ok(resp) if resp.status().is_success() => break,
            _ if attempts < 20 => {
                attempts += 1;
                tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
            }
            other => panic!("Server did not become healthy: {:?}", other),
        }
    }

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url())
        .await
        .expect("Failed to connect test pool");

    TestApp {
        address,
        client,
        pool,
    }
}

impl TestApp {
    pub async fn start_run(&self, reference_date: NaiveDate, actor_id: i64) -> reqwest::Response {
        self.client
            .post(format!("{}/runs", self.address))
            .json(&json!({ "reference_date": reference_date, "actor_id": actor_id }))
            .send()
            .await
            .expect("start_run request failed")
    }

    pub async fn start_run_ok(&self, reference_date: NaiveDate, actor_id: i64) -> Uuid {
        let resp = self.start_run(reference_date, actor_id).await;
        assert_eq!(resp.status().as_u16(), 201, "start_run should succeed");
        let body: Value = resp.json().await.expect("start_run body");
        body["run_id"]
            .as_str()
            .expect("run_id in body")
            .parse()
            .expect("run_id is a uuid")
    }

    pub async fn stage(&self, run_id: Uuid, entries: Value) -> reqwest::Response {
        self.client
            .post(format!("{}/runs/{}/discounts", self.address, run_id))
            .json(&json!({ "entries": entries }))
            .send()
            .await
            .expect("stage request failed")
    }

    pub async fn stage_ok(&self, run_id: Uuid, entries: Value) {
        let resp = self.stage(run_id, entries).await;
        assert_eq!(resp.status().as_u16(), 200, "stage should succeed");
    }

    pub async fn finalize(&self, run_id: Uuid, actor_id: i64) -> reqwest::Response {
        self.client
            .post(format!("{}/runs/{}/finalize", self.address, run_id))
            .json(&json!({ "actor_id": actor_id }))
            .send()
            .await
            .expect("finalize request failed")
    }

    pub async fn finalize_ok(&self, run_id: Uuid, actor_id: i64) -> Value {
        let resp = self.finalize(run_id, actor_id).await;
        assert_eq!(resp.status().as_u16(), 200, "finalize should succeed");
        resp.json().await.expect("finalize body")
    }

    pub async fn abort(&self, run_id: Uuid) -> reqwest::Response {
        self.client
            .post(format!("{}/runs/{}/abort", self.address, run_id))
            .send()
            .await
            .expect("abort request failed")
    }

    pub async fn heartbeat(&self, run_id: Uuid) -> reqwest::Response {
        self.client
            .post(format!("{}/runs/{}/heartbeat", self.address, run_id))
            .send()
            .await
            .expect("heartbeat request failed")
    }

    pub async fn cleanup(&self, stale_after_minutes: Option<i64>) -> Value {
        let mut req = self
            .client
            .post(format!("{}/maintenance/cleanup", self.address));
        if let Some(minutes) = stale_after_minutes {
            req = req.json(&json!({ "stale_after_minutes": minutes }));
        }
        let resp = req.send().await.expect("cleanup request failed");
        assert_eq!(resp.status().as_u16(), 200, "cleanup should succeed");
        resp.json().await.expect("cleanup body")
    }

    pub async fn balance(&self, document_id: &str) -> Decimal {
        let resp = self
            .client
            .get(format!(
                "{}/discounts/balance?document_id={}",
                self.address, document_id
            ))
            .send()
            .await
            .expect("balance request failed");
        assert_eq!(resp.status().as_u16(), 200, "balance should succeed");
        let body: Value = resp.json().await.expect("balance body");
        body["balance"]
            .as_str()
            .expect("balance is a string")
            .parse()
            .expect("balance parses as decimal")
    }

    pub async fn list_by_document(&self, document_id: &str) -> Value {
        let resp = self
            .client
            .get(format!(
                "{}/discounts?document_id={}",
                self.address, document_id
            ))
            .send()
            .await
            .expect("list request failed");
        assert_eq!(resp.status().as_u16(), 200, "list should succeed");
        resp.json().await.expect("list body")
    }
}

/// Every test gets its own accounting period so period locks never collide
/// across concurrently running tests.
pub fn unique_reference_date() -> NaiveDate {
    let days = (Uuid::new_v4().as_u128() % 300_000) as i32;
    NaiveDate::from_num_days_from_ce_opt(700_000 + days).expect("date in range")
}

/// Fresh 11-digit document id.
pub fn unique_document() -> String {
    format!("{:011}", Uuid::new_v4().as_u128() % 100_000_000_000)
}

/// Fresh business key.
pub fn unique_key() -> String {
    format!("test|{}", Uuid::new_v4())
}

pub fn dec(s: &str) -> Decimal {
    s.parse().expect("decimal literal")
}

/// A staged discount entry as the upstream calculation would produce it.
pub fn entry(business_key: &str, document_id: &str, amount: &str) -> Value {
    json!({
        "amount": amount,
        "document_id": document_id,
        "subject_name": "Maria Souza",
        "movement_kind": "desconto realizado",
        "proposal": "P-1001",
        "business_key": business_key,
    })
}
