//! discount-ledger-service: staging, reconciliation, and the authoritative
//! discount ledger behind broker incentive payouts.

pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
