//! HTTP handlers for discount-ledger-service.

pub mod runs;
pub mod statement;
